use super::{ObjectBody, ObjectInfo, ObjectStore, UploadBody};
use crate::util::aws_sdk::stream::IntoStream;
use crate::{Config, Result};
use aws_config::meta::region::RegionProviderChain;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_smithy_types_convert::date_time::DateTimeExt;
use aws_types::region::Region;
use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use snafu::{prelude::*, IntoError};
use std::{ops::Range, sync::Arc};
use tokio::io::AsyncReadExt;
use tracing::{debug, error, instrument, Instrument};

/// Implementation of [`ObjectStore`] for a bucket in S3 or an S3-compatible API
#[derive(Clone)]
pub(crate) struct S3Bucket {
    inner: Arc<S3BucketInner>,
}

struct S3BucketInner {
    name: String,

    config: Config,

    /// The region this bucket is located in, if it's different from the region specified in the
    /// AWS SDK config.
    ///
    /// If a bucket is in a different region, then we need to use a different
    /// [`aws_sdk_s3::Client`] instance to talk to the S3 APIs when dealing with that bucket.
    region: Option<String>,

    /// The client to use to operate on this bucket.
    client: aws_sdk_s3::Client,
}

impl S3Bucket {
    /// Construct a new instance and validate that the current client has access to the bucket.
    ///
    /// If there is no access to the bucket then fail with an error
    pub(crate) async fn new(config: &Config, name: &str) -> Result<Self> {
        debug!(bucket = name, "Validating access to bucket");

        let mut client = make_s3_client(config, None).await;

        // If the bucket is in a different region, `head_bucket` will fail and the error will
        // include a header telling us the correct region.  Look for that and handle it properly.
        let region = if let Some(region) = Self::validate_access_and_region(&client, name).await? {
            debug!(bucket = name, %region, "Bucket is in another region; repeating access validation in the correct region");

            client = make_s3_client(config, region.clone()).await;

            // If S3 redirects us a second time something is badly wrong, but that's still just an
            // inaccessible bucket as far as the caller is concerned
            if let Some(other_region) = Self::validate_access_and_region(&client, name).await? {
                error!(bucket = name, %region, %other_region, "S3 redirected to another region twice");
            }

            Some(region)
        } else {
            None
        };

        debug!(bucket = name, ?region, "Access to bucket is confirmed");

        Ok(Self {
            inner: Arc::new(S3BucketInner {
                name: name.to_string(),
                config: config.clone(),
                region,
                client,
            }),
        })
    }

    /// Perform a HEAD on the bucket to check access.
    ///
    /// If the HEAD check passes, it means the client's configured region is correct, the
    /// configured credentials have access to the bucket, and all is well.  In that case this
    /// function returns `Ok(None)`
    ///
    /// If the HEAD check fails with an error that indicates the bucket is in a different region,
    /// then this will return `Ok(Some($region))`, and the check should be repeated again in that
    /// region.
    ///
    /// If the HEAD check fails for any other error, most likely because the bucket doesn't exist
    /// or the credentials don't have access to it, then this returns the corresponding error.
    async fn validate_access_and_region(
        client: &aws_sdk_s3::Client,
        name: &str,
    ) -> Result<Option<String>> {
        match client.head_bucket().bucket(name).send().await {
            Ok(_) => Ok(None),
            Err(e) => {
                if let Some(response) = e.raw_response() {
                    if response.status().as_u16() == 301 {
                        if let Some(region) = response.headers().get("x-amz-bucket-region") {
                            // This is AWS's way of telling us we have the right bucket, but it is
                            // in another region so we should use the appropriate region endpoint
                            return Ok(Some(region.to_string()));
                        }
                    }
                }

                Err(crate::error::BucketInvalidOrNotAccessibleSnafu { bucket: name }.into_error(e))
            }
        }
    }

    /// Read the next part of an upload body, up to `chunk_size` bytes.
    ///
    /// The result is only shorter than `chunk_size` if the body hit EOF, and is empty if there
    /// was nothing left to read at all.
    async fn read_chunk(body: &mut UploadBody, chunk_size: usize, key: &str) -> Result<Bytes> {
        let mut buffer = BytesMut::with_capacity(chunk_size);

        while buffer.len() < chunk_size {
            let remaining = (chunk_size - buffer.len()) as u64;
            let bytes_read = (&mut *body)
                .take(remaining)
                .read_buf(&mut buffer)
                .await
                .context(crate::error::ReadUploadBodySnafu { key })?;

            if bytes_read == 0 {
                break;
            }
        }

        Ok(buffer.freeze())
    }

    async fn put_single_part(&self, key: &str, data: Bytes) -> Result<()> {
        debug!(key, size = data.len(), "Uploading object in a single request");

        self.inner
            .client
            .put_object()
            .bucket(&self.inner.name)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await
            .with_context(|_| crate::error::PutObjectSnafu {
                bucket: self.inner.name.clone(),
                key,
            })?;

        Ok(())
    }

    /// Upload the object identified by `key` using the S3 multipart upload APIs.
    ///
    /// `first_chunk` was already read from `body` by the caller, which used it to decide that
    /// the object is big enough to bother with multipart.  The remaining parts are read from
    /// `body` one after the other, but uploaded in parallel up to the configured maximum
    /// concurrency.
    async fn put_multipart(&self, key: &str, first_chunk: Bytes, body: UploadBody) -> Result<u64> {
        let response = self
            .inner
            .client
            .create_multipart_upload()
            .bucket(&self.inner.name)
            .key(key)
            .send()
            .await
            .with_context(|_| crate::error::CreateMultipartUploadSnafu {
                bucket: self.inner.name.clone(),
                key,
            })?;

        let upload_id = response.upload_id().unwrap_or_default().to_string();

        let result = self
            .upload_parts(key, &upload_id, first_chunk, body)
            .await;

        if let Err(e) = &result {
            // Before reporting this error, clean up the remains of the multi-part upload
            error!(?e, bucket = %self.inner.name, %key, %upload_id,
                "Multi-part upload failed; aborting multi-part upload on server side");

            if let Err(e) = self
                .inner
                .client
                .abort_multipart_upload()
                .bucket(&self.inner.name)
                .key(key)
                .upload_id(&upload_id)
                .send()
                .await
            {
                error!(?e, bucket = %self.inner.name, %key, %upload_id,
                    "Error aborting multi-part upload.  This will remain on the server forever unless there's a lifecycle policy configured");
            }
        }

        result
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        first_chunk: Bytes,
        body: UploadBody,
    ) -> Result<u64> {
        let chunk_size = self.inner.config.multipart_chunk_size();

        // Read the body one chunk at a time.  Part numbers start from 1 in the S3 API
        let chunks = futures::stream::try_unfold(
            (body, Some(first_chunk), 1usize),
            move |(mut body, pending, part_number)| async move {
                let chunk = match pending {
                    Some(chunk) => chunk,
                    None => Self::read_chunk(&mut body, chunk_size, key).await?,
                };

                let next: Option<((usize, Bytes), _)> = if chunk.is_empty() {
                    None
                } else {
                    Some(((part_number, chunk), (body, None, part_number + 1)))
                };

                Result::<_>::Ok(next)
            },
        )
        .boxed();

        let part_futs = chunks.map_ok(|(part_number, chunk)| {
            let span = tracing::debug_span!("upload part", part_number, chunk_size = chunk.len());

            self.upload_part(key, upload_id, part_number, chunk)
                .instrument(span)
        });

        // Use the magic of `try_buffer_unordered` to poll these part uploads up to a maximum
        // concurrency level while the next parts are still being read from the body.  The chunk
        // reader is an `async` block, so the stream has to be pinned before it can be polled
        let mut uploaded_parts = Box::pin(
            part_futs.try_buffer_unordered(self.inner.config.max_concurrent_requests.max(1)),
        );

        let mut total_bytes = 0u64;
        let mut completed_parts = Vec::new();

        while let Some((part_size, completed_part)) = uploaded_parts.try_next().await? {
            total_bytes += part_size as u64;
            completed_parts.push(completed_part);
        }

        debug!(
            total_parts = completed_parts.len(),
            total_bytes, "All parts uploaded; completing multi-part upload"
        );

        // S3 insists on the parts being listed in order of part number
        completed_parts.sort_unstable_by_key(|part| part.part_number());

        self.inner
            .client
            .complete_multipart_upload()
            .bucket(&self.inner.name)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build(),
            )
            .send()
            .await
            .with_context(|_| crate::error::CompleteMultipartUploadSnafu {
                bucket: self.inner.name.clone(),
                key,
            })?;

        Ok(total_bytes)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: usize,
        chunk: Bytes,
    ) -> Result<(usize, CompletedPart)> {
        let part_size = chunk.len();

        debug!("Uploading multi-part chunk");

        let response = self
            .inner
            .client
            .upload_part()
            .bucket(&self.inner.name)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number as i32)
            .body(ByteStream::from(chunk))
            .send()
            .await
            .with_context(|_| crate::error::UploadPartSnafu {
                bucket: self.inner.name.clone(),
                key,
                part_number,
            })?;

        // Once all of the uploads are done we must provide the information about each part to the
        // CompleteMultipartUpload call, so retain the key bits here
        let completed_part = CompletedPart::builder()
            .set_e_tag(response.e_tag().map(|e_tag| e_tag.to_string()))
            .part_number(part_number as i32)
            .build();

        Ok((part_size, completed_part))
    }
}

#[async_trait::async_trait]
impl ObjectStore for S3Bucket {
    fn bucket(&self) -> &str {
        &self.inner.name
    }

    #[instrument(skip(self), fields(bucket = %self.inner.name))]
    async fn stat(&self, key: &str) -> Result<ObjectInfo> {
        let metadata = match self
            .inner
            .client
            .head_object()
            .bucket(&self.inner.name)
            .key(key)
            .send()
            .await
        {
            Ok(metadata) => metadata,
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    return crate::error::ObjectNotFoundSnafu {
                        bucket: self.inner.name.clone(),
                        key,
                    }
                    .fail();
                }

                return Err(crate::error::HeadObjectSnafu {
                    bucket: self.inner.name.clone(),
                    key,
                }
                .into_error(e));
            }
        };

        Ok(ObjectInfo {
            key: key.to_string(),
            size: metadata.content_length().unwrap_or_default().max(0) as u64,
            modified_at: to_chrono(metadata.last_modified()),
        })
    }

    #[instrument(skip(self), fields(bucket = %self.inner.name))]
    async fn get(&self, key: &str, range: Option<Range<u64>>) -> Result<ObjectBody> {
        debug!("Reading object");

        let mut request = self
            .inner
            .client
            .get_object()
            .bucket(&self.inner.name)
            .key(key);

        if let Some(range) = &range {
            request = request.range(format!(
                "bytes={}-{}",
                range.start,
                range.end.saturating_sub(1)
            ));
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                {
                    return crate::error::ObjectNotFoundSnafu {
                        bucket: self.inner.name.clone(),
                        key,
                    }
                    .fail();
                }

                return Err(crate::error::GetObjectSnafu {
                    bucket: self.inner.name.clone(),
                    key,
                }
                .into_error(e));
            }
        };

        // For ranged reads the content length is only the length of the range; the size of the
        // whole object is the part of `Content-Range` after the `/`
        let content_length = response.content_length().unwrap_or_default().max(0) as u64;
        let size = response
            .content_range()
            .and_then(|content_range| content_range.rsplit_once('/'))
            .and_then(|(_, total)| total.parse::<u64>().ok())
            .unwrap_or(content_length);

        let info = ObjectInfo {
            key: key.to_string(),
            size,
            modified_at: to_chrono(response.last_modified()),
        };

        let bucket = self.inner.name.clone();
        let key = key.to_string();
        let data = response
            .body
            .into_stream()
            .map(move |result| {
                result.with_context(|_| crate::error::ReadByteStreamSnafu {
                    bucket: bucket.clone(),
                    key: key.clone(),
                })
            })
            .boxed();

        Ok(ObjectBody { info, data })
    }

    #[instrument(skip(self, body), fields(bucket = %self.inner.name))]
    async fn put(
        &self,
        key: &str,
        mut body: UploadBody,
        size_hint: Option<u64>,
    ) -> Result<ObjectInfo> {
        // Even with a size hint we can't know if multipart is needed until we've tried to read a
        // whole part worth of data, since the hint could be wrong
        let chunk_size = self.inner.config.multipart_chunk_size();
        debug!(?size_hint, chunk_size, "Uploading object");

        let first_chunk = Self::read_chunk(&mut body, chunk_size, key).await?;

        if first_chunk.len() < chunk_size {
            // EOF was reached before a whole part was read, so this object is small enough to
            // upload in one request
            self.put_single_part(key, first_chunk).await?;
        } else {
            let total_bytes = self.put_multipart(key, first_chunk, body).await?;

            debug!(key, total_bytes, "Multi-part upload completed");
        }

        self.stat(key).await
    }

    fn list(&self, prefix: &str, recursive: bool) -> BoxStream<'static, Result<ObjectInfo>> {
        debug!(bucket = %self.inner.name, prefix, recursive, "Listing objects");

        let mut request = self
            .inner
            .client
            .list_objects_v2()
            .bucket(&self.inner.name)
            .prefix(prefix);

        if !recursive {
            request = request.delimiter("/");
        }

        // Use the paginated API to automatically handle dealing with continuation tokens
        let pages = request.into_paginator().send().into_stream();

        let bucket = self.inner.name.clone();
        let prefix = prefix.to_string();

        pages
            .map(move |result| {
                let page = result.with_context(|_| crate::error::ListObjectsInPrefixSnafu {
                    bucket: bucket.clone(),
                    prefix: prefix.clone(),
                })?;

                let objects = page
                    .contents()
                    .iter()
                    .filter_map(|object| {
                        Some(ObjectInfo {
                            key: object.key()?.to_string(),
                            size: object.size().unwrap_or_default().max(0) as u64,
                            modified_at: to_chrono(object.last_modified()),
                        })
                    })
                    .map(Result::<_>::Ok)
                    .collect::<Vec<_>>();

                Ok(futures::stream::iter(objects))
            })
            .try_flatten()
            .boxed()
    }
}

impl std::fmt::Debug for S3Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Bucket")
            .field("name", &self.inner.name)
            .field("region", &self.inner.region)
            .field("client", &"<...>")
            .finish()
    }
}

/// Convert an AWS timestamp into a chrono one.  Objects always have a last modified time, but the
/// machine-generated SDK types make it optional; a missing or out of range timestamp is reported
/// as the UNIX epoch.
fn to_chrono(timestamp: Option<&aws_smithy_types::DateTime>) -> chrono::DateTime<chrono::Utc> {
    timestamp
        .and_then(|timestamp| timestamp.to_chrono_utc().ok())
        .unwrap_or_default()
}

/// Create a new AWS SDK S3 client, using either an explicit region or the region from the config
/// or the environment
async fn make_s3_client(config: &Config, region: impl Into<Option<String>>) -> aws_sdk_s3::Client {
    let region = region.into().or_else(|| config.aws_region.clone());

    let region_provider = if let Some(region) = region {
        RegionProviderChain::first_try(Region::new(region))
    } else {
        // No explicit region; use the environment
        RegionProviderChain::default_provider().or_else("us-east-1")
    };

    let mut loader =
        aws_config::defaults(aws_config::BehaviorVersion::latest()).region(region_provider);

    if let (Some(access_key_id), Some(secret_access_key)) =
        (&config.aws_access_key_id, &config.aws_secret_access_key)
    {
        loader = loader.credentials_provider(aws_credential_types::Credentials::from_keys(
            access_key_id,
            secret_access_key,
            None,
        ));
    }

    let aws_config = loader.load().await;

    let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&aws_config);
    if let Some(s3_endpoint) = &config.s3_endpoint {
        // S3-compatible services like MinIO generally don't support virtual-host style bucket
        // addressing
        s3_config_builder = s3_config_builder
            .endpoint_url(s3_endpoint.as_str())
            .force_path_style(true);
    }

    aws_sdk_s3::Client::from_conf(s3_config_builder.build())
}
