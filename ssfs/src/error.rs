use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::{
    complete_multipart_upload::CompleteMultipartUploadError,
    create_multipart_upload::CreateMultipartUploadError, get_object::GetObjectError,
    head_bucket::HeadBucketError, head_object::HeadObjectError,
    list_objects_v2::ListObjectsV2Error, put_object::PutObjectError,
    upload_part::UploadPartError,
};
use snafu::{prelude::*, IntoError};

pub type Result<T, E = SsfsError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SsfsError {
    #[snafu(display(
        "The object path '{path}' is invalid: paths must start with '/' and must not contain '\\'"
    ))]
    InvalidObjectPath { path: String },

    #[snafu(display(
        "The prefix '{prefix}' is invalid: prefixes must end with '/' and must not contain '\\'"
    ))]
    InvalidPrefix { prefix: String },

    #[snafu(display("Seeking object '{key}' to position {position} which is before the start"))]
    NegativeSeek { key: String, position: i128 },

    #[snafu(display("The object '{key}' doesn't exist in bucket '{bucket}'"))]
    ObjectNotFound { bucket: String, key: String },

    #[snafu(display("The handle for object '{key}' is already closed"))]
    HandleClosed { key: String },

    #[snafu(display(
        "Error closing the upload pipe for object '{key}'; the upload was cancelled"
    ))]
    ClosePipe { key: String, source: std::io::Error },

    #[snafu(display(
        "The S3 bucket '{bucket}' either doesn't exist, or your IAM identity is not granted access"
    ))]
    BucketInvalidOrNotAccessible {
        bucket: String,
        source: SdkError<HeadBucketError>,
    },

    #[snafu(display("Error getting metadata about object '{key}' on S3 bucket '{bucket}'"))]
    HeadObject {
        bucket: String,
        key: String,
        source: SdkError<HeadObjectError>,
    },

    #[snafu(display("Error getting object '{key}' on S3 bucket '{bucket}'"))]
    GetObject {
        bucket: String,
        key: String,
        source: SdkError<GetObjectError>,
    },

    #[snafu(display("Error reading the body of object '{key}' on S3 bucket '{bucket}'"))]
    ReadByteStream {
        bucket: String,
        key: String,
        source: aws_sdk_s3::primitives::ByteStreamError,
    },

    #[snafu(display("Error listing objects in S3 bucket '{bucket}' with prefix '{prefix}'"))]
    ListObjectsInPrefix {
        bucket: String,
        prefix: String,
        source: SdkError<ListObjectsV2Error>,
    },

    #[snafu(display("Error uploading object '{key}' to S3 bucket '{bucket}'"))]
    PutObject {
        bucket: String,
        key: String,
        source: SdkError<PutObjectError>,
    },

    #[snafu(display("Error starting multipart upload of object '{key}' to S3 bucket '{bucket}'"))]
    CreateMultipartUpload {
        bucket: String,
        key: String,
        source: SdkError<CreateMultipartUploadError>,
    },

    #[snafu(display(
        "Error uploading part {part_number} of object '{key}' to S3 bucket '{bucket}'"
    ))]
    UploadPart {
        bucket: String,
        key: String,
        part_number: usize,
        source: SdkError<UploadPartError>,
    },

    #[snafu(display(
        "Error completing multipart upload of object '{key}' to S3 bucket '{bucket}'"
    ))]
    CompleteMultipartUpload {
        bucket: String,
        key: String,
        source: SdkError<CompleteMultipartUploadError>,
    },

    #[snafu(display("Error reading data to upload to object '{key}'"))]
    ReadUploadBody { key: String, source: std::io::Error },

    #[snafu(display("Object store operation on '{key}' failed"))]
    Backend { key: String, source: std::io::Error },

    #[snafu(display("Error writing object '{key}' into the tar archive as '{name}'"))]
    AppendArchiveEntry {
        key: String,
        name: String,
        source: std::io::Error,
    },

    #[snafu(display("Error finishing the tar archive of prefix '{prefix}'"))]
    FinishArchive {
        prefix: String,
        source: std::io::Error,
    },

    #[snafu(display(
        "The archive of prefix '{prefix}' was abandoned before all entries were written"
    ))]
    ArchiveAbandoned { prefix: String },

    #[snafu(display("The upload of object '{key}' was cancelled"))]
    UploadCancelled { key: String },

    #[snafu(display("A background task panicked or was cancelled"))]
    BackgroundTask { source: tokio::task::JoinError },
}

/// Coarse classification of [`SsfsError`], for callers that need to react to a category of
/// failure rather than to a specific variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A malformed object path or prefix, or an invalid seek.
    InvalidArgument,

    /// The object doesn't exist.
    NotFound,

    /// The handle was already closed.
    ClosedHandle,

    /// The write side of an upload pipe could not be closed, so the upload was forcibly aborted.
    PartialPipeFailure,

    /// The object store, or a background task talking to it, failed.
    UpstreamFailure,
}

impl SsfsError {
    /// Construct the error an [`crate::ObjectStore`] implementation should report when an
    /// object doesn't exist.
    pub fn not_found(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        ObjectNotFoundSnafu { bucket, key }.build()
    }

    /// Wrap an arbitrary failure of an [`crate::ObjectStore`] implementation.
    pub fn backend(key: impl Into<String>, source: std::io::Error) -> Self {
        BackendSnafu { key }.into_error(source)
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidObjectPath { .. }
            | Self::InvalidPrefix { .. }
            | Self::NegativeSeek { .. } => ErrorKind::InvalidArgument,
            Self::ObjectNotFound { .. } => ErrorKind::NotFound,
            Self::HandleClosed { .. } => ErrorKind::ClosedHandle,
            Self::ClosePipe { .. } => ErrorKind::PartialPipeFailure,
            _ => ErrorKind::UpstreamFailure,
        }
    }
}

impl From<SsfsError> for std::io::Error {
    fn from(e: SsfsError) -> Self {
        let kind = match e.kind() {
            ErrorKind::InvalidArgument => std::io::ErrorKind::InvalidInput,
            ErrorKind::NotFound => std::io::ErrorKind::NotFound,
            ErrorKind::ClosedHandle | ErrorKind::PartialPipeFailure => {
                std::io::ErrorKind::BrokenPipe
            }
            ErrorKind::UpstreamFailure => std::io::ErrorKind::Other,
        };

        std::io::Error::new(kind, e)
    }
}
