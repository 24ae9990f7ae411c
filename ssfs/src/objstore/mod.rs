use crate::{async_bridge::ByteStream, Config, Result};
use dyn_clone::DynClone;
use futures::stream::BoxStream;
use std::ops::Range;
use tokio::io::AsyncRead;

mod s3;

pub(crate) use s3::S3Bucket;

/// The body of an upload, as handed to [`ObjectStore::put`]
pub type UploadBody = Box<dyn AsyncRead + Send + Unpin>;

/// A bucket in an object storage system like S3, which is the namespace in which named objects
/// are stored.
///
/// This is the complete set of capabilities the file-like handles in this crate need from object
/// storage.  The S3 implementation is used by [`crate::ObjectFs::new`]; any other implementation
/// can be injected with [`crate::ObjectFs::with_store`].
///
/// Keys passed to these methods never start with `/`.
///
/// Implementations must be trivially cloneable such that the cost of a clone is the cost of
/// increasing the ref count on an `Arc`, and must be safe to call concurrently from any number of
/// tasks.
#[async_trait::async_trait]
pub trait ObjectStore: DynClone + std::fmt::Debug + Sync + Send + 'static {
    /// The name of the bucket, for logging and error messages
    fn bucket(&self) -> &str;

    /// Query the size and modification time of an object.
    ///
    /// Fails with [`crate::ErrorKind::NotFound`] if there is no such object.
    async fn stat(&self, key: &str) -> Result<ObjectInfo>;

    /// Start reading an object, or only the bytes of the object in `range`.
    ///
    /// The returned [`ObjectBody`] carries the object's metadata as of the time the read started,
    /// and the data itself as a stream.  The network read session lasts as long as the stream
    /// does; dropping the stream releases it.
    ///
    /// A range extending past the end of the object is truncated to the object's size.
    async fn get(&self, key: &str, range: Option<Range<u64>>) -> Result<ObjectBody>;

    /// Upload a new object, replacing any object with the same key, with the contents read from
    /// `body` until EOF.
    ///
    /// The size of the object doesn't have to be known in advance; callers should provide a size
    /// hint if they can predict it.  If reading from `body` fails, the upload fails and no object
    /// is created.
    ///
    /// Returns the metadata of the new object.
    async fn put(&self, key: &str, body: UploadBody, size_hint: Option<u64>) -> Result<ObjectInfo>;

    /// List the objects whose keys start with `prefix`.
    ///
    /// If `recursive` is false, only the objects directly "in" the prefix are listed, treating
    /// `/` as a delimiter.  The listing is produced lazily, page by page, in whatever order the
    /// object store uses.
    fn list(&self, prefix: &str, recursive: bool) -> BoxStream<'static, Result<ObjectInfo>>;
}

dyn_clone::clone_trait_object!(ObjectStore);

/// Snapshot of an object's metadata, taken at the time the object was stat-ed, read or listed.
///
/// If the object changes later this value isn't updated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,

    /// Size in bytes of the object data
    pub size: u64,

    pub modified_at: chrono::DateTime<chrono::Utc>,
}

impl ObjectInfo {
    /// The permission bits objects are presented with.  Object storage has no concept of
    /// permissions, so every object is a regular file readable by all and writable by the owner.
    pub const MODE: u32 = 0o644;

    /// The name of the object, which is its complete key
    pub fn name(&self) -> &str {
        &self.key
    }

    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn mode(&self) -> u32 {
        Self::MODE
    }

    /// Objects are never directories
    pub fn is_dir(&self) -> bool {
        false
    }
}

/// An object read session started by [`ObjectStore::get`]
pub struct ObjectBody {
    /// Metadata of the whole object (not just the requested range)
    pub info: ObjectInfo,

    pub data: ByteStream,
}

impl std::fmt::Debug for ObjectBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectBody")
            .field("info", &self.info)
            .field("data", &"<stream>")
            .finish()
    }
}

/// Construct the S3 implementation of [`ObjectStore`] for `bucket`, validating that the bucket
/// exists and is accessible.
pub(crate) async fn s3_bucket(config: &Config, bucket: &str) -> Result<Box<dyn ObjectStore>> {
    Ok(Box::new(S3Bucket::new(config, bucket).await?))
}
