//! The entry point which exposes a bucket as a file system.
use crate::archive::ArchiveStream;
use crate::objstore::{self, ObjectInfo, ObjectStore};
use crate::{path, Config, ObjectReader, ObjectWriter, Result};
use tracing::{debug, instrument};

/// A bucket in object storage, presented as a flat file system of objects.
///
/// Objects are named by paths which start with `/`, like absolute paths; `/foo/bar.txt` is the
/// object with key `foo/bar.txt`.  Prefixes, which are used to archive many objects at once, are
/// named by paths which end with `/`, like directories.  Neither may contain a `\`.  A path that
/// breaks these rules fails with [`crate::ErrorKind::InvalidArgument`] before object storage is
/// contacted.
///
/// The methods here are async, but the handles they return do blocking I/O, and must be used from
/// a blocking thread in the same tokio runtime.
#[derive(Clone, Debug)]
pub struct ObjectFs {
    config: Config,
    store: Box<dyn ObjectStore>,
}

impl ObjectFs {
    /// Connect to the S3 bucket `bucket`, using the endpoint, region and credentials in `config`.
    ///
    /// Fails if the bucket doesn't exist or isn't accessible with those credentials.
    #[instrument(skip(config))]
    pub async fn new(config: Config, bucket: &str) -> Result<Self> {
        let store = objstore::s3_bucket(&config, bucket).await?;

        Ok(Self::with_store(config, store))
    }

    /// Use an object store implementation other than S3.
    pub fn with_store(config: Config, store: Box<dyn ObjectStore>) -> Self {
        Self { config, store }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Open an existing object for reading.
    ///
    /// Fails with [`crate::ErrorKind::NotFound`] if there's no such object.
    #[instrument(skip(self), fields(bucket = self.store.bucket()))]
    pub async fn open(&self, path: &str) -> Result<ObjectReader> {
        let key = path::object_key(path)?;

        ObjectReader::open(self.store.clone(), key).await
    }

    /// Create an object, replacing any existing object with the same name once the returned
    /// writer is successfully closed.
    ///
    /// The upload starts right away in the background, and receives data as it's written.
    #[instrument(skip(self), fields(bucket = self.store.bucket()))]
    pub async fn create(&self, path: &str) -> Result<ObjectWriter> {
        let key = path::object_key(path)?;

        Ok(ObjectWriter::start(self.store.clone(), key, &self.config))
    }

    /// Open a gzip-compressed tar archive of every object whose key starts with `prefix`.
    ///
    /// Entries are named by their keys relative to the prefix.  The prefix is listed before this
    /// returns, so the archive contains exactly the objects that existed at this moment.  A prefix
    /// with no objects produces a valid archive with no entries.
    #[instrument(skip(self), fields(bucket = self.store.bucket()))]
    pub async fn open_archive(&self, prefix: &str) -> Result<ArchiveStream> {
        let key_prefix = path::key_prefix(prefix)?;

        debug!(key_prefix, "Opening archive");

        ArchiveStream::open(self.store.clone(), key_prefix, &self.config).await
    }

    /// Query the metadata of a single object without opening it.
    #[instrument(skip(self), fields(bucket = self.store.bucket()))]
    pub async fn stat(&self, path: &str) -> Result<ObjectInfo> {
        let key = path::object_key(path)?;

        self.store.stat(key).await
    }
}
