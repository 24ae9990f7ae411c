//! Streaming `.tar.gz` archives of all of the objects under a prefix.
//!
//! Opening an archive lists the prefix up front, so the set of entries is a snapshot taken at
//! that moment.  The objects themselves are read lazily, one after the other, by a producer task
//! that frames each one as a tar entry and compresses the result into a pipe.  The caller reads
//! the archive from the other end of that pipe while it is being produced.
use crate::async_bridge::pipe_bridge;
use crate::objstore::ObjectStore;
use crate::{path, Config, Result};
use futures::TryStreamExt;
use snafu::IntoError;
use std::io::Read;
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

mod producer;

/// One object in an archive
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Path of the entry inside the archive, which is the key relative to the archive prefix
    pub name: String,

    /// Key of the object in the bucket
    pub key: String,
}

/// What a completed archive contains
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ArchiveSummary {
    /// Number of objects written to the archive
    pub entries: usize,

    /// Total size of the objects written to the archive, before framing and compression
    pub bytes: u64,
}

/// A gzip-compressed tar archive of a prefix, opened with [`crate::ObjectFs::open_archive`].
///
/// The archive is produced in the background while it is read, so reading it is a blocking
/// operation which must be done from a blocking thread.
///
/// If an object can't be read while the archive is being produced, the archive stops at that
/// point without a tar end marker, so a tar reader will see a truncated archive.  The actual
/// error is reported by [`Self::close`].
pub struct ArchiveStream {
    prefix: String,

    entries: Arc<Vec<ArchiveEntry>>,

    /// Read end of the pipe the producer writes into.  `None` once closed
    pipe: Option<SyncIoBridge<DuplexStream>>,

    producer: Option<JoinHandle<Result<ArchiveSummary>>>,

    /// Set once a read has returned EOF, meaning the producer has written everything it ever will
    eof: bool,

    cancel: CancellationToken,
    handle: Handle,
}

impl ArchiveStream {
    /// List the objects under `prefix` and start the producer task for an archive of them.
    #[instrument(skip(store, config), fields(bucket = store.bucket()))]
    pub(crate) async fn open(
        store: Box<dyn ObjectStore>,
        prefix: &str,
        config: &Config,
    ) -> Result<Self> {
        let objects = store
            .list(prefix, true)
            .try_collect::<Vec<_>>()
            .await?;

        let entries = objects
            .into_iter()
            .filter_map(|object| match path::archive_name(prefix, &object.key) {
                Some(name) => Some(ArchiveEntry {
                    name: name.to_string(),
                    key: object.key.clone(),
                }),
                None => {
                    debug!(key = %object.key, "Skipping object with no name relative to the prefix");
                    None
                }
            })
            .collect::<Vec<_>>();

        debug!(entries = entries.len(), "Listed objects to archive");

        let entries = Arc::new(entries);
        let (producer_end, consumer_end) = tokio::io::duplex(config.pipe_buffer_size());
        let cancel = CancellationToken::new();
        let handle = Handle::current();

        let producer = producer::Producer {
            store,
            prefix: prefix.to_string(),
            entries: entries.clone(),
            compression: config.compression(),
            cancel: cancel.clone(),
            handle: handle.clone(),
        };

        let span = tracing::debug_span!("archive producer", prefix);
        let producer = tokio::task::spawn_blocking(move || {
            let _guard = span.enter();

            producer.run(producer_end)
        });

        Ok(Self {
            prefix: prefix.to_string(),
            entries,
            pipe: Some(pipe_bridge(consumer_end, handle.clone())),
            producer: Some(producer),
            eof: false,
            cancel,
            handle,
        })
    }

    /// The objects in this archive, in the order they appear in it.
    ///
    /// This is the listing taken when the archive was opened.  Objects created under the prefix
    /// since then are not included, and objects deleted since then will make the archive fail.
    pub fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    /// Stop reading the archive and wait for the producer to exit.
    ///
    /// If the whole archive was read, returns what the archive contains, or the error that
    /// stopped the producer early.  If the caller stops before reading the whole archive, the
    /// producer is cancelled and this fails with [`crate::SsfsError::ArchiveAbandoned`].
    ///
    /// Must be called exactly once; a second call fails with
    /// [`crate::ErrorKind::ClosedHandle`].
    pub fn close(&mut self) -> Result<ArchiveSummary> {
        let (Some(pipe), Some(producer)) = (self.pipe.take(), self.producer.take()) else {
            return crate::error::HandleClosedSnafu { key: &self.prefix }.fail();
        };

        debug!(prefix = %self.prefix, eof = self.eof, "Closing archive stream");

        if !self.eof {
            // The producer checks for cancellation between entries, and any write it is blocked
            // on fails as soon as the pipe is dropped
            self.cancel.cancel();
        }
        drop(pipe);

        let outcome = self
            .handle
            .block_on(producer)
            .map_err(|e| crate::error::BackgroundTaskSnafu.into_error(e))
            .and_then(|result| result);

        if self.eof {
            outcome
        } else {
            if let Err(e) = &outcome {
                debug!(err = ?e, "Archive producer stopped after the archive was abandoned");
            }

            crate::error::ArchiveAbandonedSnafu {
                prefix: &self.prefix,
            }
            .fail()
        }
    }
}

impl Read for ArchiveStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let Some(pipe) = &mut self.pipe else {
            return Err(crate::error::HandleClosedSnafu { key: &self.prefix }
                .build()
                .into());
        };

        let bytes_read = pipe.read(buf)?;

        if bytes_read == 0 && !buf.is_empty() {
            self.eof = true;
        }

        Ok(bytes_read)
    }
}

impl Drop for ArchiveStream {
    fn drop(&mut self) {
        if self.pipe.is_some() {
            warn!(prefix = %self.prefix, "Archive stream dropped without being closed; cancelling producer");
            self.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for ArchiveStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveStream")
            .field("prefix", &self.prefix)
            .field("entries", &self.entries.len())
            .field("eof", &self.eof)
            .field("closed", &self.pipe.is_none())
            .finish()
    }
}
