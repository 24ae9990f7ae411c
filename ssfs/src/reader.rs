//! Blocking, seekable reads of a single object.
use crate::async_bridge::{stream_as_reader, StreamReader};
use crate::objstore::{ObjectInfo, ObjectStore};
use crate::Result;
use futures::TryStreamExt;
use snafu::prelude::*;
use std::io::{Read, Seek, SeekFrom};
use tokio::runtime::Handle;
use tracing::{debug, instrument};

/// An object opened for reading with [`crate::ObjectFs::open`].
///
/// This implements [`Read`] and [`Seek`] like a file would.  Data is streamed from object storage
/// as it is read; seeking abandons the current read session and a new one is started, at the new
/// position, by the next read.  [`Self::read_at`] reads any part of the object without moving the
/// cursor.
///
/// All of these methods block on network I/O, and must not be called from an async context.  Use
/// [`tokio::task::spawn_blocking`] or a thread of your own (inside the runtime the reader was
/// opened in).
///
/// Call [`Self::close`] when done.  After that every operation fails with
/// [`crate::ErrorKind::ClosedHandle`].
pub struct ObjectReader {
    store: Box<dyn ObjectStore>,

    /// Metadata as of the time the object was opened
    info: ObjectInfo,

    /// Offset of the next byte [`Read::read`] will return
    position: u64,

    /// The current read session, which starts at `position`.  `None` after a seek, until the next
    /// read
    body: Option<StreamReader>,

    handle: Handle,

    closed: bool,
}

impl ObjectReader {
    /// Check that the object exists, then start reading it from the beginning
    #[instrument(skip(store), fields(bucket = store.bucket()))]
    pub(crate) async fn open(store: Box<dyn ObjectStore>, key: &str) -> Result<Self> {
        // Stat first so a missing object is reported here rather than on the first read
        let info = store.stat(key).await?;

        debug!(size = info.size, "Object exists; starting read");

        let body = store.get(key, None).await?;
        let handle = Handle::current();

        Ok(Self {
            store,
            info: body.info,
            position: 0,
            body: Some(stream_as_reader(body.data, handle.clone())),
            handle,
            closed: false,
        })
    }

    /// Metadata of the object, as of the time it was opened
    pub fn info(&self) -> &ObjectInfo {
        &self.info
    }

    /// Query the current metadata of the object from object storage.
    ///
    /// Fails with [`crate::ErrorKind::NotFound`] if the object was deleted since it was opened.
    pub fn stat(&self) -> Result<ObjectInfo> {
        self.ensure_open()?;

        self.handle.block_on(self.store.stat(&self.info.key))
    }

    /// Read up to `buf.len()` bytes starting at `offset`, without using or changing the position
    /// of the cursor used by [`Read`] and [`Seek`].
    ///
    /// Returns the number of bytes read, which is only less than `buf.len()` if the end of the
    /// object was reached.  An offset at or past the end of the object reads nothing.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
        self.ensure_open()?;

        if buf.is_empty() || offset >= self.info.size {
            return Ok(0);
        }

        let end = offset
            .saturating_add(buf.len() as u64)
            .min(self.info.size);

        let bytes_read = self.handle.block_on(async {
            let mut body = self.store.get(&self.info.key, Some(offset..end)).await?;
            let mut filled = 0;

            while filled < buf.len() {
                match body.data.try_next().await? {
                    None => break,
                    Some(chunk) => {
                        let len = chunk.len().min(buf.len() - filled);
                        buf[filled..filled + len].copy_from_slice(&chunk[..len]);
                        filled += len;
                    }
                }
            }

            Result::<_>::Ok(filled)
        })?;

        Ok(bytes_read)
    }

    /// Release the read session.
    ///
    /// Must be called exactly once; a second call fails with
    /// [`crate::ErrorKind::ClosedHandle`].
    pub fn close(&mut self) -> Result<()> {
        self.ensure_open()?;

        debug!(key = %self.info.key, position = self.position, "Closing object reader");

        self.body = None;
        self.closed = true;

        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        ensure!(
            !self.closed,
            crate::error::HandleClosedSnafu {
                key: &self.info.key
            }
        );

        Ok(())
    }
}

impl Read for ObjectReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.ensure_open()?;

        if buf.is_empty() || self.position >= self.info.size {
            return Ok(0);
        }

        let mut body = match self.body.take() {
            Some(body) => body,
            None => {
                debug!(key = %self.info.key, position = self.position, "Resuming read after seek");

                let body = self.handle.block_on(
                    self.store
                        .get(&self.info.key, Some(self.position..self.info.size)),
                )?;

                stream_as_reader(body.data, self.handle.clone())
            }
        };

        let result = body.read(buf);
        self.body = Some(body);

        let bytes_read = result?;
        self.position += bytes_read as u64;

        Ok(bytes_read)
    }
}

impl Seek for ObjectReader {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.ensure_open()?;

        let position = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::Current(delta) => self.position as i128 + delta as i128,
            SeekFrom::End(delta) => self.info.size as i128 + delta as i128,
        };

        let position = u64::try_from(position).map_err(|_| {
            crate::error::NegativeSeekSnafu {
                key: &self.info.key,
                position,
            }
            .build()
        })?;

        if position != self.position {
            self.body = None;
            self.position = position;
        }

        Ok(position)
    }
}

impl std::fmt::Debug for ObjectReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectReader")
            .field("store", &self.store)
            .field("info", &self.info)
            .field("position", &self.position)
            .field("closed", &self.closed)
            .finish()
    }
}
