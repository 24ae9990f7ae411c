//! The blocking task which writes an archive into its pipe.
//!
//! The writers are chained like this, each owning the next:
//!
//! ```text
//! tar::Builder -> Gate -> GzEncoder -> SyncIoBridge -> pipe
//! ```
//!
//! and are shut down in that same order when the producer is done, whether it succeeded or not.
use super::{ArchiveEntry, ArchiveSummary};
use crate::async_bridge::{pipe_bridge, stream_as_reader};
use crate::objstore::{ObjectInfo, ObjectStore};
use crate::Result;
use flate2::write::GzEncoder;
use flate2::Compression;
use snafu::prelude::*;
use std::io::{Read, Write};
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio::runtime::Handle;
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

type ArchiveBuilder = tar::Builder<Gate<GzEncoder<SyncIoBridge<DuplexStream>>>>;

pub(super) struct Producer {
    pub store: Box<dyn ObjectStore>,
    pub prefix: String,
    pub entries: Arc<Vec<ArchiveEntry>>,
    pub compression: Compression,
    pub cancel: CancellationToken,
    pub handle: Handle,
}

impl Producer {
    /// Write every entry into the archive and finish it, or stop at the first failure.
    ///
    /// Must be run on a blocking thread.
    pub fn run(self, pipe: DuplexStream) -> Result<ArchiveSummary> {
        let sink = pipe_bridge(pipe, self.handle.clone());
        let mut builder = tar::Builder::new(Gate::new(GzEncoder::new(sink, self.compression)));

        let outcome = self.append_entries(&mut builder);

        if outcome.is_err() {
            // Whatever was already written stays in the archive, but without an end marker
            // nobody will mistake it for a complete archive
            builder.get_mut().close();
        }

        let shutdown = self.shutdown(builder);

        match (outcome, shutdown) {
            (Ok(summary), Ok(())) => {
                debug!(entries = summary.entries, bytes = summary.bytes, "Archive completed");

                Ok(summary)
            }
            (Ok(_), Err(e)) => {
                error!(err = ?e, "Failed to finish archive");

                Err(e)
            }
            (Err(e), shutdown) => {
                if self.cancel.is_cancelled() {
                    debug!(err = ?e, "Archive producer cancelled");
                } else {
                    error!(err = ?e, "Archive failed");
                }

                if let Err(shutdown_err) = shutdown {
                    debug!(err = ?shutdown_err, "Error shutting down failed archive");
                }

                Err(e)
            }
        }
    }

    fn append_entries(&self, builder: &mut ArchiveBuilder) -> Result<ArchiveSummary> {
        let mut summary = ArchiveSummary::default();

        for entry in self.entries.iter() {
            ensure!(
                !self.cancel.is_cancelled(),
                crate::error::ArchiveAbandonedSnafu {
                    prefix: &self.prefix
                }
            );

            let size = self.append_entry(builder, entry)?;

            summary.entries += 1;
            summary.bytes += size;
        }

        Ok(summary)
    }

    /// Read one object and write it to the archive, returning its size.
    ///
    /// The read session is released before this returns.
    fn append_entry(&self, builder: &mut ArchiveBuilder, entry: &ArchiveEntry) -> Result<u64> {
        let body = self.handle.block_on(async {
            tokio::select! {
                _ = self.cancel.cancelled() => crate::error::ArchiveAbandonedSnafu {
                    prefix: &self.prefix,
                }
                .fail(),
                body = self.store.get(&entry.key, None) => body,
            }
        })?;

        // Size and timestamp as of this read, not as of the listing
        let ObjectInfo {
            size, modified_at, ..
        } = body.info;

        debug!(key = %entry.key, name = %entry.name, size, "Appending object to archive");

        let mut header = tar::Header::new_gnu();
        header.set_size(size);
        header.set_mtime(modified_at.timestamp().max(0) as u64);
        header.set_mode(ObjectInfo::MODE);
        header.set_uid(0);
        header.set_gid(0);
        header.set_entry_type(tar::EntryType::Regular);

        let data = ExactLength::new(stream_as_reader(body.data, self.handle.clone()), size);

        append_named(builder, &mut header, &entry.name, data).with_context(|_| {
            crate::error::AppendArchiveEntrySnafu {
                key: &entry.key,
                name: &entry.name,
            }
        })?;

        Ok(size)
    }

    /// Finish the tar archive, then the gzip stream, then shut down the pipe so the reader sees
    /// EOF.
    ///
    /// If a stage fails, the later stages are still closed when they are dropped.
    fn shutdown(&self, builder: ArchiveBuilder) -> Result<()> {
        let gate = builder
            .into_inner()
            .context(crate::error::FinishArchiveSnafu {
                prefix: &self.prefix,
            })?;

        let mut sink = gate
            .into_inner()
            .finish()
            .context(crate::error::FinishArchiveSnafu {
                prefix: &self.prefix,
            })?;

        sink.shutdown().context(crate::error::FinishArchiveSnafu {
            prefix: &self.prefix,
        })?;

        Ok(())
    }
}

/// Append an entry to the archive under `name`, exactly as given.
///
/// [`tar::Builder::append_data`] refuses names with `..` components, but those are perfectly
/// good object keys, so the name is written into the header here instead.  Names too long for
/// the header are preceded by a GNU long name entry, the same way `tar` does it.
fn append_named<W: Write>(
    builder: &mut tar::Builder<W>,
    header: &mut tar::Header,
    name: &str,
    data: impl Read,
) -> std::io::Result<()> {
    let name = name.as_bytes();
    let field = &mut header.as_old_mut().name;

    if name.len() > field.len() {
        const LONG_LINK: &[u8] = b"././@LongLink";

        let mut long_name = tar::Header::new_gnu();
        long_name.as_old_mut().name[..LONG_LINK.len()].copy_from_slice(LONG_LINK);
        long_name.set_mode(0o644);
        long_name.set_uid(0);
        long_name.set_gid(0);
        long_name.set_mtime(0);
        // The name is NUL terminated
        long_name.set_size(name.len() as u64 + 1);
        long_name.set_entry_type(tar::EntryType::GNULongName);
        long_name.set_cksum();

        builder.append(&long_name, name.chain(&[0u8][..]))?;
    }

    let len = name.len().min(field.len());
    field[..len].copy_from_slice(&name[..len]);
    header.set_cksum();

    builder.append(header, data)
}

/// Passes writes through to the inner writer until closed, after which everything written is
/// discarded.
///
/// The tar builder always writes its end marker when it's finished or dropped.  Closing the gate
/// in front of the compressor is how the marker is kept out of a failed archive.
pub(super) struct Gate<W> {
    inner: W,
    open: bool,
}

impl<W: Write> Gate<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, open: true }
    }

    pub fn close(&mut self) {
        self.open = false;
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for Gate<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.open {
            self.inner.write(buf)
        } else {
            Ok(buf.len())
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if self.open {
            self.inner.flush()
        } else {
            Ok(())
        }
    }
}

/// Reads exactly `size` bytes from an object body.
///
/// The tar header declares the size before the body is copied, so a body that turns out shorter
/// would corrupt the archive.  That's an error; anything past `size` is ignored.
struct ExactLength<R> {
    inner: R,
    remaining: u64,
}

impl<R: Read> ExactLength<R> {
    fn new(inner: R, size: u64) -> Self {
        Self {
            inner,
            remaining: size,
        }
    }
}

impl<R: Read> Read for ExactLength<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }

        let len = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
        let bytes_read = self.inner.read(&mut buf[..len])?;

        if bytes_read == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("object body ended {} bytes early", self.remaining),
            ));
        }

        self.remaining -= bytes_read as u64;

        Ok(bytes_read)
    }
}
