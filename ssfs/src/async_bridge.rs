//! Types which bridge between async `Stream`/`AsyncRead`/`AsyncWrite` and synchronous `Read` and
//! `Write` types.
//!
//! The object store is only reachable with async code, but the handles this crate gives out are
//! blocking, file-like readers and writers, and the `tar` and `flate2` crates operate on
//! synchronous `Read` and `Write` traits too.  Everything in here bridges across that gap by
//! blocking on a runtime [`Handle`].
//!
//! Every type produced here panics if its blocking methods are called from an async context.
//! Blocking I/O must be performed on a blocking worker thread, for example one started by
//! [`tokio::task::spawn_blocking`].

use crate::Result;
use bytes::{Buf, Bytes};
use futures::{Stream, StreamExt};
use std::{io::Read, pin::Pin};
use tokio::runtime::Handle;
use tokio_util::io::SyncIoBridge;

/// A boxed stream of object data, as yielded by the object store
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Given a [`Stream`] impl that yields chunks of bytes, produce a [`Read`] implementation that
/// will expose those very same bytes for blocking reads.
pub(crate) fn stream_as_reader(stream: ByteStream, handle: Handle) -> StreamReader {
    StreamReader {
        buffer: Bytes::new(),
        stream,
        handle,
    }
}

/// Wrap an async reader or writer (in our case one end of a [`tokio::io::DuplexStream`]) in a
/// synchronous bridge that performs its I/O on `handle`.
pub(crate) fn pipe_bridge<T: Unpin>(io: T, handle: Handle) -> SyncIoBridge<T> {
    SyncIoBridge::new_with_handle(io, handle)
}

pub(crate) struct StreamReader {
    buffer: Bytes,
    stream: ByteStream,
    handle: Handle,
}

impl Read for StreamReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        // Empty chunks are legal in the stream, but a zero-length read means EOF to our caller,
        // so keep pulling until there's actually something to return
        while !self.buffer.has_remaining() {
            match self.handle.block_on(self.stream.next()) {
                None => return Ok(0),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(bytes)) => self.buffer = bytes,
            }
        }

        // Short reads are fine per the `Read` contract, so don't try to top up `buf` with another
        // chunk from the stream
        let len = buf.len().min(self.buffer.remaining());
        self.buffer.copy_to_slice(&mut buf[..len]);

        Ok(len)
    }
}
