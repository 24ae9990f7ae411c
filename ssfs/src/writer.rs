//! Blocking writes of a new object, streamed to object storage by a background upload task.
use crate::async_bridge::pipe_bridge;
use crate::objstore::{ObjectInfo, ObjectStore};
use crate::{Config, Result};
use snafu::IntoError;
use std::future::Future;
use std::io::Write;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, DuplexStream, ReadBuf};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, error, instrument, warn, Instrument};

/// An object opened for writing with [`crate::ObjectFs::create`].
///
/// Bytes written to this type are passed through a bounded in-memory pipe to a background task
/// which uploads them to object storage as they arrive.  If the upload falls behind, writes block
/// until there is room in the pipe again, so memory usage stays bounded no matter how big the
/// object is.
///
/// The object only exists in object storage once [`Self::close`] returns successfully.  Any
/// failure of the upload is reported by `close`; a write that fails because the upload already
/// gave up is reported with a less specific IO error, so always call `close` to learn what
/// actually happened.
///
/// Dropping the writer without closing it cancels the upload, and no object is created.
///
/// Like [`crate::ObjectReader`], all methods block and must be called from a blocking thread.
pub struct ObjectWriter {
    key: String,
    state: UploadState,
    cancel: CancellationToken,
    handle: Handle,
}

/// The life cycle of an upload.  Any failure during `Closing` leads to `Failed`.
enum UploadState {
    /// Accepting writes
    Open {
        pipe: SyncIoBridge<DuplexStream>,
        upload: JoinHandle<Result<ObjectInfo>>,
    },

    /// The pipe is shut down and `close` is waiting for the upload to finish
    Closing,

    /// The upload completed and the object is committed
    Closed,

    /// `close` was called but the upload didn't complete
    Failed,
}

impl std::fmt::Debug for UploadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self {
            Self::Open { .. } => "Open",
            Self::Closing => "Closing",
            Self::Closed => "Closed",
            Self::Failed => "Failed",
        };

        f.write_str(state)
    }
}

impl ObjectWriter {
    /// Spawn the upload task for `key` and return the writer which feeds it.
    ///
    /// Must be called from within a tokio runtime.
    #[instrument(skip(store, config), fields(bucket = store.bucket()))]
    pub(crate) fn start(store: Box<dyn ObjectStore>, key: &str, config: &Config) -> Self {
        let (producer, consumer) = tokio::io::duplex(config.pipe_buffer_size());
        let cancel = CancellationToken::new();
        let handle = Handle::current();

        let body = CancellableRead::new(consumer, key, cancel.clone());

        // The size is never known in advance; the store has to discover it by reading until EOF
        let upload = {
            let key = key.to_string();
            let span = tracing::debug_span!("upload", key = %key);

            tokio::spawn(
                async move {
                    let result = store.put(&key, Box::new(body), None).await;

                    match &result {
                        Ok(info) => debug!(size = info.size, "Upload completed"),
                        Err(e) => error!(err = ?e, "Upload failed"),
                    }

                    result
                }
                .instrument(span),
            )
        };

        debug!("Upload task started");

        Self {
            key: key.to_string(),
            state: UploadState::Open {
                pipe: pipe_bridge(producer, handle.clone()),
                upload,
            },
            cancel,
            handle,
        }
    }

    /// The key of the object being written
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Signal that there is no more data to write, and wait for the upload to complete.
    ///
    /// Returns the metadata of the newly created object.  If the upload failed, returns the error
    /// that it failed with.  If the pipe to the upload task couldn't be shut down, the upload is
    /// cancelled and the pipe error is returned with kind
    /// [`crate::ErrorKind::PartialPipeFailure`].
    ///
    /// Must be called exactly once; a second call fails with
    /// [`crate::ErrorKind::ClosedHandle`].
    pub fn close(&mut self) -> Result<ObjectInfo> {
        let (mut pipe, upload) = match std::mem::replace(&mut self.state, UploadState::Closing) {
            UploadState::Open { pipe, upload } => (pipe, upload),
            state => {
                self.state = state;

                return crate::error::HandleClosedSnafu { key: &self.key }.fail();
            }
        };

        debug!(key = %self.key, "Closing object writer");

        let shutdown = pipe.shutdown();
        drop(pipe);

        let result = finish_upload(&self.key, shutdown, upload, &self.cancel, &self.handle);

        self.state = if result.is_ok() {
            UploadState::Closed
        } else {
            UploadState::Failed
        };

        debug!(key = %self.key, state = ?self.state, "Object writer closed");

        result
    }

    fn pipe(&mut self) -> Result<&mut SyncIoBridge<DuplexStream>> {
        match &mut self.state {
            UploadState::Open { pipe, .. } => Ok(pipe),
            _ => crate::error::HandleClosedSnafu { key: &self.key }.fail(),
        }
    }
}

impl Write for ObjectWriter {
    /// Blocks until all of `buf` has been accepted by the pipe, so this always either writes
    /// the whole buffer or fails.
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.pipe()?.write_all(buf)?;

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.pipe()?.flush()
    }
}

impl Drop for ObjectWriter {
    fn drop(&mut self) {
        if let UploadState::Open { .. } = &self.state {
            // Cancel before the pipe is dropped along with `state`, otherwise the upload task
            // would see EOF and commit a truncated object
            warn!(key = %self.key, "Object writer dropped without being closed; cancelling upload");
            self.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for ObjectWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectWriter")
            .field("key", &self.key)
            .field("state", &self.state)
            .finish()
    }
}

/// Wait for the upload task once the pipe has been shut down (or failed to shut down), and
/// return the outcome of the close.
///
/// If the shutdown failed the task may never see EOF, so it's cancelled before waiting for it, and
/// the shutdown error is what's reported.
fn finish_upload(
    key: &str,
    shutdown: std::io::Result<()>,
    upload: JoinHandle<Result<ObjectInfo>>,
    cancel: &CancellationToken,
    handle: &Handle,
) -> Result<ObjectInfo> {
    if shutdown.is_err() {
        warn!(%key, "Failed to shut down upload pipe; cancelling upload");
        cancel.cancel();
    }

    let outcome = handle.block_on(upload);

    match (shutdown, outcome) {
        (Err(e), outcome) => {
            if let Ok(Err(upload_err)) = outcome {
                debug!(%key, err = ?upload_err, "Upload stopped after the pipe failed");
            }

            Err(crate::error::ClosePipeSnafu { key }.into_error(e))
        }
        (Ok(()), Ok(result)) => result,
        (Ok(()), Err(e)) => Err(crate::error::BackgroundTaskSnafu.into_error(e)),
    }
}

/// The body of an upload, which reads from the consumer end of the pipe until it's cancelled.
///
/// Once cancelled, every read fails, which makes the object store abandon the upload.
struct CancellableRead<R> {
    inner: R,
    key: String,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl<R> CancellableRead<R> {
    fn new(inner: R, key: &str, token: CancellationToken) -> Self {
        Self {
            inner,
            key: key.to_string(),
            cancelled: Box::pin(token.cancelled_owned()),
        }
    }

    fn cancelled_error(&self) -> std::io::Error {
        crate::error::UploadCancelledSnafu { key: &self.key }
            .build()
            .into()
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CancellableRead<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        // Polling the cancellation future also registers the waker, so a read that is pending on
        // an empty pipe still wakes up when the token is cancelled
        if self.cancelled.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(self.cancelled_error()));
        }

        let filled = buf.filled().len();

        match Pin::new(&mut self.inner).poll_read(cx, buf) {
            // A dropped writer is cancelled before its end of the pipe is closed, so an EOF could
            // really be a cancellation
            Poll::Ready(Ok(())) if buf.filled().len() == filled => {
                if self.cancelled.as_mut().poll(cx).is_ready() {
                    Poll::Ready(Err(self.cancelled_error()))
                } else {
                    Poll::Ready(Ok(()))
                }
            }
            other => other,
        }
    }
}
