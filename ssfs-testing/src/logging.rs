//! Per-test log capture.
//!
//! The handles in `ssfs` log from background tasks and blocking threads, which the usual
//! thread-local test subscribers never see.  The harness here gives each test its own runtime
//! whose threads all log to the same buffer, and prints that buffer once the test is over.
use crate::Result;
use std::{
    cell::RefCell,
    future::Future,
    io::Write,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing_subscriber::fmt::MakeWriter;

/// Log filter used when `RUST_LOG` isn't set
const DEFAULT_FILTER: &str = "h2=warn,hyper=info,rustls=info,aws=info,ssfs=trace,debug";

/// Collects the formatted log events of one test
#[derive(Clone, Default)]
struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    /// Take everything logged so far.  Panics if the log output isn't UTF-8
    fn drain(&self) -> String {
        let buffer = std::mem::take(&mut *self.buffer.lock().unwrap());

        String::from_utf8(buffer).unwrap()
    }
}

impl<'a> Write for &'a LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = &'a Self;

    fn make_writer(&'a self) -> Self::Writer {
        self
    }
}

std::thread_local! {
    static RUNTIME_THREAD_DISPATCH: RefCell<Option<tracing::subscriber::DefaultGuard>> =
        RefCell::new(None);
}

/// Run an async test in its own multi-threaded tokio runtime, with logging enabled.
///
/// Use this in place of `#[tokio::test]`.  Every worker and blocking thread of the runtime logs
/// into a buffer owned by this test only, so the output isn't mixed with that of tests running in
/// parallel.  The buffer is printed when the test finishes, even if it panics.
pub fn test_with_logging(test: impl Future<Output = Result<()>>) -> Result<()> {
    let capture = LogCapture::default();

    let dispatch = {
        use tracing_subscriber::prelude::*;
        use tracing_subscriber::{fmt, EnvFilter};

        let format = fmt::layer()
            .with_level(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(false)
            .with_writer(capture.clone());

        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(DEFAULT_FILTER))
            .unwrap();

        Arc::new(tracing::Dispatch::new(
            tracing_subscriber::registry().with(filter).with(format),
        ))
    };

    let result = tracing::dispatcher::with_default(&dispatch, || {
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        builder.enable_all();

        {
            let dispatch = dispatch.clone();
            builder.on_thread_start(move || {
                let guard = tracing::dispatcher::set_default(&dispatch);
                RUNTIME_THREAD_DISPATCH.with(|cell| cell.replace(Some(guard)));
            });
        }
        builder.on_thread_stop(|| {
            RUNTIME_THREAD_DISPATCH.with(|cell| cell.replace(None));
        });

        let runtime = builder.build()?;

        // Test futures can't all be expected to be unwind safe; the runtime is discarded after a
        // panic anyway
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(move || {
            let result = runtime.block_on(test);
            runtime.shutdown_timeout(Duration::from_secs(10));

            result
        }));

        println!("Log events from this test: \n{}", capture.drain());

        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    });

    result
}
