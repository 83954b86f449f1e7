//! Logging setup and per-run log capture
//!
//! The CLI installs a global stderr subscriber once. Each run then executes
//! under its own scoped dispatcher whose formatter writes into a
//! [`LogCapture`] buffer, so the text stored on the experiment record
//! contains exactly that run's events.

use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::Dispatch;
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Environment variable consulted by [`init_cli_tracing`].
pub const LOG_ENV: &str = "FEDLAB_LOG";

/// Install the global stderr subscriber for the binary.
///
/// Uses `FEDLAB_LOG` when set, else `default_filter`. Calling this twice is
/// harmless; the second install is ignored.
pub fn init_cli_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr))
        .try_init();
}

/// Shared in-memory log buffer.
#[derive(Debug, Clone, Default)]
pub struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    /// Create an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a dispatcher that writes formatted events into this buffer,
    /// and to stderr as well when `echo` is set.
    #[must_use]
    pub fn dispatch(&self, filter: &str, echo: bool) -> Dispatch {
        let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
        let capture = fmt::layer()
            .with_writer(self.clone())
            .with_ansi(false)
            .with_target(false);
        let echo = echo.then(|| fmt::layer().with_writer(io::stderr));

        Dispatch::new(
            tracing_subscriber::registry()
                .with(env_filter)
                .with(capture)
                .with(echo),
        )
    }

    /// Captured text so far (lossy UTF-8).
    #[must_use]
    pub fn contents(&self) -> String {
        let buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&buffer).into_owned()
    }

    /// True if nothing was captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}

/// Writer handed out per event by [`LogCapture`].
#[derive(Debug)]
pub struct CaptureWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl io::Write for CaptureWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = CaptureWriter;

    fn make_writer(&'a self) -> Self::Writer {
        CaptureWriter {
            buffer: Arc::clone(&self.buffer),
        }
    }
}
