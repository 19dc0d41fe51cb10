//! User requests shared between the web UI, the terminal and the session
//!
//! Producers raise flags from any thread; the running session polls once
//! per tick. A capture request is consumed by the poll that sees it, an
//! abort request stays raised.

use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

use crate::vision::{Signal, SignalSource};

#[derive(Debug, Default)]
pub struct SignalHub {
    capture: AtomicBool,
    abort: AtomicBool,
}

impl SignalHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn request_capture(&self) {
        self.capture.store(true, Ordering::SeqCst);
    }

    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    pub fn raise(&self, signal: Signal) {
        match signal {
            Signal::Capture => self.request_capture(),
            Signal::Abort => self.request_abort(),
        }
    }

    pub fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    /// Pending request, abort first
    pub fn take(&self) -> Option<Signal> {
        if self.abort_requested() {
            return Some(Signal::Abort);
        }
        self.capture
            .swap(false, Ordering::SeqCst)
            .then_some(Signal::Capture)
    }
}

impl SignalSource for Arc<SignalHub> {
    fn poll(&mut self) -> Option<Signal> {
        self.take()
    }
}

/// Key binding of one terminal line: `q` or ESC aborts, `c` or a space
/// captures
pub fn parse_line(line: &str) -> Option<Signal> {
    if line.contains('q') || line.contains('\u{1b}') {
        Some(Signal::Abort)
    } else if line.contains('c') || line.contains(' ') {
        Some(Signal::Capture)
    } else {
        None
    }
}

/// Forward terminal input to `hub` from a background thread.
///
/// The thread ends at EOF; a closed stdin is not an abort.
pub fn spawn_stdin_listener(hub: Arc<SignalHub>) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("stdin-signals".into())
        .spawn(move || {
            info!("Keys: 'c' + Enter to capture, 'q' + Enter to quit");
            for line in std::io::stdin().lock().lines() {
                match line {
                    Ok(line) => {
                        if let Some(signal) = parse_line(&line) {
                            debug!("Terminal requested {:?}", signal);
                            hub.raise(signal);
                        }
                    }
                    Err(e) => {
                        warn!("Failed to read terminal input: {}", e);
                        break;
                    }
                }
            }
            debug!("Terminal input closed");
        })
}
