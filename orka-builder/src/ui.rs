//! User-facing progress sink.
//!
//! Steps report progress with `say` and failures with `error`. Diagnostics
//! that are only useful when debugging go through `tracing` instead.

use std::io::Write;

pub trait Ui: Send + Sync {
    /// Informational message.
    fn say(&self, message: &str);

    /// Error message. Does not affect the build outcome by itself.
    fn error(&self, message: &str);
}

/// Writes progress to stdout and errors to stderr, prefixed with the builder name.
#[derive(Debug, Clone)]
pub struct ConsoleUi {
    prefix: String,
}

impl ConsoleUi {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for ConsoleUi {
    fn default() -> Self {
        Self::new("orka")
    }
}

impl Ui for ConsoleUi {
    fn say(&self, message: &str) {
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "==> {}: {}", self.prefix, message);
    }

    fn error(&self, message: &str) {
        let mut err = std::io::stderr().lock();
        let _ = writeln!(err, "==> {}: {}", self.prefix, message);
    }
}
