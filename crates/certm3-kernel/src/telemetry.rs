//! Structured logging for both middleware processes.
//!
//! Log records are JSON lines with an RFC-3339 timestamp at millisecond
//! precision including the local offset. Output goes to the configured
//! append-only log file; `verbose` tees every line to stdout as well.
//! Security events always pass through [`security_event`] so the event-type
//! vocabulary matches the `security_events_total` metric labels.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to open log file {path}: {source}")]
    LogFile {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid log level: {0}")]
    Level(String),
    #[error("failed to install subscriber: {0}")]
    Subscriber(String),
}

/// Appends to the log file and optionally mirrors to stdout.
#[derive(Clone)]
struct TeeWriter {
    file: Arc<Mutex<File>>,
    stdout: bool,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut file = self.file.lock().expect("log file lock poisoned");
        file.write_all(buf)?;
        if self.stdout {
            io::stdout().write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut file = self.file.lock().expect("log file lock poisoned");
        file.flush()?;
        if self.stdout {
            io::stdout().flush()?;
        }
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for TeeWriter {
    type Writer = TeeWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Installs the global subscriber. Call once per process, before anything
/// logs.
pub fn init(level: &str, log_file: &str, verbose: bool) -> Result<(), TelemetryError> {
    let filter =
        EnvFilter::try_new(level).map_err(|_| TelemetryError::Level(level.to_string()))?;

    let path = Path::new(log_file);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| TelemetryError::LogFile {
            path: log_file.to_string(),
            source,
        })?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| TelemetryError::LogFile {
            path: log_file.to_string(),
            source,
        })?;

    let writer = TeeWriter {
        file: Arc::new(Mutex::new(file)),
        stdout: verbose,
    };

    tracing_subscriber::fmt()
        .json()
        .flatten_event(true)
        .with_timer(ChronoLocal::new("%Y-%m-%dT%H:%M:%S%.3f%:z".to_string()))
        .with_env_filter(filter)
        .with_writer(writer)
        .try_init()
        .map_err(|e| TelemetryError::Subscriber(e.to_string()))?;

    Ok(())
}

/// Logs a security-relevant event and bumps the matching metric.
pub fn security_event(event_type: &str, path: &str, remote_ip: &str, detail: &str) {
    tracing::warn!(event_type, path, remote_ip, detail, "security event");
    crate::metrics::record_security_event(event_type);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tee_writer_appends_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .unwrap();
        let mut writer = TeeWriter {
            file: Arc::new(Mutex::new(file)),
            stdout: false,
        };
        writer.write_all(b"{\"msg\":\"one\"}\n").unwrap();
        writer.write_all(b"{\"msg\":\"two\"}\n").unwrap();
        writer.flush().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
