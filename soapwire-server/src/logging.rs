//! The per-request log.
//!
//! Distinct from `tracing` diagnostics: this is the operator-facing,
//! append-only request log the server owns. One line per logged event,
//! prefixed with a UTC timestamp; flushing is explicit so bursts stay
//! cheap.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

use soapwire_core::SoapMessage;
use tracing::warn;

/// How much ends up in the request log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// Nothing at all.
    #[default]
    None,
    /// Faults and server errors only.
    Faults,
    /// Every call, plus faults and errors.
    Every,
}

impl LogLevel {
    fn from_u8(raw: u8) -> LogLevel {
        match raw {
            2 => LogLevel::Every,
            1 => LogLevel::Faults,
            _ => LogLevel::None,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            LogLevel::None => 0,
            LogLevel::Faults => 1,
            LogLevel::Every => 2,
        }
    }
}

#[derive(Debug, Default)]
struct LogFile {
    writer: Option<BufWriter<File>>,
    path: Option<PathBuf>,
}

/// Thread-safe append-only log writer with a tunable level.
#[derive(Debug, Default)]
pub struct ServerLogger {
    level: AtomicU8,
    file: Mutex<LogFile>,
}

impl ServerLogger {
    pub fn new() -> Self {
        ServerLogger::default()
    }

    /// Open (or create) the log file in append mode.
    pub fn set_file(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let path = path.as_ref();
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut guard = self.file.lock().unwrap_or_else(|e| e.into_inner());
        guard.writer = Some(BufWriter::new(file));
        guard.path = Some(path.to_owned());
        Ok(())
    }

    pub fn file_name(&self) -> Option<PathBuf> {
        self.file
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .path
            .clone()
    }

    /// Takes effect immediately for subsequent events.
    pub fn set_level(&self, level: LogLevel) {
        self.level.store(level.as_u8(), Ordering::Relaxed);
    }

    pub fn level(&self) -> LogLevel {
        LogLevel::from_u8(self.level.load(Ordering::Relaxed))
    }

    /// `CALL <method>` — logged at `Every`.
    pub fn log_call(&self, method: &str) {
        if self.level() == LogLevel::Every {
            self.write_line(&format!("CALL {method}"));
        }
    }

    /// `FAULT <method> -- <fault summary>` — logged at `Faults` and above.
    pub fn log_fault(&self, method: &str, fault: &SoapMessage) {
        if self.level() != LogLevel::None {
            self.write_line(&format!("FAULT {method} -- {}", fault.fault_as_string()));
        }
    }

    /// `ERROR <message>` — logged unless the level is `None`.
    pub fn log_error(&self, message: &str) {
        if self.level() != LogLevel::None {
            self.write_line(&format!("ERROR {message}"));
        }
    }

    pub fn flush(&self) {
        let mut guard = self.file.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(writer) = guard.writer.as_mut() {
            if let Err(e) = writer.flush() {
                warn!("failed to flush request log: {e}");
            }
        }
    }

    fn write_line(&self, line: &str) {
        let mut guard = self.file.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(writer) = guard.writer.as_mut() {
            let stamp = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            if let Err(e) = writeln!(writer, "{stamp} {line}") {
                warn!("failed to write request log: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn read_lines(path: &Path) -> Vec<String> {
        let mut text = String::new();
        File::open(path).unwrap().read_to_string(&mut text).unwrap();
        text.lines().map(str::to_owned).collect()
    }

    #[test]
    fn test_levels_and_line_format() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("soapwire-log-test-{}.log", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let logger = ServerLogger::new();
        logger.set_file(&path).unwrap();
        logger.set_level(LogLevel::Every);

        let mut fault = SoapMessage::new();
        fault.set_fault("Client.Data", "Empty employee name", "", "");

        logger.log_call("getEmployeeCountry");
        logger.log_fault("getEmployeeCountry", &fault);
        logger.flush();

        logger.set_level(LogLevel::None);
        logger.log_call("getEmployeeCountry");
        logger.log_fault("getEmployeeCountry", &fault);
        logger.flush();

        logger.set_level(LogLevel::Faults);
        logger.log_call("getEmployeeCountry");
        logger.log_fault("getEmployeeCountry", &fault);
        logger.log_error("Too many connections (2), incoming connection rejected");
        logger.flush();

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 4);
        assert!(lines[0].ends_with("CALL getEmployeeCountry"));
        assert!(lines[1]
            .ends_with("FAULT getEmployeeCountry -- Fault code Client.Data: Empty employee name"));
        assert!(lines[2].ends_with("FAULT getEmployeeCountry -- Fault code Client.Data: Empty employee name"));
        assert!(
            lines[3].ends_with("ERROR Too many connections (2), incoming connection rejected")
        );
        // ISO timestamp prefix
        assert!(lines[0].split(' ').next().unwrap().contains('T'));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_append_mode_preserves_existing_lines() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("soapwire-log-append-{}.log", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let logger = ServerLogger::new();
        logger.set_file(&path).unwrap();
        logger.set_level(LogLevel::Every);
        logger.log_call("first");
        logger.flush();
        drop(logger);

        let logger = ServerLogger::new();
        logger.set_file(&path).unwrap();
        logger.set_level(LogLevel::Every);
        logger.log_call("second");
        logger.flush();

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("CALL first"));
        assert!(lines[1].ends_with("CALL second"));

        let _ = std::fs::remove_file(&path);
    }
}
