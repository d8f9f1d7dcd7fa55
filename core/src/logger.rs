//! # Log Sink Glue
//!
//! The library reports through the `log` facade; this module is the thin
//! bridge that points the facade at the sink named in the configuration.
//! If the embedding process already installed a logger, that logger wins
//! and the configured sink is ignored; library messages still flow.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::sync::Mutex;

use log::{LevelFilter, Log, Metadata, Record};

use crate::config::{LogConfig, LogSink};

enum SinkWriter {
    Stderr,
    File(Mutex<std::fs::File>),
}

struct SinkLogger {
    writer: SinkWriter,
}

/// One output line per record: level, then the message (modules prefix
/// their messages with the subsystem name already).
fn format_line(record: &Record<'_>) -> String {
    format!("{:<5} {}\n", record.level(), record.args())
}

impl Log for SinkLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format_line(record);
        match &self.writer {
            SinkWriter::Stderr => {
                let _ = io::stderr().lock().write_all(line.as_bytes());
            }
            SinkWriter::File(file) => {
                if let Ok(mut file) = file.lock() {
                    let _ = file.write_all(line.as_bytes());
                }
            }
        }
    }

    fn flush(&self) {}
}

/// Install the configured sink (best effort)
///
/// Returns an error only when a file sink cannot be opened; an already
/// installed process logger is not an error.
pub(crate) fn install(config: &LogConfig) -> io::Result<()> {
    let writer = match &config.sink {
        LogSink::Stderr => SinkWriter::Stderr,
        LogSink::File(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            SinkWriter::File(Mutex::new(file))
        }
    };

    let level = if config.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    if log::set_boxed_logger(Box::new(SinkLogger { writer })).is_ok() {
        log::set_max_level(level);
    }
    Ok(())
}
