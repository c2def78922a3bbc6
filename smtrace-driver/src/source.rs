//! Loading models, traces and kernel logs from disk.
//!
//! Traces and kernel logs are JSON lines: one record per line, blank lines
//! and lines starting with `#` ignored.

use crate::config::InputConfig;
use crate::error::DriverError;
use serde::de::DeserializeOwned;
use smtrace_core::{KernelLog, KernelRecord, Model, TraceEvent};
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Loads and validates a model definition.
pub fn load_model(path: impl AsRef<Path>) -> Result<Model, DriverError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| DriverError::io(path, e))?;
    let model = Model::from_json_str(&content)?;
    info!(
        model = %model.name(),
        nodes = model.nodes().len(),
        checksum = %model.checksum(),
        "loaded model"
    );
    Ok(model)
}

/// Iterator over the records of a JSON lines reader.
pub struct JsonLines<R, T> {
    lines: Lines<R>,
    path: PathBuf,
    line: usize,
    _record: PhantomData<T>,
}

impl<R: BufRead, T: DeserializeOwned> JsonLines<R, T> {
    /// `path` is only used in error messages.
    pub fn new(reader: R, path: impl Into<PathBuf>) -> Self {
        Self {
            lines: reader.lines(),
            path: path.into(),
            line: 0,
            _record: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> JsonLines<BufReader<File>, T> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DriverError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| DriverError::io(path, e))?;
        Ok(Self::new(BufReader::new(file), path))
    }
}

impl<R: BufRead, T: DeserializeOwned> Iterator for JsonLines<R, T> {
    type Item = Result<T, DriverError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(DriverError::io(&self.path, e))),
            };
            self.line += 1;

            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            return Some(
                serde_json::from_str(trimmed).map_err(|e| DriverError::Parse {
                    path: self.path.clone(),
                    line: self.line,
                    message: e.to_string(),
                }),
            );
        }
    }
}

/// Reads the events of a trace that fall inside the configured window.
pub fn read_events<R: BufRead>(
    reader: JsonLines<R, TraceEvent>,
    input: &InputConfig,
) -> Result<Vec<TraceEvent>, DriverError> {
    let mut events = Vec::new();
    let mut skipped = 0usize;
    for event in reader {
        let event = event?;
        if input.in_window(event.timestamp) {
            events.push(event);
        } else {
            skipped += 1;
        }
    }
    debug!(events = events.len(), skipped, "read trace");
    Ok(events)
}

/// Loads the trace file named by the input configuration.
pub fn load_events(input: &InputConfig) -> Result<Vec<TraceEvent>, DriverError> {
    let path = input
        .events
        .as_ref()
        .ok_or(DriverError::MissingInput("events"))?;
    read_events(JsonLines::open(path)?, input)
}

/// Loads a kernel log.
pub fn load_kernel_log(path: impl AsRef<Path>) -> Result<KernelLog, DriverError> {
    let records = JsonLines::<_, KernelRecord>::open(path)?.collect::<Result<Vec<_>, _>>()?;
    let log = KernelLog::from_records(records);
    info!(
        runs = log.run_count(),
        counters = log.counter_count(),
        "loaded kernel log"
    );
    Ok(log)
}
