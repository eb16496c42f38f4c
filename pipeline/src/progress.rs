use serde::Serialize;
use std::time::Instant;
use tracing::{info, warn};

/// Severity of a progress entry.
///
/// `QualityWarning` flags data conditions that continue with degraded output;
/// `Recoverable` flags a stage falling back to a documented alternative.
/// Neither ever fails the job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    QualityWarning,
    Recoverable,
}

/// One structured line of the per-job progress log.
#[derive(Clone, Debug, Serialize)]
pub struct ProgressEntry {
    pub stage: &'static str,
    pub level: LogLevel,
    pub message: String,
    /// Milliseconds since the job started.
    pub at_ms: u128,
}

/// Structured progress log: human strings plus per-stage timings, accumulated
/// across the whole job and attached to its outcome.
#[derive(Debug)]
pub struct ProgressLog {
    started: Instant,
    entries: Vec<ProgressEntry>,
}

impl Default for ProgressLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressLog {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            entries: Vec::new(),
        }
    }

    fn push(&mut self, stage: &'static str, level: LogLevel, message: String) {
        let at_ms = self.started.elapsed().as_millis();
        match level {
            LogLevel::Info => info!("[{stage}] {message}"),
            LogLevel::QualityWarning => warn!("[{stage}] quality: {message}"),
            LogLevel::Recoverable => warn!("[{stage}] recoverable: {message}"),
        }
        self.entries.push(ProgressEntry {
            stage,
            level,
            message,
            at_ms,
        });
    }

    pub fn info(&mut self, stage: &'static str, message: impl Into<String>) {
        self.push(stage, LogLevel::Info, message.into());
    }

    pub fn quality_warning(&mut self, stage: &'static str, message: impl Into<String>) {
        self.push(stage, LogLevel::QualityWarning, message.into());
    }

    pub fn recoverable(&mut self, stage: &'static str, message: impl Into<String>) {
        self.push(stage, LogLevel::Recoverable, message.into());
    }

    /// Records a completed stage with its wall-clock duration.
    pub fn stage_done(&mut self, stage: &'static str, since: Instant, detail: impl Into<String>) {
        let ms = since.elapsed().as_millis();
        let detail = detail.into();
        self.push(stage, LogLevel::Info, format!("done in {ms} ms: {detail}"));
    }

    pub fn entries(&self) -> &[ProgressEntry] {
        &self.entries
    }

    pub fn has_quality_warnings(&self) -> bool {
        self.entries
            .iter()
            .any(|e| e.level == LogLevel::QualityWarning)
    }

    pub fn has_recoverable(&self) -> bool {
        self.entries.iter().any(|e| e.level == LogLevel::Recoverable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_accumulate_in_order() {
        let mut log = ProgressLog::new();
        log.info("inspect", "3 series found");
        log.quality_warning("assemble", "CV 12.0% above 10%");
        log.recoverable("preprocess", "bias correction failed, using original");
        let entries = log.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].stage, "inspect");
        assert_eq!(entries[1].level, LogLevel::QualityWarning);
        assert!(log.has_quality_warnings());
        assert!(log.has_recoverable());
    }

    #[test]
    fn stage_done_records_duration() {
        let mut log = ProgressLog::new();
        let t = Instant::now();
        log.stage_done("select", t, "primary 1.2.3");
        assert!(log.entries()[0].message.contains("done in"));
    }
}
