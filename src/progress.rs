//! Reindex progress reporting for `rag-backend reindex`.
//!
//! Progress is emitted on **stderr** so stdout stays free for the final job
//! summary. The human form is one line per event; the JSON form is one
//! object per line carrying the full job snapshot.

use std::io::Write;

use crate::job_stream::JobEvent;

/// Receives job events drained from a [`JobStream`](crate::job_stream::JobStream).
pub trait JobProgressReporter: Send + Sync {
    fn report(&self, event: &JobEvent);
}

/// Human-friendly progress on stderr:
/// `reindex reindex-3f2a…  ingesting:bash-info  42%  (1,234 documents)`.
pub struct StderrProgress;

impl JobProgressReporter for StderrProgress {
    fn report(&self, event: &JobEvent) {
        let line = human_line(event);
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl JobProgressReporter for JsonProgress {
    fn report(&self, event: &JobEvent) {
        let obj = serde_json::json!({
            "event": if event.is_complete() { "complete" } else { "progress" },
            "job": event.job(),
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl JobProgressReporter for NoProgress {
    fn report(&self, _event: &JobEvent) {}
}

fn human_line(event: &JobEvent) -> String {
    let job = event.job();
    let stage = job.stage.as_deref().unwrap_or("-");
    let percent = job.percent_complete.unwrap_or(0.0);
    let mut line = format!(
        "reindex {}  {}  {:.0}%  ({} documents)",
        job.job_id,
        stage,
        percent,
        format_number(job.documents_processed)
    );
    if event.is_complete() {
        line.push_str(&format!("  {}", job.status.as_str()));
        if let Some(err) = &job.error_message {
            line.push_str(&format!(": {}", err));
        }
    }
    line.push('\n');
    line
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn JobProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
