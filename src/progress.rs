//! Sync progress reporting.
//!
//! Reports observable progress during `mirror sync` and streamed HTTP runs so
//! users see which phase and collection is being reconciled and how many
//! records are left. CLI progress is emitted on **stderr** so stdout remains
//! parseable for scripts; the HTTP surface forwards the same events through
//! a [`ChannelProgress`].

use serde::Serialize;
use std::io::Write;
use tokio::sync::mpsc::UnboundedSender;

use crate::models::CollectionKey;
use crate::pipeline::RunReport;
use crate::reconciler::CollectionReport;

/// A single progress event for a run.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncProgressEvent {
    /// A dependency phase begins.
    Phase {
        phase: u8,
        collections: Vec<CollectionKey>,
    },
    /// Reconciliation of one collection begins.
    CollectionStarted { collection: CollectionKey },
    /// `n` of `total` records of a collection processed.
    Records {
        collection: CollectionKey,
        n: u64,
        total: u64,
    },
    CollectionFinished { report: CollectionReport },
    /// The collection could not be read; the run continues with the next.
    CollectionFailed {
        collection: CollectionKey,
        kind: String,
        message: String,
    },
    /// Back-reference fields of a collection were rewritten.
    Linked {
        collection: CollectionKey,
        updated: usize,
    },
    Finished { report: RunReport },
}

/// Reports sync progress.
pub trait SyncProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the reconciler and pipeline.
    fn report(&self, event: SyncProgressEvent);
}

/// Human-friendly progress on stderr: "sync work  records  12 / 40".
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        let line = match &event {
            SyncProgressEvent::Phase { phase, collections } => {
                let names: Vec<&str> = collections.iter().map(|c| c.as_str()).collect();
                format!("phase {}  {}\n", phase, names.join(", "))
            }
            SyncProgressEvent::CollectionStarted { collection } => {
                format!("sync {}  reading...\n", collection)
            }
            SyncProgressEvent::Records {
                collection,
                n,
                total,
            } => {
                // Keep long collections readable without a line per record.
                if *n != *total && *n % 10 != 0 {
                    return;
                }
                format!(
                    "sync {}  records  {} / {}\n",
                    collection,
                    format_number(*n),
                    format_number(*total)
                )
            }
            SyncProgressEvent::CollectionFinished { report } => format!(
                "sync {}  done  +{} ~{} ={} -{}{}\n",
                report.collection,
                report.created,
                report.updated,
                report.unchanged,
                report.deleted,
                if report.failures.is_empty() {
                    String::new()
                } else {
                    format!("  ({} failed)", report.failures.len())
                }
            ),
            SyncProgressEvent::CollectionFailed {
                collection,
                message,
                ..
            } => format!("sync {}  FAILED  {}\n", collection, message),
            SyncProgressEvent::Linked {
                collection,
                updated,
            } => format!("link {}  {} updated\n", collection, updated),
            SyncProgressEvent::Finished { report } => format!(
                "finished  {} synced, {} unchanged, {} deleted, {} failures in {:.1}s\n",
                format_number(report.total_synced as u64),
                format_number(report.unchanged as u64),
                format_number(report.deleted as u64),
                report.failures,
                report.duration_ms as f64 / 1000.0
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        if let Ok(line) = serde_json::to_string(&event) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

/// Forwards events to a channel, for streaming them to an HTTP client.
/// Events sent after the receiver is gone are dropped.
pub struct ChannelProgress {
    tx: UnboundedSender<SyncProgressEvent>,
}

impl ChannelProgress {
    pub fn new(tx: UnboundedSender<SyncProgressEvent>) -> Self {
        Self { tx }
    }
}

impl SyncProgressReporter for ChannelProgress {
    fn report(&self, event: SyncProgressEvent) {
        let _ = self.tx.send(event);
    }
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
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
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

    pub fn reporter(&self) -> std::sync::Arc<dyn SyncProgressReporter> {
        match self {
            ProgressMode::Off => std::sync::Arc::new(NoProgress),
            ProgressMode::Human => std::sync::Arc::new(StderrProgress),
            ProgressMode::Json => std::sync::Arc::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn events_serialize_with_tag() {
        let event = SyncProgressEvent::Records {
            collection: CollectionKey::Work,
            n: 3,
            total: 9,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            serde_json::json!({ "event": "records", "collection": "work", "n": 3, "total": 9 })
        );
    }

    #[tokio::test]
    async fn channel_progress_forwards_and_tolerates_closed_receiver() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let progress = ChannelProgress::new(tx);
        progress.report(SyncProgressEvent::CollectionStarted {
            collection: CollectionKey::Material,
        });
        assert!(matches!(
            rx.recv().await,
            Some(SyncProgressEvent::CollectionStarted {
                collection: CollectionKey::Material
            })
        ));
        drop(rx);
        progress.report(SyncProgressEvent::CollectionStarted {
            collection: CollectionKey::Material,
        });
    }
}
