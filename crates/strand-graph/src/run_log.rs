use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use strand_core::config::AppConfig;
use strand_core::types::{AgentEvent, GraphEvent};

/// JSONL run logger.
///
/// Consumes a run's events and writes one JSON object per line to
/// `{log_dir}/{timestamp}_{run_id}.jsonl`. Lines are flushed as they are
/// written, so a crashed process leaves a readable prefix.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    run_id: String,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    node: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `level` controls verbosity: 1=run summary and failures,
    /// 2=nodes, transitions and usage, 3=agent tool calls and text.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Logger for the `[log]` section, if logging is enabled.
    pub fn from_config(config: &AppConfig) -> Option<Self> {
        let dir = config.log_dir()?;
        let level = config.log.as_ref().map_or(2, |l| l.level);
        Some(Self::new(dir, level))
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Write events from `rx` until the run finishes, the bus closes, or
    /// `cancel` fires. Returns the path written, if any.
    ///
    /// Subscribe before starting the run so no event is missed.
    pub async fn run(
        self,
        mut rx: broadcast::Receiver<GraphEvent>,
        cancel: CancellationToken,
    ) -> Option<PathBuf> {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, "Failed to create log directory");
            return None;
        }

        let mut writer: Option<(PathBuf, BufWriter<tokio::fs::File>)> = None;

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => match result {
                    Ok(event) => event,
                    Err(RecvError::Lagged(n)) => {
                        debug!(skipped = n, "RunLogger lagged, skipped events");
                        continue;
                    }
                    Err(RecvError::Closed) => {
                        debug!("EventBus closed, RunLogger stopping");
                        break;
                    }
                },
            };

            let finished = matches!(event, GraphEvent::RunFinished { .. });
            if let Some(entry) = self.event_to_entry(&event) {
                if writer.is_none() {
                    writer = self.open(&entry.run_id).await;
                    if writer.is_none() {
                        return None;
                    }
                }
                if let Some((_, ref mut w)) = writer {
                    if let Ok(json) = serde_json::to_string(&entry) {
                        let line = format!("{}\n", json);
                        if let Err(e) = w.write_all(line.as_bytes()).await {
                            error!(error = %e, "Failed to write log entry");
                            break;
                        }
                        if let Err(e) = w.flush().await {
                            error!(error = %e, "Failed to flush log");
                        }
                    }
                }
            }
            if finished {
                break;
            }
        }

        let (path, mut w) = writer?;
        w.flush().await.ok();
        debug!(path = %path.display(), "RunLogger finished");
        Some(path)
    }

    async fn open(&self, run_id: &str) -> Option<(PathBuf, BufWriter<tokio::fs::File>)> {
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let path = self.log_dir.join(format!("{}_{}.jsonl", timestamp, run_id));
        match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
        {
            Ok(file) => {
                info!(path = %path.display(), "RunLogger started");
                Some((path, BufWriter::new(file)))
            }
            Err(e) => {
                error!(error = %e, path = %path.display(), "Failed to open log file");
                None
            }
        }
    }

    /// Convert an event to a log entry (None if filtered by level).
    fn event_to_entry(&self, event: &GraphEvent) -> Option<LogEntry> {
        let (node, detail) = match event {
            // L1: run summary and failures
            GraphEvent::RunStarted { entry, .. } => (None, Some(serde_json::json!({ "entry": entry }))),
            GraphEvent::RunFinished {
                state,
                node,
                invocations,
                elapsed_ms,
                ..
            } => (
                node.clone(),
                Some(serde_json::json!({
                    "state": state,
                    "invocations": invocations,
                    "elapsed_ms": elapsed_ms,
                })),
            ),
            GraphEvent::NodeFailed { node, error, .. } => {
                (Some(node.clone()), Some(serde_json::json!({ "error": error })))
            }

            // L2: node lifecycle, transitions, usage
            GraphEvent::NodeStarted { node, .. } if self.level >= 2 => (Some(node.clone()), None),
            GraphEvent::NodeCompleted {
                node, elapsed_ms, ..
            } if self.level >= 2 => (
                Some(node.clone()),
                Some(serde_json::json!({ "elapsed_ms": elapsed_ms })),
            ),
            GraphEvent::TransitionTaken {
                from, to, label, ..
            } if self.level >= 2 => (
                Some(from.clone()),
                Some(serde_json::json!({ "to": to, "label": label })),
            ),
            GraphEvent::Agent {
                node,
                agent,
                event: AgentEvent::Usage {
                    input_tokens,
                    output_tokens,
                },
                ..
            } if self.level >= 2 => (
                Some(node.clone()),
                Some(serde_json::json!({
                    "agent": agent,
                    "kind": "usage",
                    "input_tokens": input_tokens,
                    "output_tokens": output_tokens,
                })),
            ),

            // L3: agent tool calls and streamed text
            GraphEvent::Agent {
                node, agent, event, ..
            } if self.level >= 3 => (Some(node.clone()), Some(agent_detail(agent, event))),

            _ => return None,
        };

        Some(LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            run_id: event.run_id().to_string(),
            event_type: event.kind().to_string(),
            node,
            detail,
        })
    }
}

fn agent_detail(agent: &str, event: &AgentEvent) -> serde_json::Value {
    match event {
        AgentEvent::TextDelta { text } | AgentEvent::ThinkingDelta { text } => serde_json::json!({
            "agent": agent,
            "kind": if matches!(event, AgentEvent::TextDelta { .. }) { "text_delta" } else { "thinking_delta" },
            "text": truncate_str(text, 200),
        }),
        AgentEvent::ToolStart { name } => serde_json::json!({
            "agent": agent,
            "kind": "tool_start",
            "tool": name,
        }),
        AgentEvent::ToolEnd { name, input } => serde_json::json!({
            "agent": agent,
            "kind": "tool_end",
            "tool": name,
            "input": truncate_json(input, 500),
        }),
        AgentEvent::Usage {
            input_tokens,
            output_tokens,
        } => serde_json::json!({
            "agent": agent,
            "kind": "usage",
            "input_tokens": input_tokens,
            "output_tokens": output_tokens,
        }),
    }
}

/// Truncate a JSON value for logging.
fn truncate_json(value: &serde_json::Value, max_len: usize) -> String {
    let s = value.to_string();
    format!("{}{}", truncate_str(&s, max_len), if s.len() > max_len { "..." } else { "" })
}

/// Truncate a string for logging, on a char boundary.
fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::event::EventBus;
    use strand_core::types::{RunId, RunState};

    fn finished(run_id: &RunId) -> GraphEvent {
        GraphEvent::RunFinished {
            run_id: run_id.clone(),
            state: RunState::CompletedSuccessfully,
            node: Some("b".into()),
            invocations: 2,
            elapsed_ms: 5,
        }
    }

    #[test]
    fn level_filtering() {
        let run_id = RunId::new();
        let started = GraphEvent::NodeStarted {
            run_id: run_id.clone(),
            node: "a".into(),
        };
        let delta = GraphEvent::Agent {
            run_id: run_id.clone(),
            node: "a".into(),
            agent: "writer".into(),
            event: AgentEvent::TextDelta { text: "hi".into() },
        };

        let l1 = RunLogger::new(PathBuf::from("/tmp"), 1);
        assert!(l1.event_to_entry(&finished(&run_id)).is_some());
        assert!(l1.event_to_entry(&started).is_none());
        assert!(l1.event_to_entry(&delta).is_none());

        let l2 = RunLogger::new(PathBuf::from("/tmp"), 2);
        assert!(l2.event_to_entry(&started).is_some());
        assert!(l2.event_to_entry(&delta).is_none());

        let l3 = RunLogger::new(PathBuf::from("/tmp"), 3);
        let entry = l3.event_to_entry(&delta).unwrap();
        assert_eq!(entry.event_type, "agent");
        assert_eq!(entry.detail.unwrap()["kind"], "text_delta");
    }

    #[test]
    fn entry_omits_empty_fields() {
        let run_id = RunId::new();
        let l2 = RunLogger::new(PathBuf::from("/tmp"), 2);
        let entry = l2
            .event_to_entry(&GraphEvent::NodeStarted {
                run_id,
                node: "a".into(),
            })
            .unwrap();
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"node\":\"a\""));
        assert!(!json.contains("detail"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_str("héllo", 2), "h");
        assert_eq!(truncate_str("short", 10), "short");
        let long = serde_json::json!({"key": "a very long string that should be truncated"});
        assert!(truncate_json(&long, 20).ends_with("..."));
    }

    #[tokio::test]
    async fn writes_jsonl_until_run_finished() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new(16);
        let rx = bus.subscribe();
        let run_id = RunId::new();

        bus.publish(GraphEvent::RunStarted {
            run_id: run_id.clone(),
            entry: "a".into(),
        });
        bus.publish(GraphEvent::NodeStarted {
            run_id: run_id.clone(),
            node: "a".into(),
        });
        bus.publish(finished(&run_id));
        bus.publish(GraphEvent::NodeStarted {
            run_id: run_id.clone(),
            node: "after".into(),
        });

        let path = RunLogger::new(dir.path().to_path_buf(), 2)
            .run(rx, CancellationToken::new())
            .await
            .unwrap();
        assert!(path.to_string_lossy().ends_with(&format!("{}.jsonl", run_id)));

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["event_type"], "run_started");
        assert_eq!(lines[2]["event_type"], "run_finished");
        assert_eq!(lines[2]["detail"]["state"], "completed_successfully");
    }

    #[tokio::test]
    async fn cancelled_before_any_event_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new(4);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let path = RunLogger::new(dir.path().to_path_buf(), 2)
            .run(bus.subscribe(), cancel)
            .await;
        assert!(path.is_none());
    }
}
