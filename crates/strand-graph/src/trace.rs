use chrono::{DateTime, Utc};
use serde::Serialize;

use strand_core::types::RunId;

/// One executed node in a traced run.
#[derive(Debug, Clone, Serialize)]
pub struct TraceStep {
    pub index: usize,
    pub node: String,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    /// Debug rendering of the node output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Node the run advanced to afterwards.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Ordered log of the nodes a run executed.
#[derive(Debug, Clone, Serialize)]
pub struct RunTrace {
    pub run_id: RunId,
    pub steps: Vec<TraceStep>,
}

impl RunTrace {
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            steps: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, mut step: TraceStep) {
        step.index = self.steps.len();
        self.steps.push(step);
    }

    /// Node names in execution order.
    pub fn nodes(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.node.as_str()).collect()
    }

    pub fn visits(&self, node: &str) -> usize {
        self.steps.iter().filter(|s| s.node == node).count()
    }

    pub fn last(&self) -> Option<&TraceStep> {
        self.steps.last()
    }

    pub fn to_jsonl(&self) -> String {
        self.steps
            .iter()
            .filter_map(|s| serde_json::to_string(s).ok())
            .map(|line| line + "\n")
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(node: &str) -> TraceStep {
        TraceStep {
            index: 0,
            node: node.into(),
            started_at: Utc::now(),
            elapsed_ms: 1,
            output: Some(format!("{:?}", node)),
            next: None,
            error: None,
        }
    }

    #[test]
    fn push_numbers_steps() {
        let mut trace = RunTrace::new(RunId::new());
        trace.push(step("a"));
        trace.push(step("b"));
        trace.push(step("a"));
        assert_eq!(trace.nodes(), vec!["a", "b", "a"]);
        assert_eq!(trace.visits("a"), 2);
        assert_eq!(trace.last().unwrap().index, 2);
    }

    #[test]
    fn jsonl_has_one_line_per_step() {
        let mut trace = RunTrace::new(RunId::new());
        trace.push(step("a"));
        trace.push(step("b"));
        let jsonl = trace.to_jsonl();
        assert_eq!(jsonl.lines().count(), 2);
        let first: serde_json::Value = serde_json::from_str(jsonl.lines().next().unwrap()).unwrap();
        assert_eq!(first["node"], "a");
        assert!(first.get("error").is_none());
    }
}
