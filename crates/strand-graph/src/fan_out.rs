use std::future::Future;

use futures::future::{join_all, try_join_all};
use tokio::sync::Semaphore;
use tracing::{debug, info};

use strand_core::config::FanOutConfig;
use strand_core::error::{Result, StrandError};

use crate::context::ProcessContext;

/// Bounded-parallel sub-invocations inside a node.
///
/// At most `max_parallelism` tasks run at once; results come back in input
/// order. Every task gets a child context labelled `<label>[i]` that shares
/// the run's cancellation token, agent registry and event bus.
#[derive(Debug, Clone)]
pub struct FanOut {
    max_parallelism: usize,
    label: String,
}

impl FanOut {
    pub fn new(max_parallelism: usize) -> Self {
        Self {
            max_parallelism: max_parallelism.max(1),
            label: "task".to_string(),
        }
    }

    pub fn from_config(config: &FanOutConfig) -> Self {
        Self::new(config.max_parallelism)
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn max_parallelism(&self) -> usize {
        self.max_parallelism
    }

    /// Run `f` over every item. The first error wins and drops the tasks
    /// still in flight.
    pub async fn run<T, R, F, Fut>(
        &self,
        ctx: &ProcessContext,
        items: impl IntoIterator<Item = T>,
        f: F,
    ) -> Result<Vec<R>>
    where
        F: Fn(ProcessContext, T) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let semaphore = Semaphore::new(self.max_parallelism);
        let tasks: Vec<_> = items
            .into_iter()
            .enumerate()
            .map(|(i, item)| self.task(ctx, &semaphore, &f, i, item))
            .collect();
        info!(node = %ctx.node_path(), tasks = tasks.len(), max_parallelism = self.max_parallelism, "Fanning out");
        try_join_all(tasks).await
    }

    /// Run `f` over every item and return every result, failures included.
    pub async fn run_settled<T, R, F, Fut>(
        &self,
        ctx: &ProcessContext,
        items: impl IntoIterator<Item = T>,
        f: F,
    ) -> Vec<Result<R>>
    where
        F: Fn(ProcessContext, T) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let semaphore = Semaphore::new(self.max_parallelism);
        let tasks: Vec<_> = items
            .into_iter()
            .enumerate()
            .map(|(i, item)| self.task(ctx, &semaphore, &f, i, item))
            .collect();
        info!(node = %ctx.node_path(), tasks = tasks.len(), max_parallelism = self.max_parallelism, "Fanning out");
        join_all(tasks).await
    }

    async fn task<T, R, F, Fut>(
        &self,
        ctx: &ProcessContext,
        semaphore: &Semaphore,
        f: &F,
        index: usize,
        item: T,
    ) -> Result<R>
    where
        F: Fn(ProcessContext, T) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let child = ctx.child(format!("{}[{}]", self.label, index));
        let _permit = tokio::select! {
            biased;
            _ = child.cancel_token().cancelled() => return Err(child.cancelled_error()),
            permit = semaphore.acquire() => permit.map_err(|_| child.cancelled_error())?,
        };
        debug!(node = %child.node_path(), "Fan-out task started");
        let path = child.node_path().to_string();
        let result = f(child, item).await;
        if let Err(ref e) = result {
            debug!(node = %path, error = %e, "Fan-out task failed");
        }
        result.map_err(|e| match e {
            StrandError::Cancelled { node: None } => StrandError::Cancelled { node: Some(path) },
            other => other,
        })
    }
}

impl Default for FanOut {
    fn default() -> Self {
        Self::from_config(&FanOutConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    use strand_core::types::AgentRequest;
    use strand_test_utils::{ConcurrencyProbe, ScriptedAgent};

    #[tokio::test]
    async fn never_exceeds_max_parallelism() {
        let probe = Arc::new(ConcurrencyProbe::new(Duration::from_millis(20)));
        let max = probe.max_in_flight();
        let ctx = ProcessContext::new().child("research");

        let results = FanOut::new(3)
            .run(&ctx, 0..10, |child, i: usize| {
                let probe = probe.clone();
                async move {
                    let response = child
                        .invoke_agent(&*probe, AgentRequest::new(format!("q{}", i)))
                        .await?;
                    Ok(response.text())
                }
            })
            .await
            .unwrap();

        assert_eq!(results.len(), 10);
        assert_eq!(results[0], "echo: q0");
        assert_eq!(results[9], "echo: q9");
        assert!(max.load(Ordering::SeqCst) <= 3);
        assert!(max.load(Ordering::SeqCst) >= 2);
        assert_eq!(probe.calls().load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn results_keep_input_order_when_completion_order_differs() {
        let ctx = ProcessContext::new();
        let results = FanOut::new(4)
            .run(&ctx, vec![40u64, 10, 30, 0], |_child, delay| async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(delay)
            })
            .await
            .unwrap();
        assert_eq!(results, vec![40, 10, 30, 0]);
    }

    #[tokio::test]
    async fn children_are_labelled_by_index() {
        let ctx = ProcessContext::new().child("research");
        let paths = FanOut::new(2)
            .with_label("query")
            .run(&ctx, 0..3, |child, _i: i32| async move {
                Ok(child.node_path().to_string())
            })
            .await
            .unwrap();
        assert_eq!(
            paths,
            vec!["research/query[0]", "research/query[1]", "research/query[2]"]
        );
    }

    #[tokio::test]
    async fn settled_returns_every_result() {
        let ctx = ProcessContext::new();
        let results = FanOut::new(2)
            .run_settled(&ctx, 0..4, |_child, i: u32| async move {
                if i % 2 == 1 {
                    Err(StrandError::Agent {
                        agent: "w".into(),
                        message: format!("odd {}", i),
                    })
                } else {
                    Ok(i)
                }
            })
            .await;
        assert_eq!(results.len(), 4);
        assert_eq!(*results[0].as_ref().unwrap(), 0);
        assert!(results[1].is_err());
        assert_eq!(*results[2].as_ref().unwrap(), 2);
        assert!(results[3].is_err());
    }

    #[tokio::test]
    async fn run_fails_fast() {
        let ctx = ProcessContext::new();
        let err = FanOut::new(1)
            .run(&ctx, 0..3, |_child, i: u32| async move {
                if i == 1 {
                    Err(StrandError::Agent {
                        agent: "w".into(),
                        message: "boom".into(),
                    })
                } else {
                    Ok(i)
                }
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn cancelled_run_starts_nothing() {
        let agent = Arc::new(ScriptedAgent::repeating("w", "x", 5));
        let calls = agent.calls();
        let ctx = ProcessContext::new().child("fan");
        ctx.cancel();

        let results = FanOut::new(2)
            .run_settled(&ctx, 0..3, |child, _i: u32| {
                let agent = agent.clone();
                async move { child.invoke_agent(&*agent, AgentRequest::new("x")).await }
            })
            .await;
        assert!(results.iter().all(|r| matches!(r, Err(e) if e.is_cancelled())));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn zero_parallelism_is_clamped() {
        assert_eq!(FanOut::new(0).max_parallelism(), 1);
        assert_eq!(FanOut::default().max_parallelism(), 4);
    }
}
