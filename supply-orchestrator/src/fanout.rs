//! Bounded fan-out with a single result collector.

use futures_util::stream::{self, StreamExt};
use std::future::Future;

use crate::error::OrchestratorError;

/// Outcome of a fan-out: every item lands in exactly one of the two lists.
#[derive(Debug)]
pub struct Collector<T, E = OrchestratorError> {
    pub succeeded: Vec<T>,
    /// `(label, error)` per failed item.
    pub failed: Vec<(String, E)>,
}

impl<T, E> Default for Collector<T, E> {
    fn default() -> Self {
        Self {
            succeeded: Vec::new(),
            failed: Vec::new(),
        }
    }
}

impl<T, E: std::fmt::Display> Collector<T, E> {
    pub fn push(&mut self, label: String, res: Result<T, E>) {
        match res {
            Ok(v) => self.succeeded.push(v),
            Err(e) => self.failed.push((label, e)),
        }
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn is_empty_success(&self) -> bool {
        self.succeeded.is_empty()
    }

    /// Last failure, for user-facing order/step messages.
    pub fn last_error(&self) -> Option<String> {
        self.failed
            .last()
            .map(|(label, e)| format!("{}: {}", label, e))
    }

    pub fn log_failures(&self, component: &str) {
        for (label, e) in &self.failed {
            tracing::warn!("[{}] {} failed: {}", component, label, e);
        }
    }
}

/// Run `f` over `items` with at most `limit` in flight and collect every outcome.
pub async fn fan_out<I, X, F, Fut, T, E>(limit: usize, items: I, f: F) -> Collector<T, E>
where
    I: IntoIterator<Item = (String, X)>,
    F: Fn(X) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let f = &f;
    let results: Vec<(String, Result<T, E>)> = stream::iter(items)
        .map(|(label, input)| {
            let fut = f(input);
            async move { (label, fut.await) }
        })
        .buffer_unordered(limit.max(1))
        .collect()
        .await;

    let mut out = Collector::default();
    for (label, res) in results {
        out.push(label, res);
    }
    out
}
