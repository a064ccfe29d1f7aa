use std::sync::Arc;

use futures::{StreamExt, stream::FuturesUnordered};

use crate::core::{
    cancel::CancelSignal,
    domain::{ExecutionRequest, ExecutionResult, ScriptCall},
    scheduler::ExecutionScheduler,
};

/// Fans a batch out to the scheduler and joins the results in input order.
/// The scheduler's gate is the only concurrency cap; excess requests queue there.
#[derive(Clone, Debug)]
pub struct BatchCoordinator {
    scheduler: Arc<ExecutionScheduler>,
}

impl BatchCoordinator {
    pub fn new(scheduler: Arc<ExecutionScheduler>) -> Self {
        Self { scheduler }
    }

    /// Runs every call with the shared `cancel` signal.
    pub async fn execute_calls(
        &self,
        calls: Vec<ScriptCall>,
        cancel: &CancelSignal,
    ) -> Vec<ExecutionResult> {
        let requests = calls
            .into_iter()
            .map(|call| call.into_request(cancel.clone()))
            .collect();
        self.execute_many(requests).await
    }

    /// `results[i]` belongs to `requests[i]` whatever the completion order.
    /// A failing request never affects its siblings.
    #[tracing::instrument(skip_all, fields(size = requests.len()))]
    pub async fn execute_many(&self, requests: Vec<ExecutionRequest>) -> Vec<ExecutionResult> {
        let mut futures = FuturesUnordered::new();
        for (idx, request) in requests.into_iter().enumerate() {
            let scheduler = self.scheduler.clone();
            futures.push(async move { (idx, scheduler.execute(request).await) });
        }

        let mut results: Vec<Option<ExecutionResult>> = Vec::with_capacity(futures.len());
        results.resize_with(futures.len(), || None);
        while let Some((idx, result)) = futures.next().await {
            tracing::debug!("Batch item {} finished: success={}", idx, result.success);
            results[idx] = Some(result);
        }

        results.into_iter().flatten().collect()
    }
}
