//! Simulated upstream load.

use super::{SimulateOptions, load_config};
use async_trait::async_trait;
use gatekeeper::{
    ApiError, ApiErrorKind, BatchHandler, CallDescriptor, CallResult, RequestManager,
    RetryableError,
};
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::info;

/// Upstream stand-in failing a fixed fraction of dispatches.
///
/// Failures are spread evenly over the dispatch sequence using the golden
/// ratio, so runs are reproducible.
#[derive(Debug)]
struct SimulatedUpstream {
    failure_rate: f64,
    latency: Duration,
    dispatches: AtomicU64,
}

impl SimulatedUpstream {
    async fn call(&self) -> Result<u64, ApiError> {
        let n = self.dispatches.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(self.latency).await;
        if (n as f64 * 0.618_033_988_75).fract() < self.failure_rate {
            Err(ApiError::new(ApiErrorKind::Http {
                status_code: 503,
                message: "Service unavailable".to_string(),
            }))
        } else {
            Ok(n)
        }
    }
}

#[async_trait]
impl BatchHandler for SimulatedUpstream {
    async fn dispatch(&self, _method: &str, requests: Vec<JsonValue>) -> CallResult<Vec<JsonValue>> {
        let n = self.call().await.map_err(|e| e.classify())?;
        Ok(requests
            .into_iter()
            .map(|request| json!({ "request": request, "dispatch": n }))
            .collect())
    }
}

/// Run the simulate command.
pub async fn run_simulation(options: SimulateOptions) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(options.config.as_deref())?;
    let manager = RequestManager::new(config);
    let upstream = Arc::new(SimulatedUpstream {
        failure_rate: options.failure_rate.clamp(0.0, 1.0),
        latency: Duration::from_millis(options.latency_ms),
        dispatches: AtomicU64::new(0),
    });
    manager.register_batch_handler(options.method.clone(), upstream.clone());

    info!(
        method = %options.method,
        calls = options.calls,
        failure_rate = options.failure_rate,
        batch = options.batch,
        "Starting simulation"
    );

    let descriptor = CallDescriptor::new(options.method.clone()).with_batchable(options.batch);
    let mut tasks = JoinSet::new();
    for i in 0..options.calls {
        let manager = manager.clone();
        let upstream = upstream.clone();
        let descriptor = descriptor.clone();
        tasks.spawn(async move {
            if *descriptor.batchable() {
                manager.submit(&descriptor, json!(i)).await.map(|_| ())
            } else {
                manager
                    .execute(&descriptor, || {
                        let upstream = upstream.clone();
                        async move { upstream.call().await }
                    })
                    .await
                    .map(|_| ())
            }
        });
    }

    let mut succeeded = 0u64;
    let mut failed = 0u64;
    while let Some(joined) = tasks.join_next().await {
        match joined? {
            Ok(()) => succeeded += 1,
            Err(e) => {
                info!(error = %e.kind(), attempts = e.attempts, "Simulated call failed");
                failed += 1;
            }
        }
    }

    info!(
        succeeded,
        failed,
        dispatches = upstream.dispatches.load(Ordering::Relaxed),
        "Simulation finished"
    );
    println!("{}", serde_json::to_string_pretty(&manager.metrics_snapshot())?);
    Ok(())
}
