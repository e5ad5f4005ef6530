//! The single entry point for outbound upstream calls.

use crate::BatchHandler;
use crate::call::{CallContext, CallKind};
use futures::FutureExt;
use gatekeeper_batch::{BatchFlush, BatchReply, BatchingCoordinator, PendingBatch};
use gatekeeper_circuit::CircuitBreaker;
use gatekeeper_core::{
    CallDescriptor, CallPhase, CircuitState, GatekeeperConfig, OutcomeRecord, PhaseEvent,
    PhaseObserver,
};
use gatekeeper_error::{CallError, CallResult, GatekeeperResult, RetryableError};
use gatekeeper_metrics::{MethodSnapshot, MetricsRecorder, MetricsSnapshot};
use gatekeeper_rate_limit::{Admission, RateLimiter};
use gatekeeper_retry::RetryExecutor;
use serde_json::Value as JsonValue;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// State shared between the manager and the batch flush path.
struct Shared {
    config: Arc<GatekeeperConfig>,
    limiter: RateLimiter,
    breaker: CircuitBreaker,
    metrics: MetricsRecorder,
    handlers: RwLock<HashMap<String, Arc<dyn BatchHandler>>>,
    observers: RwLock<Vec<Arc<dyn PhaseObserver>>>,
    /// Rate-limit and circuit keys each method has been called with.
    keys: RwLock<HashMap<String, BTreeSet<String>>>,
    next_call_id: AtomicU64,
}

impl Shared {
    fn begin(&self, kind: CallKind, descriptor: &CallDescriptor) -> CallContext {
        let id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let policy = self.config.for_method(descriptor.method());
        let call = CallContext::new(id, kind, descriptor, policy);
        let known = self
            .keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&call.method)
            .is_some_and(|keys| keys.contains(&call.key));
        if !known {
            self.keys
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(call.method.clone())
                .or_default()
                .insert(call.key.clone());
        }
        if call.kind == CallKind::Logical {
            self.emit(&call, CallPhase::Queued, 0);
        }
        call
    }

    fn emit(&self, call: &CallContext, phase: CallPhase, attempt: u32) {
        debug!(call_id = call.id, method = %call.method, phase = %phase, attempt, "Call phase");
        let event = PhaseEvent::new(call.id, call.method.clone(), call.key.clone(), phase, attempt);
        self.metrics.record_phase(&event);
        let observers = self.observers.read().unwrap_or_else(PoisonError::into_inner);
        for observer in observers.iter() {
            observer.on_phase(&event);
        }
    }

    /// Settle a logical call: record its outcome and report the terminal phase.
    fn finish<T>(&self, call: &CallContext, result: &CallResult<T>, attempts: u32) {
        if call.kind != CallKind::Logical {
            return;
        }
        let duration = call.started.elapsed();
        let record = match result {
            Ok(_) => OutcomeRecord::succeeded(
                &call.method,
                &call.key,
                duration,
                call.waited(),
                attempts,
            ),
            Err(e) => OutcomeRecord::failed(
                &call.method,
                &call.key,
                duration,
                call.waited(),
                attempts,
                e.class(),
            ),
        };
        self.metrics.record(&record);

        match result {
            Ok(_) => self.emit(call, CallPhase::Succeeded, attempts),
            Err(e) => {
                debug!(call_id = call.id, error = %e.kind(), "Call failed");
                self.emit(call, CallPhase::Failed, attempts);
            }
        }
    }

    /// Run `operation` with retry, each attempt passing the circuit and the limiter.
    async fn run<T, E, F, Fut>(
        &self,
        call: &CallContext,
        cancel: &CancellationToken,
        operation: F,
    ) -> CallResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetryableError,
    {
        let operation = Mutex::new(operation);
        let executor = RetryExecutor::new(call.policy.retry().clone());
        let result = executor
            .run(|attempt| self.attempt(call, attempt, cancel, &operation))
            .await;

        let attempts = call.dispatches();
        let result = result.map_err(|e| e.with_attempts(attempts));
        self.finish(call, &result, attempts);
        result
    }

    async fn attempt<T, E, F, Fut>(
        &self,
        call: &CallContext,
        attempt: u32,
        cancel: &CancellationToken,
        operation: &Mutex<F>,
    ) -> CallResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetryableError,
    {
        if attempt > 1 {
            self.emit(call, CallPhase::Retrying, attempt);
        }
        if cancel.is_cancelled() {
            return Err(CallError::cancelled());
        }

        let permit = self.breaker.check(&call.method, &call.key)?;

        let grant = match self.limiter.reserve(&call.method, &call.key, call.units)? {
            Admission::Granted(grant) => grant,
            Admission::Pending(reservation) => {
                self.emit(call, CallPhase::RateLimited, attempt);
                let waiting = Instant::now();
                let opened = self.breaker.opened(&call.key);
                tokio::select! {
                    grant = reservation.ready() => {
                        call.add_wait(grant.waited());
                        grant
                    }
                    err = opened => {
                        call.add_wait(waiting.elapsed());
                        debug!(call_id = call.id, "Circuit opened while waiting for admission");
                        return Err(err);
                    }
                    _ = cancel.cancelled() => {
                        call.add_wait(waiting.elapsed());
                        debug!(call_id = call.id, "Cancelled while waiting for admission");
                        return Err(CallError::cancelled());
                    }
                }
            }
        };

        let dispatch = {
            let mut operation = operation.lock().unwrap_or_else(PoisonError::into_inner);
            (*operation)()
        };
        if cancel.is_cancelled() {
            // The dispatch future has not been polled, so nothing reached the upstream.
            drop(dispatch);
            grant.refund();
            debug!(call_id = call.id, "Cancelled after admission, tokens returned");
            return Err(CallError::cancelled());
        }
        call.dispatched();
        self.emit(call, CallPhase::Dispatched, attempt);

        let result = match tokio::time::timeout(call.deadline, dispatch).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.classify()),
            Err(_) => Err(CallError::timeout(call.deadline)),
        };

        match &result {
            Err(e) if e.counts_against_circuit() => permit.record_failure(),
            // A terminal answer still proves the upstream is reachable.
            _ => permit.record_success(),
        }
        result
    }

    /// Dispatch one flushed batch through the handler registered for its method.
    ///
    /// The sub-requests are taken only after each attempt is admitted, so
    /// callers can still withdraw while the batch waits for tokens. A batch
    /// left by every caller in that time is cancelled without dispatching.
    async fn flush_batch(&self, batch: Arc<PendingBatch>) -> CallResult<Vec<JsonValue>> {
        let method = batch.method().to_string();
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&method)
            .cloned()
            .ok_or_else(|| {
                CallError::upstream(format!("no batch handler registered for {}", method), false)
            })?;

        let weight = *self.config.for_method(&method).batch().weight();
        let descriptor = CallDescriptor::new(method.as_str())
            .with_key(batch.key())
            .with_weight(weight);
        let call = self.begin(CallKind::BatchDispatch, &descriptor);

        let mut recorded = false;
        self.run(&call, batch.abandoned(), || {
            let params = batch.take();
            if !recorded && !params.is_empty() {
                self.metrics.record_batch(&method, params.len());
                recorded = true;
            }
            let handler = Arc::clone(&handler);
            let method = method.clone();
            async move { handler.dispatch(&method, params).await }
        })
        .await
    }
}

/// Composes circuit breaking, rate limiting, retry, batching and metrics for
/// every outbound call.
///
/// Component state lives in per-key registries owned by this instance; two
/// managers never share budgets or circuits.
///
/// # Example
///
/// ```rust,no_run
/// use gatekeeper::{ApiError, ApiErrorKind, CallDescriptor, RequestManager};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let manager = RequestManager::load()?;
/// let descriptor = CallDescriptor::new("groups.getMembers").with_key("groups.getMembers:42");
///
/// let members = manager
///     .execute(&descriptor, || async {
///         Err::<Vec<u64>, _>(ApiError::new(ApiErrorKind::Http {
///             status_code: 503,
///             message: "Service unavailable".to_string(),
///         }))
///     })
///     .await;
/// assert!(members.is_err());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RequestManager {
    shared: Arc<Shared>,
    batcher: BatchingCoordinator,
}

impl RequestManager {
    /// Create a manager for `config`.
    pub fn new(config: GatekeeperConfig) -> Self {
        let config = Arc::new(config);
        let shared = Arc::new(Shared {
            limiter: RateLimiter::new(Arc::clone(&config)),
            breaker: CircuitBreaker::new(Arc::clone(&config)),
            metrics: MetricsRecorder::new(),
            handlers: RwLock::new(HashMap::new()),
            observers: RwLock::new(Vec::new()),
            keys: RwLock::new(HashMap::new()),
            next_call_id: AtomicU64::new(1),
            config: Arc::clone(&config),
        });

        let flush_shared = Arc::clone(&shared);
        let flush: BatchFlush = Arc::new(move |batch: Arc<PendingBatch>| {
            let shared = Arc::clone(&flush_shared);
            async move { shared.flush_batch(batch).await }.boxed()
        });

        Self {
            batcher: BatchingCoordinator::new(config, flush),
            shared,
        }
    }

    /// Create a manager from the layered configuration files.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration cannot be loaded or is invalid.
    pub fn load() -> GatekeeperResult<Self> {
        Ok(Self::new(GatekeeperConfig::load()?))
    }

    /// Configuration in use.
    pub fn config(&self) -> &GatekeeperConfig {
        &self.shared.config
    }

    /// The rate limiter.
    pub fn limiter(&self) -> &RateLimiter {
        &self.shared.limiter
    }

    /// The circuit breaker.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.shared.breaker
    }

    /// The metrics recorder.
    pub fn metrics(&self) -> &MetricsRecorder {
        &self.shared.metrics
    }

    /// Report every phase transition to `observer`.
    pub fn add_observer(&self, observer: Arc<dyn PhaseObserver>) {
        self.shared
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Builder-style [`add_observer`](Self::add_observer).
    pub fn with_observer(self, observer: Arc<dyn PhaseObserver>) -> Self {
        self.add_observer(observer);
        self
    }

    /// Route flushed batches of `method` to `handler`.
    pub fn register_batch_handler(
        &self,
        method: impl Into<String>,
        handler: Arc<dyn BatchHandler>,
    ) {
        let method = method.into();
        info!(method = %method, "Registered batch handler");
        self.shared
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(method, handler);
    }

    /// Run `operation` under the policies of `descriptor.method`.
    ///
    /// `operation` is called once per admitted attempt; the returned future is
    /// the upstream call. Its error is classified through [`RetryableError`]
    /// the moment it returns.
    ///
    /// A closure cannot be merged with other calls, so the call is always
    /// dispatched alone and `descriptor.batchable` is ignored here. Use
    /// [`submit`](Self::submit) with a registered [`BatchHandler`] to batch.
    ///
    /// # Errors
    ///
    /// - `CircuitOpen` when the circuit is open or opens while waiting
    /// - `RateLimited` when admission would take longer than `max_wait_ms`
    /// - `Upstream` / `Timeout` once retries are exhausted or the failure is terminal
    pub async fn execute<T, E, F, Fut>(
        &self,
        descriptor: &CallDescriptor,
        operation: F,
    ) -> CallResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetryableError,
    {
        self.execute_with_cancel(descriptor, &CancellationToken::new(), operation)
            .await
    }

    /// Like [`execute`](Self::execute), failing with `Cancelled` if `cancel`
    /// fires before a dispatch.
    ///
    /// Cancellation is best effort: a dispatch already in flight runs to
    /// completion.
    ///
    /// # Errors
    ///
    /// As for [`execute`](Self::execute), plus `Cancelled`.
    #[instrument(
        skip_all,
        fields(method = %descriptor.method(), key = %descriptor.key(), weight = descriptor.units())
    )]
    pub async fn execute_with_cancel<T, E, F, Fut>(
        &self,
        descriptor: &CallDescriptor,
        cancel: &CancellationToken,
        operation: F,
    ) -> CallResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetryableError,
    {
        if *descriptor.batchable() {
            debug!("Batchable call sent through execute, dispatching alone");
        }
        let call = self.shared.begin(CallKind::Logical, descriptor);
        let result = self.shared.run(&call, cancel, operation).await;
        if let Err(e) = &result {
            warn!(error = %e.kind(), attempts = e.attempts, "Call failed");
        }
        result
    }

    /// Send `params` to `descriptor.method` through its batch handler.
    ///
    /// Batchable descriptors are coalesced with other calls for the same
    /// method and key; the rest are dispatched alone. Either way the
    /// dispatch passes the circuit, the limiter and retry.
    ///
    /// # Errors
    ///
    /// As for [`execute`](Self::execute). A batch whose handler fails
    /// delivers the same error to every caller in it.
    pub async fn submit(
        &self,
        descriptor: &CallDescriptor,
        params: JsonValue,
    ) -> CallResult<JsonValue> {
        self.submit_with_cancel(descriptor, params, &CancellationToken::new())
            .await
    }

    /// Like [`submit`](Self::submit), withdrawing the call if `cancel`
    /// fires before its batch is dispatched, including while the flushed
    /// batch waits for rate-limit admission.
    ///
    /// # Errors
    ///
    /// As for [`submit`](Self::submit), plus `Cancelled`.
    #[instrument(
        skip_all,
        fields(method = %descriptor.method(), key = %descriptor.key(), batchable = descriptor.batchable())
    )]
    pub async fn submit_with_cancel(
        &self,
        descriptor: &CallDescriptor,
        params: JsonValue,
        cancel: &CancellationToken,
    ) -> CallResult<JsonValue> {
        if !*descriptor.batchable() {
            let method = descriptor.method().clone();
            let handler = self
                .shared
                .handlers
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&method)
                .cloned();
            return self
                .execute_with_cancel(descriptor, cancel, || {
                    let handler = handler.clone();
                    let method = method.clone();
                    let params = params.clone();
                    async move {
                        let handler = handler.ok_or_else(|| {
                            CallError::upstream(
                                format!("no batch handler registered for {}", method),
                                false,
                            )
                        })?;
                        let mut responses = handler.dispatch(&method, vec![params]).await?;
                        match responses.len() {
                            1 => Ok(responses.remove(0)),
                            n => Err(CallError::upstream(
                                format!("{} returned {} responses for 1 request", method, n),
                                false,
                            )),
                        }
                    }
                })
                .await;
        }

        let call = self.shared.begin(CallKind::Logical, descriptor);
        let result = match self.shared.breaker.precheck(&call.key) {
            Err(e) => Err(e),
            Ok(()) => {
                self.batcher
                    .submit_with_cancel(&call.method, &call.key, params, cancel)
                    .await
            }
        };
        if result.is_ok() {
            call.add_wait(call.started.elapsed());
        }
        let attempts = match &result {
            Ok(reply) => *reply.dispatches(),
            Err(e) => e.attempts,
        };
        self.shared.finish(&call, &result, attempts);
        result.map(BatchReply::into_value)
    }

    /// Health of every configured or active method, without calling the upstream.
    ///
    /// A method called under several keys reports the least healthy of their
    /// circuits and the fewest tokens left in any of their buckets.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        let shared = &self.shared;
        let mut methods: BTreeSet<String> = shared.metrics.methods().into_iter().collect();
        methods.extend(shared.config.methods.iter().map(|o| o.name.clone()));
        let touched = shared.keys.read().unwrap_or_else(PoisonError::into_inner).clone();

        MetricsSnapshot::from_methods(methods.into_iter().map(|method| {
            let stats = shared.metrics.stats(&method).unwrap_or_default();
            let mut keys = touched.get(&method).cloned().unwrap_or_default();
            keys.insert(method.clone());

            let tokens = keys
                .iter()
                .filter_map(|key| shared.limiter.tokens_available(key))
                .reduce(f64::min);
            let state = keys
                .iter()
                .map(|key| shared.breaker.state(key))
                .max_by_key(|state| state.severity())
                .unwrap_or(CircuitState::Closed);

            MethodSnapshot::new(method.as_str(), &stats, tokens, state)
        }))
    }
}
