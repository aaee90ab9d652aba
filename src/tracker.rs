//! In-flight operation tracking.
//!
//! Keys such as `car-update-<id>` mark a logical operation as running so a
//! second trigger for the same key is dropped instead of racing the first.
//! This is a same-process guard only; it gives no protection against a
//! second terminal writing the same row.
//!
//! The tracker also carries bounded retry bookkeeping and a retrying
//! executor with optional read-back verification, used for writes that
//! must stick (marking a job completed).

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::QueueError;

/// Upper bound for a single backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Fetch,
    Insert,
    Update,
    Delete,
    Completion,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Fetch => "fetch",
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::Completion => "completion",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct TrackedOperation {
    pub kind: OperationKind,
    pub retry_count: u32,
    pub max_retries: u32,
    pub started_at: Instant,
}

/// Errors that know whether another attempt could succeed.
pub trait Retryable: fmt::Display {
    fn is_retryable(&self) -> bool;
}

impl Retryable for QueueError {
    fn is_retryable(&self) -> bool {
        QueueError::is_retryable(self)
    }
}

/// Retry policy for [`OperationTracker::execute`].
pub struct ExecuteOptions {
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Called before each retry with the attempt that failed (1-based) and
    /// its error message.
    pub on_retry: Option<Box<dyn Fn(u32, &str) + Send + Sync>>,
}

impl ExecuteOptions {
    pub fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            max_retries,
            retry_delay,
            on_retry: None,
        }
    }

    pub fn on_retry(mut self, callback: impl Fn(u32, &str) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Box::new(callback));
        self
    }
}

impl fmt::Debug for ExecuteOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecuteOptions")
            .field("max_retries", &self.max_retries)
            .field("retry_delay", &self.retry_delay)
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}

/// Delay before the retry that follows failed attempt `attempt` (1-based).
/// Completion writes back off exponentially; everything else waits flat.
pub fn backoff_delay(kind: OperationKind, base: Duration, attempt: u32) -> Duration {
    match kind {
        OperationKind::Completion => {
            let factor = 1u32 << attempt.saturating_sub(1).min(10);
            base.saturating_mul(factor).min(MAX_BACKOFF)
        }
        _ => base.min(MAX_BACKOFF),
    }
}

#[derive(Debug, Default)]
pub struct OperationTracker {
    active: Mutex<HashMap<String, TrackedOperation>>,
}

impl OperationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TrackedOperation>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `id` as in flight. Overwrites an existing record; callers
    /// check [`is_active`](Self::is_active) first or use
    /// [`try_start`](Self::try_start).
    pub fn start(&self, id: &str, kind: OperationKind, max_retries: u32) {
        self.lock().insert(
            id.to_string(),
            TrackedOperation {
                kind,
                retry_count: 0,
                max_retries,
                started_at: Instant::now(),
            },
        );
    }

    /// Atomic check-and-register. Returns `false` if `id` is already active.
    pub fn try_start(&self, id: &str, kind: OperationKind, max_retries: u32) -> bool {
        let mut active = self.lock();
        if active.contains_key(id) {
            return false;
        }
        active.insert(
            id.to_string(),
            TrackedOperation {
                kind,
                retry_count: 0,
                max_retries,
                started_at: Instant::now(),
            },
        );
        true
    }

    /// [`try_start`](Self::try_start) returning a guard that ends the
    /// operation when dropped.
    pub fn guard(&self, id: &str, kind: OperationKind) -> Option<OperationGuard<'_>> {
        if self.try_start(id, kind, 0) {
            Some(OperationGuard {
                tracker: self,
                id: id.to_string(),
            })
        } else {
            None
        }
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Whether any active key starts with `prefix`.
    pub fn any_active_with_prefix(&self, prefix: &str) -> bool {
        self.lock().keys().any(|key| key.starts_with(prefix))
    }

    pub fn get(&self, id: &str) -> Option<TrackedOperation> {
        self.lock().get(id).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    /// Remove the record. Safe on unknown ids.
    pub fn end(&self, id: &str) {
        self.lock().remove(id);
    }

    /// Count one retry. Returns `false` (and drops the record) once the
    /// budget is spent, or if `id` is not tracked.
    pub fn retry(&self, id: &str) -> bool {
        let mut active = self.lock();
        match active.get_mut(id) {
            Some(op) if op.retry_count < op.max_retries => {
                op.retry_count += 1;
                true
            }
            Some(_) => {
                active.remove(id);
                false
            }
            None => false,
        }
    }

    /// Run `operation`, retrying retryable failures with backoff.
    pub async fn execute<T, E, Op, Fut>(
        &self,
        id: &str,
        kind: OperationKind,
        options: ExecuteOptions,
        operation: Op,
    ) -> Result<T, E>
    where
        E: Retryable,
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_verified(id, kind, options, operation, || async { Ok(()) })
            .await
    }

    /// Like [`execute`](Self::execute), but after each apparently successful
    /// attempt runs `verify`; a verification error counts as a failed
    /// attempt. Exhausting retries returns the last error.
    pub async fn execute_verified<T, E, Op, Fut, V, VFut>(
        &self,
        id: &str,
        kind: OperationKind,
        options: ExecuteOptions,
        mut operation: Op,
        mut verify: V,
    ) -> Result<T, E>
    where
        E: Retryable,
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        V: FnMut() -> VFut,
        VFut: Future<Output = Result<(), E>>,
    {
        self.start(id, kind, options.max_retries);
        let _guard = OperationGuard {
            tracker: self,
            id: id.to_string(),
        };

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let error = match operation().await {
                Ok(value) => match verify().await {
                    Ok(()) => {
                        if attempt > 1 {
                            debug!(operation = %id, %kind, attempt, "operation succeeded after retry");
                        }
                        return Ok(value);
                    }
                    Err(e) => e,
                },
                Err(e) => e,
            };

            if !error.is_retryable() {
                return Err(error);
            }
            if !self.retry(id) {
                warn!(operation = %id, %kind, attempt, error = %error, "operation failed, retries exhausted");
                return Err(error);
            }

            let delay = backoff_delay(kind, options.retry_delay, attempt);
            warn!(
                operation = %id,
                %kind,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "operation failed, retrying"
            );
            if let Some(callback) = &options.on_retry {
                callback(attempt, &error.to_string());
            }
            tokio::time::sleep(delay).await;
        }
    }
}

/// Ends the tracked operation when dropped, on every exit path.
#[derive(Debug)]
pub struct OperationGuard<'a> {
    tracker: &'a OperationTracker,
    id: String,
}

impl OperationGuard<'_> {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        self.tracker.end(&self.id);
    }
}
