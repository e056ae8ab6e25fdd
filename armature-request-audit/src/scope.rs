//! Audit scopes
//!
//! An [`AuditScope`] owns the [`AuditEvent`] of one request between the moment
//! auditing starts and the moment the event is persisted. Saving is
//! idempotent, so an event reaches its backend at most once.

use crate::{AuditAction, AuditBackend, AuditBackendError, AuditEvent, ExceptionInfo};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Options for opening an [`AuditScope`]
pub struct AuditScopeOptions {
    event_type: String,
    action: AuditAction,
    backend: Arc<dyn AuditBackend>,
}

impl AuditScopeOptions {
    pub fn new(event_type: impl Into<String>, backend: Arc<dyn AuditBackend>) -> Self {
        Self {
            event_type: event_type.into(),
            action: AuditAction::default(),
            backend,
        }
    }

    /// Initial action payload of the event
    pub fn action(mut self, action: AuditAction) -> Self {
        self.action = action;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeState {
    Open,
    Saved,
    Discarded,
}

/// Unit of work around a single audit event
pub struct AuditScope {
    event: AuditEvent,
    backend: Arc<dyn AuditBackend>,
    state: ScopeState,
}

impl AuditScope {
    /// Open a scope; nothing is written until [`save`](Self::save)
    ///
    /// # Examples
    ///
    /// ```
    /// use armature_request_audit::*;
    /// use std::sync::Arc;
    ///
    /// # async fn example() -> Result<(), AuditBackendError> {
    /// let backend = MemoryBackend::new();
    /// let mut scope = AuditScope::create(
    ///     AuditScopeOptions::new("GET /orders", Arc::new(backend.clone())),
    /// )
    /// .await;
    ///
    /// scope.save().await?;
    /// scope.save().await?; // no-op
    /// assert_eq!(backend.get_events().await.len(), 1);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn create(options: AuditScopeOptions) -> Self {
        debug!(
            event_type = %options.event_type,
            trace_id = %options.action.trace_id,
            "Audit scope opened"
        );

        Self {
            event: AuditEvent::new(options.event_type, options.action),
            backend: options.backend,
            state: ScopeState::Open,
        }
    }

    pub fn event(&self) -> &AuditEvent {
        &self.event
    }

    pub fn event_mut(&mut self) -> &mut AuditEvent {
        &mut self.event
    }

    pub fn event_type(&self) -> &str {
        &self.event.event_type
    }

    /// Replace the action payload of the event
    pub fn set_action(&mut self, action: AuditAction) {
        self.event.action = action;
    }

    pub fn is_saved(&self) -> bool {
        self.state == ScopeState::Saved
    }

    /// Persist the event.
    ///
    /// Only the first call on an open scope writes; later calls, and calls on
    /// a discarded scope, return `Ok(())` without touching the backend. A
    /// failed write still closes the scope.
    ///
    /// The write runs on its own task. Dropping the returned future stops
    /// the wait, not the write.
    pub async fn save(&mut self) -> Result<(), AuditBackendError> {
        if self.state != ScopeState::Open {
            return Ok(());
        }
        self.state = ScopeState::Saved;

        self.event.finish();
        let event = self.event.clone();
        let backend = self.backend.clone();
        let write = tokio::spawn(async move { backend.write(&event).await });
        match write.await {
            Ok(result) => result?,
            Err(e) => {
                return Err(AuditBackendError::Other(format!(
                    "audit write task failed: {}",
                    e
                )));
            }
        }

        debug!(
            event_type = %self.event.event_type,
            trace_id = %self.event.action.trace_id,
            status = ?self.event.action.response_status_code,
            duration_ms = ?self.event.duration_ms,
            "Audit event saved"
        );
        Ok(())
    }

    /// Close the scope without persisting anything
    pub fn discard(&mut self) {
        if self.state == ScopeState::Open {
            self.state = ScopeState::Discarded;
        }
    }

    /// Guard that persists a failure record for this scope if it is dropped
    /// while still armed.
    pub(crate) fn close_guard(&self) -> CloseGuard {
        CloseGuard {
            pending: Some(PendingClose {
                event: self.event.clone(),
                backend: self.backend.clone(),
            }),
        }
    }
}

impl fmt::Debug for AuditScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditScope")
            .field("event_type", &self.event.event_type)
            .field("event_id", &self.event.id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

struct PendingClose {
    event: AuditEvent,
    backend: Arc<dyn AuditBackend>,
}

/// Drop guard bound to an open audit scope.
///
/// The middleware disarms the guard right before its own save, which runs
/// to completion even if the request is dropped meanwhile. If the request
/// future is dropped first (host cancellation, timeout) or the handler
/// panics, the guard records a failure from the snapshot it took when the
/// scope opened and hands the save to the current tokio runtime.
pub(crate) struct CloseGuard {
    pending: Option<PendingClose>,
}

impl CloseGuard {
    pub(crate) fn disarm(&mut self) {
        self.pending = None;
    }
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        let Some(PendingClose { mut event, backend }) = self.pending.take() else {
            return;
        };

        let exception = if std::thread::panicking() {
            ExceptionInfo::new("Panic", "request handler panicked")
        } else {
            ExceptionInfo::new("Cancelled", "request was dropped before completion")
        };
        warn!(
            event_type = %event.event_type,
            trace_id = %event.action.trace_id,
            kind = %exception.kind,
            "Request ended without completing; recording failure"
        );
        event.action.record_failure(exception);
        event.finish();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = backend.write(&event).await {
                        error!(
                            trace_id = %event.action.trace_id,
                            error = %e,
                            "Failed to save audit event"
                        );
                    }
                });
            }
            Err(_) => {
                warn!(
                    trace_id = %event.action.trace_id,
                    "No runtime available; audit event for interrupted request dropped"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryBackend;
    use async_trait::async_trait;
    use std::time::Duration;

    struct FailingBackend;

    #[async_trait]
    impl AuditBackend for FailingBackend {
        async fn write(&self, _event: &AuditEvent) -> Result<(), AuditBackendError> {
            Err(AuditBackendError::Other("storage offline".to_string()))
        }
    }

    struct SlowBackend {
        inner: MemoryBackend,
        delay: Duration,
    }

    #[async_trait]
    impl AuditBackend for SlowBackend {
        async fn write(&self, event: &AuditEvent) -> Result<(), AuditBackendError> {
            tokio::time::sleep(self.delay).await;
            self.inner.write(event).await
        }
    }

    async fn open(backend: &MemoryBackend) -> AuditScope {
        AuditScope::create(AuditScopeOptions::new(
            "GET /orders",
            Arc::new(backend.clone()),
        ))
        .await
    }

    #[tokio::test]
    async fn test_save_writes_once() {
        let backend = MemoryBackend::new();
        let mut scope = open(&backend).await;

        scope.save().await.unwrap();
        scope.save().await.unwrap();

        assert!(scope.is_saved());
        let events = backend.get_events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "GET /orders");
        assert!(events[0].end_date.is_some());
    }

    #[tokio::test]
    async fn test_set_action_before_save() {
        let backend = MemoryBackend::new();
        let mut scope = open(&backend).await;

        let action = AuditAction {
            http_method: "GET".to_string(),
            response_status_code: Some(200),
            ..Default::default()
        };
        scope.set_action(action);
        scope.save().await.unwrap();

        let events = backend.get_events().await;
        assert_eq!(events[0].action.response_status_code, Some(200));
    }

    #[tokio::test]
    async fn test_discarded_scope_is_not_saved() {
        let backend = MemoryBackend::new();
        let mut scope = open(&backend).await;

        scope.discard();
        scope.save().await.unwrap();

        assert!(!scope.is_saved());
        assert!(backend.get_events().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_save_closes_scope() {
        let mut scope =
            AuditScope::create(AuditScopeOptions::new("GET /", Arc::new(FailingBackend))).await;

        assert!(scope.save().await.is_err());
        assert!(scope.save().await.is_ok());
    }

    #[tokio::test]
    async fn test_save_outlives_dropped_caller() {
        let backend = MemoryBackend::new();
        let slow = SlowBackend {
            inner: backend.clone(),
            delay: Duration::from_millis(50),
        };
        let mut scope =
            AuditScope::create(AuditScopeOptions::new("GET /slow", Arc::new(slow))).await;

        let outcome = tokio::time::timeout(Duration::from_millis(10), scope.save()).await;
        assert!(outcome.is_err());
        assert!(scope.is_saved());

        tokio::time::sleep(Duration::from_millis(100)).await;
        let events = backend.get_events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "GET /slow");

        scope.save().await.unwrap();
        assert_eq!(backend.get_events().await.len(), 1);
    }

    #[tokio::test]
    async fn test_disarmed_guard_does_nothing() {
        let backend = MemoryBackend::new();
        let scope = open(&backend).await;

        let mut guard = scope.close_guard();
        guard.disarm();
        drop(guard);
        tokio::task::yield_now().await;

        assert!(backend.get_events().await.is_empty());
    }

    #[tokio::test]
    async fn test_armed_guard_records_cancellation() {
        let backend = MemoryBackend::new();
        let scope = open(&backend).await;

        drop(scope.close_guard());
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let events = backend.get_events().await;
        assert_eq!(events.len(), 1);
        let action = &events[0].action;
        assert_eq!(action.response_status_code, Some(500));
        assert_eq!(action.exception.as_ref().unwrap().kind, "Cancelled");
    }
}
