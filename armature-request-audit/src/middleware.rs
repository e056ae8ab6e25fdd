//! Request auditing middleware

use crate::scope::CloseGuard;
use crate::{
    AUDIT_ACTION_KEY, AUDIT_SCOPE_KEY, AuditAction, AuditBackend, AuditMiddlewareConfig,
    AuditScope, AuditScopeOptions, AuditSwitch, BodyTap, CaptureDecisions, Error, ExceptionInfo,
    HttpContext, Middleware, Next,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// Request/response audit middleware
///
/// Produces one [`AuditEvent`](crate::AuditEvent) per request that passes the
/// configured filter, whether the rest of the pipeline succeeds, returns an
/// error, or never completes. Errors from downstream are re-raised unchanged;
/// errors from the audit backend are logged and otherwise ignored.
pub struct AuditMiddleware {
    backend: Arc<dyn AuditBackend>,
    config: AuditMiddlewareConfig,
    switch: AuditSwitch,
}

impl AuditMiddleware {
    /// Create a new audit middleware
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use armature_request_audit::*;
    ///
    /// let middleware = AuditMiddleware::new(FileBackend::new("audit.log")).config(
    ///     AuditMiddlewareConfig::new()
    ///         .include_headers(true)
    ///         .include_response_body_when(|req| req.method != "GET")
    ///         .filter_by_request(|req| !req.path.starts_with("/health")),
    /// );
    /// ```
    pub fn new(backend: impl AuditBackend + 'static) -> Self {
        Self::with_backend(Arc::new(backend))
    }

    /// Create a middleware writing to a shared backend
    pub fn with_backend(backend: Arc<dyn AuditBackend>) -> Self {
        Self {
            backend,
            config: AuditMiddlewareConfig::default(),
            switch: AuditSwitch::global(),
        }
    }

    /// Set the capture configuration
    pub fn config(mut self, config: AuditMiddlewareConfig) -> Self {
        self.config = config;
        self
    }

    /// Use `switch` instead of the process-wide [`AuditSwitch::global`]
    pub fn switch(mut self, switch: AuditSwitch) -> Self {
        self.switch = switch;
        self
    }

    /// Build the action from the request and open its scope.
    ///
    /// Both are left in the request's items for the closing phase.
    async fn before_invoke(
        &self,
        ctx: &mut HttpContext,
        decisions: &CaptureDecisions,
    ) -> CloseGuard {
        let action = AuditAction::from_request(&ctx.request, decisions);
        let event_type = decisions.event_type(&action.http_method, &action.request_url);

        let scope = AuditScope::create(
            AuditScopeOptions::new(event_type, self.backend.clone()).action(action.clone()),
        )
        .await;
        let guard = scope.close_guard();

        ctx.items.insert(AUDIT_ACTION_KEY, action);
        ctx.items.insert(AUDIT_SCOPE_KEY, scope);
        guard
    }

    /// Finalize the action from the outcome and save the scope.
    async fn after_invoke(
        &self,
        ctx: &mut HttpContext,
        mut guard: CloseGuard,
        error: Option<&Error>,
        captured_body: Option<&[u8]>,
    ) {
        let action = ctx.items.remove::<AuditAction>(AUDIT_ACTION_KEY);
        let scope = ctx.items.remove::<AuditScope>(AUDIT_SCOPE_KEY);
        let (Some(mut action), Some(mut scope)) = (action, scope) else {
            debug!(
                trace_id = %ctx.request.trace_id,
                "Audit action or scope missing from request items; skipping audit"
            );
            guard.disarm();
            return;
        };

        match error {
            Some(err) => action.record_failure(ExceptionInfo::from(err)),
            None => action.record_response(&ctx.response, captured_body),
        }
        scope.set_action(action.clone());

        guard.disarm();
        if let Err(e) = scope.save().await {
            error!(
                trace_id = %action.trace_id,
                event_type = %scope.event_type(),
                error = %e,
                "Failed to save audit event"
            );
        }

        ctx.items.insert(AUDIT_ACTION_KEY, action);
        ctx.items.insert(AUDIT_SCOPE_KEY, scope);
    }
}

#[async_trait]
impl Middleware for AuditMiddleware {
    async fn handle(&self, ctx: &mut HttpContext, next: Next<'_>) -> Result<(), Error> {
        if self.switch.is_disabled() {
            return next.run(ctx).await;
        }

        let decisions = self.config.evaluate(&ctx.request);
        if !decisions.should_audit {
            trace!(trace_id = %ctx.request.trace_id, "Request filtered out of auditing");
            return next.run(ctx).await;
        }

        let guard = self.before_invoke(ctx, &decisions).await;

        if !decisions.include_response_body {
            let result = next.run(ctx).await;
            self.after_invoke(ctx, guard, result.as_ref().err(), None).await;
            return result;
        }

        let tap = BodyTap::attach(&mut ctx.response);
        let result = next.run(ctx).await;
        let (captured, replay) = tap.detach(&mut ctx.response).await;
        self.after_invoke(ctx, guard, result.as_ref().err(), Some(captured.as_ref()))
            .await;

        match (result, replay) {
            (Ok(()), Ok(())) => Ok(()),
            (Ok(()), Err(e)) => Err(Error::Io(e)),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(e)) => {
                warn!(
                    trace_id = %ctx.request.trace_id,
                    error = %e,
                    "Failed to replay response body after handler error"
                );
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Handler, HttpRequest, HttpResponse, MemoryBackend, ResponseBuffer};

    struct Ok200;

    #[async_trait]
    impl Handler for Ok200 {
        async fn call(&self, ctx: &mut HttpContext) -> Result<(), Error> {
            ctx.response.write(b"ok").await
        }
    }

    struct DropItems;

    #[async_trait]
    impl Handler for DropItems {
        async fn call(&self, ctx: &mut HttpContext) -> Result<(), Error> {
            ctx.items.remove::<AuditScope>(AUDIT_SCOPE_KEY);
            Ok(())
        }
    }

    fn context(path: &str) -> HttpContext {
        HttpContext::new(HttpRequest::new("GET", path), HttpResponse::sink())
    }

    #[tokio::test]
    async fn test_leaves_finalized_action_in_items() {
        let backend = MemoryBackend::new();
        let middleware = AuditMiddleware::new(backend.clone()).switch(AuditSwitch::new());

        let mut ctx = context("/orders");
        middleware
            .handle(&mut ctx, Next::endpoint(&Ok200))
            .await
            .unwrap();

        let action = ctx.audit_action().unwrap();
        assert_eq!(action.response_status_code, Some(200));
        let scope = ctx.items.get::<AuditScope>(AUDIT_SCOPE_KEY).unwrap();
        assert!(scope.is_saved());
        assert_eq!(backend.get_events().await.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_scope_is_a_no_op() {
        let backend = MemoryBackend::new();
        let middleware = AuditMiddleware::new(backend.clone()).switch(AuditSwitch::new());

        let mut ctx = context("/orders");
        let result = middleware.handle(&mut ctx, Next::endpoint(&DropItems)).await;

        assert!(result.is_ok());
        tokio::task::yield_now().await;
        assert!(backend.get_events().await.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_switch_is_transparent() {
        let backend = MemoryBackend::new();
        let switch = AuditSwitch::new();
        switch.disable();
        let middleware = AuditMiddleware::new(backend.clone())
            .config(AuditMiddlewareConfig::new().include_response_body(true))
            .switch(switch);

        let client = ResponseBuffer::new();
        let mut ctx = HttpContext::new(
            HttpRequest::new("GET", "/"),
            HttpResponse::new(Box::new(client.clone())),
        );
        middleware
            .handle(&mut ctx, Next::endpoint(&Ok200))
            .await
            .unwrap();

        assert_eq!(client.contents().as_ref(), b"ok");
        assert!(ctx.items.is_empty());
        assert!(backend.get_events().await.is_empty());
    }
}
