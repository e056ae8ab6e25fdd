//! Capture policy
//!
//! Decides, once per request and before anything is captured, which parts of
//! the request/response pair end up in the audit record.

use crate::HttpRequest;
use once_cell::sync::Lazy;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Default event type template
pub const DEFAULT_EVENT_TYPE_NAME: &str = "{verb} {url}";

/// Environment variable consulted when the global switch is first used
pub const AUDIT_DISABLED_ENV: &str = "ARMATURE_AUDIT_DISABLED";

/// Predicate over the inbound request
pub type RequestPredicate = Arc<dyn Fn(&HttpRequest) -> bool + Send + Sync>;

/// Event type name selector
pub type EventTypeSelector = Arc<dyn Fn(&HttpRequest) -> Option<String> + Send + Sync>;

/// Substitute `{verb}` and `{url}` in an event type template.
pub fn render_event_type(template: &str, verb: &str, url: &str) -> String {
    template.replace("{verb}", verb).replace("{url}", url)
}

/// Selectors configuring what the audit middleware captures.
///
/// Every selector is optional. Unset boolean selectors default to `false`,
/// the event type defaults to [`DEFAULT_EVENT_TYPE_NAME`] and an unset filter
/// audits every request.
#[derive(Clone, Default)]
pub struct AuditMiddlewareConfig {
    include_headers: Option<RequestPredicate>,
    include_request_body: Option<RequestPredicate>,
    include_response_body: Option<RequestPredicate>,
    event_type_name: Option<EventTypeSelector>,
    request_filter: Option<RequestPredicate>,
}

impl AuditMiddlewareConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture request headers for every audited request
    pub fn include_headers(self, include: bool) -> Self {
        self.include_headers_when(move |_| include)
    }

    /// Capture request headers when `predicate` returns true
    pub fn include_headers_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&HttpRequest) -> bool + Send + Sync + 'static,
    {
        self.include_headers = Some(Arc::new(predicate));
        self
    }

    /// Capture the request body for every audited request
    pub fn include_request_body(self, include: bool) -> Self {
        self.include_request_body_when(move |_| include)
    }

    pub fn include_request_body_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&HttpRequest) -> bool + Send + Sync + 'static,
    {
        self.include_request_body = Some(Arc::new(predicate));
        self
    }

    /// Capture the response body for every audited request
    pub fn include_response_body(self, include: bool) -> Self {
        self.include_response_body_when(move |_| include)
    }

    pub fn include_response_body_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&HttpRequest) -> bool + Send + Sync + 'static,
    {
        self.include_response_body = Some(Arc::new(predicate));
        self
    }

    /// Fixed event type template, e.g. `"{verb}:{url}"`
    pub fn event_type_name(self, template: impl Into<String>) -> Self {
        let template = template.into();
        self.event_type_name_with(move |_| Some(template.clone()))
    }

    /// Per-request event type template; `None` falls back to the default
    pub fn event_type_name_with<F>(mut self, selector: F) -> Self
    where
        F: Fn(&HttpRequest) -> Option<String> + Send + Sync + 'static,
    {
        self.event_type_name = Some(Arc::new(selector));
        self
    }

    /// Only audit requests for which `filter` returns true
    pub fn filter_by_request<F>(mut self, filter: F) -> Self
    where
        F: Fn(&HttpRequest) -> bool + Send + Sync + 'static,
    {
        self.request_filter = Some(Arc::new(filter));
        self
    }

    /// Evaluate every selector exactly once for `request`.
    pub fn evaluate(&self, request: &HttpRequest) -> CaptureDecisions {
        let check = |predicate: &Option<RequestPredicate>, default: bool| {
            predicate
                .as_ref()
                .map_or(default, |predicate| predicate(request))
        };

        let template = self
            .event_type_name
            .as_ref()
            .and_then(|selector| selector(request));

        CaptureDecisions {
            include_headers: check(&self.include_headers, false),
            include_request_body: check(&self.include_request_body, false),
            include_response_body: check(&self.include_response_body, false),
            event_type_name: template,
            should_audit: check(&self.request_filter, true),
        }
    }
}

impl fmt::Debug for AuditMiddlewareConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditMiddlewareConfig")
            .field("include_headers", &self.include_headers.is_some())
            .field("include_request_body", &self.include_request_body.is_some())
            .field("include_response_body", &self.include_response_body.is_some())
            .field("event_type_name", &self.event_type_name.is_some())
            .field("request_filter", &self.request_filter.is_some())
            .finish()
    }
}

/// Capture decisions for a single request.
///
/// Computed before the downstream handler starts and never re-evaluated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureDecisions {
    pub include_headers: bool,
    pub include_request_body: bool,
    pub include_response_body: bool,
    /// Template chosen by the selector, `None` for the default
    pub event_type_name: Option<String>,
    pub should_audit: bool,
}

impl CaptureDecisions {
    /// Final event type for a request with the given verb and URL
    pub fn event_type(&self, verb: &str, url: &str) -> String {
        let template = self
            .event_type_name
            .as_deref()
            .unwrap_or(DEFAULT_EVENT_TYPE_NAME);
        render_event_type(template, verb, url)
    }
}

static GLOBAL_SWITCH: Lazy<AuditSwitch> = Lazy::new(AuditSwitch::from_env);

/// On/off switch for auditing.
///
/// Clones share the same flag. When the switch is disabled the audit
/// middleware is fully transparent.
#[derive(Debug, Clone, Default)]
pub struct AuditSwitch {
    disabled: Arc<AtomicBool>,
}

impl AuditSwitch {
    /// New, enabled switch independent of the global one
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide switch shared by every middleware that was not given its own
    pub fn global() -> AuditSwitch {
        GLOBAL_SWITCH.clone()
    }

    /// Switch initialised from [`AUDIT_DISABLED_ENV`]
    pub fn from_env() -> Self {
        let disabled = std::env::var(AUDIT_DISABLED_ENV)
            .map(|value| parse_flag(&value))
            .unwrap_or(false);
        let switch = Self::new();
        switch.set_disabled(disabled);
        switch
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::Relaxed);
    }

    pub fn disable(&self) {
        self.set_disabled(true);
    }

    pub fn enable(&self) {
        self.set_disabled(false);
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
