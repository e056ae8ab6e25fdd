//! Audit action record
//!
//! One [`AuditAction`] accumulates the facts about a single request/response
//! pair. It is built from the request before the handler runs and finalized
//! from the outcome afterwards.

use crate::{CaptureDecisions, Error, HttpRequest, HttpResponse, status_reason};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Status code recorded when the downstream handler failed
pub const FAILURE_STATUS_CODE: u16 = 500;

/// Body metadata and, when capture is enabled, its content
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BodyContent {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

impl BodyContent {
    pub fn new(content_type: Option<String>, length: Option<i64>) -> Self {
        Self {
            content_type,
            length,
            value: None,
        }
    }

    pub fn with_value(mut self, value: impl Into<serde_json::Value>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// Body bytes rendered as text (invalid UTF-8 is replaced)
    pub fn with_text(self, bytes: &[u8]) -> Self {
        self.with_value(String::from_utf8_lossy(bytes).into_owned())
    }
}

/// Structured description of a failure raised by the downstream handler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionInfo {
    /// Name of the error kind, e.g. `"Internal"`
    pub kind: String,

    /// Display message of the error
    pub message: String,

    /// Messages of the error's `source()` chain, outermost first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
}

impl ExceptionInfo {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            sources: Vec::new(),
        }
    }
}

impl From<&Error> for ExceptionInfo {
    fn from(err: &Error) -> Self {
        // `Other` displays as its wrapped error, so the chain starts below it
        let mut source = match err {
            Error::Other(inner) => std::error::Error::source(&**inner),
            _ => std::error::Error::source(err),
        };
        let mut sources = Vec::new();
        while let Some(cause) = source {
            sources.push(cause.to_string());
            source = cause.source();
        }

        let kind = err.kind();
        let mut message = err.to_string();
        if message.trim().is_empty() {
            message = format!("{} error", kind);
        }

        Self {
            kind: kind.to_string(),
            message,
            sources,
        }
    }
}

/// Everything recorded about one audited request.
///
/// Optional fields that were not captured are left out of the serialized form
/// entirely rather than written as empty values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditAction {
    /// Always true for records produced by the request middleware
    pub is_middleware: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,

    pub request_url: String,

    pub http_method: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub form_variables: Option<HashMap<String, String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,

    /// Reserved for an enriching layer; never set by the middleware
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_name: Option<String>,

    /// Reserved for an enriching layer; never set by the middleware
    #[serde(skip_serializing_if = "Option::is_none")]
    pub controller_name: Option<String>,

    /// Reserved for an enriching layer; never set by the middleware
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_parameters: Option<HashMap<String, serde_json::Value>>,

    pub request_body: BodyContent,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<BodyContent>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_status_code: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_status: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<ExceptionInfo>,

    pub trace_id: String,
}

impl AuditAction {
    /// Build the initial record for `request`.
    ///
    /// Must run before the handler starts. Body and header content is only
    /// copied when the matching capture decision is set; body type and
    /// length are always taken from the declared request metadata.
    pub fn from_request(request: &HttpRequest, decisions: &CaptureDecisions) -> Self {
        let mut request_body = BodyContent::new(
            request.content_type().map(str::to_string),
            request.content_length(),
        );
        if decisions.include_request_body {
            request_body = request_body.with_text(&request.body);
        }

        Self {
            is_middleware: true,
            user_name: request.user.clone(),
            ip_address: request.remote_addr.map(|addr| addr.ip().to_string()),
            request_url: request.display_url(),
            http_method: request.method.clone(),
            form_variables: form_variables(request),
            headers: decisions.include_headers.then(|| request.headers.clone()),
            action_name: None,
            controller_name: None,
            action_parameters: None,
            request_body,
            response_body: None,
            response_status_code: None,
            response_status: None,
            exception: None,
            trace_id: request.trace_id.clone(),
        }
    }

    /// Record a failed invocation.
    ///
    /// The status is forced to 500 whatever the response says, and no
    /// response body is captured.
    pub fn record_failure(&mut self, exception: ExceptionInfo) {
        self.exception = Some(exception);
        self.response_status_code = Some(FAILURE_STATUS_CODE);
        self.response_status = Some(status_reason(FAILURE_STATUS_CODE));
    }

    /// Record a completed invocation from the final response state.
    ///
    /// `captured_body` is the tapped response body when response capture is
    /// enabled. A response body already placed on the record by downstream
    /// code is kept as is.
    pub fn record_response(&mut self, response: &HttpResponse, captured_body: Option<&[u8]>) {
        self.response_status_code = Some(response.status);
        self.response_status = Some(status_reason(response.status));

        if let Some(bytes) = captured_body
            && self.response_body.is_none()
        {
            let body = BodyContent::new(
                response.content_type().map(str::to_string),
                response.content_length(),
            )
            .with_text(bytes);
            self.response_body = Some(body);
        }
    }

    /// Whether the outcome of the request has been recorded
    pub fn is_finalized(&self) -> bool {
        self.response_status_code.is_some()
    }
}

/// Form fields of a URL-encoded request body.
///
/// Multipart bodies and bodies that fail to parse yield `None`.
fn form_variables(request: &HttpRequest) -> Option<HashMap<String, String>> {
    if !request.is_urlencoded_form() {
        return None;
    }

    match serde_urlencoded::from_bytes::<Vec<(String, String)>>(&request.body) {
        Ok(pairs) => Some(pairs.into_iter().collect()),
        Err(e) => {
            debug!(trace_id = %request.trace_id, error = %e, "Failed to parse form body");
            None
        }
    }
}
