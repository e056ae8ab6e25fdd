// HTTP request, response and per-request context types

use crate::items::RequestItems;
use crate::{AuditAction, Error};
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Output channel a response body is written to.
pub type ResponseWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Look up a header ignoring ASCII case.
fn find_header<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Inbound HTTP request
///
/// The body is fully buffered by the host before the pipeline runs, so it can
/// be inspected by middleware without disturbing the handler.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub query_string: Option<String>,
    pub scheme: String,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
    /// Authenticated user name, if an upstream layer resolved one
    pub user: Option<String>,
    /// Address of the connected peer
    pub remote_addr: Option<SocketAddr>,
    /// Identifier correlating log lines and audit records for this request
    pub trace_id: String,
}

impl HttpRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        let path = path.into();
        let (path, query_string) = match path.split_once('?') {
            Some((path, query)) => (path.to_string(), Some(query.to_string())),
            None => (path, None),
        };

        Self {
            method: method.into(),
            path,
            query_string,
            scheme: "http".to_string(),
            headers: HashMap::new(),
            body: Bytes::new(),
            user: None,
            remote_addr: None,
            trace_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    /// Get a header value (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Declared `Content-Type` of the body
    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    /// Declared `Content-Length` of the body
    pub fn content_length(&self) -> Option<i64> {
        self.header("content-length")
            .and_then(|value| value.trim().parse().ok())
    }

    /// Whether the body is an `application/x-www-form-urlencoded` form
    pub fn is_urlencoded_form(&self) -> bool {
        self.content_type().is_some_and(|ct| {
            ct.to_ascii_lowercase()
                .starts_with("application/x-www-form-urlencoded")
        })
    }

    /// Path plus query string, e.g. `/orders/42?expand=lines`
    pub fn path_and_query(&self) -> String {
        match &self.query_string {
            Some(query) if !query.is_empty() => format!("{}?{}", self.path, query),
            _ => self.path.clone(),
        }
    }

    /// URL as a user would see it.
    ///
    /// Fully qualified when the request carries a `Host` header, otherwise just
    /// the path and query.
    pub fn display_url(&self) -> String {
        match self.header("host") {
            Some(host) => format!("{}://{}{}", self.scheme, host, self.path_and_query()),
            None => self.path_and_query(),
        }
    }
}

/// Outbound HTTP response
///
/// Status and headers are plain values; the body is streamed to `body` as the
/// handler writes it.
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: ResponseWriter,
}

impl HttpResponse {
    pub fn new(body: ResponseWriter) -> Self {
        Self {
            status: 200,
            headers: HashMap::new(),
            body,
        }
    }

    /// Response that discards everything written to it
    pub fn sink() -> Self {
        Self::new(Box::new(tokio::io::sink()))
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(key.into(), value.into());
    }

    /// Get a header value (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    pub fn content_length(&self) -> Option<i64> {
        self.header("content-length")
            .and_then(|value| value.trim().parse().ok())
    }

    /// Write a chunk of the body to the current output channel
    pub async fn write(&mut self, chunk: &[u8]) -> Result<(), Error> {
        self.body.write_all(chunk).await?;
        Ok(())
    }

    /// Flush the current output channel
    pub async fn flush(&mut self) -> Result<(), Error> {
        self.body.flush().await?;
        Ok(())
    }
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Everything the pipeline knows about one in-flight request.
///
/// A context is created by the host per request and passed by `&mut` through
/// every middleware, so nothing stored in `items` is ever visible to another
/// request.
#[derive(Debug)]
pub struct HttpContext {
    pub request: HttpRequest,
    pub response: HttpResponse,
    pub items: RequestItems,
}

impl HttpContext {
    pub fn new(request: HttpRequest, response: HttpResponse) -> Self {
        Self {
            request,
            response,
            items: RequestItems::new(),
        }
    }

    /// The audit action of this request, if auditing is active for it
    pub fn audit_action(&self) -> Option<&AuditAction> {
        self.items.get(crate::AUDIT_ACTION_KEY)
    }

    /// Mutable access to the in-flight audit action.
    ///
    /// Handlers use this to enrich the record (action names, a pre-rendered
    /// response body, ...) before the middleware finalizes it.
    pub fn audit_action_mut(&mut self) -> Option<&mut AuditAction> {
        self.items.get_mut(crate::AUDIT_ACTION_KEY)
    }
}

/// Canonical reason phrase for a status code, e.g. `404` -> `"Not Found"`.
///
/// Codes without a registered phrase render as the number itself.
pub fn status_reason(status: u16) -> String {
    http::StatusCode::from_u16(status)
        .ok()
        .and_then(|code| code.canonical_reason())
        .map(str::to_string)
        .unwrap_or_else(|| status.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_splits_query() {
        let req = HttpRequest::new("GET", "/orders?page=2");
        assert_eq!(req.path, "/orders");
        assert_eq!(req.query_string.as_deref(), Some("page=2"));
        assert_eq!(req.path_and_query(), "/orders?page=2");
    }

    #[test]
    fn test_display_url_without_host() {
        let req = HttpRequest::new("GET", "/orders/42");
        assert_eq!(req.display_url(), "/orders/42");
    }

    #[test]
    fn test_display_url_with_host() {
        let req = HttpRequest::new("GET", "/orders/42?x=1")
            .with_scheme("https")
            .with_header("Host", "shop.example.com");
        assert_eq!(req.display_url(), "https://shop.example.com/orders/42?x=1");
    }

    #[test]
    fn test_header_lookup_ignores_case() {
        let req = HttpRequest::new("POST", "/")
            .with_header("Content-Type", "application/json")
            .with_header("CONTENT-LENGTH", " 17 ");
        assert_eq!(req.content_type(), Some("application/json"));
        assert_eq!(req.content_length(), Some(17));
    }

    #[test]
    fn test_form_content_type_detection() {
        let form = HttpRequest::new("POST", "/")
            .with_header("content-type", "application/x-www-form-urlencoded; charset=utf-8");
        let multipart = HttpRequest::new("POST", "/")
            .with_header("Content-Type", "multipart/form-data; boundary=xyz");
        let json = HttpRequest::new("POST", "/").with_header("content-type", "application/json");
        assert!(form.is_urlencoded_form());
        assert!(!multipart.is_urlencoded_form());
        assert!(!json.is_urlencoded_form());
        assert!(!HttpRequest::new("GET", "/").is_urlencoded_form());
    }

    #[test]
    fn test_status_reason() {
        assert_eq!(status_reason(200), "OK");
        assert_eq!(status_reason(404), "Not Found");
        assert_eq!(status_reason(500), "Internal Server Error");
        assert_eq!(status_reason(599), "599");
    }

    #[tokio::test]
    async fn test_response_write_to_sink() {
        let mut response = HttpResponse::sink();
        response.set_status(201);
        response.write(b"created").await.unwrap();
        response.flush().await.unwrap();
        assert_eq!(response.status, 201);
    }
}
