//! Request auditing for Armature
//!
//! This crate provides a middleware that turns every request/response pair
//! flowing through a pipeline into a durable audit record, including requests
//! whose handler fails or never completes.
//!
//! # Features
//!
//! - **Capture Policy** - Per-request selectors for headers, bodies, event type and filtering
//! - **Body Tap** - Transparent capture of the response body
//! - **Exactly-once Persistence** - One saved event per audited request
//! - **Failure Records** - Errors, panics and cancellations are audited too
//! - **Backends** - JSON-lines file log and in-memory storage
//! - **Global Switch** - Turn auditing off process-wide
//!
//! # Quick Start
//!
//! ```no_run
//! use armature_request_audit::*;
//! use async_trait::async_trait;
//!
//! struct GetOrder;
//!
//! #[async_trait]
//! impl Handler for GetOrder {
//!     async fn call(&self, ctx: &mut HttpContext) -> Result<(), Error> {
//!         ctx.response.set_header("Content-Type", "application/json");
//!         ctx.response.write(br#"{"id":42}"#).await
//!     }
//! }
//!
//! # async fn example() -> Result<(), Error> {
//! let pipeline = Pipeline::new(GetOrder).with(
//!     AuditMiddleware::new(FileBackend::new("audit.log"))
//!         .config(AuditMiddlewareConfig::new().include_response_body(true)),
//! );
//!
//! let mut ctx = HttpContext::new(HttpRequest::new("GET", "/orders/42"), HttpResponse::sink());
//! pipeline.handle(&mut ctx).await?;
//! # Ok(())
//! # }
//! ```

pub mod action;
pub mod backend;
pub mod error;
pub mod event;
pub mod http;
pub mod items;
pub mod middleware;
pub mod pipeline;
pub mod policy;
pub mod scope;
pub mod tap;

pub use action::*;
pub use backend::*;
pub use error::*;
pub use event::*;
pub use http::*;
pub use items::*;
pub use middleware::*;
pub use pipeline::*;
pub use policy::*;
pub use scope::{AuditScope, AuditScopeOptions};
pub use tap::*;
