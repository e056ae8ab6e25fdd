// Middleware pipeline for request processing

use crate::{Error, HttpContext};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, trace};

/// Terminal request handler
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handle the request, writing the response through `ctx.response`
    async fn call(&self, ctx: &mut HttpContext) -> Result<(), Error>;
}

#[async_trait]
impl<H: Handler + ?Sized> Handler for Arc<H> {
    async fn call(&self, ctx: &mut HttpContext) -> Result<(), Error> {
        (**self).call(ctx).await
    }
}

/// Middleware trait for wrapping the rest of the pipeline
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Process the request and optionally pass it on through `next`
    async fn handle(&self, ctx: &mut HttpContext, next: Next<'_>) -> Result<(), Error>;
}

/// Continuation invoking the remainder of the pipeline.
///
/// `run` consumes the continuation, so the rest of the chain runs at most once
/// per middleware invocation.
pub struct Next<'a> {
    middlewares: &'a [Arc<dyn Middleware>],
    endpoint: &'a dyn Handler,
}

impl<'a> Next<'a> {
    /// Continuation that calls `endpoint` directly
    pub fn endpoint(endpoint: &'a dyn Handler) -> Self {
        Self {
            middlewares: &[],
            endpoint,
        }
    }

    pub async fn run(self, ctx: &mut HttpContext) -> Result<(), Error> {
        match self.middlewares.split_first() {
            Some((middleware, rest)) => {
                trace!(remaining = rest.len(), "Executing middleware");
                let next = Next {
                    middlewares: rest,
                    endpoint: self.endpoint,
                };
                middleware.handle(ctx, next).await
            }
            None => {
                trace!("Middleware chain complete, calling handler");
                self.endpoint.call(ctx).await
            }
        }
    }
}

/// An endpoint wrapped in an ordered list of middleware.
///
/// Middleware run in the order they were added; the first one added is the
/// outermost.
#[derive(Clone)]
pub struct Pipeline {
    middlewares: Vec<Arc<dyn Middleware>>,
    endpoint: Arc<dyn Handler>,
}

impl Pipeline {
    pub fn new(endpoint: impl Handler + 'static) -> Self {
        Self {
            middlewares: Vec::new(),
            endpoint: Arc::new(endpoint),
        }
    }

    /// Add a middleware to the chain
    pub fn with(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    /// Add a shared middleware to the chain
    pub fn with_shared(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Run one request through the pipeline
    pub async fn handle(&self, ctx: &mut HttpContext) -> Result<(), Error> {
        debug!(
            middleware_count = self.middlewares.len(),
            method = %ctx.request.method,
            path = %ctx.request.path,
            "Executing middleware chain"
        );
        let next = Next {
            middlewares: &self.middlewares,
            endpoint: self.endpoint.as_ref(),
        };
        next.run(ctx).await
    }
}
