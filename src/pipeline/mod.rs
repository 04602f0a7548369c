//! Ordered, short-circuiting middleware chains.
//!
//! A [`Pipeline`] applies its middleware to a value one after the other, in registration order.
//! Each middleware can transform the value, leave it untouched or abort the run with a
//! [`MiddlewareError`]. The first failure stops the pipeline: later middleware never sees the
//! value, and the error is handed back to the caller unchanged.
//!
//! Publishers run a `Pipeline<PublishOp>` before sending, consumers a `Pipeline<Message>` for
//! every delivery.
pub(crate) mod codec;
mod error;
mod log;

pub use codec::CRC32_HEADER;
pub use error::MiddlewareError;
pub use log::{LogEntry, MiddlewareLog};

use std::sync::Arc;

/// A single step of a [`Pipeline`].
///
/// Synchronous closures taking `&mut T` are middleware too.
#[async_trait::async_trait]
pub trait Middleware<T>: Send + Sync + 'static {
    /// A human-readable name, used in logs when the middleware fails.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    async fn handle(&self, value: &mut T) -> Result<(), MiddlewareError>;
}

#[async_trait::async_trait]
impl<T, F> Middleware<T> for F
where
    T: Send,
    F: Fn(&mut T) -> Result<(), MiddlewareError> + Send + Sync + 'static,
{
    async fn handle(&self, value: &mut T) -> Result<(), MiddlewareError> {
        (self)(value)
    }
}

/// An ordered list of middleware for values of type `T`.
pub struct Pipeline<T> {
    middlewares: Vec<Arc<dyn Middleware<T>>>,
}

impl<T> Clone for Pipeline<T> {
    fn clone(&self) -> Self {
        Self {
            middlewares: self.middlewares.clone(),
        }
    }
}

impl<T> Default for Pipeline<T> {
    fn default() -> Self {
        Self {
            middlewares: Vec::new(),
        }
    }
}

impl<T> std::fmt::Debug for Pipeline<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("middlewares", &self.middlewares.len())
            .finish()
    }
}

impl<T: Send + 'static> Pipeline<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a middleware at the end of the pipeline.
    #[must_use]
    pub fn with_middleware<M: Middleware<T>>(self, middleware: M) -> Self {
        self.with_dyn_middleware(Arc::new(middleware))
    }

    /// Append a middleware at the end of the pipeline.
    #[must_use]
    pub fn with_dyn_middleware(mut self, middleware: Arc<dyn Middleware<T>>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Append a list of middlewares at the end of the pipeline, preserving their order.
    #[must_use]
    pub fn with_middlewares(mut self, middlewares: Vec<Arc<dyn Middleware<T>>>) -> Self {
        self.middlewares.extend(middlewares);
        self
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Run `value` through every middleware, stopping at the first failure.
    ///
    /// Changes applied by the middleware that ran before a failure are kept.
    pub async fn run(&self, value: &mut T) -> Result<(), MiddlewareError> {
        for middleware in &self.middlewares {
            if let Err(error) = middleware.handle(value).await {
                tracing::debug!(
                    middleware = middleware.name(),
                    error = %error,
                    "Middleware rejected the value"
                );
                return Err(error);
            }
        }
        Ok(())
    }
}
