//! Delegate port used by `and_agent` steps.
//!
//! A delegate turns a prompt into a JSON value (typically a language model
//! call with structured output). `Delegate` uses RPITIT, so it is not object
//! safe; `BoxDelegate` provides type erasure with the usual blanket-impl
//! pattern:
//! 1. An object-safe `DelegateDyn` trait with boxed futures
//! 2. A blanket impl of `DelegateDyn` for every `T: Delegate`
//! 3. `BoxDelegate` wrapping `Arc<dyn DelegateDyn>`

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;

use crate::schema::Shape;

/// One delegate invocation.
#[derive(Debug, Clone)]
pub struct DelegateRequest {
    /// Step issuing the request.
    pub step_id: String,
    pub prompt: String,
    /// Structural description of the value the step will accept back.
    pub output_shape: Option<Shape>,
}

#[derive(Debug, Error)]
pub enum DelegateError {
    #[error("delegate unavailable: {0}")]
    Unavailable(String),

    #[error("delegate call failed: {0}")]
    Failed(String),
}

pub trait Delegate: Send + Sync {
    fn name(&self) -> &str;

    fn invoke(
        &self,
        request: &DelegateRequest,
    ) -> impl Future<Output = Result<Value, DelegateError>> + Send;
}

/// Object-safe version of [`Delegate`].
pub trait DelegateDyn: Send + Sync {
    fn name(&self) -> &str;

    fn invoke_boxed<'a>(
        &'a self,
        request: &'a DelegateRequest,
    ) -> BoxFuture<'a, Result<Value, DelegateError>>;
}

impl<T: Delegate> DelegateDyn for T {
    fn name(&self) -> &str {
        Delegate::name(self)
    }

    fn invoke_boxed<'a>(
        &'a self,
        request: &'a DelegateRequest,
    ) -> BoxFuture<'a, Result<Value, DelegateError>> {
        Box::pin(self.invoke(request))
    }
}

/// Type-erased, cheaply cloneable delegate handle.
#[derive(Clone)]
pub struct BoxDelegate {
    inner: Arc<dyn DelegateDyn>,
}

impl BoxDelegate {
    pub fn new<T: Delegate + 'static>(delegate: T) -> Self {
        Self {
            inner: Arc::new(delegate),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub async fn invoke(&self, request: &DelegateRequest) -> Result<Value, DelegateError> {
        self.inner.invoke_boxed(request).await
    }
}

impl std::fmt::Debug for BoxDelegate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxDelegate")
            .field("name", &self.name())
            .finish()
    }
}
