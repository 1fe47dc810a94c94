use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::SqlBridgeError;

/// Creates the resources a pool hands out.
#[async_trait]
pub trait ResourceFactory: Send + Sync + 'static {
    type Resource: Send + 'static;

    /// Create a new resource.
    ///
    /// The token is cancelled when the pool shuts down; long-running creations
    /// should observe it.
    ///
    /// # Errors
    ///
    /// Any error here shuts the whole pool down.
    async fn create(&self, cancel: CancellationToken) -> Result<Self::Resource, SqlBridgeError>;

    /// Whether the resource may still be handed out. Dead resources are dropped
    /// on release and skipped on checkout.
    fn is_alive(&self, _resource: &Self::Resource) -> bool {
        true
    }
}

/// Factory backed by an async closure.
pub struct FnFactory<F, R> {
    create: F,
    _resource: PhantomData<fn() -> R>,
}

/// Wrap a closure `(CancellationToken) -> impl Future<Output = Result<R, _>>` as a factory.
pub fn factory_fn<F, Fut, R>(create: F) -> FnFactory<F, R>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, SqlBridgeError>> + Send + 'static,
    R: Send + 'static,
{
    FnFactory {
        create,
        _resource: PhantomData,
    }
}

#[async_trait]
impl<F, Fut, R> ResourceFactory for FnFactory<F, R>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, SqlBridgeError>> + Send + 'static,
    R: Send + 'static,
{
    type Resource = R;

    async fn create(&self, cancel: CancellationToken) -> Result<R, SqlBridgeError> {
        (self.create)(cancel).await
    }
}
