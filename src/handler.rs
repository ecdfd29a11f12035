use crate::Message;
use std::future::Future;

/// Implementers of the `Handler` trait process the messages pulled from the queue by
/// [`Client::consume`](crate::Client::consume).
///
/// `handle` does not return an error: deliveries are auto-acknowledged, so the broker
/// has already forgotten about the message by the time `handle` runs.
///
/// While you can implement `Handler` for a struct or enum, most of the time you will be
/// relying on the implementation for async closures with a matching signature -
/// `Fn(Message<P>) -> Fut`.
#[async_trait::async_trait]
pub trait Handler<P>: Send + Sync + 'static {
    async fn handle(&self, message: Message<P>);
}

#[async_trait::async_trait]
impl<P, F, Fut> Handler<P> for F
where
    P: Send + 'static,
    F: Fn(Message<P>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, message: Message<P>) {
        (self)(message).await
    }
}
