use crate::context::MessageContext;
use crate::errors::DispatchError;
use futures::future::BoxFuture;
use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A value a handler parameter can be bound from. The set of
/// implementations is closed: key, value, cancellation signal, the whole
/// context, or a resolver-provided service. Binding strategy selection
/// happens once, at registration, through trait resolution; dispatch only
/// runs the chosen binders.
pub trait FromContext<K, V>: Sized {
    fn from_context(ctx: &MessageContext<K, V>) -> Result<Self, DispatchError>;
}

/// The deserialized message key.
pub struct Key<K>(pub K);

/// The deserialized message value.
pub struct Value<V>(pub V);

/// A dependency resolved from the service resolver at dispatch time. This
/// is the one binder whose failure can only surface per message.
pub struct Service<T>(pub Arc<T>);

impl<T> Deref for Service<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<K: Clone, V> FromContext<K, V> for Key<K> {
    fn from_context(ctx: &MessageContext<K, V>) -> Result<Self, DispatchError> {
        Ok(Key(ctx.key().clone()))
    }
}

impl<K, V: Clone> FromContext<K, V> for Value<V> {
    fn from_context(ctx: &MessageContext<K, V>) -> Result<Self, DispatchError> {
        Ok(Value(ctx.value().clone()))
    }
}

impl<K, V> FromContext<K, V> for CancellationToken {
    fn from_context(ctx: &MessageContext<K, V>) -> Result<Self, DispatchError> {
        Ok(ctx.cancellation().clone())
    }
}

impl<K, V> FromContext<K, V> for MessageContext<K, V> {
    fn from_context(ctx: &MessageContext<K, V>) -> Result<Self, DispatchError> {
        Ok(ctx.clone())
    }
}

impl<T: Send + Sync + 'static, K, V> FromContext<K, V> for Service<T> {
    fn from_context(ctx: &MessageContext<K, V>) -> Result<Self, DispatchError> {
        ctx.resolver()
            .get::<T>()
            .map(Service)
            .ok_or(DispatchError::UnresolvedService {
                type_name: std::any::type_name::<T>(),
            })
    }
}

/// Normalizes handler return types: handlers may return nothing or a
/// `Result` whose error becomes a per-message dispatch failure.
pub trait IntoHandlerResult {
    fn into_handler_result(self) -> Result<(), DispatchError>;
}

impl IntoHandlerResult for () {
    fn into_handler_result(self) -> Result<(), DispatchError> {
        Ok(())
    }
}

impl<E: std::fmt::Display> IntoHandlerResult for Result<(), E> {
    fn into_handler_result(self) -> Result<(), DispatchError> {
        self.map_err(|e| DispatchError::Handler {
            reason: e.to_string(),
        })
    }
}

/// An async callable whose parameters are all bindable from a message
/// context. `Args` is the parameter tuple; it only disambiguates the blanket
/// impls below.
pub trait TopicHandler<K, V, Args>: Send + Sync + 'static {
    fn invoke(&self, ctx: MessageContext<K, V>) -> BoxFuture<'static, Result<(), DispatchError>>;
}

macro_rules! impl_topic_handler {
    ($($arg:ident),*) => {
        #[allow(non_snake_case, unused_variables)]
        impl<K, V, F, Fut, R, $($arg),*> TopicHandler<K, V, ($($arg,)*)> for F
        where
            K: Send + Sync + 'static,
            V: Send + Sync + 'static,
            F: Fn($($arg),*) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = R> + Send + 'static,
            R: IntoHandlerResult,
            $($arg: FromContext<K, V> + Send + 'static,)*
        {
            fn invoke(
                &self,
                ctx: MessageContext<K, V>,
            ) -> BoxFuture<'static, Result<(), DispatchError>> {
                $(
                    let $arg = match $arg::from_context(&ctx) {
                        Ok(arg) => arg,
                        Err(e) => return Box::pin(std::future::ready(Err(e))),
                    };
                )*
                let fut = (self)($($arg),*);
                Box::pin(async move { fut.await.into_handler_result() })
            }
        }
    };
}

impl_topic_handler!();
impl_topic_handler!(A1);
impl_topic_handler!(A1, A2);
impl_topic_handler!(A1, A2, A3);
impl_topic_handler!(A1, A2, A3, A4);
impl_topic_handler!(A1, A2, A3, A4, A5);
