use crate::client::RawMessage;
use crate::codec::{CodecSelector, Decoder, JsonCodec};
use crate::context::{ContextParts, MessageContext};
use crate::errors::{ConfigurationError, DispatchError, MessagePart};
use crate::handler::TopicHandler;
use crate::metadata::MetadataSet;
use crate::producer::ProducerFactory;
use crate::resolver::ServiceResolver;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;

/// Ambient pieces a loop hands to the erased handler for one message.
pub(crate) struct DispatchEnv {
    pub raw: RawMessage,
    pub cancel: CancellationToken,
    pub resolver: Arc<ServiceResolver>,
    pub metadata: Arc<MetadataSet>,
    pub producers: Arc<ProducerFactory>,
}

/// Object-safe face of a typed handler: decodes the raw message, builds the
/// context, runs the bound arguments.
pub(crate) trait ErasedHandler: Send + Sync {
    /// Resolves both codecs. Called once when the loop starts, before any
    /// poll, so a missing codec faults the topic instead of every message.
    fn prepare(
        &self,
        resolver: &ServiceResolver,
        metadata: &MetadataSet,
    ) -> Result<(), ConfigurationError>;

    fn handle(&self, env: DispatchEnv) -> BoxFuture<'static, Result<(), DispatchError>>;
}

fn resolve_decoder<T: DeserializeOwned + Send + Sync + 'static>(
    resolver: &ServiceResolver,
    selector: CodecSelector,
) -> Result<Arc<dyn Decoder<T>>, ConfigurationError> {
    match selector {
        CodecSelector::Json => Ok(resolver
            .decoder::<T>()
            .unwrap_or_else(|| Arc::new(JsonCodec::<T>::default()))),
        CodecSelector::Registered => {
            resolver
                .decoder::<T>()
                .ok_or(ConfigurationError::MissingCodec {
                    type_name: std::any::type_name::<T>(),
                })
        }
    }
}

pub(crate) struct TypedHandler<K, V, H, Args> {
    handler: H,
    key_decoder: OnceLock<Arc<dyn Decoder<K>>>,
    value_decoder: OnceLock<Arc<dyn Decoder<V>>>,
    _marker: PhantomData<fn() -> (K, V, Args)>,
}

impl<K, V, H, Args> TypedHandler<K, V, H, Args> {
    pub fn new(handler: H) -> Self {
        TypedHandler {
            handler,
            key_decoder: OnceLock::new(),
            value_decoder: OnceLock::new(),
            _marker: PhantomData,
        }
    }
}

impl<K, V, H, Args> TypedHandler<K, V, H, Args>
where
    K: DeserializeOwned + Send + Sync + 'static,
    V: DeserializeOwned + Send + Sync + 'static,
{
    fn key_decoder(
        &self,
        resolver: &ServiceResolver,
        selector: CodecSelector,
    ) -> Result<Arc<dyn Decoder<K>>, ConfigurationError> {
        if let Some(decoder) = self.key_decoder.get() {
            return Ok(decoder.clone());
        }
        let decoder = resolve_decoder::<K>(resolver, selector)?;
        let _ = self.key_decoder.set(decoder.clone());
        Ok(decoder)
    }

    fn value_decoder(
        &self,
        resolver: &ServiceResolver,
        selector: CodecSelector,
    ) -> Result<Arc<dyn Decoder<V>>, ConfigurationError> {
        if let Some(decoder) = self.value_decoder.get() {
            return Ok(decoder.clone());
        }
        let decoder = resolve_decoder::<V>(resolver, selector)?;
        let _ = self.value_decoder.set(decoder.clone());
        Ok(decoder)
    }
}

impl<K, V, H, Args> ErasedHandler for TypedHandler<K, V, H, Args>
where
    K: DeserializeOwned + Clone + Send + Sync + 'static,
    V: DeserializeOwned + Clone + Send + Sync + 'static,
    H: TopicHandler<K, V, Args>,
    Args: 'static,
{
    fn prepare(
        &self,
        resolver: &ServiceResolver,
        metadata: &MetadataSet,
    ) -> Result<(), ConfigurationError> {
        self.key_decoder(resolver, metadata.key_codec())?;
        self.value_decoder(resolver, metadata.value_codec())?;
        Ok(())
    }

    fn handle(&self, env: DispatchEnv) -> BoxFuture<'static, Result<(), DispatchError>> {
        fn fail(err: DispatchError) -> BoxFuture<'static, Result<(), DispatchError>> {
            Box::pin(std::future::ready(Err(err)))
        }

        let key_decoder = match self.key_decoder(&env.resolver, env.metadata.key_codec()) {
            Ok(decoder) => decoder,
            Err(e) => {
                return fail(DispatchError::Handler {
                    reason: e.to_string(),
                });
            }
        };
        let value_decoder = match self.value_decoder(&env.resolver, env.metadata.value_codec()) {
            Ok(decoder) => decoder,
            Err(e) => {
                return fail(DispatchError::Handler {
                    reason: e.to_string(),
                });
            }
        };

        let key = match key_decoder.decode(env.raw.key.as_deref()) {
            Ok(key) => key,
            Err(e) => {
                return fail(DispatchError::Decode {
                    part: MessagePart::Key,
                    reason: e.reason,
                });
            }
        };
        let value = match value_decoder.decode(env.raw.payload.as_deref()) {
            Ok(value) => value,
            Err(e) => {
                return fail(DispatchError::Decode {
                    part: MessagePart::Value,
                    reason: e.reason,
                });
            }
        };

        let DispatchEnv {
            raw,
            cancel,
            resolver,
            metadata,
            producers,
        } = env;
        let ctx = MessageContext::new(
            ContextParts {
                topic: raw.topic,
                partition: raw.partition,
                offset: raw.offset,
                timestamp: raw.timestamp,
                raw_key: raw.key,
                raw_payload: raw.payload,
                headers: raw.headers,
                cancel,
                resolver,
                metadata,
                producers,
            },
            key,
            value,
        );
        self.handler.invoke(ctx)
    }
}

/// One declared topic handler with its effective configuration, frozen when
/// the data source is built.
pub struct TopicRegistration {
    topic: String,
    handler: Arc<dyn ErasedHandler>,
    metadata: Arc<MetadataSet>,
}

impl std::fmt::Debug for TopicRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicRegistration")
            .field("topic", &self.topic)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

impl TopicRegistration {
    pub(crate) fn new(
        topic: impl Into<String>,
        handler: Arc<dyn ErasedHandler>,
        metadata: MetadataSet,
    ) -> Result<Self, ConfigurationError> {
        let topic = topic.into();
        if topic.is_empty() {
            return Err(ConfigurationError::EmptyTopic);
        }
        Ok(TopicRegistration {
            topic,
            handler,
            metadata: Arc::new(metadata),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn metadata(&self) -> &MetadataSet {
        &self.metadata
    }

    pub(crate) fn metadata_arc(&self) -> Arc<MetadataSet> {
        self.metadata.clone()
    }

    pub(crate) fn handler(&self) -> &Arc<dyn ErasedHandler> {
        &self.handler
    }
}

/// Root the runtime enumerates at startup: every registration plus the
/// shared resolver. Topic names need not be unique; each registration gets
/// its own loop.
pub struct DataSource {
    registrations: Vec<Arc<TopicRegistration>>,
    resolver: Arc<ServiceResolver>,
}

impl DataSource {
    pub(crate) fn new(
        registrations: Vec<Arc<TopicRegistration>>,
        resolver: Arc<ServiceResolver>,
    ) -> Self {
        DataSource {
            registrations,
            resolver,
        }
    }

    pub fn registrations(&self) -> &[Arc<TopicRegistration>] {
        &self.registrations
    }

    pub fn resolver(&self) -> &Arc<ServiceResolver> {
        &self.resolver
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::{ScriptedFactory, raw_json};
    use crate::handler::{Key, Value};
    use crate::metadata::Metadata;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn env(raw: RawMessage, metadata: MetadataSet) -> DispatchEnv {
        DispatchEnv {
            raw,
            cancel: CancellationToken::new(),
            resolver: Arc::new(ServiceResolver::new()),
            metadata: Arc::new(metadata),
            producers: Arc::new(ProducerFactory::new(Arc::new(ScriptedFactory::new()))),
        }
    }

    #[test]
    fn empty_topic_is_a_configuration_error() {
        let handler = |Value(_): Value<u64>| async {};
        let erased: Arc<dyn ErasedHandler> =
            Arc::new(TypedHandler::<String, u64, _, _>::new(handler));

        let err = TopicRegistration::new("", erased, MetadataSet::new()).unwrap_err();
        assert!(matches!(err, ConfigurationError::EmptyTopic));
    }

    #[test]
    fn registered_selector_requires_a_resolver_codec() {
        let handler = |Value(_): Value<u64>| async {};
        let typed = TypedHandler::<String, u64, _, _>::new(handler);

        let mut metadata = MetadataSet::new();
        metadata.set(Metadata::ValueCodec(CodecSelector::Registered));

        let err = typed
            .prepare(&ServiceResolver::new(), &metadata)
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::MissingCodec { .. }));
    }

    #[tokio::test]
    async fn handle_decodes_and_invokes() {
        let calls = Arc::new(AtomicU64::new(0));
        let calls_in_handler = calls.clone();
        let handler = move |Key(key): Key<String>, Value(value): Value<String>| {
            let calls = calls_in_handler.clone();
            async move {
                assert_eq!(key, "k1");
                assert_eq!(value, "v1");
                calls.fetch_add(1, Ordering::SeqCst);
            }
        };
        let typed = TypedHandler::<String, String, _, _>::new(handler);

        typed
            .handle(env(raw_json("orders", 0, 3, "k1", "v1"), MetadataSet::new()))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn malformed_value_is_a_decode_error() {
        let handler = |Value(_): Value<u64>| async {};
        let typed = TypedHandler::<Option<String>, u64, _, _>::new(handler);

        let raw = RawMessage {
            topic: "orders".to_string(),
            partition: 0,
            offset: 0,
            timestamp: None,
            key: None,
            payload: Some(b"{broken".to_vec()),
            headers: HashMap::new(),
        };
        let err = typed.handle(env(raw, MetadataSet::new())).await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Decode {
                part: MessagePart::Value,
                ..
            }
        ));
    }
}
