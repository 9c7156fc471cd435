use crate::client::{DeliveryAck, OutboundRecord};
use crate::codec::{Encoder, JsonCodec};
use crate::errors::DispatchError;
use crate::metadata::MetadataSet;
use crate::producer::ProducerFactory;
use crate::resolver::ServiceResolver;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything a handler can see about the message being dispatched. Created
/// per message, dropped when the handler returns; cloning is an `Arc` bump.
pub struct MessageContext<K, V> {
    inner: Arc<ContextInner<K, V>>,
}

struct ContextInner<K, V> {
    topic: String,
    partition: i32,
    offset: i64,
    timestamp: Option<i64>,
    raw_key: Option<Vec<u8>>,
    raw_payload: Option<Vec<u8>>,
    headers: HashMap<String, Vec<u8>>,
    key: K,
    value: V,
    cancel: CancellationToken,
    resolver: Arc<ServiceResolver>,
    metadata: Arc<MetadataSet>,
    producers: Arc<ProducerFactory>,
}

impl<K, V> Clone for MessageContext<K, V> {
    fn clone(&self) -> Self {
        MessageContext {
            inner: self.inner.clone(),
        }
    }
}

pub(crate) struct ContextParts {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub timestamp: Option<i64>,
    pub raw_key: Option<Vec<u8>>,
    pub raw_payload: Option<Vec<u8>>,
    pub headers: HashMap<String, Vec<u8>>,
    pub cancel: CancellationToken,
    pub resolver: Arc<ServiceResolver>,
    pub metadata: Arc<MetadataSet>,
    pub producers: Arc<ProducerFactory>,
}

impl<K, V> MessageContext<K, V> {
    pub(crate) fn new(parts: ContextParts, key: K, value: V) -> Self {
        MessageContext {
            inner: Arc::new(ContextInner {
                topic: parts.topic,
                partition: parts.partition,
                offset: parts.offset,
                timestamp: parts.timestamp,
                raw_key: parts.raw_key,
                raw_payload: parts.raw_payload,
                headers: parts.headers,
                key,
                value,
                cancel: parts.cancel,
                resolver: parts.resolver,
                metadata: parts.metadata,
                producers: parts.producers,
            }),
        }
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn partition(&self) -> i32 {
        self.inner.partition
    }

    pub fn offset(&self) -> i64 {
        self.inner.offset
    }

    pub fn timestamp(&self) -> Option<i64> {
        self.inner.timestamp
    }

    pub fn key(&self) -> &K {
        &self.inner.key
    }

    pub fn value(&self) -> &V {
        &self.inner.value
    }

    pub fn raw_key(&self) -> Option<&[u8]> {
        self.inner.raw_key.as_deref()
    }

    pub fn raw_payload(&self) -> Option<&[u8]> {
        self.inner.raw_payload.as_deref()
    }

    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.inner.headers.get(name).map(|v| v.as_slice())
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    pub fn resolver(&self) -> &ServiceResolver {
        &self.inner.resolver
    }

    /// The registration's effective metadata, as merged at configuration
    /// time.
    pub fn metadata(&self) -> &MetadataSet {
        &self.inner.metadata
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.inner.metadata.user_tag(key)
    }

    /// Produces one message using the ambient metadata of this context. The
    /// produce client is drawn from the runtime's keyed cache, so repeated
    /// sends with the same effective settings reuse one client.
    pub async fn send<K2, V2>(
        &self,
        topic: &str,
        key: &K2,
        value: &V2,
    ) -> Result<DeliveryAck, DispatchError>
    where
        K2: Serialize + Send + Sync + 'static,
        V2: Serialize + Send + Sync + 'static,
    {
        let settings =
            self.inner
                .metadata
                .producer_settings(topic)
                .map_err(|e| DispatchError::Produce {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                })?;

        let client = self
            .inner
            .producers
            .get(&settings)
            .map_err(|e| DispatchError::Produce {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;

        let record = OutboundRecord {
            topic: topic.to_string(),
            key: Some(encode_outbound(&self.inner.resolver, topic, key)?),
            payload: Some(encode_outbound(&self.inner.resolver, topic, value)?),
            headers: HashMap::new(),
        };

        client.send(record).await
    }
}

fn encode_outbound<T: Serialize + Send + Sync + 'static>(
    resolver: &ServiceResolver,
    topic: &str,
    value: &T,
) -> Result<Vec<u8>, DispatchError> {
    let encoded = match resolver.encoder::<T>() {
        Some(encoder) => encoder.encode(value),
        None => JsonCodec::<T>::default().encode(value),
    };
    encoded.map_err(|e| DispatchError::Produce {
        topic: topic.to_string(),
        reason: e.reason,
    })
}
