use crate::errors::{ConnectionError, DispatchError, ShutdownError};
use crate::metadata::OffsetReset;
use futures::future::BoxFuture;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{ClientConfig, TopicPartitionList};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};

/// Effective consumer configuration for one topic loop, lowered from the
/// registration's merged metadata.
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub topic: String,
    pub group_id: String,
    pub bootstrap_servers: String,
    pub offset_reset: OffsetReset,
    pub properties: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProducerSettings {
    pub bootstrap_servers: String,
    pub properties: Vec<(String, String)>,
}

impl ProducerSettings {
    /// Cache key for produce-client reuse: same servers + same properties
    /// means the same client works.
    pub fn cache_key(&self) -> String {
        let mut props = self.properties.clone();
        props.sort();
        let mut key = self.bootstrap_servers.clone();
        for (k, v) in props {
            key.push('\u{1f}');
            key.push_str(&k);
            key.push('=');
            key.push_str(&v);
        }
        key
    }
}

/// One consumed message, undecoded.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub timestamp: Option<i64>,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    pub headers: HashMap<String, Vec<u8>>,
}

#[derive(Debug, Clone, Default)]
pub struct OutboundRecord {
    pub topic: String,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    pub headers: HashMap<String, Vec<u8>>,
}

/// Broker acknowledgment for one produced message. `timestamp` is `None`
/// when the client does not report one.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryAck {
    pub partition: i32,
    pub offset: i64,
    pub timestamp: Option<i64>,
}

/// The consuming side of the opaque broker client. Each topic loop owns
/// exactly one; no instance is shared across loops.
pub trait ConsumeClient: Send + Sync {
    /// Waits for the next message. `Ok(None)` means the timeout elapsed
    /// without one.
    fn poll(&self, timeout: Duration) -> BoxFuture<'_, Result<Option<RawMessage>, ConnectionError>>;

    /// Marks the message at `offset` consumed; the next delivery for the
    /// partition starts at `offset + 1`.
    fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<(), DispatchError>;

    fn unsubscribe(&self) -> Result<(), ShutdownError>;
}

pub trait ProduceClient: Send + Sync {
    fn send(&self, record: OutboundRecord) -> BoxFuture<'_, Result<DeliveryAck, DispatchError>>;
}

/// Builds clients from resolved settings. The runtime takes this as a
/// collaborator so loops can run against in-process clients in tests.
pub trait ClientFactory: Send + Sync {
    fn consumer(
        &self,
        settings: &ConsumerSettings,
    ) -> Result<Arc<dyn ConsumeClient>, ConnectionError>;

    fn producer(
        &self,
        settings: &ProducerSettings,
    ) -> Result<Arc<dyn ProduceClient>, ConnectionError>;
}

/// rdkafka-backed factory, the production default.
#[derive(Debug, Default, Clone)]
pub struct KafkaClientFactory;

impl ClientFactory for KafkaClientFactory {
    fn consumer(
        &self,
        settings: &ConsumerSettings,
    ) -> Result<Arc<dyn ConsumeClient>, ConnectionError> {
        let mut client_config = ClientConfig::new();

        client_config
            .set("bootstrap.servers", &settings.bootstrap_servers)
            .set("group.id", &settings.group_id)
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", settings.offset_reset.as_client_value());

        for (key, value) in &settings.properties {
            client_config.set(key, value);
        }

        let consumer: StreamConsumer =
            client_config
                .create()
                .map_err(|e| ConnectionError::ClientCreation {
                    reason: e.to_string(),
                })?;

        consumer
            .subscribe(&[settings.topic.as_str()])
            .map_err(|e| ConnectionError::Subscription {
                topic: settings.topic.clone(),
                reason: e.to_string(),
            })?;

        info!("Subscribed to Kafka topic: {}", settings.topic);
        Ok(Arc::new(KafkaConsumeClient { consumer }))
    }

    fn producer(
        &self,
        settings: &ProducerSettings,
    ) -> Result<Arc<dyn ProduceClient>, ConnectionError> {
        let mut client_config = ClientConfig::new();

        client_config
            .set("bootstrap.servers", &settings.bootstrap_servers)
            .set("message.timeout.ms", "5000");

        for (key, value) in &settings.properties {
            client_config.set(key, value);
        }

        let producer: FutureProducer =
            client_config
                .create()
                .map_err(|e| ConnectionError::ClientCreation {
                    reason: e.to_string(),
                })?;

        Ok(Arc::new(KafkaProduceClient { producer }))
    }
}

struct KafkaConsumeClient {
    consumer: StreamConsumer,
}

impl ConsumeClient for KafkaConsumeClient {
    fn poll(
        &self,
        poll_timeout: Duration,
    ) -> BoxFuture<'_, Result<Option<RawMessage>, ConnectionError>> {
        Box::pin(async move {
            match timeout(poll_timeout, self.consumer.recv()).await {
                Ok(Ok(message)) => {
                    debug!(
                        "Received message from partition {} offset {}",
                        message.partition(),
                        message.offset()
                    );
                    Ok(Some(convert_message(&message)))
                }
                Ok(Err(e)) => Err(ConnectionError::Receive {
                    reason: e.to_string(),
                }),
                Err(_) => Ok(None),
            }
        })
    }

    fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<(), DispatchError> {
        let commit_err = |reason: String| DispatchError::Commit {
            topic: topic.to_string(),
            partition,
            offset,
            reason,
        };

        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(topic, partition, rdkafka::Offset::Offset(offset + 1))
            .map_err(|e| commit_err(e.to_string()))?;

        self.consumer
            .commit(&tpl, CommitMode::Sync)
            .map_err(|e| commit_err(e.to_string()))?;

        debug!(
            "Committed offset {} for partition {}",
            offset + 1,
            partition
        );
        Ok(())
    }

    fn unsubscribe(&self) -> Result<(), ShutdownError> {
        self.consumer.unsubscribe();
        Ok(())
    }
}

fn convert_message(message: &rdkafka::message::BorrowedMessage) -> RawMessage {
    let mut headers = HashMap::new();
    if let Some(header_map) = message.headers() {
        for header in header_map.iter() {
            if let Some(value) = header.value {
                headers.insert(header.key.to_string(), value.to_vec());
            }
        }
    }

    RawMessage {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        timestamp: message.timestamp().to_millis(),
        key: message.key().map(|k| k.to_vec()),
        payload: message.payload().map(|p| p.to_vec()),
        headers,
    }
}

struct KafkaProduceClient {
    producer: FutureProducer,
}

impl ProduceClient for KafkaProduceClient {
    fn send(&self, record: OutboundRecord) -> BoxFuture<'_, Result<DeliveryAck, DispatchError>> {
        Box::pin(async move {
            let mut future_record = FutureRecord::<[u8], [u8]>::to(&record.topic);

            if let Some(key) = record.key.as_deref() {
                future_record = future_record.key(key);
            }
            if let Some(payload) = record.payload.as_deref() {
                future_record = future_record.payload(payload);
            }
            if !record.headers.is_empty() {
                let mut owned = OwnedHeaders::new();
                for (key, value) in &record.headers {
                    owned = owned.insert(Header {
                        key,
                        value: Some(value.as_slice()),
                    });
                }
                future_record = future_record.headers(owned);
            }

            let (partition, offset) = self
                .producer
                .send(future_record, Duration::from_secs(5))
                .await
                .map_err(|(e, _)| DispatchError::Produce {
                    topic: record.topic.clone(),
                    reason: e.to_string(),
                })?;

            Ok(DeliveryAck {
                partition,
                offset,
                timestamp: None,
            })
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    pub(crate) fn raw_json(
        topic: &str,
        partition: i32,
        offset: i64,
        key: &str,
        value: &str,
    ) -> RawMessage {
        RawMessage {
            topic: topic.to_string(),
            partition,
            offset,
            timestamp: Some(offset),
            key: Some(serde_json::to_vec(key).unwrap()),
            payload: Some(serde_json::to_vec(value).unwrap()),
            headers: HashMap::new(),
        }
    }

    /// In-process consume client fed from a queue the test controls.
    pub(crate) struct ScriptedClient {
        queue: Mutex<VecDeque<RawMessage>>,
        pub commits: Mutex<Vec<(String, i32, i64)>>,
        pub unsubscribed: AtomicBool,
    }

    impl ScriptedClient {
        pub fn new() -> Self {
            ScriptedClient {
                queue: Mutex::new(VecDeque::new()),
                commits: Mutex::new(Vec::new()),
                unsubscribed: AtomicBool::new(false),
            }
        }

        pub fn push(&self, message: RawMessage) {
            self.queue.lock().unwrap().push_back(message);
        }

        pub fn commit_count(&self) -> usize {
            self.commits.lock().unwrap().len()
        }

        pub fn queued(&self) -> usize {
            self.queue.lock().unwrap().len()
        }
    }

    impl ConsumeClient for ScriptedClient {
        fn poll(
            &self,
            poll_timeout: Duration,
        ) -> BoxFuture<'_, Result<Option<RawMessage>, ConnectionError>> {
            Box::pin(async move {
                if let Some(message) = self.queue.lock().unwrap().pop_front() {
                    return Ok(Some(message));
                }
                tokio::time::sleep(poll_timeout.min(Duration::from_millis(5))).await;
                Ok(None)
            })
        }

        fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<(), DispatchError> {
            self.commits
                .lock()
                .unwrap()
                .push((topic.to_string(), partition, offset));
            Ok(())
        }

        fn unsubscribe(&self) -> Result<(), ShutdownError> {
            self.unsubscribed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    pub(crate) struct RecordingProducer {
        pub sent: Mutex<Vec<OutboundRecord>>,
    }

    impl RecordingProducer {
        pub fn new() -> Self {
            RecordingProducer {
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    impl ProduceClient for RecordingProducer {
        fn send(&self, record: OutboundRecord) -> BoxFuture<'_, Result<DeliveryAck, DispatchError>> {
            Box::pin(async move {
                let mut sent = self.sent.lock().unwrap();
                sent.push(record);
                Ok(DeliveryAck {
                    partition: 0,
                    offset: sent.len() as i64 - 1,
                    timestamp: Some(42),
                })
            })
        }
    }

    /// Factory handing out one scripted client per topic, with optional
    /// injected construction failures.
    pub(crate) struct ScriptedFactory {
        clients: Mutex<HashMap<String, Arc<ScriptedClient>>>,
        pub producer: Arc<RecordingProducer>,
        pub producers_built: AtomicUsize,
        consumer_failures: Mutex<HashMap<String, u32>>,
    }

    impl ScriptedFactory {
        pub fn new() -> Self {
            ScriptedFactory {
                clients: Mutex::new(HashMap::new()),
                producer: Arc::new(RecordingProducer::new()),
                producers_built: AtomicUsize::new(0),
                consumer_failures: Mutex::new(HashMap::new()),
            }
        }

        pub fn client(&self, topic: &str) -> Arc<ScriptedClient> {
            self.clients
                .lock()
                .unwrap()
                .entry(topic.to_string())
                .or_insert_with(|| Arc::new(ScriptedClient::new()))
                .clone()
        }

        /// The next `times` consumer builds for `topic` fail.
        pub fn fail_consumer(&self, topic: &str, times: u32) {
            self.consumer_failures
                .lock()
                .unwrap()
                .insert(topic.to_string(), times);
        }
    }

    impl ClientFactory for ScriptedFactory {
        fn consumer(
            &self,
            settings: &ConsumerSettings,
        ) -> Result<Arc<dyn ConsumeClient>, ConnectionError> {
            let mut failures = self.consumer_failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&settings.topic) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(ConnectionError::ClientCreation {
                        reason: format!("injected failure for {}", settings.topic),
                    });
                }
            }
            drop(failures);
            Ok(self.client(&settings.topic))
        }

        fn producer(
            &self,
            _settings: &ProducerSettings,
        ) -> Result<Arc<dyn ProduceClient>, ConnectionError> {
            self.producers_built.fetch_add(1, Ordering::SeqCst);
            Ok(self.producer.clone())
        }
    }

    #[test]
    fn cache_key_ignores_property_order() {
        let a = ProducerSettings {
            bootstrap_servers: "localhost:9092".to_string(),
            properties: vec![
                ("acks".to_string(), "all".to_string()),
                ("linger.ms".to_string(), "5".to_string()),
            ],
        };
        let b = ProducerSettings {
            bootstrap_servers: "localhost:9092".to_string(),
            properties: vec![
                ("linger.ms".to_string(), "5".to_string()),
                ("acks".to_string(), "all".to_string()),
            ],
        };
        assert_eq!(a.cache_key(), b.cache_key());

        let c = ProducerSettings {
            bootstrap_servers: "other:9092".to_string(),
            properties: vec![],
        };
        assert_ne!(a.cache_key(), c.cache_key());
    }
}
