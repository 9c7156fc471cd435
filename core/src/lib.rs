pub mod builder;
pub mod client;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod context;
pub mod errors;
pub mod handler;
pub mod metadata;
pub mod producer;
pub mod registration;
pub mod resolver;
pub mod runtime;
pub mod telemetry;

pub use builder::{ConventionBuilder, KafkaBuilder, TopicConventions};
pub use client::{ClientFactory, DeliveryAck, KafkaClientFactory};
pub use codec::{CodecSelector, Decoder, Encoder, JsonCodec};
pub use config::{RouterOptions, TopicOptions};
pub use consumer::{LoopOutcome, LoopSummary};
pub use context::MessageContext;
pub use errors::{
    ConfigurationError, ConnectionError, DispatchError, Result, RouterError, ShutdownError,
};
pub use handler::{FromContext, Key, Service, TopicHandler, Value};
pub use metadata::{DecodeFailurePolicy, Metadata, MetadataSet, OffsetReset};
pub use resolver::ServiceResolver;
pub use runtime::KafkaRouter;
pub use telemetry::{LoopMetrics, MetricsSnapshot, init_tracing};
