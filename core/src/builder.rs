use crate::client::{ClientFactory, KafkaClientFactory};
use crate::codec::{CodecSelector, Decoder, Encoder};
use crate::config::{RouterOptions, TopicOptions};
use crate::errors::ConfigurationError;
use crate::handler::TopicHandler;
use crate::metadata::{DecodeFailurePolicy, Metadata, MetadataSet, OffsetReset};
use crate::registration::{DataSource, ErasedHandler, TopicRegistration, TypedHandler};
use crate::resolver::ServiceResolver;
use crate::runtime::KafkaRouter;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Shared convention surface: the same `with_*` calls work at the global
/// scope and on a single topic's overrides.
pub trait ConventionBuilder: Sized {
    fn metadata_mut(&mut self) -> &mut MetadataSet;

    /// Appends without replacing. Non-singleton facets accumulate.
    fn with_metadata(mut self, item: Metadata) -> Self {
        self.metadata_mut().push(item);
        self
    }

    /// Replace-by-kind append for singleton facets.
    fn with_single(mut self, item: Metadata) -> Self {
        self.metadata_mut().set(item);
        self
    }

    fn with_group_id(self, group_id: impl Into<String>) -> Self {
        self.with_single(Metadata::GroupId(group_id.into()))
    }

    fn with_bootstrap_servers(self, servers: impl Into<String>) -> Self {
        self.with_single(Metadata::BootstrapServers(servers.into()))
    }

    fn with_offset_reset(self, reset: OffsetReset) -> Self {
        self.with_single(Metadata::OffsetReset(reset))
    }

    fn with_report_interval(self, interval: Duration) -> Self {
        self.with_single(Metadata::ReportInterval(interval))
    }

    fn with_key_codec(self, selector: CodecSelector) -> Self {
        self.with_single(Metadata::KeyCodec(selector))
    }

    fn with_value_codec(self, selector: CodecSelector) -> Self {
        self.with_single(Metadata::ValueCodec(selector))
    }

    fn with_decode_failure(self, policy: DecodeFailurePolicy) -> Self {
        self.with_single(Metadata::DecodeFailure(policy))
    }

    fn with_client_property(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.with_single(Metadata::ClientProperty {
            key: key.into(),
            value: value.into(),
        })
    }

    fn with_tag(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.with_metadata(Metadata::UserTag {
            key: key.into(),
            value: value.into(),
        })
    }
}

struct PendingRegistration {
    topic: String,
    handler: Arc<dyn ErasedHandler>,
    /// Global metadata as it stood at `map_topic` time, plus any matching
    /// options-file fragment. A copy: later global changes never reach an
    /// already-registered topic.
    snapshot: MetadataSet,
    overrides: MetadataSet,
}

/// Entry point for declaring topics. Configuration is threaded through this
/// value and frozen by `build`; nothing is registered globally.
#[derive(Default)]
pub struct KafkaBuilder {
    global: MetadataSet,
    resolver: ServiceResolver,
    pending: Vec<PendingRegistration>,
    topic_options: BTreeMap<String, TopicOptions>,
}

impl KafkaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies loaded options: defaults onto the global scope now, per-topic
    /// fragments when the matching topic is mapped.
    pub fn with_options(mut self, options: RouterOptions) -> Self {
        options.defaults.apply(&mut self.global);
        self.topic_options.extend(options.topics);
        self
    }

    pub fn register_service<T: Send + Sync + 'static>(mut self, service: T) -> Self {
        self.resolver.register(service);
        self
    }

    pub fn register_decoder<T: 'static>(mut self, decoder: Arc<dyn Decoder<T>>) -> Self {
        self.resolver.register_decoder(decoder);
        self
    }

    pub fn register_encoder<T: 'static>(mut self, encoder: Arc<dyn Encoder<T>>) -> Self {
        self.resolver.register_encoder(encoder);
        self
    }

    /// Declares a handler for `topic`. The returned conventions apply only
    /// to this registration and win over the global defaults captured in
    /// the snapshot.
    pub fn map_topic<K, V, Args, H>(
        &mut self,
        topic: &str,
        handler: H,
    ) -> Result<TopicConventions<'_>, ConfigurationError>
    where
        K: DeserializeOwned + Clone + Send + Sync + 'static,
        V: DeserializeOwned + Clone + Send + Sync + 'static,
        H: TopicHandler<K, V, Args>,
        Args: 'static,
    {
        if topic.is_empty() {
            return Err(ConfigurationError::EmptyTopic);
        }

        let mut snapshot = self.global.clone();
        if let Some(fragment) = self.topic_options.get(topic) {
            fragment.apply(&mut snapshot);
        }

        self.pending.push(PendingRegistration {
            topic: topic.to_string(),
            handler: Arc::new(TypedHandler::<K, V, H, Args>::new(handler)),
            snapshot,
            overrides: MetadataSet::new(),
        });

        let overrides = &mut self
            .pending
            .last_mut()
            .expect("registration just pushed")
            .overrides;
        Ok(TopicConventions { metadata: overrides })
    }

    pub fn build(self) -> Result<KafkaRouter, ConfigurationError> {
        self.build_with_factory(Arc::new(KafkaClientFactory))
    }

    /// Builds against a caller-supplied client factory. The runtime itself
    /// only ever sees the factory traits.
    pub fn build_with_factory(
        self,
        factory: Arc<dyn ClientFactory>,
    ) -> Result<KafkaRouter, ConfigurationError> {
        let resolver = Arc::new(self.resolver);
        let mut registrations = Vec::with_capacity(self.pending.len());
        for pending in self.pending {
            let merged = MetadataSet::merge(&pending.snapshot, &pending.overrides);
            registrations.push(Arc::new(TopicRegistration::new(
                pending.topic,
                pending.handler,
                merged,
            )?));
        }
        Ok(KafkaRouter::new(
            DataSource::new(registrations, resolver),
            factory,
        ))
    }
}

impl ConventionBuilder for KafkaBuilder {
    fn metadata_mut(&mut self) -> &mut MetadataSet {
        &mut self.global
    }
}

/// Per-topic override scope returned by `map_topic`.
pub struct TopicConventions<'a> {
    metadata: &'a mut MetadataSet,
}

impl ConventionBuilder for TopicConventions<'_> {
    fn metadata_mut(&mut self) -> &mut MetadataSet {
        self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Value;

    async fn noop(Value(_): Value<u64>) {}

    #[test]
    fn per_topic_overrides_win_over_globals() {
        let mut builder = KafkaBuilder::new()
            .with_group_id("g1")
            .with_bootstrap_servers("localhost:9092")
            .with_report_interval(Duration::from_secs(5));

        builder
            .map_topic::<String, u64, _, _>("orders", noop)
            .unwrap()
            .with_report_interval(Duration::from_secs(1));

        let router = builder.build().unwrap();
        let registration = &router.data_source().registrations()[0];
        assert_eq!(
            registration.metadata().report_interval(),
            Some(Duration::from_secs(1))
        );
        assert_eq!(registration.metadata().group_id(), Some("g1"));
    }

    #[test]
    fn registrations_snapshot_globals_by_copy() {
        let mut builder = KafkaBuilder::new().with_group_id("early");
        builder
            .map_topic::<String, u64, _, _>("orders", noop)
            .unwrap();

        let mut builder = builder.with_group_id("late");
        builder
            .map_topic::<String, u64, _, _>("audit", noop)
            .unwrap();

        let router = builder.build().unwrap();
        let registrations = router.data_source().registrations();
        assert_eq!(registrations[0].metadata().group_id(), Some("early"));
        assert_eq!(registrations[1].metadata().group_id(), Some("late"));
    }

    #[test]
    fn empty_topic_is_rejected_at_registration() {
        let mut builder = KafkaBuilder::new();
        let err = builder
            .map_topic::<String, u64, _, _>("", noop)
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::EmptyTopic));
    }

    #[test]
    fn duplicate_topic_registrations_are_allowed() {
        let mut builder = KafkaBuilder::new().with_group_id("g1");
        builder
            .map_topic::<String, u64, _, _>("orders", noop)
            .unwrap();
        builder
            .map_topic::<String, u64, _, _>("orders", noop)
            .unwrap();

        let router = builder.build().unwrap();
        assert_eq!(router.data_source().registrations().len(), 2);
    }

    #[test]
    fn options_fragments_apply_between_globals_and_overrides() {
        let options: RouterOptions = serde_yaml::from_str(
            r#"
defaults:
  group_id: "file-default"
topics:
  orders:
    report_interval_secs: 5
"#,
        )
        .unwrap();

        let mut builder = KafkaBuilder::new().with_options(options);
        builder
            .map_topic::<String, u64, _, _>("orders", noop)
            .unwrap()
            .with_report_interval(Duration::from_secs(1));

        let router = builder.build().unwrap();
        let metadata = router.data_source().registrations()[0].metadata();
        assert_eq!(metadata.group_id(), Some("file-default"));
        assert_eq!(metadata.report_interval(), Some(Duration::from_secs(1)));
    }
}
