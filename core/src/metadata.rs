use crate::client::{ConsumerSettings, ProducerSettings};
use crate::codec::CodecSelector;
use crate::errors::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One configuration facet. Items are immutable once constructed; two items
/// of the same kind are interchangeable for override purposes.
#[derive(Debug, Clone, PartialEq)]
pub enum Metadata {
    GroupId(String),
    BootstrapServers(String),
    OffsetReset(OffsetReset),
    ReportInterval(Duration),
    KeyCodec(CodecSelector),
    ValueCodec(CodecSelector),
    DecodeFailure(DecodeFailurePolicy),
    /// Raw client property passed through to the underlying client untouched.
    ClientProperty { key: String, value: String },
    /// Free-form annotation, ignored by the runtime, readable by handlers.
    UserTag { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MetadataKind {
    GroupId,
    BootstrapServers,
    OffsetReset,
    ReportInterval,
    KeyCodec,
    ValueCodec,
    DecodeFailure,
    /// Singleton per property key, not per facet.
    ClientProperty(String),
    UserTag,
}

impl Metadata {
    pub fn kind(&self) -> MetadataKind {
        match self {
            Metadata::GroupId(_) => MetadataKind::GroupId,
            Metadata::BootstrapServers(_) => MetadataKind::BootstrapServers,
            Metadata::OffsetReset(_) => MetadataKind::OffsetReset,
            Metadata::ReportInterval(_) => MetadataKind::ReportInterval,
            Metadata::KeyCodec(_) => MetadataKind::KeyCodec,
            Metadata::ValueCodec(_) => MetadataKind::ValueCodec,
            Metadata::DecodeFailure(_) => MetadataKind::DecodeFailure,
            Metadata::ClientProperty { key, .. } => MetadataKind::ClientProperty(key.clone()),
            Metadata::UserTag { .. } => MetadataKind::UserTag,
        }
    }

    pub fn is_singleton(&self) -> bool {
        !matches!(self, Metadata::UserTag { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    Earliest,
    Latest,
    Error,
}

impl OffsetReset {
    pub fn as_client_value(&self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
            OffsetReset::Error => "error",
        }
    }
}

/// What a loop does with a message whose key or value fails to decode.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeFailurePolicy {
    /// Commit and continue. The default: a poison message never stalls the
    /// partition.
    Skip,
    /// Leave the offset uncommitted. The message is redelivered after a
    /// restart of the loop.
    Hold,
    /// Forward the raw message to the named topic, then commit.
    DeadLetter(String),
}

/// Ordered collection of metadata items. Insertion order is preserved for
/// deterministic iteration; every lookup is last-occurrence-wins per kind,
/// so appending child items after parent items is all `merge` needs for
/// override semantics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataSet {
    items: Vec<Metadata>,
}

impl MetadataSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends without touching existing items.
    pub fn push(&mut self, item: Metadata) {
        self.items.push(item);
    }

    /// Replace-by-kind: removes every existing item of the same kind, then
    /// appends. For non-singleton kinds this is a plain append.
    pub fn set(&mut self, item: Metadata) {
        if item.is_singleton() {
            let kind = item.kind();
            self.items.retain(|existing| existing.kind() != kind);
        }
        self.items.push(item);
    }

    /// Parent items followed by child items. Nothing is removed; last-wins
    /// lookup makes child singleton items shadow same-kind parent items.
    pub fn merge(parent: &MetadataSet, child: &MetadataSet) -> MetadataSet {
        let mut items = Vec::with_capacity(parent.items.len() + child.items.len());
        items.extend(parent.items.iter().cloned());
        items.extend(child.items.iter().cloned());
        MetadataSet { items }
    }

    pub fn items(&self) -> &[Metadata] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn last_of<'a, T>(&'a self, pick: impl Fn(&'a Metadata) -> Option<T>) -> Option<T> {
        self.items.iter().rev().find_map(pick)
    }

    pub fn group_id(&self) -> Option<&str> {
        self.last_of(|m| match m {
            Metadata::GroupId(v) => Some(v.as_str()),
            _ => None,
        })
    }

    pub fn bootstrap_servers(&self) -> Option<&str> {
        self.last_of(|m| match m {
            Metadata::BootstrapServers(v) => Some(v.as_str()),
            _ => None,
        })
    }

    pub fn offset_reset(&self) -> Option<OffsetReset> {
        self.last_of(|m| match m {
            Metadata::OffsetReset(v) => Some(*v),
            _ => None,
        })
    }

    pub fn report_interval(&self) -> Option<Duration> {
        self.last_of(|m| match m {
            Metadata::ReportInterval(v) => Some(*v),
            _ => None,
        })
    }

    pub fn key_codec(&self) -> CodecSelector {
        self.last_of(|m| match m {
            Metadata::KeyCodec(v) => Some(*v),
            _ => None,
        })
        .unwrap_or(CodecSelector::Json)
    }

    pub fn value_codec(&self) -> CodecSelector {
        self.last_of(|m| match m {
            Metadata::ValueCodec(v) => Some(*v),
            _ => None,
        })
        .unwrap_or(CodecSelector::Json)
    }

    pub fn decode_failure(&self) -> DecodeFailurePolicy {
        self.last_of(|m| match m {
            Metadata::DecodeFailure(v) => Some(v.clone()),
            _ => None,
        })
        .unwrap_or(DecodeFailurePolicy::Skip)
    }

    /// Raw client properties, last value per key, in first-seen key order.
    pub fn client_properties(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = Vec::new();
        for item in &self.items {
            if let Metadata::ClientProperty { key, value } = item {
                match out.iter_mut().find(|(k, _)| k == key) {
                    Some(slot) => slot.1 = value.clone(),
                    None => out.push((key.clone(), value.clone())),
                }
            }
        }
        out
    }

    pub fn user_tags(&self) -> impl Iterator<Item = (&str, &str)> {
        self.items.iter().filter_map(|m| match m {
            Metadata::UserTag { key, value } => Some((key.as_str(), value.as_str())),
            _ => None,
        })
    }

    pub fn user_tag(&self, key: &str) -> Option<&str> {
        self.last_of(|m| match m {
            Metadata::UserTag { key: k, value } if k == key => Some(value.as_str()),
            _ => None,
        })
    }

    /// Lowers the effective configuration into consumer settings. Group id
    /// and bootstrap servers have no sensible defaults; their absence is a
    /// configuration error for the topic.
    pub fn consumer_settings(&self, topic: &str) -> Result<ConsumerSettings, ConfigurationError> {
        let group_id = self
            .group_id()
            .ok_or_else(|| ConfigurationError::MissingGroupId {
                topic: topic.to_string(),
            })?
            .to_string();
        let bootstrap_servers = self
            .bootstrap_servers()
            .ok_or_else(|| ConfigurationError::MissingBootstrapServers {
                topic: topic.to_string(),
            })?
            .to_string();
        Ok(ConsumerSettings {
            topic: topic.to_string(),
            group_id,
            bootstrap_servers,
            offset_reset: self.offset_reset().unwrap_or(OffsetReset::Earliest),
            properties: self.client_properties(),
        })
    }

    pub fn producer_settings(&self, topic: &str) -> Result<ProducerSettings, ConfigurationError> {
        let bootstrap_servers = self
            .bootstrap_servers()
            .ok_or_else(|| ConfigurationError::MissingBootstrapServers {
                topic: topic.to_string(),
            })?
            .to_string();
        Ok(ProducerSettings {
            bootstrap_servers,
            properties: self.client_properties(),
        })
    }
}

impl FromIterator<Metadata> for MetadataSet {
    fn from_iter<I: IntoIterator<Item = Metadata>>(iter: I) -> Self {
        MetadataSet {
            items: iter.into_iter().collect(),
        }
    }
}
