use crate::errors::ConfigurationError;
use crate::metadata::{DecodeFailurePolicy, Metadata, MetadataSet, OffsetReset};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Declarative router configuration: global defaults plus per-topic
/// fragments. Lowered onto the same metadata path the fluent builder uses,
/// so file-driven and code-driven configuration merge identically.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterOptions {
    #[serde(default)]
    pub defaults: TopicOptions,
    #[serde(default)]
    pub topics: BTreeMap<String, TopicOptions>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopicOptions {
    pub bootstrap_servers: Option<String>,
    pub group_id: Option<String>,
    pub auto_offset_reset: Option<OffsetReset>,
    pub report_interval_secs: Option<u64>,
    pub dead_letter_topic: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl RouterOptions {
    pub fn from_file(path: &str) -> Result<Self, ConfigurationError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigurationError::LoadFailed {
                source: path.to_string(),
                error: Box::new(e),
            })?;
        let options: RouterOptions =
            serde_yaml::from_str(&content).map_err(|e| ConfigurationError::LoadFailed {
                source: path.to_string(),
                error: Box::new(e),
            })?;
        options.validate()?;
        Ok(options)
    }

    pub fn from_env() -> Result<Self, ConfigurationError> {
        let content =
            std::env::var("ROUTER_CONFIG").map_err(|_| ConfigurationError::InvalidOptions {
                message: "ROUTER_CONFIG environment variable not set".to_string(),
            })?;
        let options: RouterOptions = serde_yaml::from_str(&content)?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.defaults.validate("defaults")?;
        for (name, topic) in &self.topics {
            if name.is_empty() {
                return Err(ConfigurationError::InvalidOptions {
                    message: "topic name must not be empty".to_string(),
                });
            }
            topic.validate(name)?;
        }
        Ok(())
    }
}

impl TopicOptions {
    fn validate(&self, scope: &str) -> Result<(), ConfigurationError> {
        if let Some(servers) = &self.bootstrap_servers {
            if servers.is_empty() {
                return Err(ConfigurationError::InvalidOptions {
                    message: format!("{scope}: bootstrap_servers must not be empty"),
                });
            }
        }
        if self.report_interval_secs == Some(0) {
            return Err(ConfigurationError::InvalidOptions {
                message: format!("{scope}: report_interval_secs must be greater than zero"),
            });
        }
        Ok(())
    }

    /// Lowers this fragment onto a metadata set. Singleton facets replace,
    /// tags append.
    pub fn apply(&self, set: &mut MetadataSet) {
        if let Some(servers) = &self.bootstrap_servers {
            set.set(Metadata::BootstrapServers(servers.clone()));
        }
        if let Some(group_id) = &self.group_id {
            set.set(Metadata::GroupId(group_id.clone()));
        }
        if let Some(reset) = self.auto_offset_reset {
            set.set(Metadata::OffsetReset(reset));
        }
        if let Some(secs) = self.report_interval_secs {
            set.set(Metadata::ReportInterval(Duration::from_secs(secs)));
        }
        if let Some(topic) = &self.dead_letter_topic {
            set.set(Metadata::DecodeFailure(DecodeFailurePolicy::DeadLetter(
                topic.clone(),
            )));
        }
        for (key, value) in &self.properties {
            set.set(Metadata::ClientProperty {
                key: key.clone(),
                value: value.clone(),
            });
        }
        for (key, value) in &self.tags {
            set.push(Metadata::UserTag {
                key: key.clone(),
                value: value.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
defaults:
  bootstrap_servers: "localhost:9092"
  group_id: "g1"
  auto_offset_reset: earliest
  report_interval_secs: 5
topics:
  orders:
    report_interval_secs: 1
    dead_letter_topic: "orders-dlq"
    tags:
      team: "billing"
"#;

    #[test]
    fn parses_options_from_a_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let options = RouterOptions::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(options.defaults.group_id.as_deref(), Some("g1"));
        assert_eq!(
            options.defaults.auto_offset_reset,
            Some(OffsetReset::Earliest)
        );
        assert_eq!(options.topics["orders"].report_interval_secs, Some(1));
    }

    #[test]
    fn missing_file_is_a_load_failure() {
        let err = RouterOptions::from_file("/nonexistent/options.yaml").unwrap_err();
        assert!(matches!(err, ConfigurationError::LoadFailed { .. }));
    }

    #[test]
    fn zero_report_interval_fails_validation() {
        let options: RouterOptions = serde_yaml::from_str(
            "defaults:\n  report_interval_secs: 0\n",
        )
        .unwrap();
        assert!(matches!(
            options.validate(),
            Err(ConfigurationError::InvalidOptions { .. })
        ));
    }

    #[test]
    fn empty_bootstrap_servers_fail_validation() {
        let options: RouterOptions =
            serde_yaml::from_str("topics:\n  orders:\n    bootstrap_servers: \"\"\n").unwrap();
        assert!(options.validate().is_err());
    }

    #[test]
    fn fragments_lower_onto_metadata() {
        let options: RouterOptions = serde_yaml::from_str(SAMPLE).unwrap();

        let mut set = MetadataSet::new();
        options.defaults.apply(&mut set);
        options.topics["orders"].apply(&mut set);

        assert_eq!(set.group_id(), Some("g1"));
        assert_eq!(set.report_interval(), Some(Duration::from_secs(1)));
        assert_eq!(
            set.decode_failure(),
            DecodeFailurePolicy::DeadLetter("orders-dlq".to_string())
        );
        assert_eq!(set.user_tag("team"), Some("billing"));
    }
}
