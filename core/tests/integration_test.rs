use route_core::*;
use std::time::Duration;

async fn record_order(Value(_): Value<String>) {}

#[test]
fn options_and_fluent_configuration_merge_through_one_path() {
    let options: RouterOptions = serde_yaml::from_str(
        r#"
defaults:
  bootstrap_servers: "localhost:9092"
  group_id: "g1"
  auto_offset_reset: earliest
  report_interval_secs: 5
topics:
  orders:
    report_interval_secs: 2
"#,
    )
    .unwrap();
    options.validate().unwrap();

    let mut builder = KafkaBuilder::new().with_options(options);
    builder
        .map_topic::<String, String, _, _>("orders", record_order)
        .unwrap()
        .with_report_interval(Duration::from_secs(1))
        .with_tag("team", "billing");
    builder
        .map_topic::<String, String, _, _>("shipments", record_order)
        .unwrap();

    let router = builder.build().unwrap();
    let registrations = router.data_source().registrations();

    let orders = registrations[0].metadata();
    assert_eq!(orders.group_id(), Some("g1"));
    assert_eq!(orders.offset_reset(), Some(OffsetReset::Earliest));
    assert_eq!(orders.report_interval(), Some(Duration::from_secs(1)));
    assert_eq!(orders.user_tag("team"), Some("billing"));

    let shipments = registrations[1].metadata();
    assert_eq!(shipments.report_interval(), Some(Duration::from_secs(5)));
}

#[test]
fn error_taxonomy_distinguishes_fatal_from_retryable() {
    let connection = RouterError::Connection(ConnectionError::ClientCreation {
        reason: "connection refused".to_string(),
    });
    assert!(connection.is_retryable());
    assert_eq!(connection.retry_delay(), Duration::from_millis(1000));

    let config = RouterError::Config(ConfigurationError::EmptyTopic);
    assert!(!config.is_retryable());
}
