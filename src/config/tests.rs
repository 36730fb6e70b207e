use super::*;
use crate::broker::InMemoryTransport;
use crate::publishing::Publisher;
use crate::serialization::{JsonSerializer, MessageTypeRegistry};
use serial_test::serial;
use std::io::Write;
use std::sync::Arc;

const SAMPLE: &str = r#"
broker:
  connect_retries: 5
consumers:
  - endpoint: { name: orders }
    batch: { size: 10, max_wait_ms: 250 }
    error_policy:
      type: chain
      policies:
        - { type: retry, max_failed_attempts: 3, initial_delay_ms: 100, delay_increment_ms: 50 }
        - { type: move, endpoint: { name: orders-dlq }, max_failed_attempts: 1 }
  - endpoint: { name: payments }
producers:
  - endpoint: { name: orders, chunk_size: 1024 }
"#;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".yaml")
        .tempfile()
        .expect("temp file");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn test_config_default() {
    let config = Config::default();

    assert_eq!(config.broker.connect_retries, DEFAULT_CONNECT_RETRIES);
    assert!(config.consumers.is_empty());
    assert!(config.producers.is_empty());
}

#[test]
#[serial]
fn test_load_from_file() {
    let file = write_config(SAMPLE);

    let config = Config::load(file.path().to_str()).unwrap();

    assert_eq!(config.broker.connect_retries, 5);
    assert_eq!(config.consumers.len(), 2);
    assert_eq!(config.producers[0].endpoint.chunk_size, Some(1024));

    let settings = config.consumers[0].settings().unwrap();
    assert_eq!(settings.batch.size, 10);
    assert_eq!(settings.batch.max_wait, Duration::from_millis(250));
    assert_eq!(
        settings.error_policy,
        Some(ErrorPolicy::Chain(vec![
            ErrorPolicy::retry_with_delay(3, Duration::from_millis(100), Duration::from_millis(50)),
            ErrorPolicy::move_to(Endpoint::new("orders-dlq"), 1),
        ]))
    );

    let defaults = config.consumers[1].settings().unwrap();
    assert_eq!(defaults.batch, BatchSettings::default());
    assert_eq!(defaults.error_policy, None);
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    let file = write_config(SAMPLE);
    std::env::set_var("COURIER__BROKER__CONNECT_RETRIES", "2");

    let config = Config::load(file.path().to_str());
    std::env::remove_var("COURIER__BROKER__CONNECT_RETRIES");

    assert_eq!(config.unwrap().broker.connect_retries, 2);
}

#[test]
#[serial]
fn test_missing_explicit_file_fails() {
    let result = Config::load(Some("/nonexistent/courier-config.yaml"));

    assert!(matches!(result, Err(ConfigError::Load(_))));
}

#[test]
fn test_skip_must_be_last_in_chain() {
    let config = ErrorPolicyConfig::Chain {
        policies: vec![
            ErrorPolicyConfig::Skip,
            ErrorPolicyConfig::Retry {
                max_failed_attempts: 2,
                initial_delay_ms: 0,
                delay_increment_ms: 0,
            },
        ],
    };

    assert_eq!(
        ErrorPolicy::try_from(&config),
        Err(PolicyError::NotLast("Skip"))
    );
}

#[tokio::test]
async fn test_apply_creates_consumers_and_producers() {
    let config: Config = ::config::Config::builder()
        .add_source(::config::File::from_str(SAMPLE, ::config::FileFormat::Yaml))
        .build()
        .unwrap()
        .try_deserialize()
        .unwrap();
    let builder = Broker::builder(
        Arc::new(InMemoryTransport::new()),
        Arc::new(JsonSerializer::new(MessageTypeRegistry::new())),
    )
    .publisher(Publisher::builder().build());
    let broker = config.broker.apply(builder).build();

    config.apply(&broker).unwrap();

    assert_eq!(broker.consumers().len(), 2);
    assert_eq!(broker.producer_count(), 1);
    let orders = broker.get_consumer(&Endpoint::new("orders")).unwrap();
    assert_eq!(orders.settings().batch.size, 10);
}

#[test]
fn test_invalid_policy_leaves_broker_untouched() {
    let config = Config {
        consumers: vec![ConsumerConfig {
            endpoint: Endpoint::new("orders"),
            error_policy: Some(ErrorPolicyConfig::Retry {
                max_failed_attempts: 0,
                initial_delay_ms: 0,
                delay_increment_ms: 0,
            }),
            ..ConsumerConfig::default()
        }],
        ..Config::default()
    };
    let broker = Broker::builder(
        Arc::new(InMemoryTransport::new()),
        Arc::new(JsonSerializer::new(MessageTypeRegistry::new())),
    )
    .publisher(Publisher::builder().build())
    .build();

    let result = config.apply(&broker);

    assert!(matches!(result, Err(ConfigError::Policy(PolicyError::ZeroAttempts))));
    assert!(broker.consumers().is_empty());
}
