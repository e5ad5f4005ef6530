//! OpenTelemetry setup, only built with the `observability` feature.

#![cfg(feature = "observability")]

use gatekeeper::observability::{ObservabilityConfig, init_observability_with_config};
use gatekeeper::{ApiError, CallDescriptor, GatekeeperConfig, RequestManager};

#[test]
fn test_config_builder() {
    let config = ObservabilityConfig::new("crawler")
        .with_log_level("gatekeeper=debug")
        .with_json_logs(true);

    assert_eq!(config.service_name, "crawler");
    assert_eq!(config.log_level, "gatekeeper=debug");
    assert!(config.json_logs);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_calls_are_exported_through_installed_providers() {
    let guard =
        init_observability_with_config(ObservabilityConfig::default().with_log_level("warn"))
            .unwrap();

    let manager = RequestManager::new(GatekeeperConfig::default());
    manager
        .execute(&CallDescriptor::new("users.get"), || async {
            Ok::<_, ApiError>(())
        })
        .await
        .unwrap();

    // A second global subscriber is refused.
    assert!(init_observability_with_config(ObservabilityConfig::default()).is_err());

    guard.shutdown();
}
