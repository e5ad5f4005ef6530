//! Tests for policy configuration loading and resolution.

use gatekeeper_core::{GatekeeperConfig, MethodOverrides};
use std::io::Write;
use std::time::Duration;
use tempfile::Builder;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut temp_file = Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(temp_file, "{}", contents).unwrap();
    temp_file
}

#[test]
fn test_load_bundled_defaults() {
    let config = GatekeeperConfig::load().unwrap();

    let friends = config.for_method("friends.get");
    assert_eq!(*friends.rate_limit().capacity(), 3);
    assert_eq!(*friends.rate_limit().refill_per_sec(), 3.0);
    assert_eq!(*friends.circuit().failure_threshold(), 5);
    assert_eq!(friends.circuit().window(), Duration::from_secs(10));

    let users = config.for_method("users.get");
    assert_eq!(*users.batch().max_batch_size(), 100);
}

#[test]
fn test_unknown_method_uses_defaults() {
    let config = GatekeeperConfig::default();
    let policy = config.for_method("photos.search");

    assert_eq!(policy.method(), "photos.search");
    assert_eq!(policy.rate_limit(), config.defaults.rate_limit());
    assert_eq!(policy.retry(), config.defaults.retry());
    assert_eq!(policy.deadline(), Duration::from_secs(10));
}

#[test]
fn test_overrides_only_replace_specified_fields() {
    let mut config = GatekeeperConfig::default();
    config.methods.push(MethodOverrides {
        name: "wall.getComments".to_string(),
        capacity: Some(7),
        max_attempts: Some(5),
        ..Default::default()
    });

    let policy = config.for_method("wall.getComments");
    assert_eq!(*policy.rate_limit().capacity(), 7);
    assert_eq!(
        policy.rate_limit().refill_per_sec(),
        config.defaults.rate_limit().refill_per_sec()
    );
    assert_eq!(*policy.retry().max_attempts(), 5);
    assert_eq!(
        policy.retry().initial_backoff_ms(),
        config.defaults.retry().initial_backoff_ms()
    );
    assert_eq!(
        policy.circuit().cooldown_multiplier(),
        config.defaults.circuit().cooldown_multiplier()
    );
}

#[test]
fn test_config_from_file() {
    let file = write_config(
        r#"
[defaults]
deadline_ms = 2_000

[defaults.rate_limit]
capacity = 10
refill_per_sec = 2.5

[[methods]]
name = "groups.getMembers"
capacity = 42
cooldown_ms = 750
"#,
    );

    let config = GatekeeperConfig::from_file(file.path()).unwrap();

    let defaults = config.for_method("anything");
    assert_eq!(*defaults.rate_limit().capacity(), 10);
    assert_eq!(*defaults.rate_limit().refill_per_sec(), 2.5);
    // Unspecified table falls back to serde defaults
    assert_eq!(*defaults.retry().max_attempts(), 3);
    assert_eq!(defaults.deadline(), Duration::from_secs(2));

    let members = config.for_method("groups.getMembers");
    assert_eq!(*members.rate_limit().capacity(), 42);
    assert_eq!(members.circuit().cooldown(), Duration::from_millis(750));
}

#[test]
fn test_camel_case_method_names_survive_loading() {
    let file = write_config(
        r#"
[[methods]]
name = "wall.getComments"
max_attempts = 1
"#,
    );

    let config = GatekeeperConfig::from_file(file.path()).unwrap();
    assert_eq!(*config.for_method("wall.getComments").retry().max_attempts(), 1);
}

#[test]
fn test_invalid_values_are_rejected() {
    let cases = [
        "[defaults.rate_limit]\ncapacity = 0",
        "[defaults.rate_limit]\nrefill_per_sec = 0.0",
        "[defaults.circuit]\nfailure_ratio = 1.5",
        "[defaults.circuit]\nfailure_threshold = 0",
        "[defaults.circuit]\ncooldown_multiplier = inf",
        "[defaults.circuit]\ncooldown_ms = 10000\nmax_cooldown_ms = 5000",
        "[defaults.retry]\nmax_attempts = 0",
        "[defaults.batch]\nmax_batch_size = 0",
        "[[methods]]\nname = \"friends.get\"\nbatch_weight = 0",
        "[[methods]]\nname = \"\"\ncapacity = 1",
    ];

    for contents in cases {
        let file = write_config(contents);
        assert!(
            GatekeeperConfig::from_file(file.path()).is_err(),
            "expected rejection for:\n{}",
            contents
        );
    }
}
