//! Option resolution: command line over environment over defaults.

use std::collections::HashMap;

use plugcheck::config::{
    CliOverrides, ConfigError, EnvOverlay, ValidationOptions, DEFAULT_STRICTNESS,
    DEFAULT_TIMEOUT_MS,
};
use plugcheck::realtime::ViolationPolicy;

fn env(pairs: &[(&str, &str)]) -> EnvOverlay {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    EnvOverlay::from_lookup(move |key| map.get(key).cloned())
}

#[test]
fn defaults_without_input() {
    let options = ValidationOptions::resolve(&CliOverrides::default(), &env(&[])).unwrap();
    assert_eq!(options.strictness_level, DEFAULT_STRICTNESS);
    assert_eq!(options.timeout_ms, DEFAULT_TIMEOUT_MS);
    assert_eq!(options.repeat, 1);
    assert!(options.with_gui);
    assert_eq!(options.violation_policy, ViolationPolicy::RaiseError);
}

#[test]
fn cli_wins_over_environment() {
    let cli = CliOverrides {
        strictness_level: Some(8),
        timeout_ms: Some(1_000),
        ..CliOverrides::default()
    };
    let overlay = env(&[
        ("STRICTNESS_LEVEL", "2"),
        ("TIMEOUT_MS", "5000"),
        ("REPEAT", "3"),
    ]);
    let options = ValidationOptions::resolve(&cli, &overlay).unwrap();
    assert_eq!(options.strictness_level, 8);
    assert_eq!(options.timeout_ms, 1_000);
    assert_eq!(options.repeat, 3);
}

#[test]
fn invalid_environment_falls_back() {
    let overlay = env(&[
        ("STRICTNESS_LEVEL", "loud"),
        ("TIMEOUT_MS", "0"),
        ("RTCHECK_POLICY", "explode"),
        ("SKIP_GUI_TESTS", "maybe"),
    ]);
    let options = ValidationOptions::resolve(&CliOverrides::default(), &overlay).unwrap();
    assert_eq!(options.strictness_level, DEFAULT_STRICTNESS);
    assert_eq!(options.timeout_ms, DEFAULT_TIMEOUT_MS);
    assert_eq!(options.violation_policy, ViolationPolicy::RaiseError);
    assert!(options.with_gui);
}

#[test]
fn bad_cli_policy_is_an_error() {
    let cli = CliOverrides {
        rtcheck_policy: Some("sometimes".into()),
        ..CliOverrides::default()
    };
    assert!(matches!(
        ValidationOptions::resolve(&cli, &env(&[])),
        Err(ConfigError::Policy(_))
    ));
}

#[test]
fn payload_hand_off_preserves_options() {
    let cli = CliOverrides {
        random_seed: Some(0xabc),
        skip_gui_tests: true,
        disabled_tests: vec!["Editor".into(), "Automation".into()],
        rtcheck_policy: Some("log".into()),
        ..CliOverrides::default()
    };
    let options = ValidationOptions::resolve(&cli, &env(&[])).unwrap();
    let restored = ValidationOptions::from_payload(&options.to_payload().unwrap()).unwrap();
    assert_eq!(restored, options);
    assert!(restored.is_disabled("Editor"));
    assert!(!restored.with_gui);
}
