//! Engine behaviour against the reference plugins, run in-process.

use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;

use plugcheck::config::ValidationOptions;
use plugcheck::engine::{
    select_tests, EngineConfig, EngineListener, TestContext, TestEngine, TestResult,
    DISCOVERY_TEST, STARTING_TEST_PREFIX,
};
use plugcheck::plugin::{FormatManager, PluginInstance};
use plugcheck::realtime::{AllocInterceptor, ViolationPolicy};
use plugcheck::suite::{PluginTestCase, TestRegistry};

/// The interceptor and its violation ring are process-wide.
static ENGINE_LOCK: Mutex<()> = parking_lot::const_mutex(());

#[derive(Default)]
struct Collect {
    logs: Mutex<Vec<String>>,
    results: Mutex<Vec<TestResult>>,
}

impl EngineListener for Collect {
    fn log(&self, text: &str) {
        self.logs.lock().push(text.to_string());
    }

    fn item_complete(&self, result: &TestResult) {
        self.results.lock().push(result.clone());
    }
}

impl Collect {
    fn real_results(&self) -> Vec<TestResult> {
        self.results.lock().iter().filter(|r| !r.pseudo).cloned().collect()
    }

    fn started(&self) -> Vec<String> {
        self.logs
            .lock()
            .iter()
            .filter_map(|line| line.strip_prefix(STARTING_TEST_PREFIX))
            .map(str::to_string)
            .collect()
    }
}

/// Passes, logging a value drawn from its seeded generator.
struct Draws(&'static str);

impl PluginTestCase for Draws {
    fn name(&self) -> &str {
        self.0
    }

    fn min_strictness(&self) -> u8 {
        1
    }

    fn run(&self, _plugin: &mut dyn PluginInstance, ctx: &mut TestContext) {
        let value: u64 = ctx.rng().gen();
        ctx.log(format!("drew {value}"));
        ctx.pass();
    }
}

struct AllocatesInWindow;

impl PluginTestCase for AllocatesInWindow {
    fn name(&self) -> &str {
        "Allocates in window"
    }

    fn min_strictness(&self) -> u8 {
        1
    }

    fn run(&self, _plugin: &mut dyn PluginInstance, ctx: &mut TestContext) {
        let _window = ctx.realtime_window();
        let scratch: Vec<u8> = Vec::with_capacity(256);
        black_box(scratch);
    }
}

struct Panics;

impl PluginTestCase for Panics {
    fn name(&self) -> &str {
        "Panics"
    }

    fn min_strictness(&self) -> u8 {
        1
    }

    fn run(&self, _plugin: &mut dyn PluginInstance, _ctx: &mut TestContext) {
        panic!("boom");
    }
}

fn registry(cases: Vec<Arc<dyn PluginTestCase>>) -> TestRegistry {
    let mut registry = TestRegistry::new();
    for case in cases {
        registry.register(case).unwrap();
    }
    registry
}

fn quick_config() -> EngineConfig {
    EngineConfig {
        settle_delay: Duration::ZERO,
        ..EngineConfig::default()
    }
}

fn run(target: &str, registry: &TestRegistry, options: &ValidationOptions) -> (u32, u32, u64, Arc<Collect>) {
    let collect = Arc::new(Collect::default());
    let summary = TestEngine::new(Arc::new(FormatManager::with_builtin_formats()), registry)
        .with_config(quick_config())
        .run(target, options, collect.clone())
        .unwrap();
    (summary.tests, summary.failures, summary.seed, collect)
}

#[test]
fn no_types_found_is_a_single_failure() {
    let _lock = ENGINE_LOCK.lock();
    let registry = TestRegistry::builtin().unwrap();

    let (tests, failures, _, collect) = run("reference:empty", &registry, &ValidationOptions::default());
    assert_eq!((tests, failures), (1, 1));
    let results = collect.results.lock();
    assert_eq!(results[0].name, DISCOVERY_TEST);
    assert_eq!(results[0].messages, vec!["No types found for reference:empty"]);
}

#[test]
fn unknown_target_reports_loader_error() {
    let _lock = ENGINE_LOCK.lock();
    let registry = TestRegistry::builtin().unwrap();

    let (_, failures, _, collect) = run("reference:nope", &registry, &ValidationOptions::default());
    assert_eq!(failures, 1);
    let message = &collect.results.lock()[0].messages[0];
    assert!(message.starts_with("No types found for reference:nope: "), "{message}");
}

#[test]
fn results_follow_registration_order() {
    let _lock = ENGINE_LOCK.lock();
    let registry = registry(vec![
        Arc::new(Draws("First")),
        Arc::new(Draws("Second")),
        Arc::new(Draws("Third")),
    ]);

    let (tests, failures, _, collect) = run("reference:gain", &registry, &ValidationOptions::default());
    assert_eq!(failures, 0);
    let names: Vec<_> = collect.real_results().into_iter().map(|r| r.name).collect();
    assert_eq!(names, vec!["First", "Second", "Third"]);
    // Cold and warm open timings come first.
    assert_eq!(tests, 5);
    assert!(collect.results.lock()[..2].iter().all(|r| r.pseudo && r.passed()));
}

#[test]
fn same_seed_same_order_and_output() {
    let _lock = ENGINE_LOCK.lock();
    let cases: Vec<Arc<dyn PluginTestCase>> = ["A", "B", "C", "D", "E", "F"]
        .into_iter()
        .map(|name| Arc::new(Draws(name)) as Arc<dyn PluginTestCase>)
        .collect();
    let registry = registry(cases);
    let options = ValidationOptions {
        random_seed: 0x5eed,
        randomise: true,
        repeat: 3,
        ..ValidationOptions::default()
    };

    let (_, _, seed_a, first) = run("reference:gain", &registry, &options);
    let (_, _, seed_b, second) = run("reference:gain", &registry, &options);
    assert_eq!(seed_a, 0x5eed);
    assert_eq!(seed_a, seed_b);
    assert_eq!(first.started(), second.started());

    let outputs = |c: &Collect| -> Vec<Vec<String>> {
        c.real_results().into_iter().map(|r| r.output).collect()
    };
    assert_eq!(outputs(&first), outputs(&second));
    assert_eq!(first.real_results().len(), 18);
}

#[test]
fn zero_seed_is_replaced_and_logged() {
    let _lock = ENGINE_LOCK.lock();
    let registry = registry(vec![Arc::new(Draws("Only"))]);

    let (_, _, seed, collect) = run("reference:gain", &registry, &ValidationOptions::default());
    assert_ne!(seed, 0);
    assert_eq!(collect.logs.lock()[0], format!("Random seed: 0x{seed:x}"));
}

#[test]
fn allocation_under_raise_fails_once_and_suite_continues() {
    let _lock = ENGINE_LOCK.lock();
    let registry = registry(vec![
        Arc::new(AllocatesInWindow),
        Arc::new(Draws("After")),
    ]);
    let options = ValidationOptions {
        strictness_level: 10,
        violation_policy: ViolationPolicy::RaiseError,
        ..ValidationOptions::default()
    };

    AllocInterceptor::install(ViolationPolicy::RaiseError);
    let (_, failures, _, collect) = run("reference:gain", &registry, &options);
    AllocInterceptor::shutdown();

    let results = collect.real_results();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].failures, 1);
    assert_eq!(results[0].messages.len(), 1);
    assert!(results[0].messages[0].starts_with("Real-time violation"));
    assert!(results[1].passed());
    assert_eq!(failures, 1);
}

#[test]
fn allocation_under_log_only_passes() {
    let _lock = ENGINE_LOCK.lock();
    let registry = registry(vec![Arc::new(AllocatesInWindow)]);
    let options = ValidationOptions {
        strictness_level: 10,
        violation_policy: ViolationPolicy::LogOnly,
        ..ValidationOptions::default()
    };

    AllocInterceptor::install(ViolationPolicy::LogOnly);
    let (_, failures, _, collect) = run("reference:gain", &registry, &options);
    AllocInterceptor::shutdown();

    assert_eq!(failures, 0);
    let result = &collect.real_results()[0];
    assert!(result
        .output
        .iter()
        .any(|line| line.starts_with("Real-time violation (logged)")));
}

#[test]
fn reference_alloc_plugin_fails_realtime_check() {
    let _lock = ENGINE_LOCK.lock();
    let registry = TestRegistry::builtin().unwrap();
    let options = ValidationOptions {
        strictness_level: 10,
        random_seed: 7,
        ..ValidationOptions::default()
    };

    AllocInterceptor::install(ViolationPolicy::RaiseError);
    let (_, failures, _, collect) = run("reference:alloc", &registry, &options);
    AllocInterceptor::shutdown();

    assert!(failures > 0);
    let failed: Vec<_> = collect
        .real_results()
        .into_iter()
        .filter(|r| !r.passed())
        .map(|r| r.name)
        .collect();
    assert!(failed.contains(&"Real-time allocations".to_string()), "{failed:?}");
}

#[test]
fn gain_plugin_passes_builtin_suite() {
    let _lock = ENGINE_LOCK.lock();
    let registry = TestRegistry::builtin().unwrap();
    let options = ValidationOptions {
        random_seed: 42,
        ..ValidationOptions::default()
    };

    let (tests, failures, _, collect) = run("reference:gain", &registry, &options);
    let expected = select_tests(&registry, &options).len() as u32 + 2;
    assert_eq!(tests, expected);
    assert_eq!(failures, 0, "{:?}", collect.results.lock());
}

#[test]
fn nan_plugin_fails_audio_processing() {
    let _lock = ENGINE_LOCK.lock();
    let registry = TestRegistry::builtin().unwrap();

    let (_, failures, _, collect) = run("reference:nan", &registry, &ValidationOptions::default());
    assert!(failures > 0);
    assert!(collect
        .real_results()
        .iter()
        .any(|r| r.name == "Audio processing" && !r.passed()));
}

#[test]
fn panicking_case_becomes_failure() {
    let _lock = ENGINE_LOCK.lock();
    let registry = registry(vec![Arc::new(Panics), Arc::new(Draws("Next"))]);

    let (_, failures, _, collect) = run("reference:gain", &registry, &ValidationOptions::default());
    assert_eq!(failures, 1);
    let results = collect.real_results();
    assert_eq!(results[0].messages, vec!["Test panicked: boom"]);
    assert!(results[1].passed());
}

#[test]
fn disabled_test_is_skipped_exactly() {
    let _lock = ENGINE_LOCK.lock();
    let registry = registry(vec![
        Arc::new(Draws("Keep")),
        Arc::new(Draws("Drop")),
        Arc::new(Draws("Also keep")),
    ]);
    let mut options = ValidationOptions::default();
    options.disabled_tests.insert("Drop".to_string());

    let (_, _, _, collect) = run("reference:gain", &registry, &options);
    let names: Vec<_> = collect.real_results().into_iter().map(|r| r.name).collect();
    assert_eq!(names, vec!["Keep", "Also keep"]);
}

#[test]
fn strictness_selection_is_monotonic() {
    let registry = TestRegistry::builtin().unwrap();
    let mut previous: Vec<String> = Vec::new();
    for level in 1..=10 {
        let options = ValidationOptions {
            strictness_level: level,
            ..ValidationOptions::default()
        };
        let selected: Vec<String> = select_tests(&registry, &options)
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        assert!(previous.iter().all(|name| selected.contains(name)), "level {level}");
        previous = selected;
    }
    assert_eq!(previous.len(), registry.len());
}
