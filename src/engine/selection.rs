//! Test selection and ordering.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::config::ValidationOptions;
use crate::suite::{PluginTestCase, TestRegistry};

/// Whether a case is eligible under the given options.
pub fn is_selected(case: &dyn PluginTestCase, options: &ValidationOptions) -> bool {
    options.strictness_level >= case.min_strictness()
        && (!case.requires_gui() || options.with_gui)
        && !options.is_disabled(case.name())
}

/// Eligible cases in registration order.
pub fn select_tests(
    registry: &TestRegistry,
    options: &ValidationOptions,
) -> Vec<Arc<dyn PluginTestCase>> {
    registry
        .iter()
        .filter(|case| is_selected(case.as_ref(), options))
        .cloned()
        .collect()
}

/// Order for one repeat pass: shuffled from `rng` when randomising,
/// otherwise unchanged.
pub fn order_tests(
    selected: &[Arc<dyn PluginTestCase>],
    randomise: bool,
    rng: &mut StdRng,
) -> Vec<Arc<dyn PluginTestCase>> {
    let mut ordered = selected.to_vec();
    if randomise {
        ordered.shuffle(rng);
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn names(cases: &[Arc<dyn PluginTestCase>]) -> Vec<String> {
        cases.iter().map(|c| c.name().to_string()).collect()
    }

    #[test]
    fn test_strictness_gates_builtin_suite() {
        let registry = TestRegistry::builtin().unwrap();
        let mut options = ValidationOptions::default();

        options.strictness_level = 1;
        assert_eq!(
            names(&select_tests(&registry, &options)),
            vec!["Plugin info", "Basic bus"]
        );

        options.strictness_level = 10;
        assert_eq!(select_tests(&registry, &options).len(), registry.len());
    }

    #[test]
    fn test_gui_cases_need_gui() {
        let registry = TestRegistry::builtin().unwrap();
        let mut options = ValidationOptions::default();
        options.with_gui = false;
        assert!(!names(&select_tests(&registry, &options)).contains(&"Editor".to_string()));
    }

    #[test]
    fn test_unshuffled_order_is_unchanged() {
        let registry = TestRegistry::builtin().unwrap();
        let selected = select_tests(&registry, &ValidationOptions::default());
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(
            names(&order_tests(&selected, false, &mut rng)),
            names(&selected)
        );
    }

    #[test]
    fn test_shuffle_is_seeded() {
        let registry = TestRegistry::builtin().unwrap();
        let mut options = ValidationOptions::default();
        options.strictness_level = 10;
        let selected = select_tests(&registry, &options);

        let mut a = StdRng::seed_from_u64(1234);
        let mut b = StdRng::seed_from_u64(1234);
        for _ in 0..3 {
            assert_eq!(
                names(&order_tests(&selected, true, &mut a)),
                names(&order_tests(&selected, true, &mut b))
            );
        }
    }
}
