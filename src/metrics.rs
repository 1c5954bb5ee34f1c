//! Well-known metrics exposed for a load test.

use crate::config::{AssertionKind, ListenerConfig};
use crate::registry::{MetricDefinition, MetricKind};
use crate::schema::{Family, LabelSchema};

/// Standard metric names
pub struct MetricNames;

impl MetricNames {
    pub const SAMPLES_LATENCY: &'static str = "jmeter_samples_latency";
    pub const RUNNING_THREADS: &'static str = "jmeter_running_threads";
    pub const ASSERTIONS_TOTAL: &'static str = "jmeter_assertions_total";
}

/// Metric definitions for `config`, with schemas resolved from it.
pub fn definitions(config: &ListenerConfig) -> Vec<MetricDefinition> {
    let mut defs = vec![MetricDefinition::new(
        MetricNames::SAMPLES_LATENCY,
        "Summary for Sample Latency",
        MetricKind::Summary,
        LabelSchema::resolve(Family::Sampler, config),
    )];

    if config.save.threads {
        defs.push(MetricDefinition::new(
            MetricNames::RUNNING_THREADS,
            "Gauge for running threads",
            MetricKind::Gauge,
            LabelSchema::empty(),
        ));
    }

    if config.save.assertions {
        let kind = match config.assertion_kind {
            AssertionKind::Counter => MetricKind::Counter,
            AssertionKind::Summary => MetricKind::Summary,
        };
        defs.push(MetricDefinition::new(
            MetricNames::ASSERTIONS_TOTAL,
            "Counter for assertions",
            kind,
            LabelSchema::resolve(Family::Assertion, config),
        ));
    }

    defs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names_unique() {
        let names = [
            MetricNames::SAMPLES_LATENCY,
            MetricNames::RUNNING_THREADS,
            MetricNames::ASSERTIONS_TOTAL,
        ];
        let unique: std::collections::HashSet<_> = names.iter().collect();
        assert_eq!(names.len(), unique.len());
    }

    #[test]
    fn test_default_definitions() {
        let defs = definitions(&ListenerConfig::default());
        let kinds: Vec<_> = defs.iter().map(|d| (d.name.as_str(), d.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                (MetricNames::SAMPLES_LATENCY, MetricKind::Summary),
                (MetricNames::RUNNING_THREADS, MetricKind::Gauge),
                (MetricNames::ASSERTIONS_TOTAL, MetricKind::Counter),
            ]
        );
    }

    #[test]
    fn test_toggles_drop_definitions() {
        let mut config = ListenerConfig::default();
        config.save.threads = false;
        config.save.assertions = false;
        let defs = definitions(&config);
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, MetricNames::SAMPLES_LATENCY);
    }

    #[test]
    fn test_summary_assertion_kind() {
        let config = ListenerConfig {
            assertion_kind: AssertionKind::Summary,
            ..ListenerConfig::default()
        };
        let assertions = definitions(&config)
            .into_iter()
            .find(|d| d.name == MetricNames::ASSERTIONS_TOTAL)
            .unwrap();
        assert_eq!(assertions.kind, MetricKind::Summary);
        assert_eq!(assertions.schema.names(), vec!["label", "code", "success", "failure"]);
    }
}
