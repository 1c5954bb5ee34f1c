//! Labelled quantile summaries for the prometheus registry.
//!
//! The prometheus crate ships counters, gauges and histograms but no
//! summary, so this module provides one: a [`SummaryVec`] collector whose
//! children each keep a CKMS quantile stream together with the running sum
//! and count.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use prometheus::core::{Collector, Desc};
use prometheus::proto::{LabelPair, Metric, MetricFamily, MetricType, Quantile};
use quantiles::ckms::CKMS;

use crate::error::ListenerError;

/// A quantile to estimate and its allowed rank error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetQuantile {
    pub quantile: f64,
    pub error: f64,
}

/// Median and 99th percentile, both within 10% rank error.
pub const DEFAULT_QUANTILES: [TargetQuantile; 2] = [
    TargetQuantile {
        quantile: 0.5,
        error: 0.1,
    },
    TargetQuantile {
        quantile: 0.99,
        error: 0.1,
    },
];

/// One child series of a summary.
pub struct SummaryChild {
    state: Mutex<ChildState>,
}

struct ChildState {
    estimator: CKMS<f64>,
    sum: f64,
    count: u64,
}

impl SummaryChild {
    fn new(targets: &[TargetQuantile]) -> Self {
        Self {
            state: Mutex::new(ChildState {
                estimator: CKMS::new(tightest_error(targets)),
                sum: 0.0,
                count: 0,
            }),
        }
    }

    /// NaN observations are ignored.
    pub fn observe(&self, value: f64) {
        if value.is_nan() {
            return;
        }
        let mut state = self.state.lock();
        state.estimator.insert(value);
        state.sum += value;
        state.count += 1;
    }

    pub fn sample_count(&self) -> u64 {
        self.state.lock().count
    }

    pub fn sample_sum(&self) -> f64 {
        self.state.lock().sum
    }

    /// Estimated value at quantile `q`, NaN when nothing was observed.
    pub fn quantile(&self, q: f64) -> f64 {
        self.state
            .lock()
            .estimator
            .query(q)
            .map_or(f64::NAN, |(_, value)| value)
    }
}

fn tightest_error(targets: &[TargetQuantile]) -> f64 {
    targets
        .iter()
        .map(|t| t.error)
        .fold(f64::INFINITY, f64::min)
        .min(0.1)
}

struct SummaryCore {
    desc: Desc,
    label_names: Vec<String>,
    targets: Vec<TargetQuantile>,
    children: RwLock<HashMap<Vec<String>, Arc<SummaryChild>>>,
}

/// Summary partitioned by label values.
///
/// Cloning shares the children, as the prometheus vector types do, so one
/// clone can be registered while another is updated.
#[derive(Clone)]
pub struct SummaryVec {
    core: Arc<SummaryCore>,
}

impl SummaryVec {
    pub fn new(
        name: &str,
        help: &str,
        label_names: &[&str],
        targets: &[TargetQuantile],
    ) -> Result<Self, ListenerError> {
        let label_names: Vec<String> = label_names.iter().map(|n| n.to_string()).collect();
        let desc = Desc::new(
            name.to_string(),
            help.to_string(),
            label_names.clone(),
            HashMap::new(),
        )?;
        Ok(Self {
            core: Arc::new(SummaryCore {
                desc,
                label_names,
                targets: targets.to_vec(),
                children: RwLock::new(HashMap::new()),
            }),
        })
    }

    fn check_arity(&self, values: &[&str]) -> Result<(), ListenerError> {
        let expected = self.core.label_names.len();
        if values.len() != expected {
            return Err(ListenerError::SchemaMismatch {
                metric: self.core.desc.fq_name.clone(),
                expected,
                actual: values.len(),
            });
        }
        Ok(())
    }

    /// Child series for `values`, created on first use.
    pub fn with_label_values(&self, values: &[&str]) -> Result<Arc<SummaryChild>, ListenerError> {
        self.check_arity(values)?;
        let key: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        if let Some(child) = self.core.children.read().get(&key) {
            return Ok(Arc::clone(child));
        }
        let mut children = self.core.children.write();
        let child = children
            .entry(key)
            .or_insert_with(|| Arc::new(SummaryChild::new(&self.core.targets)));
        Ok(Arc::clone(child))
    }

    /// Drop the child series for `values`. Returns whether one existed.
    pub fn remove_label_values(&self, values: &[&str]) -> Result<bool, ListenerError> {
        self.check_arity(values)?;
        let key: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        Ok(self.core.children.write().remove(&key).is_some())
    }

    pub fn len(&self) -> usize {
        self.core.children.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.core.children.read().is_empty()
    }

    fn metric_for(&self, values: &[String], child: &SummaryChild) -> Metric {
        let mut pairs: Vec<LabelPair> = self
            .core
            .label_names
            .iter()
            .zip(values)
            .map(|(name, value)| {
                let mut pair = LabelPair::default();
                pair.set_name(name.clone());
                pair.set_value(value.clone());
                pair
            })
            .collect();
        pairs.sort_by(|a, b| a.get_name().cmp(b.get_name()));

        let state = child.state.lock();
        let mut summary = prometheus::proto::Summary::default();
        summary.set_sample_count(state.count);
        summary.set_sample_sum(state.sum);
        let mut quantiles = Vec::with_capacity(self.core.targets.len());
        for target in &self.core.targets {
            let mut quantile = Quantile::default();
            quantile.set_quantile(target.quantile);
            quantile.set_value(
                state
                    .estimator
                    .query(target.quantile)
                    .map_or(f64::NAN, |(_, value)| value),
            );
            quantiles.push(quantile);
        }
        summary.set_quantile(quantiles);
        drop(state);

        let mut metric = Metric::default();
        metric.set_label(pairs);
        metric.set_summary(summary);
        metric
    }
}

impl Collector for SummaryVec {
    fn desc(&self) -> Vec<&Desc> {
        vec![&self.core.desc]
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let children: Vec<(Vec<String>, Arc<SummaryChild>)> = self
            .core
            .children
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();

        let mut family = MetricFamily::default();
        family.set_name(self.core.desc.fq_name.clone());
        family.set_help(self.core.desc.help.clone());
        family.set_field_type(MetricType::SUMMARY);
        for (values, child) in &children {
            family.mut_metric().push(self.metric_for(values, child));
        }
        vec![family]
    }
}
