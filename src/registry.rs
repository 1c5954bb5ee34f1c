//! Live collectors, keyed by metric name.
//!
//! Every managed metric is held as a binding: its definition, the collector
//! registered with the prometheus registry, the extractor for its schema and
//! (for labelled kinds) its own cardinality cache. Reconfiguring replaces all
//! bindings under the registry's write lock; recording and sweeping only take
//! the read lock, so they run concurrently with each other and synchronize
//! per series inside the collectors.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use prometheus::core::Collector;
use prometheus::proto::MetricFamily;
use prometheus::{CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};
use tracing::{debug, info, warn};

use crate::cache::{CardinalityCache, Clock, SystemClock};
use crate::error::ListenerError;
use crate::event::{AssertionResult, SampleEvent};
use crate::extract::{Extractor, LabelValues};
use crate::schema::LabelSchema;
use crate::summary::{SummaryVec, DEFAULT_QUANTILES};

/// Collector kind of a managed metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Summary,
    /// Unlabelled, overwritten on every record, never evicted
    Gauge,
}

impl MetricKind {
    pub fn is_evictable(&self) -> bool {
        !matches!(self, MetricKind::Gauge)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricDefinition {
    pub name: String,
    pub help: String,
    pub kind: MetricKind,
    pub schema: LabelSchema,
}

impl MetricDefinition {
    pub fn new(name: &str, help: &str, kind: MetricKind, schema: LabelSchema) -> Self {
        Self {
            name: name.to_string(),
            help: help.to_string(),
            kind,
            schema,
        }
    }
}

#[derive(Clone)]
enum LiveCollector {
    Counter(CounterVec),
    Summary(SummaryVec),
    Gauge(Gauge),
}

impl LiveCollector {
    fn build(name: &str, help: &str, kind: MetricKind, schema: &LabelSchema) -> Result<Self, ListenerError> {
        let names = schema.names();
        Ok(match kind {
            MetricKind::Counter => LiveCollector::Counter(CounterVec::new(Opts::new(name, help), &names)?),
            MetricKind::Summary => {
                LiveCollector::Summary(SummaryVec::new(name, help, &names, &DEFAULT_QUANTILES)?)
            }
            MetricKind::Gauge => LiveCollector::Gauge(Gauge::with_opts(Opts::new(name, help))?),
        })
    }

    fn boxed(&self) -> Box<dyn Collector> {
        match self {
            LiveCollector::Counter(c) => Box::new(c.clone()),
            LiveCollector::Summary(s) => Box::new(s.clone()),
            LiveCollector::Gauge(g) => Box::new(g.clone()),
        }
    }

    fn update(&self, value: f64, values: &[&str]) -> Result<(), ListenerError> {
        match self {
            LiveCollector::Counter(c) => c.get_metric_with_label_values(values)?.inc(),
            LiveCollector::Summary(s) => s.with_label_values(values)?.observe(value),
            LiveCollector::Gauge(g) => g.set(value),
        }
        Ok(())
    }

    fn remove(&self, values: &[&str]) -> bool {
        match self {
            LiveCollector::Counter(c) => c.remove_label_values(values).is_ok(),
            LiveCollector::Summary(s) => s.remove_label_values(values).unwrap_or(false),
            LiveCollector::Gauge(_) => false,
        }
    }

    fn series_count(&self) -> usize {
        match self {
            LiveCollector::Summary(s) => s.len(),
            other => other
                .boxed()
                .collect()
                .iter()
                .map(|family| family.get_metric().len())
                .sum(),
        }
    }
}

struct Binding {
    definition: MetricDefinition,
    collector: LiveCollector,
    extractor: Arc<Extractor>,
    cache: Option<CardinalityCache>,
    generation: u64,
}

impl Binding {
    fn evict_before(&self, cutoff_millis: i64) -> usize {
        let Some(cache) = &self.cache else {
            return 0;
        };
        cache.sweep(cutoff_millis, |key| {
            let values: Vec<&str> = key.iter().map(String::as_str).collect();
            if !self.collector.remove(&values) {
                debug!(metric = %self.definition.name, labels = ?key, "evicted label set had no live series");
            }
        })
    }
}

/// Process-scoped set of managed metrics on one prometheus registry.
pub struct CollectorRegistry {
    registry: Registry,
    bindings: RwLock<HashMap<String, Binding>>,
    generation: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl CollectorRegistry {
    pub fn new() -> Result<Self, ListenerError> {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Result<Self, ListenerError> {
        let registry = Registry::new();

        #[cfg(all(feature = "process", target_os = "linux"))]
        registry.register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        ))?;

        Ok(Self {
            registry,
            bindings: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
            clock,
        })
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Replace every managed metric with `definitions`.
    ///
    /// Previous collectors are unregistered and their caches dropped. A
    /// definition whose collector cannot be built with its schema is retried
    /// with an empty schema; one that still fails is skipped. Returns the
    /// number of metrics installed.
    pub fn reconfigure(&self, definitions: Vec<MetricDefinition>) -> usize {
        let mut bindings = self.bindings.write();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        for (name, old) in bindings.drain() {
            if let Err(e) = self.registry.unregister(old.collector.boxed()) {
                warn!(metric = %name, error = %e, "failed to unregister previous collector");
            }
        }

        for definition in definitions {
            let name = definition.name.clone();
            match self.install(definition, generation) {
                Ok(binding) => {
                    info!(metric = %name, labels = %binding.definition.schema, "metric installed");
                    bindings.insert(name, binding);
                }
                Err(e) => warn!(metric = %name, error = %e, "metric not installed"),
            }
        }

        bindings.len()
    }

    fn install(&self, mut definition: MetricDefinition, generation: u64) -> Result<Binding, ListenerError> {
        let collector = match LiveCollector::build(
            &definition.name,
            &definition.help,
            definition.kind,
            &definition.schema,
        ) {
            Ok(collector) => collector,
            Err(e) => {
                warn!(
                    metric = %definition.name,
                    labels = %definition.schema,
                    error = %e,
                    "label schema rejected, falling back to no labels"
                );
                definition.schema = LabelSchema::empty();
                LiveCollector::build(&definition.name, &definition.help, definition.kind, &definition.schema)?
            }
        };
        self.registry.register(collector.boxed())?;

        let cache = definition.kind.is_evictable().then(CardinalityCache::new);
        Ok(Binding {
            extractor: Arc::new(Extractor::new(&definition.schema, generation)),
            definition,
            collector,
            cache,
            generation,
        })
    }

    /// Label values for `event` against the live schema of `metric`.
    pub fn extract(
        &self,
        metric: &str,
        event: &SampleEvent,
        assertion: Option<&AssertionResult>,
    ) -> Result<LabelValues, ListenerError> {
        let extractor = {
            let bindings = self.bindings.read();
            let binding = bindings
                .get(metric)
                .ok_or_else(|| ListenerError::UnknownMetric(metric.to_string()))?;
            Arc::clone(&binding.extractor)
        };
        match assertion {
            Some(assertion) => extractor.extract_assertion(event, assertion),
            None => extractor.extract(event),
        }
    }

    /// Route one measurement to the child series for `values`.
    ///
    /// Counters increment, summaries observe `value`, the gauge is set to
    /// `value` and ignores `values`.
    pub fn record(&self, metric: &str, value: f64, values: &LabelValues) -> Result<(), ListenerError> {
        let bindings = self.bindings.read();
        let binding = bindings
            .get(metric)
            .ok_or_else(|| ListenerError::UnknownMetric(metric.to_string()))?;

        if binding.definition.kind == MetricKind::Gauge {
            return binding.collector.update(value, &[]);
        }

        let expected = binding.definition.schema.len();
        if values.len() != expected {
            return Err(ListenerError::SchemaMismatch {
                metric: metric.to_string(),
                expected,
                actual: values.len(),
            });
        }
        if values.generation().is_some_and(|g| g != binding.generation) {
            return Err(ListenerError::StaleLabels {
                metric: metric.to_string(),
            });
        }

        // stamp before updating so a concurrent sweep never removes a series
        // whose update is in flight
        if let Some(cache) = &binding.cache {
            cache.touch(values.values(), self.clock.now_millis());
        }
        binding.collector.update(value, &values.as_strs())
    }

    /// Evict every label set idle for longer than `ttl`, from each metric's
    /// own cache and collector. Returns the number evicted.
    pub fn sweep(&self, ttl: Duration) -> usize {
        let cutoff = self.clock.now_millis() - ttl.as_millis() as i64;
        let names: Vec<String> = self.bindings.read().keys().cloned().collect();

        let mut evicted = 0;
        for name in names {
            let bindings = self.bindings.read();
            if let Some(binding) = bindings.get(&name) {
                let n = binding.evict_before(cutoff);
                if n > 0 {
                    debug!(metric = %name, evicted = n, "swept idle label sets");
                }
                evicted += n;
            }
        }
        evicted
    }

    pub fn metric_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.bindings.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn definition(&self, metric: &str) -> Option<MetricDefinition> {
        self.bindings.read().get(metric).map(|b| b.definition.clone())
    }

    /// Number of live child series of `metric`.
    pub fn series_count(&self, metric: &str) -> Option<usize> {
        self.bindings
            .read()
            .get(metric)
            .map(|b| b.collector.series_count())
    }

    /// Number of cache entries of `metric`; `None` for unknown or unevictable metrics.
    pub fn cached_count(&self, metric: &str) -> Option<usize> {
        self.bindings
            .read()
            .get(metric)
            .and_then(|b| b.cache.as_ref().map(CardinalityCache::len))
    }

    pub fn gather(&self) -> Vec<MetricFamily> {
        self.registry.gather()
    }

    /// All registered metrics in the text exposition format.
    pub fn encode_text(&self) -> Result<String, ListenerError> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| ListenerError::Server(e.to_string()))
    }
}
