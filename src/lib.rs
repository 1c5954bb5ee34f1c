//! # sigma-prometheus-listener
//!
//! Prometheus exposition for the sample stream of a load test.
//! Every sample is turned into label values according to a configurable
//! schema and recorded in a latency summary, an assertion counter (or
//! summary) and a running-threads gauge. Label combinations that go idle are
//! evicted after a configurable TTL so a long run does not grow the registry
//! without bound.
//!
//! The host drives [`PrometheusListener`] through three hooks:
//! [`on_test_start`](PrometheusListener::on_test_start),
//! [`on_event`](PrometheusListener::on_event) and
//! [`on_test_end`](PrometheusListener::on_test_end). None of them return
//! errors or panic on metrics failures; problems are logged and the affected
//! sample is skipped. Hosts that do not install their own tracing subscriber
//! can call [`logging::init`].

pub mod cache;
pub mod config;
pub mod error;
pub mod event;
pub mod exporter;
pub mod extract;
pub mod janitor;
pub mod logging;
pub mod metrics;
pub mod registry;
pub mod schema;
pub mod summary;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::runtime::Runtime;
use tracing::{debug, error, info, warn};

use cache::{Clock, SystemClock};
use config::ListenerConfig;
use error::{ListenerError, Result};
use event::{AssertionResult, SampleEvent};
use exporter::MetricsServer;
use extract::LabelValues;
use janitor::Janitor;
use metrics::MetricNames;
use registry::{CollectorRegistry, MetricKind};

/// Lifecycle facade the host test engine talks to.
///
/// Owns the process-wide collector registry; the exposition endpoint and the
/// cache janitor live between `on_test_start` and `on_test_end`. The hooks
/// are synchronous and must not be called from inside an async runtime.
pub struct PrometheusListener {
    config: RwLock<ListenerConfig>,
    registry: Arc<CollectorRegistry>,
    running: Mutex<Option<Running>>,
    extraction_warned: AtomicBool,
}

struct Running {
    runtime: Runtime,
    server: Option<MetricsServer>,
    janitor: Option<Janitor>,
}

/// Per-metric state for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct MetricSnapshot {
    pub name: String,
    pub kind: MetricKind,
    pub labels: Vec<String>,
    pub series: usize,
    pub cached: Option<usize>,
}

/// Listener snapshot for export
#[derive(Debug, Clone, Serialize)]
pub struct ListenerSnapshot {
    pub running: bool,
    pub janitor_active: bool,
    pub endpoint: Option<String>,
    pub metrics: Vec<MetricSnapshot>,
}

impl PrometheusListener {
    pub fn new(config: ListenerConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Listener whose cache timestamps come from `clock`.
    pub fn with_clock(config: ListenerConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        Ok(Self {
            config: RwLock::new(config),
            registry: Arc::new(CollectorRegistry::with_clock(clock)?),
            running: Mutex::new(None),
            extraction_warned: AtomicBool::new(false),
        })
    }

    pub fn registry(&self) -> &Arc<CollectorRegistry> {
        &self.registry
    }

    pub fn config(&self) -> ListenerConfig {
        self.config.read().clone()
    }

    /// Apply configuration, rebuild the registry, start the janitor (when a
    /// TTL is set) and then the exposition endpoint.
    pub fn on_test_start(&self) {
        let mut running = self.running.lock();
        if running.is_some() {
            warn!("test start received while already running, ignoring");
            return;
        }

        let config = self.config();
        self.rebuild(&config);

        let runtime = match build_runtime(&config) {
            Ok(runtime) => runtime,
            Err(e) => {
                error!(error = %e, "couldn't start metrics runtime, metrics will not be served");
                return;
            }
        };

        let janitor = spawn_janitor(&self.registry, &config, &runtime);

        let server = match MetricsServer::start(Arc::clone(&self.registry), &config.server, runtime.handle()) {
            Ok(server) => Some(server),
            Err(e) => {
                error!(
                    host = %config.server.host,
                    port = config.server.port,
                    error = %e,
                    "couldn't start metrics endpoint"
                );
                None
            }
        };

        *running = Some(Running {
            runtime,
            server,
            janitor,
        });
        info!("prometheus listener started");
    }

    /// Stop the endpoint, then the janitor. The registry keeps its contents.
    pub fn on_test_end(&self) {
        let Some(Running {
            runtime,
            server,
            janitor,
        }) = self.running.lock().take()
        else {
            debug!("test end received while not running");
            return;
        };

        runtime.block_on(async {
            if let Some(server) = server {
                if let Err(e) = server.stop().await {
                    error!(error = %e, "couldn't stop metrics endpoint cleanly");
                }
            }
            if let Some(janitor) = janitor {
                janitor.stop().await;
            }
        });
        runtime.shutdown_timeout(Duration::from_secs(1));
        info!("prometheus listener stopped");
    }

    /// Replace the configuration. Takes effect immediately: the registry is
    /// rebuilt, and when running the janitor is restarted with the new TTL.
    pub fn apply_config(&self, config: ListenerConfig) {
        *self.config.write() = config.clone();
        self.rebuild(&config);

        let mut running = self.running.lock();
        if let Some(state) = running.as_mut() {
            if let Some(old) = state.janitor.take() {
                state.runtime.block_on(old.stop());
            }
            state.janitor = spawn_janitor(&self.registry, &config, &state.runtime);
        }
    }

    fn rebuild(&self, config: &ListenerConfig) {
        let installed = self.registry.reconfigure(metrics::definitions(config));
        self.extraction_warned.store(false, Ordering::Relaxed);
        debug!(installed, "registry reconfigured");
    }

    /// Record one completed sample and its assertions.
    pub fn on_event(&self, event: &SampleEvent) {
        debug!(label = %event.result.label, "sample occurred");
        let (save_threads, save_assertions) = {
            let config = self.config.read();
            (config.save.threads, config.save.assertions)
        };

        if let Err(e) = self.observe_sample(event) {
            self.report(MetricNames::SAMPLES_LATENCY, e);
        }

        if save_threads {
            let threads = event.active_threads as f64;
            if let Err(e) = self
                .registry
                .record(MetricNames::RUNNING_THREADS, threads, &LabelValues::empty())
            {
                self.report(MetricNames::RUNNING_THREADS, e);
            }
        }

        if save_assertions {
            for assertion in &event.result.assertions {
                if let Err(e) = self.observe_assertion(event, assertion) {
                    self.report(MetricNames::ASSERTIONS_TOTAL, e);
                }
            }
        }
    }

    fn observe_sample(&self, event: &SampleEvent) -> Result<()> {
        let values = self
            .registry
            .extract(MetricNames::SAMPLES_LATENCY, event, None)?;
        self.registry.record(
            MetricNames::SAMPLES_LATENCY,
            event.result.elapsed_ms as f64,
            &values,
        )
    }

    fn observe_assertion(
        &self,
        event: &SampleEvent,
        assertion: &AssertionResult,
    ) -> Result<()> {
        let values = self
            .registry
            .extract(MetricNames::ASSERTIONS_TOTAL, event, Some(assertion))?;
        self.registry.record(
            MetricNames::ASSERTIONS_TOTAL,
            event.result.elapsed_ms as f64,
            &values,
        )
    }

    fn report(&self, metric: &str, err: ListenerError) {
        match err {
            ListenerError::Extraction { .. } => {
                if !self.extraction_warned.swap(true, Ordering::Relaxed) {
                    warn!(metric, error = %err, "didn't update metric, sample skipped");
                } else {
                    debug!(metric, error = %err, "didn't update metric, sample skipped");
                }
            }
            ListenerError::SchemaMismatch { .. } | ListenerError::StaleLabels { .. } => {
                warn!(metric, error = %err, "label set raced a reconfigure, update dropped");
            }
            ListenerError::UnknownMetric(_) => {
                error!(metric, error = %err, "metric is not installed, update dropped");
            }
            _ => warn!(metric, error = %err, "didn't update metric"),
        }
    }

    /// Address the endpoint is bound to while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running
            .lock()
            .as_ref()
            .and_then(|r| r.server.as_ref().map(MetricsServer::local_addr))
    }

    pub fn snapshot(&self) -> ListenerSnapshot {
        let (running, janitor_active, endpoint) = {
            let guard = self.running.lock();
            match guard.as_ref() {
                Some(r) => (
                    true,
                    r.janitor.is_some(),
                    r.server.as_ref().map(|s| s.local_addr().to_string()),
                ),
                None => (false, false, None),
            }
        };

        let metrics = self
            .registry
            .metric_names()
            .into_iter()
            .filter_map(|name| {
                let definition = self.registry.definition(&name)?;
                Some(MetricSnapshot {
                    series: self.registry.series_count(&name).unwrap_or(0),
                    cached: self.registry.cached_count(&name),
                    kind: definition.kind,
                    labels: definition.schema.owned_names(),
                    name,
                })
            })
            .collect();

        ListenerSnapshot {
            running,
            janitor_active,
            endpoint,
            metrics,
        }
    }

    /// Snapshot as pretty-printed JSON.
    pub fn snapshot_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.snapshot())?)
    }
}

impl Drop for PrometheusListener {
    /// Signals the endpoint and janitor to stop without waiting for them,
    /// so dropping a running listener is safe from any context.
    fn drop(&mut self) {
        let Some(Running {
            runtime,
            server,
            janitor,
        }) = self.running.get_mut().take()
        else {
            return;
        };
        if let Some(server) = server {
            server.signal_stop();
        }
        if let Some(janitor) = janitor {
            janitor.signal_stop();
        }
        runtime.shutdown_background();
        debug!("prometheus listener dropped while running, runtime shut down in background");
    }
}

fn build_runtime(config: &ListenerConfig) -> std::io::Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.server.thread_min.max(1))
        .max_blocking_threads(config.server.thread_max.max(1))
        .thread_name("prometheus-exporter")
        .enable_all()
        .build()
}

fn spawn_janitor(
    registry: &Arc<CollectorRegistry>,
    config: &ListenerConfig,
    runtime: &Runtime,
) -> Option<Janitor> {
    config.cache_ttl_ms().map(|ttl| {
        Janitor::spawn(
            Arc::clone(registry),
            Duration::from_millis(ttl),
            runtime.handle(),
        )
    })
}
