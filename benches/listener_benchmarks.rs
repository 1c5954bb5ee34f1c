use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use sigma_prometheus_listener::cache::ManualClock;
use sigma_prometheus_listener::config::ListenerConfig;
use sigma_prometheus_listener::event::{AssertionResult, SampleEvent, SampleResult};
use sigma_prometheus_listener::metrics::MetricNames;
use sigma_prometheus_listener::PrometheusListener;

fn listener(config: ListenerConfig) -> (PrometheusListener, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(0));
    let listener = PrometheusListener::with_clock(config.clone(), clock.clone())
        .expect("listener should build");
    listener.apply_config(config);
    (listener, clock)
}

fn bench_on_event(c: &mut Criterion) {
    let (listener, _) = listener(ListenerConfig::default());
    let event = SampleEvent::new(
        SampleResult::new("login", "200", true, 42)
            .with_assertion(AssertionResult::passed("status is 200")),
    )
    .with_active_threads(16);

    c.bench_function("on_event_hot_series", |b| {
        b.iter(|| listener.on_event(black_box(&event)))
    });
}

fn bench_extract_and_record(c: &mut Criterion) {
    let config = ListenerConfig {
        sample_variables: vec!["user".to_string(), "region".to_string()],
        ..ListenerConfig::default()
    };
    let (listener, _) = listener(config);
    let registry = listener.registry();
    let event = SampleEvent::new(SampleResult::new("checkout", "500", false, 120))
        .with_variables([Some("alice"), Some("eu")]);

    c.bench_function("extract_and_record_latency", |b| {
        b.iter(|| {
            let values = registry
                .extract(MetricNames::SAMPLES_LATENCY, &event, None)
                .unwrap();
            registry
                .record(MetricNames::SAMPLES_LATENCY, 120.0, black_box(&values))
                .unwrap();
        })
    });
}

fn bench_sweep(c: &mut Criterion) {
    let config = ListenerConfig {
        sample_variables: vec!["request_id".to_string()],
        ..ListenerConfig::default()
    };
    let (listener, clock) = listener(config);

    c.bench_function("sweep_1000_idle_series", |b| {
        b.iter(|| {
            for i in 0..1_000 {
                let event = SampleEvent::new(SampleResult::new("login", "200", true, 5))
                    .with_variables([Some(i.to_string())]);
                listener.on_event(&event);
            }
            clock.advance(2_000);
            black_box(listener.registry().sweep(Duration::from_millis(1_000)))
        })
    });
}

criterion_group!(benches, bench_on_event, bench_extract_and_record, bench_sweep);
criterion_main!(benches);
