//! Integration tests for telemetry initialization and span helpers.

use crawlnode::model::JobId;

#[test]
fn telemetry_initializes_without_endpoint() {
    // A global subscriber can only be set once per process; a second
    // initialization returning Err is acceptable.
    let config = crawlnode::telemetry::TelemetryConfig {
        endpoint: None,
        service_name: "crawlnode-test".to_string(),
        node_id: "test-node".to_string(),
        log_level: "debug".to_string(),
    };
    let _guard = crawlnode::telemetry::init_telemetry(config);
}

#[test]
fn job_span_records_transitions_and_outcome() {
    let id = JobId::from("job-1");
    let span = crawlnode::telemetry::job::start_job_span("interactive", &id);
    crawlnode::telemetry::job::record_state_transition(&span, "queued", "spawning");
    crawlnode::telemetry::job::record_state_transition(&span, "spawning", "active");
    crawlnode::telemetry::job::record_outcome(&span, "timed_out");
}

#[test]
fn metric_instruments_build_without_a_provider() {
    use opentelemetry::KeyValue;

    crawlnode::telemetry::metrics::jobs_received().add(1, &[KeyValue::new("kind", "crawl")]);
    crawlnode::telemetry::metrics::worker_lifetime_ms()
        .record(12.5, &[KeyValue::new("class", "batch")]);
}

#[test]
fn second_initialization_is_refused() {
    let config = || crawlnode::telemetry::TelemetryConfig {
        endpoint: None,
        service_name: "crawlnode-test".to_string(),
        node_id: "test-node".to_string(),
        log_level: "info".to_string(),
    };
    // Whichever test got here first owns the global subscriber.
    let _first = crawlnode::telemetry::init_telemetry(config());
    assert!(crawlnode::telemetry::init_telemetry(config()).is_err());
}

#[test]
fn stderr_only_guard_drops_without_exporters() {
    drop(crawlnode::telemetry::TelemetryGuard::default());
}
