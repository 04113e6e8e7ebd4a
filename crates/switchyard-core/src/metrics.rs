//! Recording helpers over the `metrics` facade.
//!
//! The library never installs a recorder; with none installed every call here is a no-op.
//! Service and consumer names are interned so the hot path does not allocate label strings.

use crate::types::RegulationState;
use dashmap::DashMap;
use metrics::{counter, gauge, histogram};
use std::{borrow::Cow, sync::OnceLock, time::Duration};

static NAME_POOL: OnceLock<DashMap<String, &'static str>> = OnceLock::new();

/// Names come from configuration, so the pool is bounded by the number of configured consumers.
#[inline]
fn name_to_static(name: &str) -> Cow<'static, str> {
    let pool = NAME_POOL.get_or_init(DashMap::new);

    if let Some(interned) = pool.get(name) {
        return Cow::Borrowed(*interned);
    }

    let owned = name.to_string();
    let leaked: &'static str = Box::leak(owned.clone().into_boxed_str());
    pool.insert(owned, leaked);
    Cow::Borrowed(leaked)
}

/// One finished call, labelled by outcome (`ok` or an error kind).
pub fn record_invocation(service: &str, outcome: &'static str, elapsed: Duration) {
    let service = name_to_static(service);
    counter!("switchyard_invocations_total", "service" => service.clone(), "outcome" => outcome)
        .increment(1);
    histogram!("switchyard_call_duration_seconds", "service" => service).record(elapsed.as_secs_f64());
}

pub fn record_route_failure(service: &str) {
    counter!("switchyard_route_failures_total", "service" => name_to_static(service)).increment(1);
}

pub fn record_retry(service: &str) {
    counter!("switchyard_retries_total", "service" => name_to_static(service)).increment(1);
}

pub fn record_late_response(service: &str) {
    counter!("switchyard_late_responses_total", "service" => name_to_static(service)).increment(1);
}

pub fn record_dial(success: bool) {
    let outcome = if success { "ok" } else { "error" };
    counter!("switchyard_connection_dials_total", "outcome" => outcome).increment(1);
}

pub fn record_active_connections(consumer: &str, count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("switchyard_connections_active", "consumer" => name_to_static(consumer)).set(count as f64);
}

pub fn record_regulation_transition(from: RegulationState, to: RegulationState) {
    counter!(
        "switchyard_regulation_transitions_total",
        "from" => from.as_str(),
        "to" => to.as_str()
    )
    .increment(1);
}

pub fn record_regulated_endpoints(consumer: &str, count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("switchyard_regulated_endpoints", "consumer" => name_to_static(consumer)).set(count as f64);
}
