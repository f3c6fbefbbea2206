//! Metrics for the control plane.
//!
//! Thin recording functions over the `metrics` facade. Without the
//! `prometheus` feature they compile to no-ops; installing an exporter is
//! the embedding application's concern.

#[cfg(feature = "prometheus")]
use metrics::{counter, histogram};

/// Record an admission outcome: `granted` or a denial kind.
pub fn record_admission(outcome: &str) {
    #[cfg(feature = "prometheus")]
    {
        counter!("praetor_admissions_total", "outcome" => outcome.to_string()).increment(1);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = outcome;
    }
}

/// Record a queue outcome counter bump.
pub fn record_queue_outcome(outcome: &str) {
    #[cfg(feature = "prometheus")]
    {
        counter!("praetor_queue_outcomes_total", "outcome" => outcome.to_string()).increment(1);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = outcome;
    }
}

/// Record a queue wait duration in seconds.
pub fn record_queue_wait(duration_secs: f64) {
    #[cfg(feature = "prometheus")]
    {
        histogram!("praetor_queue_wait_duration_seconds").record(duration_secs);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = duration_secs;
    }
}

/// Record a scheduler selection.
pub fn record_selection(category: &str, from_session: bool) {
    #[cfg(feature = "prometheus")]
    {
        counter!(
            "praetor_selections_total",
            "category" => category.to_string(),
            "from_session" => from_session.to_string(),
        )
        .increment(1);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (category, from_session);
    }
}

/// Record a dropped accounting event.
pub fn record_accounting_failure() {
    #[cfg(feature = "prometheus")]
    {
        counter!("praetor_accounting_failures_total").increment(1);
    }
}
