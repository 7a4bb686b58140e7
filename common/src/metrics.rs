use prometheus::{HistogramVec, IntCounterVec, histogram_opts, opts, register_histogram_vec, register_int_counter_vec};

/// Per-controller Prometheus metrics, registered once per resource kind
/// against the process-wide default registry.
#[derive(Clone)]
pub struct ControllerMetrics {
    pub reconcile_counter: IntCounterVec,
    pub action_counter: IntCounterVec,
    pub read_histogram: HistogramVec,
    pub write_histogram: HistogramVec,
}

impl ControllerMetrics {
    pub fn new(kind: &str) -> Self {
        let reconcile_counter = register_int_counter_vec!(
            opts!(
                format!("servicecatalog_{kind}_reconcile_total"),
                "Total number of reconcile invocations for this resource kind"
            ),
            &["name", "namespace"]
        )
        .expect("register reconcile counter");

        let action_counter = register_int_counter_vec!(
            opts!(
                format!("servicecatalog_{kind}_action_total"),
                "Total number of actions taken per resource, broken down by action kind"
            ),
            &["name", "namespace", "action"]
        )
        .expect("register action counter");

        let read_histogram = register_histogram_vec!(
            histogram_opts!(
                format!("servicecatalog_{kind}_read_phase_seconds"),
                "Time spent computing the next action for a resource"
            ),
            &["name", "namespace", "action"]
        )
        .expect("register read histogram");

        let write_histogram = register_histogram_vec!(
            histogram_opts!(
                format!("servicecatalog_{kind}_write_phase_seconds"),
                "Time spent executing the chosen action for a resource"
            ),
            &["name", "namespace", "action"]
        )
        .expect("register write histogram");

        Self {
            reconcile_counter,
            action_counter,
            read_histogram,
            write_histogram,
        }
    }
}
