use metrics::counter;

/// Metric names under: {ns}_session_*. Not trait-bound; coach-supervisor
/// calls these directly around persistence and grace-timer edges.
pub struct SessionMetricsImpl {
    ns: &'static str,
}

impl SessionMetricsImpl {
    pub fn new(namespace: &'static str) -> Self {
        Self { ns: namespace }
    }

    #[inline]
    pub fn persistence_retry_buffered(&self) {
        counter!(format!("{}_session_persistence_buffered_total", self.ns)).increment(1);
    }

    #[inline]
    pub fn persistence_retry_dropped(&self) {
        counter!(format!("{}_session_persistence_dropped_total", self.ns)).increment(1);
    }

    #[inline]
    pub fn grace_timer_started(&self) {
        counter!(format!("{}_session_grace_timer_started_total", self.ns)).increment(1);
    }

    #[inline]
    pub fn grace_timer_elapsed(&self) {
        counter!(format!("{}_session_grace_timer_elapsed_total", self.ns)).increment(1);
    }
}
