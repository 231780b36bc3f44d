use metrics::counter;

/// Metric names under: {ns}_router_*
pub struct RouterMetricsImpl {
    ns: &'static str,
}

impl RouterMetricsImpl {
    pub fn new(namespace: &'static str) -> Self {
        Self { ns: namespace }
    }

    #[inline]
    pub fn enqueued(&self) {
        counter!(format!("{}_router_enqueued_total", self.ns)).increment(1);
    }

    #[inline]
    pub fn evicted(&self) {
        counter!(format!("{}_router_evicted_total", self.ns)).increment(1);
    }

    #[inline]
    pub fn forwarded_transcription(&self) {
        counter!(format!("{}_router_forwarded_transcription_total", self.ns)).increment(1);
    }

    #[inline]
    pub fn forwarded_voice_agent(&self) {
        counter!(format!("{}_router_forwarded_voice_agent_total", self.ns)).increment(1);
    }

    #[inline]
    pub fn gated_out(&self) {
        counter!(format!("{}_router_gated_out_total", self.ns)).increment(1);
    }

    #[inline]
    pub fn sink_error(&self) {
        counter!(format!("{}_router_sink_errors_total", self.ns)).increment(1);
    }
}

/// Adapter implementing `coach_router::RouterMetrics`.
pub mod adapter {
    use super::RouterMetricsImpl;
    use coach_router::RouterMetrics;

    impl RouterMetrics for RouterMetricsImpl {
        fn inc_enqueued(&self) {
            self.enqueued();
        }
        fn inc_evicted(&self) {
            self.evicted();
        }
        fn inc_forwarded_transcription(&self) {
            self.forwarded_transcription();
        }
        fn inc_forwarded_voice_agent(&self) {
            self.forwarded_voice_agent();
        }
        fn inc_gated_out(&self) {
            self.gated_out();
        }
        fn inc_sink_error(&self) {
            self.sink_error();
        }
    }
}
