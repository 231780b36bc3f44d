use metrics::counter;

/// Metric names under: {ns}_egress_*
pub struct EgressMetricsImpl {
    ns: &'static str,
}

impl EgressMetricsImpl {
    pub fn new(namespace: &'static str) -> Self {
        Self { ns: namespace }
    }

    #[inline]
    pub fn frame_emitted(&self) {
        counter!(format!("{}_egress_frames_emitted_total", self.ns)).increment(1);
    }

    #[inline]
    pub fn underrun(&self) {
        counter!(format!("{}_egress_underruns_total", self.ns)).increment(1);
    }

    #[inline]
    pub fn buffer_primed(&self) {
        counter!(format!("{}_egress_buffer_primed_total", self.ns)).increment(1);
    }

    #[inline]
    pub fn buffer_deactivated(&self) {
        counter!(format!("{}_egress_buffer_deactivated_total", self.ns)).increment(1);
    }
}

/// Adapter implementing `coach_egress::EgressMetrics`.
pub mod adapter {
    use super::EgressMetricsImpl;
    use coach_egress::EgressMetrics;

    impl EgressMetrics for EgressMetricsImpl {
        fn inc_frame_emitted(&self) {
            self.frame_emitted();
        }
        fn inc_underrun(&self) {
            self.underrun();
        }
        fn inc_buffer_primed(&self) {
            self.buffer_primed();
        }
        fn inc_buffer_deactivated(&self) {
            self.buffer_deactivated();
        }
    }
}
