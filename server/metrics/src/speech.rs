use metrics::counter;

use crate::labels::LabelPolicy;

/// Metric names under: {ns}_speech_*, labeled by link ("voice_agent" | "transcription").
pub struct SpeechMetricsImpl {
    ns: &'static str,
    policy: LabelPolicy,
}

impl SpeechMetricsImpl {
    pub fn new(namespace: &'static str, policy: LabelPolicy) -> Self {
        Self { ns: namespace, policy }
    }

    #[inline]
    pub fn reconnect(&self, link: &'static str) {
        counter!(
            format!("{}_speech_reconnects_total", self.ns),
            "link" => self.policy.link(link).as_str().to_string()
        )
        .increment(1);
    }

    #[inline]
    pub fn connect_failure(&self, link: &'static str) {
        counter!(
            format!("{}_speech_connect_failures_total", self.ns),
            "link" => self.policy.link(link).as_str().to_string()
        )
        .increment(1);
    }

    #[inline]
    pub fn provider_error(&self, link: &'static str) {
        counter!(
            format!("{}_speech_provider_errors_total", self.ns),
            "link" => self.policy.link(link).as_str().to_string()
        )
        .increment(1);
    }

    #[inline]
    pub fn audio_sent(&self, link: &'static str) {
        counter!(
            format!("{}_speech_audio_sent_total", self.ns),
            "link" => self.policy.link(link).as_str().to_string()
        )
        .increment(1);
    }

    #[inline]
    pub fn audio_received(&self, link: &'static str) {
        counter!(
            format!("{}_speech_audio_received_total", self.ns),
            "link" => self.policy.link(link).as_str().to_string()
        )
        .increment(1);
    }
}

/// Adapter implementing `coach_speech::SpeechMetrics`.
pub mod adapter {
    use super::SpeechMetricsImpl;
    use coach_speech::SpeechMetrics;

    impl SpeechMetrics for SpeechMetricsImpl {
        fn inc_reconnect(&self, link: &'static str) {
            self.reconnect(link);
        }
        fn inc_connect_failure(&self, link: &'static str) {
            self.connect_failure(link);
        }
        fn inc_provider_error(&self, link: &'static str) {
            self.provider_error(link);
        }
        fn inc_audio_sent(&self, link: &'static str) {
            self.audio_sent(link);
        }
        fn inc_audio_received(&self, link: &'static str) {
            self.audio_received(link);
        }
    }
}
