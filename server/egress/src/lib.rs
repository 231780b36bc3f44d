//! Jitter buffer and egress pump (C7): absorbs bursty TTS delivery and
//! re-emits it as a steady 20 ms cadence, using a self-correcting
//! wall-clock scheduler so cumulative drift never builds up the way a
//! naive `sleep(20ms)` loop would (spec §4.7/§9).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use coach_audio::{align_int16, dc_highpass, samples_to_bytes, split_into_frames, DcFilterState};
use coach_dual::{DualConnectionManager, DualEvent};
use coach_router::GateState;

/// Start threshold: 400 ms of audio primed before playback begins.
pub const FRAMES_TO_BUFFER: usize = 20;
/// Once the agent has finished speaking, the DRAINING -> IDLE edge fires
/// as soon as the buffer falls to this many frames or fewer, rather than
/// waiting for a fully empty tail.
pub const MIN_BUFFER_FRAMES: usize = 5;
/// Silence tolerance before the pump deactivates: 300 ms of empty ticks.
pub const MAX_EMPTY_FRAMES: usize = 15;
const FRAME_DURATION: Duration = Duration::from_millis(20);

#[async_trait]
pub trait OutboundAudioSink: Send + Sync {
    /// Per spec §7, the egress path never throws; implementors log and
    /// drop on failure instead of propagating an error.
    async fn send_frame(&self, bytes: Bytes);
}

pub trait EgressMetrics: Send + Sync {
    fn inc_frame_emitted(&self) {}
    fn inc_underrun(&self) {}
    fn inc_buffer_primed(&self) {}
    fn inc_buffer_deactivated(&self) {}
}

pub struct NoopEgressMetrics;
impl EgressMetrics for NoopEgressMetrics {}

struct JitterBuffer {
    frames: VecDeque<Vec<i16>>,
}

impl JitterBuffer {
    fn new() -> Self {
        Self { frames: VecDeque::new() }
    }

    fn push_burst(&mut self, samples: &[i16]) {
        for frame in split_into_frames(samples) {
            self.frames.push_back(frame);
        }
    }

    fn pop(&mut self) -> Option<Vec<i16>> {
        self.frames.pop_front()
    }

    fn len(&self) -> usize {
        self.frames.len()
    }

    fn clear(&mut self) {
        self.frames.clear();
    }
}

/// Runs the egress pump to completion (until its upward event channel
/// closes). Spawn this as its own task; it owns the audio clock.
pub struct EgressPump {
    buffer: Mutex<JitterBuffer>,
    sink: Arc<dyn OutboundAudioSink>,
    gate: Arc<dyn GateState>,
    dual: DualConnectionManager,
    metrics: Arc<dyn EgressMetrics>,
    filter: Mutex<DcFilterState>,
    active: bool,
    started_at: Instant,
    frames_played: u32,
    empty_streak: usize,
    draining: bool,
}

impl EgressPump {
    pub fn new(
        sink: Arc<dyn OutboundAudioSink>,
        gate: Arc<dyn GateState>,
        dual: DualConnectionManager,
        metrics: Arc<dyn EgressMetrics>,
    ) -> Self {
        Self {
            buffer: Mutex::new(JitterBuffer::new()),
            sink,
            gate,
            dual,
            metrics,
            filter: Mutex::new(DcFilterState::default()),
            active: false,
            started_at: Instant::now(),
            frames_played: 0,
            empty_streak: 0,
            draining: false,
        }
    }

    /// Drives the buffer from the dual-connection manager's upward event
    /// stream until it closes (session teardown).
    pub async fn run(mut self, mut events_rx: mpsc::Receiver<DualEvent>) {
        loop {
            while let Ok(event) = events_rx.try_recv() {
                self.handle_event(event);
            }

            if !self.active {
                match events_rx.recv().await {
                    Some(event) => self.handle_event(event),
                    None => return,
                }
                self.maybe_activate();
                continue;
            }

            let expected =
                self.started_at + FRAME_DURATION * self.frames_played;
            let now = Instant::now();
            let sleep_for = expected
                .checked_duration_since(now)
                .unwrap_or(Duration::from_millis(1))
                .max(Duration::from_millis(1));

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {
                    self.tick().await;
                }
                event = events_rx.recv() => {
                    match event {
                        Some(e) => self.handle_event(e),
                        None => return,
                    }
                }
            }
        }
    }

    fn handle_event(&mut self, event: DualEvent) {
        match event {
            DualEvent::AiAudio(bytes) => self.ingest(&bytes),
            DualEvent::BargeIn => self.clear_and_deactivate("barge_in"),
            DualEvent::PauseStateChanged(true) => self.clear_and_deactivate("paused"),
            DualEvent::PauseStateChanged(false) => {}
            DualEvent::AgentSpeaking => {
                self.filter.lock().reset();
            }
            DualEvent::AgentDoneSpeaking => {
                self.draining = true;
            }
            DualEvent::Transcript(_) | DualEvent::GateEvent { .. } => {}
        }
    }

    fn ingest(&mut self, bytes: &Bytes) {
        if self.gate.is_paused() {
            return;
        }
        let samples = match align_int16(bytes) {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, "dropping unalignable ai_audio burst");
                return;
            }
        };
        self.buffer.lock().push_burst(&samples);
        if !self.active {
            self.maybe_activate();
        }
    }

    fn maybe_activate(&mut self) {
        if self.active || self.gate.is_paused() {
            return;
        }
        if self.buffer.lock().len() >= FRAMES_TO_BUFFER {
            self.active = true;
            self.started_at = Instant::now();
            self.frames_played = 0;
            self.empty_streak = 0;
            self.filter.lock().reset();
            self.metrics.inc_buffer_primed();
        }
    }

    async fn tick(&mut self) {
        let popped = self.buffer.lock().pop();
        match popped {
            Some(frame) => {
                let processed = {
                    let mut filter = self.filter.lock();
                    dc_highpass(&frame, &mut filter)
                };
                self.sink.send_frame(Bytes::from(samples_to_bytes(&processed))).await;
                self.frames_played += 1;
                self.empty_streak = 0;
                self.metrics.inc_frame_emitted();

                if self.draining {
                    let remaining = self.buffer.lock().len();
                    if remaining <= MIN_BUFFER_FRAMES {
                        self.dual.notify_buffer_drained();
                        self.draining = false;
                    }
                }
            }
            None => {
                self.frames_played += 1;
                self.empty_streak += 1;
                self.metrics.inc_underrun();
                if self.empty_streak >= MAX_EMPTY_FRAMES {
                    self.active = false;
                    self.metrics.inc_buffer_deactivated();
                    if self.draining {
                        self.dual.notify_buffer_drained();
                        self.draining = false;
                    }
                }
            }
        }
    }

    fn clear_and_deactivate(&mut self, reason: &'static str) {
        warn!(reason, "clearing egress buffer");
        self.buffer.lock().clear();
        self.active = false;
        self.draining = false;
        self.metrics.inc_buffer_deactivated();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_activates_at_frame_threshold() {
        let mut jb = JitterBuffer::new();
        let samples = vec![100i16; coach_audio::SAMPLES_PER_FRAME * (FRAMES_TO_BUFFER - 1)];
        jb.push_burst(&samples);
        assert_eq!(jb.len(), FRAMES_TO_BUFFER - 1);

        jb.push_burst(&vec![100i16; coach_audio::SAMPLES_PER_FRAME]);
        assert_eq!(jb.len(), FRAMES_TO_BUFFER);
    }

    #[test]
    fn clear_empties_buffer_immediately() {
        let mut jb = JitterBuffer::new();
        jb.push_burst(&vec![1i16; coach_audio::SAMPLES_PER_FRAME * 30]);
        assert_eq!(jb.len(), 30);
        jb.clear();
        assert_eq!(jb.len(), 0);
    }
}
