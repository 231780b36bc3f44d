//! Frame codec and DSP kernels shared by the ingress router and the egress
//! jitter pump.
//!
//! Everything here is synchronous and allocation-light by design: this code
//! runs on the hot audio path (per incoming/outgoing frame), so it must never
//! block and must never panic on malformed input.

use thiserror::Error;
use tracing::debug;

/// Provider and conferencing-SDK audio is fixed at 24 kHz mono, 20 ms frames.
pub const SAMPLE_RATE_HZ: u32 = 24_000;
pub const FRAME_DURATION_MS: u64 = 20;
pub const SAMPLES_PER_FRAME: usize = 480;

/// First-order DC-blocking IIR coefficient (~10 Hz cutoff at 24 kHz).
pub const DC_ALPHA: f32 = 0.995;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AudioError {
    /// Alignment produced zero samples (frame was empty or a single trailing
    /// byte). Callers must drop the frame and must not treat this as a fault.
    #[error("frame is empty after int16 alignment")]
    BadAlignment,
}

pub type AudioResult<T> = Result<T, AudioError>;

/// Truncates an odd trailing byte and reinterprets the remainder as
/// little-endian signed 16-bit samples.
pub fn align_int16(bytes: &[u8]) -> AudioResult<Vec<i16>> {
    let usable = bytes.len() - (bytes.len() % 2);
    if usable == 0 {
        debug!(len = bytes.len(), "dropping frame with no usable int16 samples");
        return Err(AudioError::BadAlignment);
    }
    let mut samples = Vec::with_capacity(usable / 2);
    for chunk in bytes[..usable].chunks_exact(2) {
        samples.push(i16::from_le_bytes([chunk[0], chunk[1]]));
    }
    Ok(samples)
}

/// Inverse of [`align_int16`]: little-endian bytes for a sample slice.
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    bytes
}

/// DC-blocking filter state, threaded across frames for a single AI response
/// and reset at response boundaries (spec I6).
#[derive(Debug, Clone, Copy, Default)]
pub struct DcFilterState {
    prev_in: f32,
    prev_out: f32,
}

impl DcFilterState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// First-order IIR DC blocker: `y[n] = alpha * (y[n-1] + x[n] - x[n-1])`.
/// Output is clamped to the signed-16 range.
pub fn dc_highpass(samples: &[i16], state: &mut DcFilterState) -> Vec<i16> {
    let mut out = Vec::with_capacity(samples.len());
    for &s in samples {
        let x = s as f32;
        let y = DC_ALPHA * (state.prev_out + x - state.prev_in);
        state.prev_in = x;
        state.prev_out = y;
        out.push(y.clamp(i16::MIN as f32, i16::MAX as f32) as i16);
    }
    out
}

/// Non-essential diagnostics used only for warnings/metrics, never for
/// correctness decisions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameDiagnostics {
    pub peak: i16,
    pub dc_mean: f32,
}

pub fn compute_frame_diagnostics(samples: &[i16]) -> FrameDiagnostics {
    if samples.is_empty() {
        return FrameDiagnostics { peak: 0, dc_mean: 0.0 };
    }
    let peak = samples.iter().map(|s| s.unsigned_abs()).max().unwrap_or(0);
    let sum: i64 = samples.iter().map(|&s| s as i64).sum();
    let dc_mean = sum as f32 / samples.len() as f32;
    FrameDiagnostics { peak: peak.min(i16::MAX as u16) as i16, dc_mean }
}

/// Splits an arbitrarily-sized burst of samples into fixed `SAMPLES_PER_FRAME`
/// units, per spec §4.7 step 1 ("the burst may be any number of 20 ms frames
/// concatenated; split them into 480-sample units"). A trailing partial frame
/// is zero-padded so every unit downstream has a uniform length.
pub fn split_into_frames(samples: &[i16]) -> Vec<Vec<i16>> {
    if samples.is_empty() {
        return Vec::new();
    }
    samples
        .chunks(SAMPLES_PER_FRAME)
        .map(|chunk| {
            if chunk.len() == SAMPLES_PER_FRAME {
                chunk.to_vec()
            } else {
                let mut padded = chunk.to_vec();
                padded.resize(SAMPLES_PER_FRAME, 0);
                padded
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_drops_odd_trailing_byte() {
        let bytes = [0x01, 0x00, 0x02, 0x00, 0xFF];
        let samples = align_int16(&bytes).unwrap();
        assert_eq!(samples, vec![1, 2]);
    }

    #[test]
    fn align_empty_is_bad_alignment() {
        assert_eq!(align_int16(&[]), Err(AudioError::BadAlignment));
        assert_eq!(align_int16(&[0xFF]), Err(AudioError::BadAlignment));
    }

    #[test]
    fn align_round_trip() {
        let original = vec![1i16, -2, 32767, -32768, 0];
        let bytes = samples_to_bytes(&original);
        let back = align_int16(&bytes).unwrap();
        assert_eq!(back, original);
        // align_int16(align_int16(x).as_bytes()) == align_int16(x)
        let bytes2 = samples_to_bytes(&back);
        let back2 = align_int16(&bytes2).unwrap();
        assert_eq!(back, back2);
    }

    #[test]
    fn dc_highpass_converges_on_constant_input() {
        let mut state = DcFilterState::default();
        let input = vec![1000i16; 4000];
        let mut last_mean = f32::MAX;
        for chunk in input.chunks(SAMPLES_PER_FRAME) {
            let out = dc_highpass(chunk, &mut state);
            let mean: f32 = out.iter().map(|&s| s as f32).sum::<f32>() / out.len() as f32;
            last_mean = mean.abs();
        }
        assert!(last_mean < 5.0, "expected near-zero mean, got {last_mean}");
    }

    #[test]
    fn dc_highpass_converges_within_2000_samples() {
        let mut state = DcFilterState::default();
        let input = vec![2000i16; 2000];
        let out = dc_highpass(&input, &mut state);
        let tail_mean: f32 =
            out[out.len() - 100..].iter().map(|&s| s as f32).sum::<f32>() / 100.0;
        assert!(tail_mean.abs() < 5.0, "tail mean {tail_mean}");
    }

    #[test]
    fn split_into_frames_pads_trailing_partial() {
        let samples = vec![1i16; SAMPLES_PER_FRAME + 10];
        let frames = split_into_frames(&samples);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].len(), SAMPLES_PER_FRAME);
        assert_eq!(frames[1].len(), SAMPLES_PER_FRAME);
        assert_eq!(frames[1][10], 0);
    }

    #[test]
    fn diagnostics_on_silence() {
        let d = compute_frame_diagnostics(&[0; 480]);
        assert_eq!(d.peak, 0);
        assert_eq!(d.dc_mean, 0.0);
    }
}
