//! Sample-rate and channel conversion.
//!
//! The capture paths normalise whatever the device granted (possibly 48 kHz
//! stereo on the `Default` ladder stage) down to the pipeline's fixed
//! 16 kHz mono before frames reach the encoder.  Capture runs through the
//! streaming [`StreamResampler`], which keeps interpolation phase across
//! driver callbacks; the output mixer uses the stateless [`resample`] on
//! whole decoded segments, folding the playback-rate factor into the ratio.

use crate::audio::encoder::TARGET_SAMPLE_RATE;

// ---------------------------------------------------------------------------
// downmix_to_mono
// ---------------------------------------------------------------------------

/// Mix interleaved multi-channel audio down to mono by averaging channels.
///
/// * `channels == 1` returns the input as an owned `Vec` (fast path).
/// * `channels == 0` returns an empty vector.
///
/// # Example
///
/// ```rust
/// use voice_bridge::audio::resample::downmix_to_mono;
///
/// let stereo = vec![0.5_f32, -0.5, 0.2, -0.2]; // L R L R
/// let mono = downmix_to_mono(&stereo, 2);
/// assert_eq!(mono.len(), 2);
/// assert!((mono[0]).abs() < 1e-6);
/// ```
pub fn downmix_to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    match channels {
        0 => Vec::new(),
        1 => samples.to_vec(),
        n => {
            let stride = usize::from(n);
            let gain = 1.0 / stride as f32;
            let mut mono = Vec::with_capacity(samples.len() / stride);
            for frame in samples.chunks_exact(stride) {
                mono.push(frame.iter().sum::<f32>() * gain);
            }
            mono
        }
    }
}

// ---------------------------------------------------------------------------
// resample
// ---------------------------------------------------------------------------

/// Resample `samples` from `source_rate` Hz to `target_rate` Hz using linear
/// interpolation.
///
/// Equal rates are a clone-and-return no-op; empty input yields empty
/// output.  The output length is approximately
/// `samples.len() * target_rate / source_rate`.
pub fn resample(samples: &[f32], source_rate: f64, target_rate: f64) -> Vec<f32> {
    if (source_rate - target_rate).abs() < f64::EPSILON {
        return samples.to_vec();
    }

    if samples.is_empty() || source_rate <= 0.0 || target_rate <= 0.0 {
        return Vec::new();
    }

    let step = source_rate / target_rate;
    let last = samples.len() - 1;
    let mut output = Vec::with_capacity((samples.len() as f64 / step).ceil() as usize);

    let mut pos = 0.0_f64;
    while pos < samples.len() as f64 {
        let idx = pos as usize;
        let sample = if idx < last {
            let frac = (pos - idx as f64) as f32;
            samples[idx] + (samples[idx + 1] - samples[idx]) * frac
        } else {
            // Tail positions past the final sample hold its value.
            samples[last]
        };
        output.push(sample);
        pos += step;
    }

    output
}

// ---------------------------------------------------------------------------
// StreamResampler
// ---------------------------------------------------------------------------

/// Streaming resampler for the capture paths.
///
/// Device callbacks deliver one continuous stream in arbitrary slices.
/// Resampling each slice with the stateless [`resample`] would restart the
/// interpolation phase at every boundary and, at fractional ratios, emit
/// surplus samples per slice — enough to make outbound durations drift from
/// wall-clock time.  This form carries the fractional read position and the
/// previous slice's final sample across calls, so chunked input yields the
/// same output as one contiguous buffer.
pub struct StreamResampler {
    /// Source samples consumed per output sample.
    step: f64,
    /// Read position relative to `carry` (index 0 when a carry exists).
    pos: f64,
    carry: Option<f32>,
}

impl StreamResampler {
    pub fn new(source_rate: f64, target_rate: f64) -> Self {
        Self {
            step: source_rate / target_rate,
            pos: 0.0,
            carry: None,
        }
    }

    /// Resampler onto the pipeline's fixed 16 kHz capture rate.
    pub fn to_16k(source_rate: u32) -> Self {
        Self::new(f64::from(source_rate), f64::from(TARGET_SAMPLE_RATE))
    }

    /// Feed the next slice of the stream, collecting the output samples it
    /// completes.  A sample landing exactly on the slice's final input
    /// position is held back one call so it can interpolate forward.
    pub fn push(&mut self, input: &[f32]) -> Vec<f32> {
        if input.is_empty() || !self.step.is_finite() || self.step <= 0.0 {
            return Vec::new();
        }
        // Unity ratio never accrues phase; pass the slice straight through.
        if self.step == 1.0 && self.carry.is_none() {
            return input.to_vec();
        }

        let carry = self.carry;
        let carried = usize::from(carry.is_some());
        let len = input.len() + carried;
        let at = |i: usize| -> f32 {
            match (carry, i) {
                (Some(held), 0) => held,
                _ => input[i - carried],
            }
        };

        let mut output = Vec::with_capacity((input.len() as f64 / self.step) as usize + 1);
        let mut pos = self.pos;
        while (pos as usize) + 1 < len {
            let idx = pos as usize;
            let frac = (pos - idx as f64) as f32;
            let a = at(idx);
            let b = at(idx + 1);
            output.push(a + (b - a) * frac);
            pos += self.step;
        }

        // Rebase onto the final input sample so the next slice continues
        // exactly where this one left off.
        self.carry = Some(at(len - 1));
        self.pos = pos - (len - 1) as f64;
        output
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // ---- downmix_to_mono ---------------------------------------------------

    #[test]
    fn mono_passthrough() {
        let input = vec![0.1_f32, 0.2, 0.3];
        assert_eq!(downmix_to_mono(&input, 1), input);
    }

    #[test]
    fn stereo_averaging() {
        let input = vec![1.0_f32, -1.0, 0.5, 0.5];
        let out = downmix_to_mono(&input, 2);
        assert_eq!(out.len(), 2);
        assert!((out[0]).abs() < 1e-6);
        assert!((out[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn zero_channels_yields_empty() {
        assert!(downmix_to_mono(&[1.0_f32, 2.0], 0).is_empty());
    }

    // ---- resample ----------------------------------------------------------

    #[test]
    fn equal_rates_are_a_noop() {
        let input: Vec<f32> = (0..160).map(|i| i as f32 / 160.0).collect();
        let out = resample(&input, 16_000.0, 16_000.0);
        assert_eq!(out, input);
    }

    #[test]
    fn empty_input_yields_empty() {
        assert!(resample(&[], 48_000.0, 16_000.0).is_empty());
    }

    #[test]
    fn downsample_48k_to_16k_length() {
        // 480 samples @ 48 kHz = 10 ms → 160 samples @ 16 kHz
        let out = resample(&vec![0.5_f32; 480], 48_000.0, 16_000.0);
        assert_eq!(out.len(), 160);
    }

    #[test]
    fn upsample_8k_to_16k_length() {
        let out = resample(&vec![0.0_f32; 80], 8_000.0, 16_000.0);
        assert_eq!(out.len(), 160);
    }

    #[test]
    fn dc_signal_amplitude_preserved() {
        let out = resample(&vec![0.5_f32; 480], 48_000.0, 16_000.0);
        for &s in &out {
            assert!((s - 0.5).abs() < 1e-5, "amplitude drift: {s}");
        }
    }

    #[test]
    fn fractional_ratio_for_playback_rate() {
        // Playing 24 kHz audio at rate 1.5 on a 48 kHz device:
        // effective source rate 36 kHz → 4/3 of the input length.
        let out = resample(&vec![0.25_f32; 360], 24_000.0 * 1.5, 48_000.0);
        assert_eq!(out.len(), 480);
    }

    // ---- StreamResampler ---------------------------------------------------

    #[test]
    fn chunked_input_matches_contiguous_output() {
        let ramp: Vec<f32> = (0..960).map(|i| i as f32 / 960.0).collect();

        let mut whole = StreamResampler::new(44_100.0, 16_000.0);
        let expected = whole.push(&ramp);

        let mut chunked = StreamResampler::new(44_100.0, 16_000.0);
        let mut got = Vec::new();
        for slice in ramp.chunks(96) {
            got.extend(chunked.push(slice));
        }

        assert_eq!(got.len(), expected.len());
        for (g, e) in got.iter().zip(&expected) {
            assert!((g - e).abs() < 1e-6, "{g} vs {e}");
        }
    }

    #[test]
    fn fractional_ratio_emits_the_true_sample_count() {
        // 100 driver buffers of 480 samples at 44.1 kHz.  Per-buffer
        // resampling would emit 175 each (17 500 total); the continuous
        // stream holds 48 000 source samples, worth ~17 415 at 16 kHz.
        let mut resampler = StreamResampler::to_16k(44_100);
        let buffer = vec![0.25_f32; 480];

        let total: usize = (0..100).map(|_| resampler.push(&buffer).len()).sum();

        let ideal = (100.0 * 480.0 * 16_000.0 / 44_100.0) as i64;
        assert!(
            (total as i64 - ideal).abs() <= 1,
            "emitted {total}, ideal {ideal}"
        );
    }

    #[test]
    fn no_phase_reset_at_buffer_boundaries() {
        // A strictly increasing ramp must stay strictly increasing through
        // the resampler; a phase reset would repeat values at slice edges.
        let ramp: Vec<f32> = (0..4800).map(|i| i as f32).collect();
        let mut resampler = StreamResampler::new(44_100.0, 16_000.0);

        let mut out = Vec::new();
        for slice in ramp.chunks(480) {
            out.extend(resampler.push(slice));
        }

        assert!(out.len() > 1000);
        for pair in out.windows(2) {
            assert!(pair[1] > pair[0], "{} then {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn unity_ratio_is_a_passthrough() {
        let mut resampler = StreamResampler::new(16_000.0, 16_000.0);
        assert_eq!(resampler.push(&[0.1, 0.2]), vec![0.1, 0.2]);
        assert_eq!(resampler.push(&[0.3]), vec![0.3]);
    }
}
