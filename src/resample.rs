//! 44.1kHz to 48kHz conversion of single 20ms frames.
//!
//! Every call is independent: the kernel is reset before each frame and the
//! filter tail is flushed with a block of zeros, so no state carries over
//! between frames (or between tracks).

use crate::constants::{
    CHANNELS, INPUT_FRAME_BYTES, INPUT_FRAME_SAMPLES, INPUT_SAMPLE_RATE, OUTPUT_FRAME_BYTES,
    OUTPUT_FRAME_SAMPLES, OUTPUT_SAMPLE_RATE, SAMPLE_SIZE,
};
use anyhow::Result;
use byteorder::{ByteOrder, LittleEndian};
use itertools::Itertools;
use rubato::{FftFixedIn, Resampler as _};
use std::time::Instant;

/// Silent frames pushed through a fresh kernel so FFT planning and buffer
/// allocation happen before the first real frame.
const PREWARM_ROUNDS: usize = 3;

pub struct Resampler {
    inner: FftFixedIn<f64>,
    flush: Vec<Vec<f64>>,
}

impl Resampler {
    pub fn new() -> Result<Self> {
        let inner = FftFixedIn::<f64>::new(
            INPUT_SAMPLE_RATE as usize,
            OUTPUT_SAMPLE_RATE as usize,
            INPUT_FRAME_SAMPLES, // chunk size
            1,                   // sub-chunks
            CHANNELS,
        )?;

        let flush = vec![vec![0.0; inner.input_frames_next()]; CHANNELS];
        let mut resampler = Self { inner, flush };
        resampler.prewarm();

        Ok(resampler)
    }

    fn prewarm(&mut self) {
        let silence = vec![0u8; INPUT_FRAME_BYTES];
        for _ in 0..PREWARM_ROUNDS {
            self.process(&silence);
        }
    }

    /// Resamples one frame of s16le interleaved stereo at the input rate into
    /// exactly one frame at the output rate.
    ///
    /// Short input is zero padded. Never fails: a kernel error yields silence.
    pub fn process(&mut self, input: &[u8]) -> Vec<u8> {
        let chunk_len = self.inner.input_frames_next();

        let mut samples = vec![0i16; INPUT_FRAME_SAMPLES * CHANNELS];
        let n = input.len().min(INPUT_FRAME_BYTES) / SAMPLE_SIZE;
        LittleEndian::read_i16_into(&input[..n * SAMPLE_SIZE], &mut samples[..n]);

        let (mut left, mut right): (Vec<f64>, Vec<f64>) = samples
            .iter()
            .tuples()
            .map(|(l, r)| (*l as f64 / 32768.0, *r as f64 / 32768.0))
            .unzip();
        left.resize(chunk_len, 0.0);
        right.resize(chunk_len, 0.0);

        self.inner.reset();
        let delay = self.inner.output_delay();

        let output = self
            .inner
            .process(&[left, right], None)
            .and_then(|mut head| {
                // Push the filter tail out so the whole frame survives the delay
                let tail = self.inner.process(&self.flush, None)?;
                for (channel, rest) in head.iter_mut().zip(tail) {
                    channel.extend(rest);
                }
                Ok(head)
            });

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                warn!("Resampling error: {e}");
                return silence_frame();
            }
        };

        let mut interleaved = Vec::with_capacity(OUTPUT_FRAME_SAMPLES * CHANNELS);
        for i in delay..delay + OUTPUT_FRAME_SAMPLES {
            for channel in &output {
                let sample = channel.get(i).copied().unwrap_or(0.0);
                interleaved.push((sample * 32767.0).clamp(-32768.0, 32767.0) as i16);
            }
        }

        let mut bytes = vec![0u8; OUTPUT_FRAME_BYTES];
        LittleEndian::write_i16_into(&interleaved, &mut bytes);
        bytes
    }
}

/// One output-rate frame of zeros.
pub fn silence_frame() -> Vec<u8> {
    vec![0u8; OUTPUT_FRAME_BYTES]
}

/// Builds and throws away one kernel at startup so the first guild that
/// attaches a streaming source doesn't pay for the cold path.
pub fn prewarm() -> Result<()> {
    let started = Instant::now();
    let _ = Resampler::new()?;
    info!("Resampler pre-warmed in {:?}", started.elapsed());
    Ok(())
}
