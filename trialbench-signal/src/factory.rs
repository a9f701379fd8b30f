//! Pull-based waveform generators.
//!
//! Every factory keeps its own offset, so successive `next` calls continue
//! where the previous one stopped. A parent always asks each of its inputs
//! for exactly the number of samples it was asked for.

use crate::calibration::Calibration;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::f64::consts::PI;
use std::sync::Arc;

/// Frequency used to look up the level of broadband signals.
pub const BROADBAND_REFERENCE_HZ: f64 = 1000.0;

pub trait WaveformFactory: Send {
    /// Exactly `n` samples, continuing from the previous call.
    fn next(&mut self, n: usize) -> Vec<f64>;

    /// Samples left before the waveform is complete. `None` for signals
    /// that never end.
    fn get_remaining_samples(&self) -> Option<u64>;

    /// Total duration in seconds.
    fn get_duration(&self) -> f64 {
        f64::INFINITY
    }

    fn is_complete(&self) -> bool {
        self.get_remaining_samples() == Some(0)
    }

    /// Back to the first sample.
    fn reset(&mut self);

    fn clone_box(&self) -> Box<dyn WaveformFactory>;
}

impl Clone for Box<dyn WaveformFactory> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Pure tone. Phase is in radians.
#[derive(Debug, Clone, PartialEq)]
pub struct Tone {
    fs: f64,
    frequency: f64,
    phase: f64,
    sf: f64,
    offset: u64,
}

impl Tone {
    pub fn new(
        fs: f64,
        level: f64,
        frequency: f64,
        phase: f64,
        polarity: f64,
        calibration: &dyn Calibration,
    ) -> Self {
        let sf = calibration.get_sf(frequency, level) * polarity;
        Self {
            fs,
            frequency,
            phase,
            sf,
            offset: 0,
        }
    }
}

impl WaveformFactory for Tone {
    fn next(&mut self, n: usize) -> Vec<f64> {
        let omega = 2.0 * PI * self.frequency;
        let out = (0..n as u64)
            .map(|i| {
                let t = (self.offset + i) as f64 / self.fs;
                self.sf * (omega * t + self.phase).sin()
            })
            .collect();
        self.offset += n as u64;
        out
    }

    fn get_remaining_samples(&self) -> Option<u64> {
        None
    }

    fn reset(&mut self) {
        self.offset = 0;
    }

    fn clone_box(&self) -> Box<dyn WaveformFactory> {
        Box::new(self.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Silence {
    pub fill_value: f64,
}

impl WaveformFactory for Silence {
    fn next(&mut self, n: usize) -> Vec<f64> {
        vec![self.fill_value; n]
    }

    fn get_remaining_samples(&self) -> Option<u64> {
        None
    }

    fn reset(&mut self) {}

    fn clone_box(&self) -> Box<dyn WaveformFactory> {
        Box::new(*self)
    }
}

/// Gaussian white noise. The same seed always gives the same samples.
#[derive(Debug, Clone)]
pub struct BroadbandNoise {
    sf: f64,
    seed: u64,
    rng: StdRng,
}

impl BroadbandNoise {
    pub fn new(level: f64, seed: u64, calibration: &dyn Calibration) -> Self {
        Self {
            sf: calibration.get_sf(BROADBAND_REFERENCE_HZ, level),
            seed,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl WaveformFactory for BroadbandNoise {
    fn next(&mut self, n: usize) -> Vec<f64> {
        (0..n)
            .map(|_| {
                let z: f64 = self.rng.sample(StandardNormal);
                self.sf * z
            })
            .collect()
    }

    fn get_remaining_samples(&self) -> Option<u64> {
        None
    }

    fn reset(&mut self) {
        self.rng = StdRng::seed_from_u64(self.seed);
    }

    fn clone_box(&self) -> Box<dyn WaveformFactory> {
        Box::new(self.clone())
    }
}

/// Plays back a fixed block of samples, then zeros.
#[derive(Debug, Clone)]
pub struct Recorded {
    fs: f64,
    samples: Arc<[f64]>,
    position: usize,
}

impl Recorded {
    pub fn new(fs: f64, samples: Arc<[f64]>) -> Self {
        Self {
            fs,
            samples,
            position: 0,
        }
    }
}

impl WaveformFactory for Recorded {
    fn next(&mut self, n: usize) -> Vec<f64> {
        let end = (self.position + n).min(self.samples.len());
        let mut out = self.samples[self.position..end].to_vec();
        out.resize(n, 0.0);
        self.position = end;
        out
    }

    fn get_remaining_samples(&self) -> Option<u64> {
        Some((self.samples.len() - self.position) as u64)
    }

    fn get_duration(&self) -> f64 {
        self.samples.len() as f64 / self.fs
    }

    fn reset(&mut self) {
        self.position = 0;
    }

    fn clone_box(&self) -> Box<dyn WaveformFactory> {
        Box::new(self.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Pass {
    High,
    Low,
}

/// Direct form I biquad with Butterworth Q.
#[derive(Debug, Clone, PartialEq)]
struct SecondOrderSection {
    a: [f64; 3],
    b: [f64; 3],
    x: [f64; 2],
    y: [f64; 2],
}

impl SecondOrderSection {
    fn new(f0: f64, fs: f64, pass: Pass) -> Self {
        let q = (2.0f64).sqrt() / 2.0;
        let omega = 2.0 * PI * f0 / fs;
        let alpha = omega.sin() / (2.0 * q);
        let cos = omega.cos();
        let b = match pass {
            Pass::High => [(1.0 + cos) / 2.0, -(1.0 + cos), (1.0 + cos) / 2.0],
            Pass::Low => [(1.0 - cos) / 2.0, 1.0 - cos, (1.0 - cos) / 2.0],
        };
        Self {
            a: [1.0 + alpha, -2.0 * cos, 1.0 - alpha],
            b,
            x: [0.0; 2],
            y: [0.0; 2],
        }
    }

    fn calculate_output(&mut self, input: f64) -> f64 {
        let output = (self.b[0] * input + self.b[1] * self.x[0] + self.b[2] * self.x[1]
            - self.a[1] * self.y[0]
            - self.a[2] * self.y[1])
            / self.a[0];
        self.x = [input, self.x[0]];
        self.y = [output, self.y[0]];
        output
    }

    fn clear(&mut self) {
        self.x = [0.0; 2];
        self.y = [0.0; 2];
    }
}

/// High-pass at `fl` followed by low-pass at `fh`. Filter state carries
/// across calls.
#[derive(Clone)]
pub struct BandpassFilter {
    high_pass: SecondOrderSection,
    low_pass: SecondOrderSection,
    input: Box<dyn WaveformFactory>,
}

impl BandpassFilter {
    pub fn new(fs: f64, fl: f64, fh: f64, input: Box<dyn WaveformFactory>) -> Self {
        Self {
            high_pass: SecondOrderSection::new(fl, fs, Pass::High),
            low_pass: SecondOrderSection::new(fh, fs, Pass::Low),
            input,
        }
    }
}

impl WaveformFactory for BandpassFilter {
    fn next(&mut self, n: usize) -> Vec<f64> {
        let mut samples = self.input.next(n);
        for s in samples.iter_mut() {
            let high = self.high_pass.calculate_output(*s);
            *s = self.low_pass.calculate_output(high);
        }
        samples
    }

    fn get_remaining_samples(&self) -> Option<u64> {
        self.input.get_remaining_samples()
    }

    fn get_duration(&self) -> f64 {
        self.input.get_duration()
    }

    fn reset(&mut self) {
        self.high_pass.clear();
        self.low_pass.clear();
        self.input.reset();
    }

    fn clone_box(&self) -> Box<dyn WaveformFactory> {
        Box::new(self.clone())
    }
}

/// Gates its input with a cos² ramp.
///
/// Over `[start_time, start_time + rise_time)` the envelope rises as
/// `sin²`, stays at 1 until `start_time + duration - rise_time`, then falls
/// as the mirror image. Outside `[start_time, start_time + duration)` it is
/// exactly zero.
#[derive(Clone)]
pub struct Cos2Envelope {
    fs: f64,
    start_time: f64,
    rise_time: f64,
    duration: f64,
    offset: u64,
    input: Box<dyn WaveformFactory>,
}

impl Cos2Envelope {
    pub fn new(
        fs: f64,
        start_time: f64,
        rise_time: f64,
        duration: f64,
        input: Box<dyn WaveformFactory>,
    ) -> Self {
        Self {
            fs,
            start_time,
            rise_time,
            duration,
            offset: 0,
            input,
        }
    }

    fn total_samples(&self) -> u64 {
        ((self.start_time + self.duration) * self.fs).round() as u64
    }

    /// Envelope value at `t` seconds.
    pub fn envelope_at(&self, t: f64) -> f64 {
        let end = self.start_time + self.duration;
        if t < self.start_time || t >= end {
            0.0
        } else if t < self.start_time + self.rise_time {
            (PI / 2.0 * (t - self.start_time) / self.rise_time).sin().powi(2)
        } else if t < end - self.rise_time {
            1.0
        } else {
            (PI / 2.0 * (end - t) / self.rise_time).sin().powi(2)
        }
    }
}

impl WaveformFactory for Cos2Envelope {
    fn next(&mut self, n: usize) -> Vec<f64> {
        let mut samples = self.input.next(n);
        for (i, s) in samples.iter_mut().enumerate() {
            let t = (self.offset + i as u64) as f64 / self.fs;
            *s *= self.envelope_at(t);
        }
        self.offset += n as u64;
        samples
    }

    fn get_remaining_samples(&self) -> Option<u64> {
        Some(self.total_samples().saturating_sub(self.offset))
    }

    fn get_duration(&self) -> f64 {
        self.start_time + self.duration
    }

    fn reset(&mut self) {
        self.offset = 0;
        self.input.reset();
    }

    fn clone_box(&self) -> Box<dyn WaveformFactory> {
        Box::new(self.clone())
    }
}
