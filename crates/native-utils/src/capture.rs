//! One-utterance microphone capture.
//!
//! The capture calibrates against ambient noise, waits for energy above the
//! calibrated threshold, then records until a run of silence or the length
//! cap. Detection is a pure state machine over sample blocks
//! ([`UtteranceDetector`]); [`record_utterance`] wires it to a cpal stream.

use std::time::{Duration, Instant};

use anyhow::Context;
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, StreamTrait};
use ringbuf::traits::{Consumer, Producer, Split};

use crate::{audio, device};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const READ_BLOCK: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("no speech before the listen timeout")]
    Timeout,
    #[error("audio device error: {0:#}")]
    Device(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    /// Ambient noise sampled before listening starts.
    pub calibration: Duration,
    /// Silence that ends an utterance.
    pub silence_hold: Duration,
    /// Hard cap on one utterance.
    pub max_utterance: Duration,
    /// Speech threshold as a multiple of ambient RMS.
    pub energy_ratio: f32,
    /// Lower bound for the speech threshold in a very quiet room.
    pub min_energy: f32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            calibration: Duration::from_millis(500),
            silence_hold: Duration::from_millis(800),
            max_utterance: Duration::from_secs(15),
            energy_ratio: 3.0,
            min_energy: 0.01,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Listening,
    Complete,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq)]
enum DetectorState {
    Calibrating { energy: f32, seen: usize },
    Waiting { threshold: f32, waited: usize },
    Speaking { threshold: f32, silent: usize },
    Done,
}

/// Decides where an utterance starts and ends in a stream of mono blocks.
#[derive(Debug)]
pub struct UtteranceDetector {
    state: DetectorState,
    recording: Vec<f32>,
    calibration: usize,
    timeout: usize,
    silence_hold: usize,
    max_utterance: usize,
    energy_ratio: f32,
    min_energy: f32,
}

fn samples_for(duration: Duration, sample_rate: u32) -> usize {
    (duration.as_secs_f64() * sample_rate as f64) as usize
}

impl UtteranceDetector {
    /// `timeout` bounds the wait for speech once calibration is over.
    pub fn new(settings: &CaptureSettings, sample_rate: u32, timeout: Duration) -> Self {
        Self {
            state: DetectorState::Calibrating {
                energy: 0.0,
                seen: 0,
            },
            recording: Vec::new(),
            calibration: samples_for(settings.calibration, sample_rate),
            timeout: samples_for(timeout, sample_rate),
            silence_hold: samples_for(settings.silence_hold, sample_rate),
            max_utterance: samples_for(settings.max_utterance, sample_rate),
            energy_ratio: settings.energy_ratio,
            min_energy: settings.min_energy,
        }
    }

    pub fn feed(&mut self, block: &[f32]) -> Progress {
        let level = audio::rms(block);
        match self.state {
            DetectorState::Calibrating { energy, seen } => {
                let energy = energy + level * level * block.len() as f32;
                let seen = seen + block.len();
                if seen >= self.calibration {
                    let ambient = if seen == 0 {
                        0.0
                    } else {
                        (energy / seen as f32).sqrt()
                    };
                    let threshold = (ambient * self.energy_ratio).max(self.min_energy);
                    tracing::debug!("Ambient level {:.4}, speech threshold {:.4}", ambient, threshold);
                    self.state = DetectorState::Waiting {
                        threshold,
                        waited: 0,
                    };
                } else {
                    self.state = DetectorState::Calibrating { energy, seen };
                }
                Progress::Listening
            }
            DetectorState::Waiting { threshold, waited } => {
                if level >= threshold {
                    self.recording.extend_from_slice(block);
                    self.state = DetectorState::Speaking {
                        threshold,
                        silent: 0,
                    };
                    return self.check_length();
                }
                let waited = waited + block.len();
                if waited >= self.timeout {
                    self.state = DetectorState::Done;
                    return Progress::TimedOut;
                }
                self.state = DetectorState::Waiting { threshold, waited };
                Progress::Listening
            }
            DetectorState::Speaking { threshold, silent } => {
                self.recording.extend_from_slice(block);
                let silent = if level < threshold {
                    silent + block.len()
                } else {
                    0
                };
                if silent >= self.silence_hold {
                    self.state = DetectorState::Done;
                    return Progress::Complete;
                }
                self.state = DetectorState::Speaking { threshold, silent };
                self.check_length()
            }
            DetectorState::Done => Progress::Complete,
        }
    }

    fn check_length(&mut self) -> Progress {
        if self.recording.len() >= self.max_utterance {
            self.state = DetectorState::Done;
            Progress::Complete
        } else {
            Progress::Listening
        }
    }

    pub fn into_recording(self) -> Vec<f32> {
        self.recording
    }
}

/// Mono recording at the device's native rate.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Records a single utterance from the named (or default) input device.
///
/// Blocks the calling thread; run it on a blocking pool.
pub fn record_utterance(
    device_name: Option<String>,
    settings: &CaptureSettings,
    timeout: Duration,
) -> Result<Utterance, CaptureError> {
    let input = device::get_or_default_input(device_name)?;
    let default_config = input
        .default_input_config()
        .context("Failed to get default input config")?;
    let sample_rate = default_config.sample_rate().0;
    let channels = default_config.channels() as usize;
    let stream_config: StreamConfig = default_config.into();
    tracing::debug!("Recording with {:?}", stream_config);

    let (mut producer, mut consumer) = audio::shared_buffer(sample_rate as usize * 2).split();
    let input_data_fn = move |data: &[f32], _: &cpal::InputCallbackInfo| {
        let mono = audio::downmix(data, channels);
        let pushed = producer.push_slice(&mono);
        if pushed < mono.len() {
            tracing::warn!("Capture buffer full, dropped {} samples", mono.len() - pushed);
        }
    };
    let stream = input
        .build_input_stream(
            &stream_config,
            input_data_fn,
            move |err| tracing::error!("An error occurred on input stream: {}", err),
            None,
        )
        .context("Failed to build input stream")?;
    stream.play().context("Failed to start input stream")?;

    // Wall-clock guard in case the device stops delivering samples.
    let deadline = settings
        .calibration
        .checked_add(timeout)
        .and_then(|d| d.checked_add(settings.max_utterance))
        .and_then(|d| d.checked_add(Duration::from_secs(1)))
        .and_then(|d| Instant::now().checked_add(d))
        .ok_or_else(|| anyhow::anyhow!("Listen timeout {:?} is out of range", timeout))?;

    let mut detector = UtteranceDetector::new(settings, sample_rate, timeout);
    let mut block = vec![0.0f32; READ_BLOCK];
    loop {
        let read = consumer.pop_slice(&mut block);
        if read == 0 {
            if Instant::now() >= deadline {
                return Err(anyhow::anyhow!("Input stream stalled").into());
            }
            std::thread::sleep(POLL_INTERVAL);
            continue;
        }
        match detector.feed(&block[..read]) {
            Progress::Listening => {}
            Progress::Complete => break,
            Progress::TimedOut => return Err(CaptureError::Timeout),
        }
    }
    drop(stream);

    let samples = detector.into_recording();
    tracing::debug!("Captured {} samples at {}hz", samples.len(), sample_rate);
    Ok(Utterance {
        samples,
        sample_rate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 1_000;

    fn settings() -> CaptureSettings {
        CaptureSettings {
            calibration: Duration::from_millis(100),
            silence_hold: Duration::from_millis(200),
            max_utterance: Duration::from_secs(2),
            energy_ratio: 3.0,
            min_energy: 0.01,
        }
    }

    fn tone(level: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| if i % 2 == 0 { level } else { -level })
            .collect()
    }

    #[test]
    fn quiet_room_times_out() {
        let mut detector = UtteranceDetector::new(&settings(), RATE, Duration::from_millis(300));
        assert_eq!(detector.feed(&tone(0.001, 100)), Progress::Listening);
        assert_eq!(detector.feed(&tone(0.001, 200)), Progress::Listening);
        assert_eq!(detector.feed(&tone(0.001, 100)), Progress::TimedOut);
        assert!(detector.into_recording().is_empty());
    }

    #[test]
    fn speech_is_recorded_until_silence() {
        let mut detector = UtteranceDetector::new(&settings(), RATE, Duration::from_secs(1));
        assert_eq!(detector.feed(&tone(0.001, 100)), Progress::Listening);
        assert_eq!(detector.feed(&tone(0.001, 50)), Progress::Listening);
        assert_eq!(detector.feed(&tone(0.3, 100)), Progress::Listening);
        assert_eq!(detector.feed(&tone(0.001, 100)), Progress::Listening);
        assert_eq!(detector.feed(&tone(0.001, 100)), Progress::Complete);

        // Leading silence is not part of the utterance.
        assert_eq!(detector.into_recording().len(), 300);
    }

    #[test]
    fn threshold_follows_ambient_noise() {
        let mut detector = UtteranceDetector::new(&settings(), RATE, Duration::from_secs(1));
        detector.feed(&tone(0.1, 100));
        // Twice the ambient level stays below the 3x threshold.
        assert_eq!(detector.feed(&tone(0.2, 100)), Progress::Listening);
        assert!(matches!(detector.state, DetectorState::Waiting { .. }));
        detector.feed(&tone(0.5, 100));
        assert!(matches!(detector.state, DetectorState::Speaking { .. }));
    }

    #[test]
    fn long_utterance_is_capped() {
        let mut detector = UtteranceDetector::new(&settings(), RATE, Duration::from_secs(1));
        detector.feed(&tone(0.0, 100));
        let mut progress = Progress::Listening;
        for _ in 0..30 {
            progress = detector.feed(&tone(0.5, 100));
            if progress != Progress::Listening {
                break;
            }
        }
        assert_eq!(progress, Progress::Complete);
        assert_eq!(detector.into_recording().len(), 2_000);
    }
}
