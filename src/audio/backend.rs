use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::AudioConfig;
use crate::error::SessionError;

/// One block of mono audio samples in the [-1, 1] range
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Float samples, mono
    pub samples: Vec<f32>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Timestamp in milliseconds since capture started
    pub timestamp_ms: u64,
}

impl AudioFrame {
    /// Playback length of this frame
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }
}

/// What the session asks of the capture device
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConstraints {
    /// Sample rate the backend expects (16kHz)
    pub sample_rate: u32,
    /// Samples per captured block
    pub frame_samples: usize,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            frame_samples: 1024,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

impl From<&AudioConfig> for CaptureConstraints {
    fn from(config: &AudioConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            frame_samples: config.frame_samples,
            echo_cancellation: config.echo_cancellation,
            noise_suppression: config.noise_suppression,
            auto_gain_control: config.auto_gain_control,
        }
    }
}

/// Audio capture device trait
///
/// Implementations:
/// - `WavCaptureDevice`: replays a WAV file in real time (stand-in for a microphone)
/// - `SilenceDevice`: emits silent blocks, for text-only calls
#[async_trait::async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Acquire the device and start capturing
    ///
    /// Returns a channel receiver that yields one frame per audio callback
    async fn start(
        &mut self,
        constraints: &CaptureConstraints,
    ) -> Result<mpsc::Receiver<AudioFrame>, SessionError>;

    /// Stop capturing and release the device
    async fn stop(&mut self) -> Result<(), SessionError>;

    /// Check if device is currently capturing
    fn is_capturing(&self) -> bool;

    /// Get device name for logging
    fn name(&self) -> &str;
}

/// Audio output trait
///
/// `play` resolves once the unit has finished rendering; the playback queue
/// relies on that to chain units without gaps.
#[async_trait::async_trait]
pub trait AudioSink: Send + Sync {
    async fn play(&self, samples: Vec<f32>) -> Result<(), SessionError>;

    /// Flush and release the output
    async fn close(&self) -> Result<(), SessionError>;

    fn name(&self) -> &str;
}

/// Capture source type
#[derive(Debug, Clone)]
pub enum CaptureSource {
    /// Replay a WAV file as if it were a microphone
    WavFile(PathBuf),
    /// Silent input
    Silence,
}

/// Playback target type
#[derive(Debug, Clone)]
pub enum PlaybackTarget {
    /// Render into a WAV file
    WavFile(PathBuf),
    /// Discard audio, but keep real-time pacing
    Discard,
}

/// Audio device factory
pub struct AudioDeviceFactory;

impl AudioDeviceFactory {
    pub fn capture(source: CaptureSource) -> Box<dyn CaptureDevice> {
        match source {
            CaptureSource::WavFile(path) => Box::new(super::file::WavCaptureDevice::new(path)),
            CaptureSource::Silence => Box::new(SilenceDevice::new()),
        }
    }

    pub fn sink(target: PlaybackTarget, sample_rate: u32) -> anyhow::Result<Box<dyn AudioSink>> {
        match target {
            PlaybackTarget::WavFile(path) => {
                Ok(Box::new(super::file::WavSink::create(path, sample_rate)?))
            }
            PlaybackTarget::Discard => Ok(Box::new(DiscardSink::new(sample_rate))),
        }
    }
}

/// Emits silent blocks at the real-time rate
pub struct SilenceDevice {
    task: Option<JoinHandle<()>>,
}

impl SilenceDevice {
    pub fn new() -> Self {
        Self { task: None }
    }
}

impl Default for SilenceDevice {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl CaptureDevice for SilenceDevice {
    async fn start(
        &mut self,
        constraints: &CaptureConstraints,
    ) -> Result<mpsc::Receiver<AudioFrame>, SessionError> {
        if constraints.sample_rate == 0 || constraints.frame_samples == 0 {
            return Err(SessionError::Device(
                "sample rate and block size must be non-zero".to_string(),
            ));
        }

        let (tx, rx) = mpsc::channel(32);
        let sample_rate = constraints.sample_rate;
        let frame_samples = constraints.frame_samples;
        let block = Duration::from_secs_f64(frame_samples as f64 / sample_rate as f64);

        // Frame timestamps are measured from here
        let origin = Instant::now();
        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(block);
            loop {
                ticker.tick().await;
                let frame = AudioFrame {
                    samples: vec![0.0; frame_samples],
                    sample_rate,
                    timestamp_ms: origin.elapsed().as_millis() as u64,
                };
                if tx.send(frame).await.is_err() {
                    break;
                }
            }
        }));

        info!("Silence device started ({} samples/block)", frame_samples);
        Ok(rx)
    }

    async fn stop(&mut self) -> Result<(), SessionError> {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Silence device stopped");
        }
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.task.is_some()
    }

    fn name(&self) -> &str {
        "silence"
    }
}

/// Drops audio after waiting out its duration
pub struct DiscardSink {
    sample_rate: u32,
}

impl DiscardSink {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }
}

#[async_trait::async_trait]
impl AudioSink for DiscardSink {
    async fn play(&self, samples: Vec<f32>) -> Result<(), SessionError> {
        let frame = AudioFrame {
            samples,
            sample_rate: self.sample_rate,
            timestamp_ms: 0,
        };
        tokio::time::sleep(frame.duration()).await;
        Ok(())
    }

    async fn close(&self) -> Result<(), SessionError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "discard"
    }
}
