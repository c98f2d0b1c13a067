use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use super::backend::{AudioFrame, AudioSink, CaptureConstraints, CaptureDevice};
use super::codec;
use crate::error::SessionError;

/// Load a WAV file as mono float samples.
///
/// Multi-channel files are averaged down to mono. The sample rate is returned
/// untouched; callers decide whether it is acceptable.
pub fn read_wav_mono(path: impl AsRef<Path>) -> Result<(Vec<f32>, u32)> {
    let path = path.as_ref();
    let reader = WavReader::open(path)
        .with_context(|| format!("Failed to open WAV file: {}", path.display()))?;

    let spec = reader.spec();
    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read audio samples")?,
        SampleFormat::Int => {
            let max = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max))
                .collect::<Result<Vec<_>, _>>()
                .context("Failed to read audio samples")?
        }
    };

    let channels = spec.channels.max(1) as usize;
    let mono = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    };

    info!(
        "Audio file loaded: {}Hz, {} channels, {} mono samples",
        spec.sample_rate,
        spec.channels,
        mono.len()
    );

    Ok((mono, spec.sample_rate))
}

/// Replays a WAV file block by block at the real-time rate
pub struct WavCaptureDevice {
    path: PathBuf,
    task: Option<JoinHandle<()>>,
}

impl WavCaptureDevice {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            task: None,
        }
    }
}

#[async_trait::async_trait]
impl CaptureDevice for WavCaptureDevice {
    async fn start(
        &mut self,
        constraints: &CaptureConstraints,
    ) -> Result<mpsc::Receiver<AudioFrame>, SessionError> {
        let (samples, sample_rate) =
            read_wav_mono(&self.path).map_err(|e| SessionError::Device(format!("{:#}", e)))?;

        if sample_rate != constraints.sample_rate {
            return Err(SessionError::Device(format!(
                "{} is {}Hz, expected {}Hz",
                self.path.display(),
                sample_rate,
                constraints.sample_rate
            )));
        }
        if constraints.frame_samples == 0 {
            return Err(SessionError::Device("block size must be non-zero".to_string()));
        }

        let (tx, rx) = mpsc::channel(32);
        let frame_samples = constraints.frame_samples;
        let block = Duration::from_secs_f64(frame_samples as f64 / sample_rate as f64);

        // Frame timestamps are measured from here
        let origin = Instant::now();
        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(block);

            for chunk in samples.chunks(frame_samples) {
                ticker.tick().await;

                let mut block_samples = chunk.to_vec();
                // Callbacks always deliver full blocks
                block_samples.resize(frame_samples, 0.0);

                let frame = AudioFrame {
                    samples: block_samples,
                    sample_rate,
                    timestamp_ms: origin.elapsed().as_millis() as u64,
                };
                if tx.send(frame).await.is_err() {
                    return;
                }
            }

            info!("WAV capture reached end of file");
        }));

        info!(
            "WAV capture started: {} (echo_cancellation={}, noise_suppression={}, auto_gain_control={})",
            self.path.display(),
            constraints.echo_cancellation,
            constraints.noise_suppression,
            constraints.auto_gain_control
        );

        Ok(rx)
    }

    async fn stop(&mut self) -> Result<(), SessionError> {
        if let Some(task) = self.task.take() {
            task.abort();
            info!("WAV capture stopped: {}", self.path.display());
        }
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.task.is_some()
    }

    fn name(&self) -> &str {
        "wav-file"
    }
}

/// Renders synthesized audio into a 16-bit mono WAV file
pub struct WavSink {
    path: PathBuf,
    sample_rate: u32,
    /// Sleep for each unit's duration so completion tracks real playback
    pace: bool,
    writer: Mutex<Option<WavWriter<BufWriter<File>>>>,
}

impl WavSink {
    pub fn create(path: impl Into<PathBuf>, sample_rate: u32) -> Result<Self> {
        let path = path.into();
        let spec = WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };

        let writer = WavWriter::create(&path, spec)
            .with_context(|| format!("Failed to create WAV file: {:?}", path))?;

        info!("Playback sink writing to {}", path.display());

        Ok(Self {
            path,
            sample_rate,
            pace: true,
            writer: Mutex::new(Some(writer)),
        })
    }

    /// Complete each unit as soon as it is written
    pub fn unpaced(mut self) -> Self {
        self.pace = false;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, samples: &[f32]) -> Result<(), SessionError> {
        let mut guard = self
            .writer
            .lock()
            .map_err(|_| SessionError::Device("playback writer poisoned".to_string()))?;

        let writer = guard
            .as_mut()
            .ok_or_else(|| SessionError::Device("playback sink already closed".to_string()))?;

        for &sample in samples {
            writer
                .write_sample(codec::quantize(sample))
                .map_err(|e| SessionError::Device(format!("Failed to write sample to WAV: {}", e)))?;
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl AudioSink for WavSink {
    async fn play(&self, samples: Vec<f32>) -> Result<(), SessionError> {
        self.write(&samples)?;

        if self.pace && self.sample_rate > 0 {
            let secs = samples.len() as f64 / self.sample_rate as f64;
            tokio::time::sleep(Duration::from_secs_f64(secs)).await;
        }

        Ok(())
    }

    async fn close(&self) -> Result<(), SessionError> {
        let writer = self
            .writer
            .lock()
            .map_err(|_| SessionError::Device("playback writer poisoned".to_string()))?
            .take();

        if let Some(writer) = writer {
            writer
                .finalize()
                .map_err(|e| SessionError::Device(format!("Failed to finalize WAV file: {}", e)))?;
            info!("Playback file finalized: {}", self.path.display());
        }

        Ok(())
    }

    fn name(&self) -> &str {
        "wav-file"
    }
}

impl Drop for WavSink {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.writer.lock() {
            if let Some(writer) = guard.take() {
                if let Err(e) = writer.finalize() {
                    warn!("Failed to finalize WAV writer on drop: {}", e);
                }
            }
        }
    }
}
