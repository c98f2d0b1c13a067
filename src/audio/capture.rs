//! Capture pipeline
//!
//! Owns the capture device for the lifetime of one call. Every device callback
//! is forwarded to the session event loop, which hands the block back through
//! [`CapturePipeline::process`]. Blocks are encoded and released for sending
//! only while the pipeline is interacting; anything captured before the
//! backend is ready is dropped, never buffered. That includes blocks that were
//! still queued behind the ready signal: a block whose capture timestamp
//! predates the moment the pipeline went interactive is stale.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::backend::{AudioFrame, CaptureConstraints, CaptureDevice};
use super::codec;
use crate::error::SessionError;

pub struct CapturePipeline {
    device: Box<dyn CaptureDevice>,
    constraints: CaptureConstraints,
    forwarder: Option<JoinHandle<()>>,
    running: bool,
    interacting: bool,
    /// Device start, the origin of frame timestamps
    started: Option<Instant>,
    /// Frames stamped earlier than this were captured before going interactive
    ready_ms: u64,
    frames_sent: u64,
    frames_dropped: u64,
}

impl CapturePipeline {
    pub fn new(device: Box<dyn CaptureDevice>, constraints: CaptureConstraints) -> Self {
        Self {
            device,
            constraints,
            forwarder: None,
            running: false,
            interacting: false,
            started: None,
            ready_ms: 0,
            frames_sent: 0,
            frames_dropped: 0,
        }
    }

    /// Acquire the device and forward each captured block into `events`.
    ///
    /// `wrap` turns a frame into whatever event type the receiver expects.
    /// Starting a running pipeline is a no-op.
    pub async fn start<E, F>(&mut self, events: mpsc::Sender<E>, wrap: F) -> Result<(), SessionError>
    where
        E: Send + 'static,
        F: Fn(AudioFrame) -> E + Send + 'static,
    {
        if self.running {
            warn!("Capture already started on {}", self.device.name());
            return Ok(());
        }

        let mut frames = self.device.start(&self.constraints).await?;
        self.running = true;
        self.interacting = false;
        self.started = Some(Instant::now());
        self.ready_ms = 0;
        self.frames_sent = 0;
        self.frames_dropped = 0;

        let device_name = self.device.name().to_string();
        self.forwarder = Some(tokio::spawn(async move {
            debug!("Capture forwarder started ({})", device_name);
            while let Some(frame) = frames.recv().await {
                if events.send(wrap(frame)).await.is_err() {
                    break;
                }
            }
            debug!("Capture forwarder stopped ({})", device_name);
        }));

        info!(
            "Capture started on {} ({}Hz, {} samples/block)",
            self.device.name(),
            self.constraints.sample_rate,
            self.constraints.frame_samples
        );

        Ok(())
    }

    /// Gate for outbound audio
    pub fn set_interacting(&mut self, interacting: bool) {
        if self.interacting == interacting {
            return;
        }
        if interacting {
            self.ready_ms = self
                .started
                .map(|t| t.elapsed().as_millis() as u64)
                .unwrap_or(0);
        }
        debug!("Capture interacting={} (ready at {}ms)", interacting, self.ready_ms);
        self.interacting = interacting;
    }

    pub fn is_interacting(&self) -> bool {
        self.interacting
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Encode one captured block, or drop it if not interacting.
    pub fn process(&mut self, frame: &AudioFrame) -> Option<String> {
        if !self.running || !self.interacting {
            self.frames_dropped += 1;
            return None;
        }
        if frame.timestamp_ms < self.ready_ms {
            debug!(
                "Dropping stale block captured at {}ms (ready at {}ms)",
                frame.timestamp_ms, self.ready_ms
            );
            self.frames_dropped += 1;
            return None;
        }

        self.frames_sent += 1;
        Some(codec::encode(&frame.samples))
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }

    /// Stop the device and release it. Safe to call any number of times.
    pub async fn stop(&mut self) {
        self.interacting = false;

        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }

        if !self.running {
            return;
        }
        self.running = false;

        if let Err(e) = self.device.stop().await {
            error!("Failed to stop capture device {}: {}", self.device.name(), e);
        }

        info!(
            "Capture stopped ({} frames sent, {} dropped)",
            self.frames_sent, self.frames_dropped
        );
    }
}
