// Playback queue for synthesized audio
//
// Units arrive at irregular intervals. They are queued in arrival order and
// played one at a time: when a unit finishes, the next one starts right away
// ("play next on completion"), so playback stays gapless and ordered without
// a shared clock. The queue is unbounded; the backend paces synthesis.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::backend::AudioSink;
use super::codec;

/// One decoded chunk of synthesized audio
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackUnit {
    pub id: u64,
    pub samples: Vec<f32>,
}

/// FIFO of decoded units plus the single playing slot
#[derive(Debug, Default)]
pub struct PlaybackQueue {
    pending: VecDeque<PlaybackUnit>,
    playing: Option<u64>,
    next_id: u64,
    played: u64,
}

impl PlaybackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a unit. Returns it back if nothing was playing and it should start now.
    pub fn push(&mut self, samples: Vec<f32>) -> Option<PlaybackUnit> {
        let unit = PlaybackUnit {
            id: self.next_id,
            samples,
        };
        // Ids stay unique across clears so late completions can be recognized
        self.next_id += 1;

        if self.playing.is_none() {
            self.playing = Some(unit.id);
            Some(unit)
        } else {
            self.pending.push_back(unit);
            None
        }
    }

    /// Mark unit `id` finished and hand out the next one, if any.
    ///
    /// Completions for anything but the current unit are ignored.
    pub fn complete(&mut self, id: u64) -> Option<PlaybackUnit> {
        if self.playing != Some(id) {
            debug!("Ignoring completion for unit {} (current: {:?})", id, self.playing);
            return None;
        }

        self.played += 1;
        match self.pending.pop_front() {
            Some(next) => {
                self.playing = Some(next.id);
                Some(next)
            }
            None => {
                self.playing = None;
                None
            }
        }
    }

    /// Drop everything queued and forget the playing unit
    pub fn clear(&mut self) {
        self.pending.clear();
        self.playing = None;
    }

    pub fn is_playing(&self) -> bool {
        self.playing.is_some()
    }

    pub fn current(&self) -> Option<u64> {
        self.playing
    }

    /// Units waiting behind the playing one
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.playing.is_none()
    }

    /// Units that finished playing
    pub fn played(&self) -> u64 {
        self.played
    }
}

type CompletionFn<E> = Arc<dyn Fn(u64) -> E + Send + Sync>;

/// Drives a [`PlaybackQueue`] against an [`AudioSink`]
///
/// Each unit plays on its own task; when the sink finishes, the task reports the
/// unit id back through the attached event channel and the owner calls
/// [`Player::on_complete`] to chain the next unit.
pub struct Player<E> {
    queue: PlaybackQueue,
    sink: Arc<dyn AudioSink>,
    events: Option<(mpsc::Sender<E>, CompletionFn<E>)>,
    current: Option<JoinHandle<()>>,
}

impl<E: Send + 'static> Player<E> {
    pub fn new(sink: Arc<dyn AudioSink>) -> Self {
        Self {
            queue: PlaybackQueue::new(),
            sink,
            events: None,
            current: None,
        }
    }

    /// Route completions for units started from now on
    pub fn attach<F>(&mut self, events: mpsc::Sender<E>, wrap: F)
    where
        F: Fn(u64) -> E + Send + Sync + 'static,
    {
        self.events = Some((events, Arc::new(wrap)));
    }

    /// Decode and enqueue a wire frame. Malformed frames are dropped.
    pub fn enqueue_frame(&mut self, frame: &str) -> bool {
        match codec::decode(frame) {
            Ok(samples) => self.enqueue(samples),
            Err(e) => {
                warn!("Dropping malformed audio frame: {}", e);
                false
            }
        }
    }

    /// Enqueue decoded samples
    pub fn enqueue(&mut self, samples: Vec<f32>) -> bool {
        if samples.is_empty() {
            return false;
        }
        if self.events.is_none() {
            warn!("Dropping audio: player is not attached to a session");
            return false;
        }

        if let Some(unit) = self.queue.push(samples) {
            self.start(unit);
        }
        true
    }

    /// Called when the sink reports unit `id` finished
    pub fn on_complete(&mut self, id: u64) {
        if self.queue.current() == Some(id) {
            self.current = None;
        }
        if let Some(next) = self.queue.complete(id) {
            self.start(next);
        }
    }

    /// Stop the playing unit and drop everything queued
    pub fn flush(&mut self) {
        if let Some(task) = self.current.take() {
            task.abort();
        }
        if !self.queue.is_empty() {
            info!(
                "Flushing playback ({} queued, playing={})",
                self.queue.len(),
                self.queue.is_playing()
            );
        }
        self.queue.clear();
        self.events = None;
    }

    pub fn is_playing(&self) -> bool {
        self.queue.is_playing()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn played(&self) -> u64 {
        self.queue.played()
    }

    /// Release the output device
    pub async fn close(&mut self) {
        self.flush();
        if let Err(e) = self.sink.close().await {
            warn!("Failed to close playback sink {}: {}", self.sink.name(), e);
        }
    }

    fn start(&mut self, unit: PlaybackUnit) {
        let Some((events, wrap)) = self.events.clone() else {
            return;
        };
        let sink = Arc::clone(&self.sink);

        self.current = Some(tokio::spawn(async move {
            let id = unit.id;
            if let Err(e) = sink.play(unit.samples).await {
                warn!("Playback of unit {} failed: {}", id, e);
            }
            let _ = events.send(wrap(id)).await;
        }));
    }
}
