pub mod backend;
pub mod capture;
pub mod codec;
pub mod file;
pub mod playback;

pub use backend::{
    AudioDeviceFactory, AudioFrame, AudioSink, CaptureConstraints, CaptureDevice, CaptureSource,
    DiscardSink, PlaybackTarget, SilenceDevice,
};
pub use capture::CapturePipeline;
pub use file::{read_wav_mono, WavCaptureDevice, WavSink};
pub use playback::{PlaybackQueue, PlaybackUnit, Player};
