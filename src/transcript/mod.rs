//! Live transcript handling
//!
//! - `synchronizer`: merges both channels into one ordered, deduplicated transcript
//! - `feed`: the dedicated transcript connection and its reconnection policy

mod feed;
mod synchronizer;

pub use feed::{transcript_url, FeedEvent, ReconnectPolicy, TranscriptFeed};
pub use synchronizer::{
    extract_text, Speaker, SyncOutcome, TranscriptEntry, TranscriptSource, TranscriptSynchronizer,
};
