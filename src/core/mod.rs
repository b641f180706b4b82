//! Core relay components
//!
//! This module contains the chat relay engine and the transcript store it
//! records completed exchanges into and reads them back from.

mod relay;
mod transcript;

pub use relay::{ChatRequest, Relay, RelayError, RelayReply};
pub use transcript::TranscriptStore;
