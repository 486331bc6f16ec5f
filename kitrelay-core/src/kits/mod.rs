//! Built-in kits
//!
//! - [`recording`]: records every call it receives; used by the replay CLI
//!   and by tests

pub mod recording;

pub use recording::{KitCall, RecordingKit};
