//! falcon-voice: real-time voice conversation client core
//!
//! Captures microphone audio, streams it to the FalconX conversational
//! speech service, plays back the synthesized reply gaplessly, and assembles
//! the incremental transcript into ordered chat messages. One
//! [`ConnectionManager`] owns all of it per conversation.
//!
//! The presentation layer only ever talks to the manager:
//!
//! ```no_run
//! use falcon_voice::ConnectionManager;
//!
//! # async fn demo() {
//! let manager = ConnectionManager::default();
//! manager.connect().await;
//!
//! for message in manager.messages() {
//!     println!("{:?}: {}", message.role, message.text);
//! }
//! if let Some(tap) = manager.output_analyser() {
//!     let level = tap.volume().volume;
//!     assert!((0.0..=1.0).contains(&level));
//! }
//!
//! manager.disconnect().await;
//! # }
//! ```

pub mod audio;
pub mod manager;
pub mod settings;
pub mod streaming;
pub mod transcript;

pub use audio::{AnalyserTap, AudioVisualizerData};
pub use manager::{ConnectionManager, ConnectionState};
pub use settings::SessionSettings;
pub use transcript::{ChatMessage, Role};
