//! # Media core for the rmedia project
//!
//! `media-core` holds the media-side buffering between the network and
//! playback: an adaptive jitter buffer that re-orders incoming RTP
//! frames by sequence number, absorbs inter-arrival jitter, and resizes
//! itself during silence so adjustments never cut into audible audio.
//!
//! The buffer is the one cross-thread boundary in the stack: `put` runs
//! on the receive path, `get` on the playback thread.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use rmedia_media_core::JitterBuffer;
//!
//! let jb = JitterBuffer::new(2, 20, 4)?;
//!
//! // receive path
//! jb.put_now(&header, payload)?;
//!
//! // playback thread, every ptime milliseconds
//! match jb.get() {
//!     Ok((header, payload)) => play(header, payload),
//!     Err(_) => play_comfort_noise(),
//! }
//! ```

pub mod error;
pub mod jitter;

pub use error::{Error, Result};
pub use jitter::{JitterBuffer, JitterStats};
