//! # RTSP core for the rmedia project
//!
//! `rtsp-core` provides the RTSP wire codec and server: incremental
//! message decoding (requests, responses and interleaved binary frames
//! sharing one TCP byte stream), header identification and lookup, and a
//! TCP/TLS listener that delivers parsed messages over a channel.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use rmedia_rtsp_core::{RtspEvent, RtspServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (server, mut events) = RtspServer::listen("0.0.0.0:8554".parse()?).await?;
//!
//!     while let Some(event) = events.recv().await {
//!         if let RtspEvent::Message { conn, msg } = event {
//!             println!("{} {} from {}", msg.method(), msg.path(), conn.peer());
//!             conn.reply(1, 200, "OK", None).await?;
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod header;
pub mod message;
mod parser;
pub mod server;

pub use error::{Error, Result};
pub use header::{hash_id, id, HeaderId, RtspHeader};
pub use message::{RtspMessage, RtspMessageType};
pub use server::{RtspConnection, RtspEvent, RtspServer};
