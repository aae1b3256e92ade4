//! # RTP core for the rmedia project
//!
//! `rtp-core` provides the RTP wire codec and the endpoint that moves
//! packets: UDP port-pair binding with RTCP on the next port up,
//! single-socket playback with multicast join, TCP-interleaved transport
//! riding an RTSP connection, RTCP demultiplexing on a shared port, and
//! the session counters RTCP needs on both directions.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use rmedia_rtp_core::{RtpEndpoint, RtpEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (endpoint, mut events) =
//!         RtpEndpoint::listen("0.0.0.0".parse()?, 16384, 32768, true).await?;
//!
//!     while let Some(event) = events.recv().await {
//!         if let RtpEvent::Packet { src, header, payload } = event {
//!             println!("seq {} ({} bytes) from {}", header.sequence, payload.len(), src);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod endpoint;
pub mod error;
pub mod packet;
pub mod rtcp;
pub mod session;

pub use endpoint::{RtpEndpoint, RtpEvent, RtpTransport};
pub use error::{Error, Result};
pub use packet::{RtpExtension, RtpHeader, RTP_HEADER_SIZE, RTP_VERSION};
pub use rtcp::{RtcpMsg, RtcpPacket, RtcpPacketType};
pub use session::{MemberStats, RtcpSession, TxStats};
