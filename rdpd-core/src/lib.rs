//! # rdpd-core
//!
//! Server side of the Remote Desktop Protocol connection sequence, from
//! the first X.224 Connection Request to an active session.
//!
//! This crate contains:
//! - **Wire layers**: `iso` (TPKT/X.224), `mcs` (T.125 with BER/PER),
//!   `sec` (GCC, standard RDP security, FIPS, Client Info, licensing),
//!   `fastpath`, `rdp` (share control, capabilities, MPPC) and `channel`
//!   (static channels and drdynvc)
//! - **Session**: `ServerSession`, a sans-IO state machine driving all
//!   layers for one client
//! - **Codec**: `RdpFrameCodec` splitting TPKT and fastpath frames for
//!   `tokio_util`
//! - **Network**: `Connection`, the async driver with TLS upgrade and a
//!   command channel
//! - **Config**: `ServerConfig`, `ServerKeys`, `ServerContext`
//! - **Error**: `RdpError`, a `thiserror`-based error hierarchy

pub mod channel;
pub mod client_info;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod fastpath;
pub mod iso;
pub mod mcs;
pub mod network;
pub mod rdp;
pub mod sec;
pub mod session;
pub mod stream;
pub mod unicode;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use client_info::{ClientInfo, CompressionType, LogonInfo, MonitorInfo};
pub use codec::RdpFrameCodec;
pub use config::{CryptLevel, FastpathMode, SecurityLayer, ServerConfig, ServerContext, ServerKeys};
pub use error::{RdpError, Result};
pub use events::{DisconnectReason, InputEvent, NullSink, Rect, SessionEventSink, UpdateKind};
pub use network::{BoxedStream, CommandSender, Connection, SessionCommand, SessionHandle, TlsUpgrade};
pub use rdp::Redirection;
pub use session::{ServerSession, SessionOutcome, SessionPhase};
pub use stream::WireBuffer;
