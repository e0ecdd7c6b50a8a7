//! # rdpd-server: RDP listener daemon
//!
//! Accepts TCP clients and runs the `rdpd-core` connection sequence for
//! each of them, logging session events through `tracing`.
//!
//! - **config**: `DaemonConfig` TOML with `[network]`, `[rdp]`, `[keys]`
//!   and `[logging]` sections
//! - **service**: `RdpService` accept loop and the `LoggingSink`

pub mod config;
pub mod service;
