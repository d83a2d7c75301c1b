//! # OpPush Core Library
//!
//! `oppush-core` is the send side of the OBEX object-push profile: it connects
//! to a nearby device, pushes a queue of files one PUT at a time, and reports
//! every step to a listener from a single event loop.
//!
//! ## Features
//!
//! - **Ordered queue**: files are pushed strictly in the order they were added
//! - **Flow control**: every body chunk waits for the peer's response code
//! - **Bounded retry**: one automatic reconnect for stale link keys
//! - **Clean teardown**: disconnect, close and transport release on every path
//!
//! ## Modules
//!
//! - [`config`] - Configuration management
//! - [`mod@file`] - Resolving share requests to readable files
//! - [`obex`] - OBEX packet codec and client primitives
//! - [`push`] - High-level push client facade
//! - [`session`] - The send-side protocol session
//! - [`share`] - Share requests, status and the pending queue
//! - [`transfer`] - Transfer orchestration and event relay
//! - [`transport`] - Byte-stream channels and connectors
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use oppush_core::push::PushClient;
//! use oppush_core::share::ShareInfo;
//! use oppush_core::transport::TcpConnector;
//!
//! let (mut client, mut status) = PushClient::new("192.168.1.20", Arc::new(TcpConnector::default()));
//! client.share_file(ShareInfo::new("photo.jpg"))?;
//! while let Some(update) = status.recv().await {
//!     println!("{update:?}");
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod error;
pub mod file;
pub mod obex;
pub mod push;
pub mod session;
pub mod share;
pub mod transfer;
pub mod transport;

pub use error::{Error, ErrorKind, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Service class UUID of the OBEX Object Push profile.
pub const OBJECT_PUSH_UUID: uuid::Uuid = uuid::Uuid::from_u128(0x0000_1105_0000_1000_8000_0080_5f9b_34fb);

/// Default OBEX-over-TCP port
pub const DEFAULT_OBEX_TCP_PORT: u16 = 650;

/// Largest OBEX packet this client will negotiate
pub const DEFAULT_MAX_PACKET_SIZE: u16 = 0xFFFE;

/// Smallest packet size OBEX allows a peer to advertise
pub const MIN_MAX_PACKET_SIZE: u16 = 255;

/// Default interval between scans of an idle share queue (milliseconds)
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1500;

/// Default watchdog window for the first remote acknowledgment (seconds)
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 50;

/// Default backoff before the single stale-link-key reconnect (milliseconds)
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 1500;
