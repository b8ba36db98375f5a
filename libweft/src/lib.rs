// Copyright © 2026 The Weft Contributors
//
// This file is part of weft, distributed under the terms of the GPLv3
// or later. For full terms see the included LICENSE file.

//! Weft is a peer-to-peer, eventually-consistent replication engine for
//! small fleets of intermittently-connected devices talking over lossy
//! short-range transports.
//!
//! Each node keeps an append-only log per stream; the engine gossips log
//! entries between channel members (anti-entropy digest/delta exchange)
//! and tracks peer liveness with SWIM-style probing. Transports, storage
//! and time are ports (see [`net::Transport`], [`storage`] and
//! [`clock::TimeSource`]), so the engine itself is deterministic and
//! runs unchanged over BLE bridges, test harnesses or plain sockets.
//!
//! The entry point is [`Coordinator`].

pub mod channel;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod ident;
pub mod log;
pub mod net;
pub mod peer;
pub mod protocol;
pub mod rtt;
pub mod storage;
pub mod store;

pub use config::Config;
pub use coordinator::Coordinator;
pub use ident::{ChannelId, NodeId, StreamId};
pub use log::{Entry, VersionVector};
