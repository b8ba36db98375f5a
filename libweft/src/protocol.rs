// Copyright © 2026 The Weft Contributors
//
// This file is part of weft, distributed under the terms of the GPLv3
// or later. For full terms see the included LICENSE file.

//! The two coupled protocols and their observability streams.
//!
//! [`swim`] and [`sync`] are pure state machines: they consume typed
//! inputs and return transitions plus effects ("tocks") for the
//! coordinator to interpret. All I/O and timing lives in the
//! coordinator; everything here is deterministic given its inputs.

pub mod error;
pub mod event;
pub mod phone;
pub mod swim;
pub mod sync;

pub use error::SyncError;
pub use event::Event;
pub use phone::Phone;
