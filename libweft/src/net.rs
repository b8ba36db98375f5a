// Copyright © 2026 The Weft Contributors
//
// This file is part of weft, distributed under the terms of the GPLv3
// or later. For full terms see the included LICENSE file.

//! Network seam: the transport port and the wire codec.

pub mod codec;
pub mod transport;

pub use codec::Message;
pub use transport::{Inbound, Priority, Transport};
