// Copyright © 2026 The Weft Contributors
//
// This file is part of weft, distributed under the terms of the GPLv3
// or later. For full terms see the included LICENSE file.

//! Opaque identifiers for nodes, channels and streams.
//!
//! Identifiers are non-empty UTF-8 strings. They are bounded to
//! [`MAX_LENGTH`] bytes so they always fit the wire format's `u16`
//! length prefixes with room to spare.

use std::{fmt, str::FromStr};

use thiserror::Error;

/// Upper bound on the byte length of an identifier.
pub const MAX_LENGTH: usize = 255;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("identifier must not be empty")]
    Empty,

    #[error("identifier exceeds {MAX_LENGTH} bytes")]
    TooLong,
}

macro_rules! ident {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Result<Self, Error> {
                let s = s.into();
                if s.is_empty() {
                    Err(Error::Empty)
                } else if s.len() > MAX_LENGTH {
                    Err(Error::TooLong)
                } else {
                    Ok(Self(s))
                }
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }
    };
}

ident! {
    /// Globally unique peer identifier, stable across restarts.
    NodeId
}

ident! {
    /// Identifier of a logical channel (a membership set plus streams).
    ChannelId
}

ident! {
    /// Identifier of a stream within a channel, unique per channel.
    StreamId
}
