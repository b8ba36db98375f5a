// Copyright © 2026 The Weft Contributors
//
// This file is part of weft, distributed under the terms of the GPLv3
// or later. For full terms see the included LICENSE file.

//! The wire codec.
//!
//! Every frame is `[1 byte kind][kind-specific payload]`, integers
//! big-endian. Identifier strings carry a `u16` length prefix, entry
//! payloads a `u32` one. Unknown kinds decode to `None` and are
//! dropped, so newer peers can speak newer kinds at us. Trailing bytes
//! after a well-formed payload are ignored for the same reason.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::{
    clock::Hlc,
    ident::{self, ChannelId, NodeId, StreamId},
    log::{self, Entry, VersionVector},
};

const PING: u8 = 0x10;
const ACK: u8 = 0x11;
const PING_REQ: u8 = 0x12;
const SUSPICION: u8 = 0x13;
const DIGEST: u8 = 0x20;
const DELTA: u8 = 0x21;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("frame truncated")]
    Truncated,

    #[error("identifier is not valid utf-8")]
    Utf8,

    #[error(transparent)]
    Ident(#[from] ident::Error),

    #[error(transparent)]
    Entry(#[from] log::Error),
}

/// Per-stream summary inside a [`Digest`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamDigest {
    pub stream: StreamId,
    pub version: VersionVector,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelDigest {
    pub channel: ChannelId,
    pub streams: Vec<StreamDigest>,
}

/// A compact summary of what a node has: per-stream version vectors.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Digest {
    pub channels: Vec<ChannelDigest>,
}

impl Digest {
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// Per-stream payload inside a [`Delta`]: the entries the receiver
/// lacks plus the sender's version vector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamDelta {
    pub stream: StreamId,
    pub version: VersionVector,
    pub entries: Vec<Entry>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelDelta {
    pub channel: ChannelId,
    pub streams: Vec<StreamDelta>,
}

/// The entries one node sends another to close a digest's gap.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Delta {
    pub channels: Vec<ChannelDelta>,
}

/// Everything that goes over the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Ping {
        seq: u32,
        incarnation: u64,
    },
    Ack {
        seq: u32,
        incarnation: u64,
    },
    PingReq {
        seq: u32,
        target: NodeId,
    },
    Suspicion {
        about: NodeId,
        incarnation: u64,
    },
    Digest(Digest),
    Delta(Delta),
}

pub fn encode(message: &Message) -> Bytes {
    let mut buf = BytesMut::new();

    match message {
        Message::Ping { seq, incarnation } => {
            buf.put_u8(PING);
            buf.put_u32(*seq);
            buf.put_u64(*incarnation);
        },

        Message::Ack { seq, incarnation } => {
            buf.put_u8(ACK);
            buf.put_u32(*seq);
            buf.put_u64(*incarnation);
        },

        Message::PingReq { seq, target } => {
            buf.put_u8(PING_REQ);
            buf.put_u32(*seq);
            put_str(&mut buf, target.as_str());
        },

        Message::Suspicion { about, incarnation } => {
            buf.put_u8(SUSPICION);
            put_str(&mut buf, about.as_str());
            buf.put_u64(*incarnation);
        },

        Message::Digest(digest) => {
            buf.put_u8(DIGEST);
            buf.put_u16(digest.channels.len() as u16);
            for channel in &digest.channels {
                put_str(&mut buf, channel.channel.as_str());
                buf.put_u16(channel.streams.len() as u16);
                for stream in &channel.streams {
                    put_str(&mut buf, stream.stream.as_str());
                    put_version(&mut buf, &stream.version);
                }
            }
        },

        Message::Delta(delta) => {
            buf.put_u8(DELTA);
            buf.put_u16(delta.channels.len() as u16);
            for channel in &delta.channels {
                put_str(&mut buf, channel.channel.as_str());
                buf.put_u16(channel.streams.len() as u16);
                for stream in &channel.streams {
                    put_str(&mut buf, stream.stream.as_str());
                    put_version(&mut buf, &stream.version);
                    buf.put_u32(stream.entries.len() as u32);
                    for entry in &stream.entries {
                        put_str(&mut buf, entry.author.as_str());
                        buf.put_u32(entry.sequence);
                        buf.put_u64(entry.timestamp.as_u64());
                        buf.put_u32(entry.payload.len() as u32);
                        buf.put_slice(&entry.payload);
                    }
                }
            }
        },
    }

    buf.freeze()
}

/// Decode one frame. `Ok(None)` means an unknown kind: drop it.
pub fn decode(frame: &[u8]) -> Result<Option<Message>, Error> {
    let mut buf = frame;
    let kind = get_u8(&mut buf)?;

    let message = match kind {
        PING => Message::Ping {
            seq: get_u32(&mut buf)?,
            incarnation: get_u64(&mut buf)?,
        },

        ACK => Message::Ack {
            seq: get_u32(&mut buf)?,
            incarnation: get_u64(&mut buf)?,
        },

        PING_REQ => Message::PingReq {
            seq: get_u32(&mut buf)?,
            target: get_node_id(&mut buf)?,
        },

        SUSPICION => Message::Suspicion {
            about: get_node_id(&mut buf)?,
            incarnation: get_u64(&mut buf)?,
        },

        DIGEST => {
            let channel_count = get_u16(&mut buf)?;
            let mut channels = Vec::with_capacity(channel_count.min(64) as usize);
            for _ in 0..channel_count {
                let channel = ChannelId::new(get_str(&mut buf)?)?;
                let stream_count = get_u16(&mut buf)?;
                let mut streams = Vec::with_capacity(stream_count.min(64) as usize);
                for _ in 0..stream_count {
                    streams.push(StreamDigest {
                        stream: StreamId::new(get_str(&mut buf)?)?,
                        version: get_version(&mut buf)?,
                    });
                }
                channels.push(ChannelDigest { channel, streams });
            }
            Message::Digest(Digest { channels })
        },

        DELTA => {
            let channel_count = get_u16(&mut buf)?;
            let mut channels = Vec::with_capacity(channel_count.min(64) as usize);
            for _ in 0..channel_count {
                let channel = ChannelId::new(get_str(&mut buf)?)?;
                let stream_count = get_u16(&mut buf)?;
                let mut streams = Vec::with_capacity(stream_count.min(64) as usize);
                for _ in 0..stream_count {
                    let stream = StreamId::new(get_str(&mut buf)?)?;
                    let version = get_version(&mut buf)?;
                    let entry_count = get_u32(&mut buf)?;
                    let mut entries = Vec::with_capacity(entry_count.min(1024) as usize);
                    for _ in 0..entry_count {
                        let author = get_node_id(&mut buf)?;
                        let sequence = get_u32(&mut buf)?;
                        let timestamp = Hlc::from_u64(get_u64(&mut buf)?);
                        let payload = get_bytes(&mut buf)?;
                        entries.push(Entry::new(author, sequence, timestamp, payload)?);
                    }
                    streams.push(StreamDelta {
                        stream,
                        version,
                        entries,
                    });
                }
                channels.push(ChannelDelta { channel, streams });
            }
            Message::Delta(Delta { channels })
        },

        _ => return Ok(None),
    };

    Ok(Some(message))
}

fn put_str(buf: &mut BytesMut, s: &str) {
    // identifiers are bounded to 255 bytes at construction
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn put_version(buf: &mut BytesMut, version: &VersionVector) {
    buf.put_u16(version.len() as u16);
    for (node, sequence) in version.iter() {
        put_str(buf, node.as_str());
        buf.put_u32(sequence);
    }
}

fn get_u8(buf: &mut &[u8]) -> Result<u8, Error> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut &[u8]) -> Result<u16, Error> {
    need(buf, 2)?;
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut &[u8]) -> Result<u32, Error> {
    need(buf, 4)?;
    Ok(buf.get_u32())
}

fn get_u64(buf: &mut &[u8]) -> Result<u64, Error> {
    need(buf, 8)?;
    Ok(buf.get_u64())
}

fn get_str(buf: &mut &[u8]) -> Result<String, Error> {
    let len = get_u16(buf)? as usize;
    need(buf, len)?;
    let raw = buf[..len].to_vec();
    buf.advance(len);
    String::from_utf8(raw).map_err(|_| Error::Utf8)
}

fn get_node_id(buf: &mut &[u8]) -> Result<NodeId, Error> {
    Ok(NodeId::new(get_str(buf)?)?)
}

fn get_bytes(buf: &mut &[u8]) -> Result<Bytes, Error> {
    let len = get_u32(buf)? as usize;
    need(buf, len)?;
    let out = Bytes::copy_from_slice(&buf[..len]);
    buf.advance(len);
    Ok(out)
}

fn get_version(buf: &mut &[u8]) -> Result<VersionVector, Error> {
    let count = get_u16(buf)?;
    let mut version = VersionVector::new();
    for _ in 0..count {
        let node = get_node_id(buf)?;
        let sequence = get_u32(buf)?;
        version.set(node, sequence);
    }
    Ok(version)
}

fn need(buf: &&[u8], n: usize) -> Result<(), Error> {
    if buf.remaining() < n {
        Err(Error::Truncated)
    } else {
        Ok(())
    }
}
