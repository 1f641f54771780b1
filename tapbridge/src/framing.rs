//! Framing of Ethernet frames on the serial byte stream.
//!
//! The peripheral firmware treats every USB transfer as one frame and puts no
//! delimiters on the wire, so [`Framing::Raw`] forwards each serial read as-is.
//! That only holds while reads never coalesce or split frames.
//! [`Framing::LengthPrefixed`] puts a 2-byte big-endian length in front of
//! every frame instead. It needs matching firmware and is never the default.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Bytes of length header in [`Framing::LengthPrefixed`] mode.
pub const LENGTH_PREFIX_LEN: usize = 2;

/// Wire framing used on the serial side of the bridge.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Framing {
    /// Pass bytes through untouched
    #[default]
    Raw,
    /// `u16` big-endian length, then the frame
    LengthPrefixed,
}

/// Splits the serial byte stream into frames and wraps outgoing frames,
/// according to the configured [`Framing`].
#[derive(Debug)]
pub struct SerialCodec {
    framing: Framing,
    delimited: LengthDelimitedCodec,
    pending: BytesMut,
}

impl SerialCodec {
    /// `max_frame` bounds the payload of a length-prefixed frame.
    pub fn new(framing: Framing, max_frame: usize) -> Self {
        let delimited = LengthDelimitedCodec::builder()
            .length_field_length(LENGTH_PREFIX_LEN)
            .max_frame_length(max_frame)
            .new_codec();
        Self {
            framing,
            delimited,
            pending: BytesMut::new(),
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Append bytes read from the serial port.
    pub fn push(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
    }

    /// Take the next complete frame, if one is buffered.
    ///
    /// In raw mode everything pushed since the last call is one frame. A
    /// length header announcing more than `max_frame` bytes is an
    /// `InvalidData` error; the stream cannot be resynchronised after that.
    pub fn next_frame(&mut self) -> io::Result<Option<BytesMut>> {
        match self.framing {
            Framing::Raw => {
                if self.pending.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(self.pending.split()))
                }
            }
            Framing::LengthPrefixed => self.delimited.decode(&mut self.pending),
        }
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Wrap one frame read from the interface for the serial port.
    pub fn encode(&mut self, frame: &[u8], dst: &mut BytesMut) -> io::Result<()> {
        match self.framing {
            Framing::Raw => {
                dst.extend_from_slice(frame);
                Ok(())
            }
            Framing::LengthPrefixed => self.delimited.encode(Bytes::copy_from_slice(frame), dst),
        }
    }
}
