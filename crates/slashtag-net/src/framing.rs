//! Message framing for the connection byte stream
//!
//! Every byte written to a connection travels inside a length-prefixed frame,
//! so raw application bytes, protocol channel messages and replication
//! traffic can share one stream.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Maximum frame size (16 MB)
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    TooLarge(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unknown frame type: {0}")]
    UnknownType(u8),
    #[error("Empty frame")]
    Empty,
}

impl From<FrameError> for slashtag_core::Error {
    fn from(e: FrameError) -> Self {
        slashtag_core::Error::Transport(e.to_string())
    }
}

/// A framed message
#[derive(Clone, Debug)]
pub struct Frame {
    /// Frame type
    pub frame_type: FrameType,
    /// Payload bytes
    pub payload: Bytes,
}

/// Frame types
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Unframed application bytes
    Raw = 0,
    /// Tagged protocol channel message
    Channel = 1,
    /// Storage replication message
    Replicate = 2,
    /// Graceful close
    Close = 3,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Raw),
            1 => Ok(Self::Channel),
            2 => Ok(Self::Replicate),
            3 => Ok(Self::Close),
            _ => Err(FrameError::UnknownType(value)),
        }
    }
}

/// Payload of a [`FrameType::Channel`] frame.
///
/// The protocol name is the tag; the ordinal selects the message spec.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelFrame {
    pub protocol: String,
    pub ordinal: u32,
    pub body: Vec<u8>,
}

impl ChannelFrame {
    pub fn to_frame(&self) -> Result<Frame, postcard::Error> {
        let payload = postcard::to_allocvec(self)?;
        Ok(Frame::new(FrameType::Channel, payload))
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, postcard::Error> {
        postcard::from_bytes(&frame.payload)
    }
}

/// Codec for length-prefixed frames
///
/// Wire format:
/// - 4 bytes: length (big-endian, includes type byte)
/// - 1 byte: frame type
/// - N bytes: payload
#[derive(Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least 5 bytes (4 length + 1 type)
        if src.len() < 5 {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(length));
        }
        if length == 0 {
            return Err(FrameError::Empty);
        }

        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);
        let frame_type = FrameType::try_from(src[0])?;
        src.advance(1);

        let payload = src.split_to(length - 1).freeze();

        Ok(Some(Frame {
            frame_type,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = 1 + item.payload.len();
        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(length));
        }

        dst.reserve(4 + length);
        dst.put_u32(length as u32);
        dst.put_u8(item.frame_type as u8);
        dst.put_slice(&item.payload);

        Ok(())
    }
}

impl Frame {
    pub fn new(frame_type: FrameType, payload: impl Into<Bytes>) -> Self {
        Self {
            frame_type,
            payload: payload.into(),
        }
    }

    pub fn raw(data: impl Into<Bytes>) -> Self {
        Self::new(FrameType::Raw, data)
    }

    pub fn close() -> Self {
        Self::new(FrameType::Close, Bytes::new())
    }
}
