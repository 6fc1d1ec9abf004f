//! Binary frames pushed to viewers.
//!
//! Every frame is `[kind: u8][count: u16 BE]` followed by `count` pixel records of
//! `[x: u16 BE][y: u16 BE][r][g][b]`, so a frame is always `3 + 7 * count` bytes.

use bytes::{BufMut, Bytes, BytesMut};

use crate::pixel::{Pixel, Rgb};

pub const FRAME_KIND_DELTA: u8 = 0x00;
pub const FRAME_KIND_FULL_STATE: u8 = 0x01;

pub const HEADER_LEN: usize = 3;
pub const PIXEL_RECORD_LEN: usize = 7;
pub const MAX_PIXELS_PER_FRAME: usize = u16::MAX as usize;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("unknown frame kind: {0:#04x}")]
    UnknownFrameKind(u8),
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("{0} trailing bytes after last pixel")]
    TrailingBytes(usize),
    #[error("{0} pixels do not fit in a single frame")]
    TooManyPixels(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Pixels changed since the previous flush.
    Delta,
    /// One chunk of the complete grid, sent while bootstrapping a viewer.
    FullState,
}

impl FrameKind {
    pub fn as_u8(self) -> u8 {
        match self {
            FrameKind::Delta => FRAME_KIND_DELTA,
            FrameKind::FullState => FRAME_KIND_FULL_STATE,
        }
    }

    fn from_u8(value: u8) -> Result<Self, WireError> {
        match value {
            FRAME_KIND_DELTA => Ok(FrameKind::Delta),
            FRAME_KIND_FULL_STATE => Ok(FrameKind::FullState),
            other => Err(WireError::UnknownFrameKind(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub pixels: Vec<Pixel>,
}

pub const fn frame_len(pixels: usize) -> usize {
    HEADER_LEN + pixels * PIXEL_RECORD_LEN
}

pub fn encode_frame(kind: FrameKind, pixels: &[Pixel]) -> Result<Bytes, WireError> {
    let mut buf = begin_frame(kind, pixels.len())?;
    for pixel in pixels {
        write_pixel(&mut buf, pixel.x, pixel.y, pixel.color());
    }
    Ok(buf.freeze())
}

/// Starts a frame that will carry exactly `count` pixel records.
pub(crate) fn begin_frame(kind: FrameKind, count: usize) -> Result<BytesMut, WireError> {
    if count > MAX_PIXELS_PER_FRAME {
        return Err(WireError::TooManyPixels(count));
    }
    let mut buf = BytesMut::with_capacity(frame_len(count));
    buf.put_u8(kind.as_u8());
    buf.put_u16(count as u16);
    Ok(buf)
}

pub(crate) fn write_pixel(buf: &mut BytesMut, x: u16, y: u16, color: Rgb) {
    buf.put_u16(x);
    buf.put_u16(y);
    buf.put_slice(&color.to_bytes());
}

pub fn decode_frame(bytes: &[u8]) -> Result<Frame, WireError> {
    let mut cursor = Cursor::new(bytes);
    let kind = FrameKind::from_u8(cursor.read_u8()?)?;
    let count = cursor.read_u16()? as usize;
    let mut pixels = Vec::with_capacity(count.min(cursor.remaining() / PIXEL_RECORD_LEN));
    for _ in 0..count {
        let x = cursor.read_u16()?;
        let y = cursor.read_u16()?;
        let rgb = cursor.read_bytes(3)?;
        pixels.push(Pixel::new(x, y, Rgb::new(rgb[0], rgb[1], rgb[2])));
    }
    if cursor.remaining() > 0 {
        return Err(WireError::TrailingBytes(cursor.remaining()));
    }
    Ok(Frame { kind, pixels })
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, WireError> {
        let raw = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([raw[0], raw[1]]))
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        if self.pos + len > self.bytes.len() {
            return Err(WireError::UnexpectedEof);
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }
}
