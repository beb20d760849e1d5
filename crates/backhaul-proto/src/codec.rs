//! Line codec for control frames
//!
//! Format: `[type: u8][payload: utf-8]\n`, one frame per line. Frames arrive
//! in arbitrary chunks over the control channel, so the decoder buffers
//! until a full line is available.

use crate::frame::{Frame, FrameError, FrameType};
use crate::MAX_FRAME_LENGTH;
use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Control frame codec
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_length: usize,
    /// Bytes of the current partial line already scanned for a terminator
    scanned: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_length(MAX_FRAME_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            scanned: 0,
        }
    }

    /// Decode every complete frame currently in `buf`
    pub fn decode_all(&mut self, buf: &mut BytesMut) -> Result<Vec<Frame>, FrameError> {
        let mut frames = Vec::new();

        while let Some(frame) = self.decode(buf)? {
            frames.push(frame);
        }

        Ok(frames)
    }

    /// Encode a frame into a standalone buffer
    pub fn encode_frame(&mut self, frame: Frame) -> Result<BytesMut, FrameError> {
        let mut buf = BytesMut::new();
        self.encode(frame, &mut buf)?;
        Ok(buf)
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        let start = self.scanned.min(src.len());
        let newline = src[start..]
            .iter()
            .position(|b| *b == b'\n')
            .map(|offset| start + offset);

        let Some(end) = newline else {
            if src.len() > self.max_length {
                return Err(FrameError::FrameTooLarge(src.len()));
            }
            self.scanned = src.len();
            return Ok(None);
        };

        self.scanned = 0;
        let line = src.split_to(end + 1);
        let line = &line[..end];

        if line.len() > self.max_length {
            return Err(FrameError::FrameTooLarge(line.len()));
        }

        let (&type_byte, payload) = line.split_first().ok_or(FrameError::EmptyFrame)?;
        let frame_type = FrameType::try_from(type_byte)?;
        let payload = std::str::from_utf8(payload).map_err(|_| FrameError::InvalidUtf8)?;

        Ok(Some(Frame::new(frame_type, payload)))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        if frame.payload.contains('\n') {
            return Err(FrameError::EmbeddedNewline);
        }
        if frame.payload.len() + 1 > self.max_length {
            return Err(FrameError::FrameTooLarge(frame.payload.len() + 1));
        }

        dst.reserve(frame.payload.len() + 2);
        dst.put_u8(frame.frame_type.as_byte());
        dst.put_slice(frame.payload.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}
