//! Line codec: frames a TCP byte stream into command lines.
//!
//! Splits on `\n`, strips an optional trailing `\r`, and decodes lossily as
//! UTF-8. Partial lines stay buffered until their terminator arrives, so reads
//! may split the stream anywhere. A line longer than the configured limit is
//! reported once as [`Frame::Overlong`] and discarded through its terminator.

use bytes::BytesMut;
use tokio_util::codec::Decoder;

/// Codec error. Over-long lines are frames, not errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One decoded unit of client input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete line without its terminator.
    Line(String),
    /// A line exceeded the length limit and was dropped.
    Overlong,
}

/// A tokio codec that frames command lines on `\n` boundaries.
#[derive(Debug)]
pub struct LineCodec {
    max_length: usize,
    discarding: bool,
}

impl LineCodec {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length,
            discarding: false,
        }
    }
}

fn strip_cr(bytes: &[u8]) -> &[u8] {
    bytes.strip_suffix(b"\r").unwrap_or(bytes)
}

fn line_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(strip_cr(bytes)).into_owned()
}

impl Decoder for LineCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match src.iter().position(|b| *b == b'\n') {
                Some(pos) => {
                    let line = src.split_to(pos + 1);
                    if self.discarding {
                        // Tail of a line already reported as overlong.
                        self.discarding = false;
                        continue;
                    }
                    // The limit applies to raw bytes, before lossy decoding.
                    if strip_cr(&line[..pos]).len() > self.max_length {
                        return Ok(Some(Frame::Overlong));
                    }
                    return Ok(Some(Frame::Line(line_text(&line[..pos]))));
                }
                None => {
                    if self.discarding {
                        src.clear();
                        return Ok(None);
                    }
                    // One byte of slack for a `\r` whose `\n` has not arrived.
                    if src.len() > self.max_length + 1 {
                        src.clear();
                        self.discarding = true;
                        return Ok(Some(Frame::Overlong));
                    }
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if src.is_empty() || self.discarding {
            src.clear();
            return Ok(None);
        }
        let rest = src.split();
        Ok(Some(Frame::Line(line_text(&rest))))
    }
}
