//! Wire-level framing shared by both dialects.
//!
//! Dialect A frames on `\n`, dialect B on `|`; both are otherwise read as
//! whole lines with the separator stripped. `hub`/`peer` pick the
//! separator per connection and drive the same [`FrameCodec`].

pub mod adc;
pub mod nmdc;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// A `tokio_util` codec that splits a byte stream on a single separator
/// byte: one frame per command, for both dialects.
pub struct FrameCodec {
    pub separator: u8,
}

impl FrameCodec {
    pub fn new(separator: u8) -> Self {
        Self { separator }
    }
}

impl Decoder for FrameCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::io::Result<Option<String>> {
        if let Some(pos) = src.iter().position(|&b| b == self.separator) {
            let frame = src.split_to(pos);
            src.advance(1);
            let line = String::from_utf8_lossy(&frame).into_owned();
            Ok(Some(line))
        } else {
            Ok(None)
        }
    }
}

impl Encoder for FrameCodec {
    type Item = String;
    type Error = std::io::Error;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> std::io::Result<()> {
        dst.reserve(item.len() + 1);
        dst.put_slice(item.as_bytes());
        dst.put_u8(self.separator);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_splits_on_separator_and_leaves_partial_frame_buffered() {
        let mut codec = FrameCodec::new(b'\n');
        let mut buf = BytesMut::from(&b"HSUP foo\nISID AB"[..]);
        let first = codec.decode(&mut buf).unwrap();
        assert_eq!(first, Some("HSUP foo".to_string()));
        let second = codec.decode(&mut buf).unwrap();
        assert_eq!(second, None);
        assert_eq!(&buf[..], b"ISID AB");
    }

    #[test]
    fn encode_appends_the_separator() {
        let mut codec = FrameCodec::new(b'|');
        let mut buf = BytesMut::new();
        codec.encode("$MyINFO $ALL nick".to_string(), &mut buf).unwrap();
        assert_eq!(&buf[..], b"$MyINFO $ALL nick|");
    }
}
