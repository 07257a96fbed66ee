//! The opaque codec: the proxy never deserializes a forwarded payload.
//!
//! Unlike a generated codec bound to one message type, `RawBytesCodec` treats
//! every frame as an opaque [`bytes::Bytes`] buffer, copied through
//! unchanged. It is forced on both the server (so the dispatcher hands bytes
//! through untouched) and on every outbound upstream stream.

use bytes::{Buf, Bytes};
use tonic::codec::{BufferSettings, Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::Status;

/// Name reported on the wire; irrelevant to clients since the wire format is
/// stock gRPC, but kept stable for diagnostics.
pub const CODEC_NAME: &str = "groxy-raw-bytes";

/// A codec whose marshal/unmarshal pair never interprets the payload.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawBytesCodec;

impl Codec for RawBytesCodec {
    type Encode = Bytes;
    type Decode = Bytes;
    type Encoder = RawBytesEncoder;
    type Decoder = RawBytesDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        RawBytesEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        RawBytesDecoder
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RawBytesEncoder;

impl Encoder for RawBytesEncoder {
    type Item = Bytes;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        dst.reserve(item.len());
        dst.put(item);
        Ok(())
    }

    fn buffer_settings(&self) -> BufferSettings {
        BufferSettings::default()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RawBytesDecoder;

impl Decoder for RawBytesDecoder {
    type Item = Bytes;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        let len = src.remaining();
        if len == 0 {
            return Ok(Some(Bytes::new()));
        }
        Ok(Some(src.copy_to_bytes(len)))
    }

    fn buffer_settings(&self) -> BufferSettings {
        BufferSettings::default()
    }
}
