// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

use crate::service::config::{DEFAULT_LEN_MSG_LEN, DEFAULT_MAX_MSG_LEN, DEFAULT_MIN_MSG_LEN};
use crate::service::NetworkConfig;
use crate::{AppError, AppResult};

/// Length-prefixed message codec: `[len][payload]`.
///
/// The prefix is 1, 2 or 4 bytes wide, in big or little endian, and holds the
/// payload length. Both sides must agree on width and byte order out of band.
/// Configure before the first read or write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameCodec {
    len_msg_len: usize,
    min_msg_len: u32,
    max_msg_len: u32,
    little_endian: bool,
}

impl Default for FrameCodec {
    fn default() -> Self {
        FrameCodec {
            len_msg_len: DEFAULT_LEN_MSG_LEN,
            min_msg_len: DEFAULT_MIN_MSG_LEN,
            max_msg_len: DEFAULT_MAX_MSG_LEN,
            little_endian: false,
        }
    }
}

impl FrameCodec {
    pub fn new() -> FrameCodec {
        FrameCodec::default()
    }

    pub fn from_config(config: &NetworkConfig) -> FrameCodec {
        let mut codec = FrameCodec::new();
        codec.set_msg_len(config.len_msg_len, config.min_msg_len, config.max_msg_len);
        codec.set_byte_order(config.little_endian);
        codec
    }

    /// Sets prefix width and payload bounds.
    ///
    /// A width other than 1, 2 or 4 keeps the current width; a zero bound keeps
    /// the current bound. Both bounds are clamped to what the width can express.
    pub fn set_msg_len(&mut self, len_msg_len: usize, min_msg_len: u32, max_msg_len: u32) {
        if matches!(len_msg_len, 1 | 2 | 4) {
            self.len_msg_len = len_msg_len;
        }
        if min_msg_len != 0 {
            self.min_msg_len = min_msg_len;
        }
        if max_msg_len != 0 {
            self.max_msg_len = max_msg_len;
        }

        let max = self.field_max();
        self.min_msg_len = self.min_msg_len.min(max);
        self.max_msg_len = self.max_msg_len.min(max);
    }

    pub fn set_byte_order(&mut self, little_endian: bool) {
        self.little_endian = little_endian;
    }

    pub fn len_msg_len(&self) -> usize {
        self.len_msg_len
    }

    pub fn min_msg_len(&self) -> u32 {
        self.min_msg_len
    }

    pub fn max_msg_len(&self) -> u32 {
        self.max_msg_len
    }

    pub fn little_endian(&self) -> bool {
        self.little_endian
    }

    fn field_max(&self) -> u32 {
        match self.len_msg_len {
            1 => u8::MAX as u32,
            2 => u16::MAX as u32,
            _ => u32::MAX,
        }
    }

    fn check_len(&self, len: usize) -> AppResult<()> {
        if len as u64 > self.max_msg_len as u64 {
            return Err(AppError::FrameTooLong {
                len,
                max: self.max_msg_len as usize,
            });
        }
        if (len as u64) < self.min_msg_len as u64 {
            return Err(AppError::FrameTooShort {
                len,
                min: self.min_msg_len as usize,
            });
        }
        Ok(())
    }

    /// Reads the length prefix from the front of `src`, which must hold at
    /// least `len_msg_len` bytes.
    fn get_len(&self, mut src: &[u8]) -> usize {
        match (self.len_msg_len, self.little_endian) {
            (1, _) => src.get_u8() as usize,
            (2, false) => src.get_u16() as usize,
            (2, true) => src.get_u16_le() as usize,
            (_, false) => src.get_u32() as usize,
            (_, true) => src.get_u32_le() as usize,
        }
    }

    fn put_len(&self, dst: &mut BytesMut, len: usize) {
        match (self.len_msg_len, self.little_endian) {
            (1, _) => dst.put_u8(len as u8),
            (2, false) => dst.put_u16(len as u16),
            (2, true) => dst.put_u16_le(len as u16),
            (_, false) => dst.put_u32(len as u32),
            (_, true) => dst.put_u32_le(len as u32),
        }
    }

    /// Reads exactly one message.
    ///
    /// A stream that ends inside the prefix or the payload is an I/O error;
    /// an out-of-bounds length fails before any payload byte is read.
    pub async fn read<R>(&self, reader: &mut R) -> AppResult<Bytes>
    where
        R: AsyncRead + Unpin,
    {
        let mut prefix = [0u8; 4];
        let prefix = &mut prefix[..self.len_msg_len];
        reader.read_exact(prefix).await?;

        let len = self.get_len(prefix);
        self.check_len(len)?;

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        Ok(Bytes::from(payload))
    }

    /// Splits one complete message off the front of `src`.
    ///
    /// Returns `None` until the whole frame is buffered. An out-of-bounds
    /// length fails as soon as the prefix is available.
    pub fn decode_frame(&self, src: &mut BytesMut) -> AppResult<Option<BytesMut>> {
        if src.len() < self.len_msg_len {
            return Ok(None);
        }
        let len = self.get_len(&src[..self.len_msg_len]);
        self.check_len(len)?;

        if src.len() < self.len_msg_len + len {
            src.reserve(self.len_msg_len + len - src.len());
            return Ok(None);
        }
        src.advance(self.len_msg_len);
        Ok(Some(src.split_to(len)))
    }

    /// Encodes the concatenation of `parts` as one message.
    pub fn encode(&self, parts: &[&[u8]]) -> AppResult<Bytes> {
        let len: usize = parts.iter().map(|part| part.len()).sum();
        self.check_len(len)?;

        let mut buf = BytesMut::with_capacity(self.len_msg_len + len);
        self.put_len(&mut buf, len);
        for part in parts {
            buf.put_slice(part);
        }
        Ok(buf.freeze())
    }

    /// Encodes `parts` and writes the message with a single write.
    pub async fn write<W>(&self, writer: &mut W, parts: &[&[u8]]) -> AppResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        let msg = self.encode(parts)?;
        writer.write_all(&msg).await?;
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> AppResult<Option<BytesMut>> {
        self.decode_frame(src)
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = AppError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> AppResult<()> {
        self.check_len(item.len())?;
        dst.reserve(self.len_msg_len + item.len());
        self.put_len(dst, item.len());
        dst.put_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn codec(width: usize, little_endian: bool) -> FrameCodec {
        let mut codec = FrameCodec::new();
        codec.set_msg_len(width, 1, 200);
        codec.set_byte_order(little_endian);
        codec
    }

    #[rstest]
    #[tokio::test]
    async fn read_returns_concatenated_parts(
        #[values(1, 2, 4)] width: usize,
        #[values(false, true)] little_endian: bool,
    ) {
        let codec = codec(width, little_endian);
        let mut wire = Vec::new();
        codec
            .write(&mut wire, &[&b"hello "[..], &b""[..], &b"world"[..]])
            .await
            .unwrap();
        assert_eq!(wire.len(), width + 11);

        let mut reader = wire.as_slice();
        let payload = codec.read(&mut reader).await.unwrap();
        assert_eq!(&payload[..], b"hello world");
        assert!(reader.is_empty());
    }

    #[test]
    fn prefix_layout_follows_byte_order() {
        let big = codec(2, false).encode(&[&[7u8; 3][..]]).unwrap();
        assert_eq!(&big[..2], &[0, 3]);
        let little = codec(4, true).encode(&[&[7u8; 3][..]]).unwrap();
        assert_eq!(&little[..4], &[3, 0, 0, 0]);
    }

    #[test]
    fn encode_rejects_out_of_bounds() {
        let mut codec = FrameCodec::new();
        codec.set_msg_len(1, 0, 10);
        let err = codec.encode(&[&[0u8; 12][..]]).unwrap_err();
        assert!(matches!(err, AppError::FrameTooLong { len: 12, max: 10 }));

        let err = codec.encode(&[]).unwrap_err();
        assert!(matches!(err, AppError::FrameTooShort { len: 0, min: 1 }));
    }

    #[tokio::test]
    async fn write_out_of_bounds_writes_nothing() {
        let mut codec = FrameCodec::new();
        codec.set_msg_len(2, 4, 8);
        let mut wire = Vec::new();
        assert!(codec.write(&mut wire, &[&b"ab"[..]]).await.is_err());
        assert!(codec.write(&mut wire, &[&b"abcdefghi"[..]]).await.is_err());
        assert!(wire.is_empty());
    }

    #[tokio::test]
    async fn read_rejects_length_before_payload() {
        let codec = codec(2, false);
        // claims 300 bytes, above the 200 max
        let wire = [0x01u8, 0x2c, 1, 2, 3];
        let mut reader = &wire[..];
        let err = codec.read(&mut reader).await.unwrap_err();
        assert!(matches!(err, AppError::FrameTooLong { len: 300, .. }));
        assert_eq!(reader.len(), 3);

        let wire = [0u8, 0];
        let err = codec.read(&mut &wire[..]).await.unwrap_err();
        assert!(matches!(err, AppError::FrameTooShort { len: 0, .. }));
    }

    #[tokio::test]
    async fn truncated_input_is_io_error() {
        let codec = codec(2, false);
        let err = codec.read(&mut &[0u8][..]).await.unwrap_err();
        assert!(matches!(err, AppError::IoError(_)));

        let wire = [0u8, 5, b'a', b'b'];
        let err = codec.read(&mut &wire[..]).await.unwrap_err();
        assert!(matches!(err, AppError::IoError(_)));
    }

    #[test]
    fn set_msg_len_keeps_and_clamps() {
        let mut codec = FrameCodec::new();
        codec.set_msg_len(3, 0, 0);
        assert_eq!(codec.len_msg_len(), 2);
        assert_eq!(codec.min_msg_len(), 1);
        assert_eq!(codec.max_msg_len(), 4096);

        codec.set_msg_len(1, 300, 0);
        assert_eq!(codec.min_msg_len(), 255);
        assert_eq!(codec.max_msg_len(), 255);
    }

    #[test]
    fn decoder_waits_for_complete_frame() {
        let mut codec = codec(2, false);
        let mut src = BytesMut::new();
        src.put_slice(&[0, 4, b'p', b'i']);
        assert!(codec.decode(&mut src).unwrap().is_none());
        src.put_slice(b"ngxx");
        let frame = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(&frame[..], b"ping");
        assert_eq!(&src[..], b"xx");

        let mut out = BytesMut::new();
        Encoder::encode(&mut codec, Bytes::from_static(b"pong"), &mut out).unwrap();
        assert_eq!(&out[..], &[0, 4, b'p', b'o', b'n', b'g']);
    }
}
