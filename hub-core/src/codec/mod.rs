//! `tokio_util` codec for the envelope framing.
//!
//! The decoder never fails on bad input. It scans forward one byte at a
//! time until something looks like a header, waits until the declared
//! envelope is complete, and then yields either the packet or a
//! [`DecodeFailure`] after discarding the offending bytes. Only I/O
//! errors end the stream.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace};

use crate::error::HubError;
use crate::header::{self, EnvelopeHeader, HEADER_SIZE};
use crate::packet::{DecodeFailure, Packet};

/// Outcome of pulling one envelope off the stream.
pub type Decoded = Result<Packet, DecodeFailure>;

#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec {
    skipped: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total garbage bytes dropped while resynchronizing.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Drop leading bytes until the buffer starts with something that
    /// looks like a header, or fewer than [`HEADER_SIZE`] bytes remain.
    fn resync(&mut self, src: &mut BytesMut) {
        let mut dropped = 0;
        while src.len() >= HEADER_SIZE && !header::looks_like_header(&src[..]) {
            src.advance(1);
            dropped += 1;
        }
        if dropped > 0 {
            self.skipped += dropped;
            debug!(dropped, "resynchronized envelope stream");
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Decoded;
    type Error = HubError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.resync(src);

        if !header::has_complete_envelope(&src[..]) {
            if let Ok(header) = EnvelopeHeader::from_bytes(&src[..]) {
                src.reserve(header.total_size() - src.len());
            }
            return Ok(None);
        }

        match Packet::decode(&src[..]) {
            Ok((packet, consumed)) => {
                src.advance(consumed);
                trace!(consumed, "decoded envelope");
                Ok(Some(Ok(packet)))
            }
            Err(failure) => {
                // A complete envelope always has a known size, but never
                // stall on zero just in case.
                src.advance(failure.consumed.max(1).min(src.len()));
                Ok(Some(Err(failure)))
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(item) => Ok(Some(item)),
            None => {
                if !buf.is_empty() {
                    debug!(remaining = buf.len(), "discarding partial envelope at end of stream");
                    buf.clear();
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<Packet> for FrameCodec {
    type Error = HubError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let envelope = item.to_bytes()?;
        dst.extend_from_slice(&envelope);
        Ok(())
    }
}

/// Pre-encoded envelopes (see [`encode_envelope`]) are written verbatim.
impl Encoder<Bytes> for FrameCodec {
    type Error = HubError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}

/// Encode once so the same envelope can be written to many peers.
pub fn encode_envelope(packet: &Packet) -> Result<Bytes, HubError> {
    packet.to_bytes().map(Bytes::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Command, CommandType};

    fn custom(name: &str) -> Packet {
        Packet::new(Command {
            command_type: CommandType::Custom(name.into()),
        })
    }

    fn drain(codec: &mut FrameCodec, buf: &mut BytesMut) -> Vec<Decoded> {
        let mut out = Vec::new();
        while let Some(item) = codec.decode(buf).unwrap() {
            out.push(item);
        }
        out
    }

    #[test]
    fn waits_for_header() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"HUB"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn decodes_back_to_back_envelopes() {
        let (a, b) = (custom("a"), custom("b"));
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&a.to_bytes().unwrap());
        buf.extend_from_slice(&b.to_bytes().unwrap());

        let mut codec = FrameCodec::new();
        let items = drain(&mut codec, &mut buf);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), &a);
        assert_eq!(items[1].as_ref().unwrap(), &b);
        assert!(buf.is_empty());
    }

    #[test]
    fn skips_short_garbage_before_envelope() {
        let packet = custom("after-garbage");
        let envelope = packet.to_bytes().unwrap();

        for garbage_len in 1..HEADER_SIZE {
            let garbage: Vec<u8> = (0..garbage_len as u8).map(|b| b.wrapping_mul(31)).collect();
            let mut buf = BytesMut::new();
            buf.extend_from_slice(&garbage);
            buf.extend_from_slice(&envelope);
            let before = buf.len();

            let mut codec = FrameCodec::new();
            let decoded = codec.decode(&mut buf).unwrap().unwrap().unwrap();
            assert_eq!(decoded, packet);
            assert_eq!(before - buf.len(), garbage_len + envelope.len());
            assert_eq!(codec.skipped(), garbage_len);
        }
    }

    #[test]
    fn skips_long_garbage_before_envelope() {
        let packet = custom("x");
        let mut buf = BytesMut::from(&[0x55u8; 300][..]);
        buf.extend_from_slice(&packet.to_bytes().unwrap());

        let mut codec = FrameCodec::new();
        let items = drain(&mut codec, &mut buf);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap(), &packet);
        assert_eq!(codec.skipped(), 300);
    }

    #[test]
    fn corrupt_envelope_is_reported_and_stream_continues() {
        let junk = [0xAB; 20];
        let header = EnvelopeHeader::for_payload(&junk).unwrap();
        let good = custom("good");

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&header.to_bytes());
        buf.extend_from_slice(&junk);
        buf.extend_from_slice(&good.to_bytes().unwrap());

        let mut codec = FrameCodec::new();
        let items = drain(&mut codec, &mut buf);
        assert_eq!(items.len(), 2);
        let failure = items[0].as_ref().unwrap_err();
        assert_eq!(failure.consumed, HEADER_SIZE + junk.len());
        assert_eq!(items[1].as_ref().unwrap(), &good);
    }

    #[test]
    fn checksum_failure_discards_envelope() {
        let mut bad = custom("bad").to_bytes().unwrap();
        let last = bad.len() - 1;
        bad[last] ^= 0x01;
        let good = custom("good");

        let mut buf = BytesMut::from(&bad[..]);
        buf.extend_from_slice(&good.to_bytes().unwrap());

        let mut codec = FrameCodec::new();
        let items = drain(&mut codec, &mut buf);
        assert!(matches!(
            items[0].as_ref().unwrap_err().error,
            HubError::ChecksumMismatch
        ));
        assert_eq!(items[1].as_ref().unwrap(), &good);
    }

    #[test]
    fn partial_envelope_waits_for_rest() {
        let packet = custom("split");
        let bytes = packet.to_bytes().unwrap();
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        for chunk in bytes.chunks(5) {
            assert!(codec.decode(&mut buf).unwrap().is_none());
            buf.extend_from_slice(chunk);
        }
        let decoded = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(decoded, packet);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_eof_drops_partial_tail() {
        let bytes = custom("tail").to_bytes().unwrap();
        let mut buf = BytesMut::from(&bytes[..bytes.len() - 2]);
        let mut codec = FrameCodec::new();
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn encoders_agree() {
        let packet = custom("same");
        let mut via_packet = BytesMut::new();
        let mut via_bytes = BytesMut::new();
        let mut codec = FrameCodec::new();
        codec.encode(packet.clone(), &mut via_packet).unwrap();
        codec
            .encode(encode_envelope(&packet).unwrap(), &mut via_bytes)
            .unwrap();
        assert_eq!(via_packet, via_bytes);
    }
}
