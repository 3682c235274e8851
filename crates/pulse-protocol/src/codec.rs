//! Packet framing for the producer/viewer TCP stream.
//!
//! Wire format: 1-byte code + 4-byte big-endian payload length + payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder};

use crate::{PacketCode, ProtocolError};

/// Maximum payload size: 16 MB (network messages may carry full bodies).
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Frame header size in bytes: code + length.
pub const HEADER_SIZE: usize = 5;

/// One framed unit on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub code: PacketCode,
    pub payload: Bytes,
}

impl Packet {
    /// A control packet with no payload.
    pub fn empty(code: PacketCode) -> Self {
        Self {
            code,
            payload: Bytes::new(),
        }
    }

    /// Serialize `entity` as the packet payload.
    pub fn encode<T: Serialize>(code: PacketCode, entity: &T) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_vec(entity)?;
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(Self {
            code,
            payload: Bytes::from(payload),
        })
    }

    /// Deserialize the payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Deserialize the payload after checking the code.
    pub fn decode_as<T: DeserializeOwned>(&self, expected: PacketCode) -> Result<T, ProtocolError> {
        if self.code != expected {
            return Err(ProtocolError::UnexpectedPacket {
                expected,
                got: self.code,
            });
        }
        self.decode()
    }
}

/// Codec for framing Packet values over a byte stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        // Peek at the header without consuming it
        let code = PacketCode::from(src[0]);
        let length = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;

        if length > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: length,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let total = HEADER_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(length).freeze();

        if let PacketCode::Unknown(raw) = code {
            tracing::trace!(code = raw, length, "decoded packet with unknown code");
        }

        Ok(Some(Packet { code, payload }))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: item.payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        dst.reserve(HEADER_SIZE + item.payload.len());
        dst.put_u8(item.code.into());
        dst.put_u32(item.payload.len() as u32);
        dst.extend_from_slice(&item.payload);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{AppInfo, ClientHello, DeviceInfo};
    use proptest::prelude::*;

    fn sample_hello() -> ClientHello {
        ClientHello {
            device_id: uuid::Uuid::nil(),
            device_info: DeviceInfo {
                name: "kean-mbp".into(),
                model: None,
                system_name: "macOS".into(),
                system_version: "14.2".into(),
                locale: None,
            },
            app_info: AppInfo {
                bundle_identifier: Some("com.example.app".into()),
                name: "Example".into(),
                version: Some("1.0".into()),
                build: Some("42".into()),
            },
        }
    }

    fn encode_all(packets: &[Packet]) -> BytesMut {
        let mut codec = PacketCodec;
        let mut buf = BytesMut::new();
        for packet in packets {
            codec.encode(packet.clone(), &mut buf).unwrap();
        }
        buf
    }

    fn decode_all(buf: &mut BytesMut) -> Vec<Packet> {
        let mut codec = PacketCodec;
        let mut out = Vec::new();
        while let Some(packet) = codec.decode(buf).unwrap() {
            out.push(packet);
        }
        out
    }

    #[test]
    fn test_header_layout() {
        let packet = Packet {
            code: PacketCode::StoreMessage,
            payload: Bytes::from_static(b"abc"),
        };
        let buf = encode_all(&[packet]);
        assert_eq!(&buf[..], &[6, 0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn test_encode_decode_hello() {
        let packet = Packet::encode(PacketCode::ClientHello, &sample_hello()).unwrap();
        let mut buf = encode_all(&[packet]);

        let decoded = decode_all(&mut buf);
        assert_eq!(decoded.len(), 1);
        let hello: ClientHello = decoded[0].decode_as(PacketCode::ClientHello).unwrap();
        assert_eq!(hello.app_info.name, "Example");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame() {
        let packet = Packet::encode(PacketCode::ClientHello, &sample_hello()).unwrap();
        let mut buf = encode_all(&[packet]);

        let half = buf.len() / 2;
        let mut partial = buf.split_to(half);
        let before = partial.len();

        let mut codec = PacketCodec;
        assert!(codec.decode(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), before, "partial frame must be left untouched");
    }

    #[test]
    fn test_header_only_split() {
        let mut codec = PacketCodec;
        let mut buf = BytesMut::from(&[5u8, 0, 0][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&[0, 0]);
        let ping = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(ping, Packet::empty(PacketCode::Ping));
    }

    #[test]
    fn test_multiple_frames_in_one_read() {
        let packets = vec![
            Packet::empty(PacketCode::ServerHello),
            Packet::empty(PacketCode::Resume),
            Packet::empty(PacketCode::Ping),
        ];
        let mut buf = encode_all(&packets);
        assert_eq!(decode_all(&mut buf), packets);
    }

    #[test]
    fn test_unknown_code_is_not_fatal() {
        let mut codec = PacketCodec;
        let mut buf = BytesMut::from(&[42u8, 0, 0, 0, 2, b'{', b'}'][..]);
        let packet = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(packet.code, PacketCode::Unknown(42));
        assert_eq!(&packet.payload[..], b"{}");
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = PacketCodec;
        let mut buf = BytesMut::new();
        buf.put_u8(6);
        buf.put_u32((MAX_PAYLOAD_SIZE + 1) as u32);
        buf.extend_from_slice(&[0u8; 16]);

        let result = codec.decode(&mut buf);
        assert!(matches!(
            result,
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_decode_as_wrong_code() {
        let packet = Packet::empty(PacketCode::Ping);
        let err = packet.decode_as::<ClientHello>(PacketCode::ClientHello);
        assert!(matches!(err, Err(ProtocolError::UnexpectedPacket { .. })));
    }

    fn arb_packet() -> impl Strategy<Value = Packet> {
        (any::<u8>(), proptest::collection::vec(any::<u8>(), 0..64)).prop_map(|(code, payload)| {
            Packet {
                code: PacketCode::from(code),
                payload: Bytes::from(payload),
            }
        })
    }

    proptest! {
        #[test]
        fn prop_arbitrary_split_matches_contiguous(
            packets in proptest::collection::vec(arb_packet(), 1..8),
            cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..6),
        ) {
            let wire = encode_all(&packets).freeze();

            let mut contiguous = BytesMut::from(&wire[..]);
            let expected = decode_all(&mut contiguous);

            let mut offsets: Vec<usize> = cuts.iter().map(|i| i.index(wire.len() + 1)).collect();
            offsets.push(0);
            offsets.push(wire.len());
            offsets.sort_unstable();
            offsets.dedup();

            let mut codec = PacketCodec;
            let mut buf = BytesMut::new();
            let mut got = Vec::new();
            for window in offsets.windows(2) {
                buf.extend_from_slice(&wire[window[0]..window[1]]);
                while let Some(packet) = codec.decode(&mut buf).unwrap() {
                    got.push(packet);
                }
            }

            prop_assert_eq!(&got, &expected);
            prop_assert_eq!(got, packets);
            prop_assert!(buf.is_empty());
        }
    }
}
