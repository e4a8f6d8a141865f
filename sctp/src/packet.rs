use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::chunk::chunk_cookie_ack::ChunkCookieAck;
use crate::chunk::chunk_cookie_echo::ChunkCookieEcho;
use crate::chunk::chunk_header::*;
use crate::chunk::chunk_heartbeat::ChunkHeartbeat;
use crate::chunk::chunk_heartbeat_ack::ChunkHeartbeatAck;
use crate::chunk::chunk_init::ChunkInit;
use crate::chunk::chunk_payload_data::ChunkPayloadData;
use crate::chunk::chunk_selective_ack::ChunkSelectiveAck;
use crate::chunk::chunk_shutdown::ChunkShutdown;
use crate::chunk::chunk_shutdown_ack::ChunkShutdownAck;
use crate::chunk::chunk_shutdown_complete::ChunkShutdownComplete;
use crate::chunk::chunk_type::*;
use crate::chunk::chunk_unknown::ChunkUnknown;
use crate::chunk::Chunk;
use crate::error::{Error, Result};
use crate::util::*;

/// Packet is the SCTP common header (source port, destination port,
/// verification tag, CRC-32C checksum) followed by back-to-back padded
/// chunks (RFC 4960 §3).
#[derive(Default, Debug)]
pub(crate) struct Packet {
    pub(crate) source_port: u16,
    pub(crate) destination_port: u16,
    pub(crate) verification_tag: u32,
    pub(crate) chunks: Vec<Box<dyn Chunk + Send + Sync>>,
}

impl PartialEq for Packet {
    fn eq(&self, other: &Self) -> bool {
        self.source_port == other.source_port
            && self.destination_port == other.destination_port
            && self.verification_tag == other.verification_tag
            && self.chunks.len() == other.chunks.len()
            && self
                .chunks
                .iter()
                .zip(other.chunks.iter())
                .all(|(a, b)| a.to_string() == b.to_string())
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Packet src={} dst={} vtag={}",
            self.source_port, self.destination_port, self.verification_tag
        )?;
        for chunk in &self.chunks {
            write!(f, "\n {chunk}")?;
        }
        Ok(())
    }
}

pub(crate) const PACKET_HEADER_SIZE: usize = 12;

impl Packet {
    pub(crate) fn unmarshal(raw: &Bytes) -> Result<Self> {
        if raw.len() < PACKET_HEADER_SIZE {
            return Err(Error::ErrPacketRawTooSmall);
        }

        let reader = &mut raw.clone();
        let source_port = reader.get_u16();
        let destination_port = reader.get_u16();
        let verification_tag = reader.get_u32();

        // The checksum is stored little-endian and computed with the
        // field itself zeroed; the digest walks around it instead of
        // copying the packet.
        let their_checksum = reader.get_u32_le();
        let our_checksum = generate_packet_checksum(raw);
        if their_checksum != our_checksum {
            return Err(Error::ErrChecksumMismatch {
                expected: our_checksum,
                actual: their_checksum,
            });
        }

        let mut chunks = vec![];
        let mut offset = PACKET_HEADER_SIZE;
        loop {
            if offset == raw.len() {
                break;
            } else if offset + CHUNK_HEADER_SIZE > raw.len() {
                return Err(Error::ErrParseSctpChunkNotEnoughData);
            }

            let rest = raw.slice(offset..);
            let c: Box<dyn Chunk + Send + Sync> = match ChunkType(raw[offset]) {
                CT_INIT | CT_INIT_ACK => Box::new(ChunkInit::unmarshal(&rest)?),
                CT_PAYLOAD_DATA => Box::new(ChunkPayloadData::unmarshal(&rest)?),
                CT_SACK => Box::new(ChunkSelectiveAck::unmarshal(&rest)?),
                CT_COOKIE_ECHO => Box::new(ChunkCookieEcho::unmarshal(&rest)?),
                CT_COOKIE_ACK => Box::new(ChunkCookieAck::unmarshal(&rest)?),
                CT_HEARTBEAT => Box::new(ChunkHeartbeat::unmarshal(&rest)?),
                CT_HEARTBEAT_ACK => Box::new(ChunkHeartbeatAck::unmarshal(&rest)?),
                CT_SHUTDOWN => Box::new(ChunkShutdown::unmarshal(&rest)?),
                CT_SHUTDOWN_ACK => Box::new(ChunkShutdownAck::unmarshal(&rest)?),
                CT_SHUTDOWN_COMPLETE => Box::new(ChunkShutdownComplete::unmarshal(&rest)?),
                _ => Box::new(ChunkUnknown::unmarshal(&rest)?),
            };

            let chunk_value_padding = get_padding_size(c.value_length());
            offset += CHUNK_HEADER_SIZE + c.value_length() + chunk_value_padding;
            chunks.push(c);
        }

        Ok(Packet {
            source_port,
            destination_port,
            verification_tag,
            chunks,
        })
    }

    pub(crate) fn marshal_to(&self, writer: &mut BytesMut) -> Result<usize> {
        writer.put_u16(self.source_port);
        writer.put_u16(self.destination_port);
        writer.put_u32(self.verification_tag);

        let checksum_pos = writer.len();
        writer.extend_from_slice(&[0, 0, 0, 0]);

        for c in &self.chunks {
            c.marshal_to(writer)?;
            let padding_needed = get_padding_size(writer.len());
            if padding_needed != 0 {
                writer.extend_from_slice(&[0u8; PADDING_MULTIPLE][..padding_needed]);
            }
        }

        let mut digest = ISCSI_CRC.digest();
        digest.update(writer);
        let checksum = digest.finalize();
        writer[checksum_pos..checksum_pos + 4].copy_from_slice(&checksum.to_le_bytes());

        Ok(writer.len())
    }

    pub(crate) fn marshal(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE);
        self.marshal_to(&mut buf)?;
        Ok(buf.freeze())
    }

    pub(crate) fn check_packet(&self) -> Result<()> {
        // Port number 0 is not allowed in either direction (RFC 4960 §8.4).
        if self.source_port == 0 {
            return Err(Error::ErrSctpPacketSourcePortZero);
        }
        if self.destination_port == 0 {
            return Err(Error::ErrSctpPacketDestinationPortZero);
        }

        for c in &self.chunks {
            if let Some(ci) = c.as_any().downcast_ref::<ChunkInit>() {
                if !ci.is_ack {
                    // An INIT must travel alone and under verification
                    // tag zero (RFC 4960 §8.5.1).
                    if self.chunks.len() != 1 {
                        return Err(Error::ErrInitChunkBundled);
                    }
                    if self.verification_tag != 0 {
                        return Err(Error::ErrInitChunkVerifyTagNotZero);
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_packet_header_only_roundtrip() -> Result<()> {
        let pkt = Packet {
            source_port: 5000,
            destination_port: 5000,
            verification_tag: 0,
            chunks: vec![],
        };
        let raw = pkt.marshal()?;
        assert_eq!(raw.len(), PACKET_HEADER_SIZE);

        let decoded = Packet::unmarshal(&raw)?;
        assert_eq!(decoded.source_port, 5000);
        assert_eq!(decoded.destination_port, 5000);
        assert_eq!(decoded.verification_tag, 0);
        assert!(decoded.chunks.is_empty());
        Ok(())
    }

    #[test]
    fn test_packet_unmarshal_too_small() {
        assert_eq!(
            Packet::unmarshal(&Bytes::new()),
            Err(Error::ErrPacketRawTooSmall)
        );
    }

    #[test]
    fn test_packet_roundtrip_with_data_chunk() -> Result<()> {
        let pkt = Packet {
            source_port: 5000,
            destination_port: 5001,
            verification_tag: 0x0102_0304,
            chunks: vec![Box::new(ChunkPayloadData {
                beginning_fragment: true,
                ending_fragment: true,
                tsn: 1000,
                stream_identifier: 0,
                stream_sequence_number: 0,
                payload_type: crate::chunk::chunk_payload_data::PayloadProtocolIdentifier::String,
                user_data: Bytes::from_static(b"hello"),
                ..Default::default()
            })],
        };
        let raw = pkt.marshal()?;
        // 5-byte user data pads the chunk out to a 4-byte boundary.
        assert_eq!(raw.len() % 4, 0);

        let decoded = Packet::unmarshal(&raw)?;
        assert_eq!(decoded.source_port, 5000);
        assert_eq!(decoded.destination_port, 5001);
        assert_eq!(decoded.verification_tag, 0x0102_0304);
        assert_eq!(decoded.chunks.len(), 1);
        let data = decoded.chunks[0]
            .as_any()
            .downcast_ref::<ChunkPayloadData>()
            .unwrap();
        assert_eq!(data.tsn, 1000);
        assert_eq!(&data.user_data[..], b"hello");
        Ok(())
    }

    #[test]
    fn test_packet_checksum_detects_bit_flips() -> Result<()> {
        let pkt = Packet {
            source_port: 5000,
            destination_port: 5000,
            verification_tag: 7,
            chunks: vec![Box::new(ChunkCookieAck {})],
        };
        let raw = pkt.marshal()?;

        for i in 0..raw.len() {
            for bit in 0..8 {
                let mut corrupted = raw.to_vec();
                corrupted[i] ^= 1 << bit;
                let result = Packet::unmarshal(&Bytes::from(corrupted));
                assert!(result.is_err(), "flip byte {i} bit {bit} went unnoticed");
            }
        }
        Ok(())
    }

    #[test]
    fn test_check_packet() -> Result<()> {
        let mut pkt = Packet {
            source_port: 0,
            destination_port: 5000,
            verification_tag: 0,
            chunks: vec![],
        };
        assert_eq!(pkt.check_packet(), Err(Error::ErrSctpPacketSourcePortZero));

        pkt.source_port = 5000;
        pkt.destination_port = 0;
        assert_eq!(
            pkt.check_packet(),
            Err(Error::ErrSctpPacketDestinationPortZero)
        );

        pkt.destination_port = 5000;
        pkt.chunks = vec![
            Box::new(ChunkInit {
                initiate_tag: 1,
                ..Default::default()
            }),
            Box::new(ChunkCookieAck {}),
        ];
        assert_eq!(pkt.check_packet(), Err(Error::ErrInitChunkBundled));

        pkt.chunks = vec![Box::new(ChunkInit {
            initiate_tag: 1,
            ..Default::default()
        })];
        pkt.verification_tag = 5;
        assert_eq!(pkt.check_packet(), Err(Error::ErrInitChunkVerifyTagNotZero));

        pkt.verification_tag = 0;
        pkt.check_packet()?;
        Ok(())
    }
}
