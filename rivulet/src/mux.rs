use rivulet_stun::message::is_message;

/// Where an inbound datagram belongs. First-byte triage per RFC 7983 /
/// RFC 5764 §5.1.2: the DTLS range is tested before STUN because a DTLS
/// record's first byte also passes the STUN top-two-bits-zero test.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Demux {
    Dtls,
    Stun,
    Unknown,
}

pub fn classify(buf: &[u8]) -> Demux {
    match buf.first() {
        Some(b) if (20..=63).contains(b) => Demux::Dtls,
        Some(_) if is_message(buf) => Demux::Stun,
        _ => Demux::Unknown,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rivulet_stun::message::{Message, BINDING_REQUEST};

    #[test]
    fn test_dtls_range() {
        for b in 20u8..=63 {
            let mut datagram = vec![b];
            datagram.extend_from_slice(&[0u8; 30]);
            assert_eq!(classify(&datagram), Demux::Dtls, "first byte {b}");
        }
    }

    #[test]
    fn test_stun_message() {
        let mut m = Message::new();
        m.set_type(BINDING_REQUEST);
        m.new_transaction_id();
        m.write_header();
        assert_eq!(classify(&m.raw), Demux::Stun);
    }

    #[test]
    fn test_dtls_wins_over_stun_shape() {
        // 22 (a DTLS handshake record) has its top two bits clear, so the
        // STUN test alone would claim it.
        let mut datagram = vec![22u8];
        datagram.extend_from_slice(&[0u8; 30]);
        assert!(is_message(&datagram));
        assert_eq!(classify(&datagram), Demux::Dtls);
    }

    #[test]
    fn test_unknown() {
        assert_eq!(classify(&[]), Demux::Unknown);
        assert_eq!(classify(&[0x80, 0, 0, 0]), Demux::Unknown);
        // STUN-shaped first byte but too short for a header.
        assert_eq!(classify(&[0x00, 0x01]), Demux::Unknown);
    }
}
