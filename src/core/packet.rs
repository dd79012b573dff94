//! IP header parsing for flow accounting. Headers only, no payload decoding.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use super::flows::{FlowKey, Protocol};

/// Flow identity and on-wire length of one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketMeta {
    pub key: FlowKey,
    pub length: u64,
}

/// Parse an IPv4 or IPv6 packet into its flow key and total length.
///
/// Ports are read for TCP and UDP only; other protocols get port 0. Returns
/// `None` for truncated or non-IP data.
pub fn parse_ip_packet(data: &[u8]) -> Option<PacketMeta> {
    let first = *data.first()?;

    let (protocol_byte, header_len, total_len, source, destination) = match first >> 4 {
        4 => {
            if data.len() < 20 {
                return None;
            }
            let ihl = ((first & 0x0F) as usize) * 4;
            if ihl < 20 {
                return None;
            }
            let total = u16::from_be_bytes([data[2], data[3]]) as u64;
            let src = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
            let dst = Ipv4Addr::new(data[16], data[17], data[18], data[19]);
            (data[9], ihl, total, IpAddr::V4(src), IpAddr::V4(dst))
        }
        6 => {
            if data.len() < 40 {
                return None;
            }
            let payload_len = u16::from_be_bytes([data[4], data[5]]) as u64;
            let src: [u8; 16] = data[8..24].try_into().ok()?;
            let dst: [u8; 16] = data[24..40].try_into().ok()?;
            (
                data[6],
                40,
                payload_len + 40,
                IpAddr::V6(Ipv6Addr::from(src)),
                IpAddr::V6(Ipv6Addr::from(dst)),
            )
        }
        _ => return None,
    };

    let protocol = Protocol::from_number(protocol_byte);
    let (source_port, destination_port) = match protocol {
        Protocol::Tcp | Protocol::Udp => {
            if data.len() < header_len + 4 {
                return None;
            }
            (
                u16::from_be_bytes([data[header_len], data[header_len + 1]]),
                u16::from_be_bytes([data[header_len + 2], data[header_len + 3]]),
            )
        }
        _ => (0, 0),
    };

    Some(PacketMeta {
        key: FlowKey {
            source,
            source_port,
            destination,
            destination_port,
            protocol,
        },
        length: total_len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal IPv4 packet: 20-byte header plus the 4 port bytes.
    fn build_ipv4_packet(protocol: u8, src_port: u16, dst_port: u16) -> Vec<u8> {
        let total_length: u16 = 24;
        let mut pkt = vec![0u8; total_length as usize];
        pkt[0] = 0x45;
        pkt[2..4].copy_from_slice(&total_length.to_be_bytes());
        pkt[9] = protocol;
        pkt[12..16].copy_from_slice(&[192, 168, 1, 20]);
        pkt[16..20].copy_from_slice(&[93, 184, 216, 34]);
        pkt[20..22].copy_from_slice(&src_port.to_be_bytes());
        pkt[22..24].copy_from_slice(&dst_port.to_be_bytes());
        pkt
    }

    fn build_ipv6_packet(next_header: u8, src_port: u16, dst_port: u16) -> Vec<u8> {
        let mut pkt = vec![0u8; 44];
        pkt[0] = 0x60;
        pkt[4..6].copy_from_slice(&4u16.to_be_bytes());
        pkt[6] = next_header;
        pkt[8..24].copy_from_slice(&Ipv6Addr::LOCALHOST.octets());
        pkt[24..40].copy_from_slice(&"fe80::1".parse::<Ipv6Addr>().unwrap().octets());
        pkt[40..42].copy_from_slice(&src_port.to_be_bytes());
        pkt[42..44].copy_from_slice(&dst_port.to_be_bytes());
        pkt
    }

    #[test]
    fn test_parse_ipv4_tcp() {
        let meta = parse_ip_packet(&build_ipv4_packet(6, 51000, 443)).unwrap();
        assert_eq!(meta.key.protocol, Protocol::Tcp);
        assert_eq!(meta.key.source, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)));
        assert_eq!(meta.key.destination, IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)));
        assert_eq!(meta.key.source_port, 51000);
        assert_eq!(meta.key.destination_port, 443);
        assert_eq!(meta.length, 24);
    }

    #[test]
    fn test_parse_ipv6_udp() {
        let meta = parse_ip_packet(&build_ipv6_packet(17, 5353, 53)).unwrap();
        assert_eq!(meta.key.protocol, Protocol::Udp);
        assert_eq!(meta.key.source, IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(meta.key.destination_port, 53);
        assert_eq!(meta.length, 44);
    }

    #[test]
    fn test_non_port_protocols_have_zero_ports() {
        let icmp = parse_ip_packet(&build_ipv4_packet(1, 0x0800, 0x1234)).unwrap();
        assert_eq!(icmp.key.protocol, Protocol::Icmp);
        assert_eq!((icmp.key.source_port, icmp.key.destination_port), (0, 0));

        let gre = parse_ip_packet(&build_ipv4_packet(47, 1, 2)).unwrap();
        assert_eq!(gre.key.protocol, Protocol::Other(47));
    }

    #[test]
    fn test_rejects_truncated_and_unknown_versions() {
        assert!(parse_ip_packet(&[]).is_none());
        assert!(parse_ip_packet(&[0x45; 10]).is_none());
        assert!(parse_ip_packet(&[0x60; 20]).is_none());
        assert!(parse_ip_packet(&[0x70; 60]).is_none());

        // IHL below the minimum header size.
        let mut bad_ihl = build_ipv4_packet(6, 1, 2);
        bad_ihl[0] = 0x44;
        assert!(parse_ip_packet(&bad_ihl).is_none());

        // TCP header cut before the ports.
        let short = &build_ipv4_packet(6, 1, 2)[..22];
        assert!(parse_ip_packet(short).is_none());
    }
}
