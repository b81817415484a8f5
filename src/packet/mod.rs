//! Minimal IPv4 header inspection
//!
//! Only what routing needs: the version nibble and the source/destination
//! addresses of a raw packet read from the tunnel interface.

use std::net::Ipv4Addr;

/// Minimum IPv4 header length
pub const IPV4_HEADER_LEN: usize = 20;

/// Returns `true` if the buffer starts with a complete IPv4 header
pub fn is_ipv4(packet: &[u8]) -> bool {
    packet.len() >= IPV4_HEADER_LEN && packet[0] >> 4 == 4
}

/// Destination address of an IPv4 packet (header bytes 16..20)
pub fn ipv4_destination(packet: &[u8]) -> Option<Ipv4Addr> {
    if !is_ipv4(packet) {
        return None;
    }
    Some(Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]))
}

/// Source address of an IPv4 packet (header bytes 12..16)
pub fn ipv4_source(packet: &[u8]) -> Option<Ipv4Addr> {
    if !is_ipv4(packet) {
        return None;
    }
    Some(Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]))
}

#[cfg(test)]
pub(crate) fn test_packet(src: Ipv4Addr, dst: Ipv4Addr, body: &[u8]) -> Vec<u8> {
    let total = (IPV4_HEADER_LEN + body.len()) as u16;
    let mut packet = vec![0u8; IPV4_HEADER_LEN];
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&total.to_be_bytes());
    packet[8] = 64;
    packet[9] = 17;
    packet[12..16].copy_from_slice(&src.octets());
    packet[16..20].copy_from_slice(&dst.octets());
    packet.extend_from_slice(body);
    packet
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addresses_extracted() {
        let packet = test_packet(
            Ipv4Addr::new(10, 8, 0, 3),
            Ipv4Addr::new(1, 1, 1, 1),
            b"hello",
        );
        assert!(is_ipv4(&packet));
        assert_eq!(ipv4_source(&packet), Some(Ipv4Addr::new(10, 8, 0, 3)));
        assert_eq!(ipv4_destination(&packet), Some(Ipv4Addr::new(1, 1, 1, 1)));
    }

    #[test]
    fn test_short_packet_rejected() {
        assert_eq!(ipv4_destination(&[0x45; 19]), None);
        assert_eq!(ipv4_destination(&[]), None);
    }

    #[test]
    fn test_ipv6_rejected() {
        let mut packet = vec![0u8; 40];
        packet[0] = 0x60;
        assert!(!is_ipv4(&packet));
        assert_eq!(ipv4_destination(&packet), None);
    }
}
