//! A fully-formed IP packet carrying a TCP segment, with zero-copy field
//! access and builders for replies.
//!
//! The IP layer (v4 and v6) is parsed and emitted with `etherparse`; the
//! TCP header itself, including the checksum over the RFC 1071
//! pseudo-header, is handled here so that the option area can be shaped
//! freely when replies are built.

use std::io;
use std::net::IpAddr;

use bitflags::bitflags;
use etherparse::{Ipv4Header, Ipv4HeaderSlice, Ipv6Header, Ipv6HeaderSlice};

use crate::quad::Quad;

/// TCP header length without options.
pub(crate) const TCP_HEADER_LEN: usize = 20;

const IPV4_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;
const IP_PROTOCOL_TCP: u8 = 6;
const REPLY_TTL: u8 = 64;

bitflags! {
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
    }
}

/// An owned IP packet whose payload is a TCP segment.
#[derive(Clone, Debug)]
pub struct Packet {
    buf: Vec<u8>,
    ip_len: usize,
}

fn invalid<E: ToString>(err: E) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err.to_string())
}

impl Packet {
    /// Validate and take ownership of an inbound IP packet.
    ///
    /// The buffer is truncated to the IP total length, so trailing read
    /// padding never counts as payload.
    pub fn parse(mut buf: Vec<u8>) -> io::Result<Packet> {
        let version = buf.first().map(|b| b >> 4);
        let (ip_len, total) = match version {
            Some(4) => {
                let ip = Ipv4HeaderSlice::from_slice(&buf).map_err(invalid)?;
                if ip.protocol() != IP_PROTOCOL_TCP {
                    return Err(invalid("not a TCP packet"));
                }
                (ip.slice().len(), ip.total_len() as usize)
            }
            Some(6) => {
                let ip = Ipv6HeaderSlice::from_slice(&buf).map_err(invalid)?;
                if ip.next_header() != IP_PROTOCOL_TCP {
                    return Err(invalid("not a TCP packet"));
                }
                (IPV6_HEADER_LEN, IPV6_HEADER_LEN + ip.payload_length() as usize)
            }
            _ => return Err(invalid("not an IP packet")),
        };
        if total > buf.len() || ip_len + TCP_HEADER_LEN > total {
            return Err(invalid("truncated TCP packet"));
        }
        buf.truncate(total);
        let pkt = Packet { buf, ip_len };
        let off = pkt.tcp()[12] as usize >> 4;
        if !(5..=15).contains(&off) || pkt.ip_len + off * 4 > pkt.buf.len() {
            return Err(invalid("bad TCP data offset"));
        }
        Ok(pkt)
    }

    /// Build an outbound packet for the connection `id` with room for
    /// `tcp_header_len - 20` bytes of options and `payload_len` bytes of
    /// payload. `id.src` is the peer, `id.dst` is this endpoint.
    pub(crate) fn reply(id: &Quad, tcp_header_len: usize, payload_len: usize) -> Packet {
        debug_assert!(tcp_header_len % 4 == 0 && (20..=60).contains(&tcp_header_len));
        let ip_payload = tcp_header_len + payload_len;
        let (mut buf, ip_len) = match (id.dst.0, id.src.0) {
            (IpAddr::V4(local), IpAddr::V4(peer)) => {
                let mut buf = vec![0u8; IPV4_HEADER_LEN + ip_payload];
                let header = Ipv4Header::new(
                    ip_payload as u16,
                    REPLY_TTL,
                    IP_PROTOCOL_TCP,
                    local.octets(),
                    peer.octets(),
                );
                let mut cursor = &mut buf[..];
                header.write(&mut cursor).expect("IPv4 header write");
                (buf, IPV4_HEADER_LEN)
            }
            (IpAddr::V6(local), IpAddr::V6(peer)) => {
                let mut buf = vec![0u8; IPV6_HEADER_LEN + ip_payload];
                let header = Ipv6Header {
                    traffic_class: 0,
                    flow_label: 0,
                    payload_length: ip_payload as u16,
                    next_header: IP_PROTOCOL_TCP,
                    hop_limit: REPLY_TTL,
                    source: local.octets(),
                    destination: peer.octets(),
                };
                let mut cursor = &mut buf[..];
                header.write(&mut cursor).expect("IPv6 header write");
                (buf, IPV6_HEADER_LEN)
            }
            _ => unreachable!("connection id mixes address families"),
        };
        {
            let tcp = &mut buf[ip_len..];
            tcp[..2].copy_from_slice(&id.dst.1.to_be_bytes());
            tcp[2..4].copy_from_slice(&id.src.1.to_be_bytes());
            tcp[12] = ((tcp_header_len / 4) as u8) << 4;
        }
        Packet { buf, ip_len }
    }

    /// Build the RFC 9293 reset reply to this packet.
    ///
    /// If the offending segment carried an ACK, the reset takes its
    /// sequence number from that ack field; otherwise the reset has
    /// sequence zero and acknowledges the segment's sequence plus length.
    pub(crate) fn reset_reply(&self) -> Packet {
        let mut pkt = Packet::reply(&self.quad(), TCP_HEADER_LEN, 0);
        if self.ack() {
            pkt.set_sequence(self.ack_number());
            pkt.set_rst(true);
        } else {
            let mut seglen = self.payload_len() as u32;
            if self.syn() {
                seglen += 1;
            }
            if self.fin() {
                seglen += 1;
            }
            pkt.set_sequence(0);
            pkt.set_ack_number(self.sequence().wrapping_add(seglen));
            pkt.set_rst(true);
            pkt.set_ack(true);
        }
        pkt.set_checksum();
        pkt
    }

    /// The 5-tuple as observed on the wire: `src` is the sender.
    pub(crate) fn quad(&self) -> Quad {
        let ip = &self.buf[..self.ip_len];
        let (src, dst) = if ip[0] >> 4 == 4 {
            let s: [u8; 4] = ip[12..16].try_into().expect("IPv4 source");
            let d: [u8; 4] = ip[16..20].try_into().expect("IPv4 destination");
            (IpAddr::from(s), IpAddr::from(d))
        } else {
            let s: [u8; 16] = ip[8..24].try_into().expect("IPv6 source");
            let d: [u8; 16] = ip[24..40].try_into().expect("IPv6 destination");
            (IpAddr::from(s), IpAddr::from(d))
        };
        Quad {
            src: (src, self.source_port()),
            dst: (dst, self.destination_port()),
        }
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    fn tcp(&self) -> &[u8] {
        &self.buf[self.ip_len..]
    }

    fn tcp_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.ip_len..]
    }

    fn be16(&self, at: usize) -> u16 {
        let tcp = self.tcp();
        u16::from_be_bytes([tcp[at], tcp[at + 1]])
    }

    fn be32(&self, at: usize) -> u32 {
        let tcp = self.tcp();
        u32::from_be_bytes([tcp[at], tcp[at + 1], tcp[at + 2], tcp[at + 3]])
    }

    pub(crate) fn source_port(&self) -> u16 {
        self.be16(0)
    }

    pub(crate) fn destination_port(&self) -> u16 {
        self.be16(2)
    }

    pub(crate) fn sequence(&self) -> u32 {
        self.be32(4)
    }

    pub(crate) fn set_sequence(&mut self, seq: u32) {
        self.tcp_mut()[4..8].copy_from_slice(&seq.to_be_bytes());
    }

    pub(crate) fn ack_number(&self) -> u32 {
        self.be32(8)
    }

    pub(crate) fn set_ack_number(&mut self, ack: u32) {
        self.tcp_mut()[8..12].copy_from_slice(&ack.to_be_bytes());
    }

    fn data_offset(&self) -> usize {
        (self.tcp()[12] as usize >> 4) * 4
    }

    pub(crate) fn flags(&self) -> TcpFlags {
        TcpFlags::from_bits_truncate(self.tcp()[13])
    }

    pub(crate) fn set_flags(&mut self, flags: TcpFlags) {
        self.tcp_mut()[13] = flags.bits();
    }

    fn set_flag(&mut self, flag: TcpFlags, on: bool) {
        let mut flags = self.flags();
        flags.set(flag, on);
        self.tcp_mut()[13] = flags.bits();
    }

    pub(crate) fn syn(&self) -> bool {
        self.flags().contains(TcpFlags::SYN)
    }

    pub(crate) fn ack(&self) -> bool {
        self.flags().contains(TcpFlags::ACK)
    }

    pub(crate) fn fin(&self) -> bool {
        self.flags().contains(TcpFlags::FIN)
    }

    pub(crate) fn rst(&self) -> bool {
        self.flags().contains(TcpFlags::RST)
    }

    pub(crate) fn only_ack(&self) -> bool {
        self.flags() == TcpFlags::ACK
    }

    pub(crate) fn set_syn(&mut self, on: bool) {
        self.set_flag(TcpFlags::SYN, on);
    }

    pub(crate) fn set_ack(&mut self, on: bool) {
        self.set_flag(TcpFlags::ACK, on);
    }

    pub(crate) fn set_fin(&mut self, on: bool) {
        self.set_flag(TcpFlags::FIN, on);
    }

    pub(crate) fn set_rst(&mut self, on: bool) {
        self.set_flag(TcpFlags::RST, on);
    }

    pub(crate) fn set_psh(&mut self, on: bool) {
        self.set_flag(TcpFlags::PSH, on);
    }

    pub(crate) fn copy_flags_from(&mut self, other: &Packet) {
        self.set_flags(other.flags());
    }

    pub(crate) fn window_size(&self) -> u16 {
        self.be16(14)
    }

    pub(crate) fn set_window_size(&mut self, window: u16) {
        self.tcp_mut()[14..16].copy_from_slice(&window.to_be_bytes());
    }

    pub(crate) fn options(&self) -> &[u8] {
        let off = self.data_offset();
        &self.tcp()[TCP_HEADER_LEN..off]
    }

    pub(crate) fn options_mut(&mut self) -> &mut [u8] {
        let off = self.data_offset();
        &mut self.tcp_mut()[TCP_HEADER_LEN..off]
    }

    pub(crate) fn payload(&self) -> &[u8] {
        let off = self.data_offset();
        &self.tcp()[off..]
    }

    pub(crate) fn payload_mut(&mut self) -> &mut [u8] {
        let off = self.data_offset();
        &mut self.tcp_mut()[off..]
    }

    pub(crate) fn payload_len(&self) -> usize {
        self.payload().len()
    }

    /// Compute and store the TCP checksum over the pseudo-header, header
    /// and payload, per RFC 1071.
    pub(crate) fn set_checksum(&mut self) {
        self.tcp_mut()[16..18].fill(0);
        let tcp_len = self.buf.len() - self.ip_len;
        let ip = &self.buf[..self.ip_len];
        let mut sum: u32 = 0;
        if ip[0] >> 4 == 4 {
            sum += sum_bytes(&ip[12..20]);
        } else {
            sum += sum_bytes(&ip[8..40]);
        }
        sum += u32::from(IP_PROTOCOL_TCP);
        sum += tcp_len as u32;
        sum += sum_bytes(&self.buf[self.ip_len..]);
        while sum > 0xffff {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        let checksum = !(sum as u16);
        self.tcp_mut()[16..18].copy_from_slice(&checksum.to_be_bytes());
    }

    /// Re-run the checksum over the stored packet; a correct packet folds
    /// to all ones.
    #[cfg(test)]
    pub(crate) fn checksum_ok(&self) -> bool {
        let tcp_len = self.buf.len() - self.ip_len;
        let ip = &self.buf[..self.ip_len];
        let mut sum: u32 = if ip[0] >> 4 == 4 {
            sum_bytes(&ip[12..20])
        } else {
            sum_bytes(&ip[8..40])
        };
        sum += u32::from(IP_PROTOCOL_TCP) + tcp_len as u32;
        sum += sum_bytes(&self.buf[self.ip_len..]);
        while sum > 0xffff {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        sum == 0xffff
    }
}

fn sum_bytes(bytes: &[u8]) -> u32 {
    let mut sum = 0u32;
    let mut chunks = bytes.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    fn quad_v4() -> Quad {
        Quad {
            src: (IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 43210),
            dst: (IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 8080),
        }
    }

    fn quad_v6() -> Quad {
        Quad {
            src: (IpAddr::V6(Ipv6Addr::LOCALHOST), 43210),
            dst: (IpAddr::V6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 1)), 8080),
        }
    }

    #[test]
    fn reply_round_trips_through_parse() {
        let mut pkt = Packet::reply(&quad_v4(), TCP_HEADER_LEN + 4, 5);
        pkt.set_sequence(1_000_000);
        pkt.set_ack_number(2_000_000);
        pkt.set_ack(true);
        pkt.set_psh(true);
        pkt.set_window_size(4096);
        pkt.payload_mut().copy_from_slice(b"hello");
        pkt.set_checksum();

        let parsed = Packet::parse(pkt.as_bytes().to_vec()).unwrap();
        assert_eq!(parsed.source_port(), 8080);
        assert_eq!(parsed.destination_port(), 43210);
        assert_eq!(parsed.sequence(), 1_000_000);
        assert_eq!(parsed.ack_number(), 2_000_000);
        assert_eq!(parsed.window_size(), 4096);
        assert_eq!(parsed.payload(), b"hello");
        assert_eq!(parsed.options().len(), 4);
        assert!(parsed.flags().contains(TcpFlags::ACK | TcpFlags::PSH));
        assert!(parsed.checksum_ok());
    }

    #[test]
    fn reply_addresses_run_from_local_to_peer() {
        let pkt = Packet::reply(&quad_v4(), TCP_HEADER_LEN, 0);
        // The reply's wire source is our end, so its quad points back at us.
        let q = pkt.quad();
        assert_eq!(q.src, quad_v4().dst);
        assert_eq!(q.dst, quad_v4().src);
    }

    #[test]
    fn ipv6_reply_round_trips() {
        let mut pkt = Packet::reply(&quad_v6(), TCP_HEADER_LEN, 3);
        pkt.set_sequence(7);
        pkt.set_ack(true);
        pkt.payload_mut().copy_from_slice(b"abc");
        pkt.set_checksum();
        let parsed = Packet::parse(pkt.as_bytes().to_vec()).unwrap();
        assert_eq!(parsed.quad().dst, quad_v6().src);
        assert_eq!(parsed.payload(), b"abc");
        assert!(parsed.checksum_ok());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Packet::parse(vec![]).is_err());
        assert!(Packet::parse(vec![0x40; 10]).is_err());
        // Valid IPv4 header but UDP inside.
        let mut pkt = Packet::reply(&quad_v4(), TCP_HEADER_LEN, 0);
        let mut buf = pkt.as_bytes().to_vec();
        buf[9] = 17;
        assert!(Packet::parse(buf).is_err());
        // Data offset pointing past the end.
        pkt.set_checksum();
        let mut buf = pkt.as_bytes().to_vec();
        buf[20 + 12] = 15 << 4;
        assert!(Packet::parse(buf).is_err());
    }

    #[test]
    fn parse_drops_trailing_read_padding() {
        let mut pkt = Packet::reply(&quad_v4(), TCP_HEADER_LEN, 2);
        pkt.payload_mut().copy_from_slice(b"ok");
        pkt.set_checksum();
        let mut buf = pkt.as_bytes().to_vec();
        buf.extend_from_slice(&[0u8; 32]);
        let parsed = Packet::parse(buf).unwrap();
        assert_eq!(parsed.payload(), b"ok");
    }

    #[test]
    fn reset_reply_to_a_segment_with_ack() {
        let mut pkt = Packet::reply(&quad_v4(), TCP_HEADER_LEN, 0);
        pkt.set_sequence(500);
        pkt.set_ack_number(901);
        pkt.set_ack(true);
        let rst = pkt.reset_reply();
        assert!(rst.rst());
        assert!(!rst.ack());
        assert_eq!(rst.sequence(), 901);
        assert!(rst.checksum_ok());
    }

    #[test]
    fn reset_reply_to_a_bare_syn() {
        let mut pkt = Packet::reply(&quad_v4(), TCP_HEADER_LEN, 0);
        pkt.set_sequence(500);
        pkt.set_syn(true);
        let rst = pkt.reset_reply();
        assert!(rst.rst() && rst.ack());
        assert_eq!(rst.sequence(), 0);
        assert_eq!(rst.ack_number(), 501);
    }

    #[test]
    fn only_ack_detects_extra_flags() {
        let mut pkt = Packet::reply(&quad_v4(), TCP_HEADER_LEN, 0);
        pkt.set_ack(true);
        assert!(pkt.only_ack());
        pkt.set_fin(true);
        assert!(!pkt.only_ack());
    }

    #[test]
    fn checksum_detects_corruption() {
        let mut pkt = Packet::reply(&quad_v4(), TCP_HEADER_LEN, 4);
        pkt.payload_mut().copy_from_slice(b"data");
        pkt.set_checksum();
        assert!(pkt.checksum_ok());
        pkt.payload_mut()[0] ^= 0xff;
        assert!(!pkt.checksum_ok());
    }
}
