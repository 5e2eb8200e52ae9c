/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Link, network and transport header parsing into [`HeaderFields`].
//!
//! Only the fields tracked per flow are extracted. Packets are usually
//! truncated by the capture snaplen, so payload lengths are taken from the
//! IP header and never from the captured buffer.

use std::net::IpAddr;

use pnet::packet::{
    ethernet::EthernetPacket,
    ip::{IpNextHeaderProtocol, IpNextHeaderProtocols},
    ipv4::Ipv4Packet,
    ipv6::Ipv6Packet,
    tcp::TcpPacket,
    udp::UdpPacket,
};
use thiserror::Error;

use super::{
    enums::{EthernetType, FlowType, LinkType, TcpFlags},
    flow_id::FlowId,
};

const ETH_HEADER_SIZE: usize = 14;
const VLAN_HEADER_SIZE: usize = 4;
const SLL_HEADER_SIZE: usize = 16;
const NULL_HEADER_SIZE: usize = 4;
const IPV6_HEADER_SIZE: usize = 40;

// BSD loopback address families, in either byte order
const AF_INET: u32 = 2;
const AF_INET6: [u32; 3] = [24, 28, 30];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("packet truncated")]
    Truncated,
    #[error("unsupported link type {0}")]
    UnsupportedLinkType(i32),
    #[error("unsupported ether type {0:#06x}")]
    UnsupportedEtherType(u16),
    #[error("unsupported ip protocol {0}")]
    UnsupportedProtocol(u8),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TcpFields {
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub win: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transport {
    Tcp(TcpFields),
    Udp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeaderFields {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub ip_id: u16,
    pub ip_ttl: u8,
    // total length from the ip header, including the ip header itself
    pub ip_len: u16,
    pub transport: Transport,
}

impl HeaderFields {
    pub fn flow_type(&self) -> FlowType {
        match self.transport {
            Transport::Tcp(_) => FlowType::Tcp,
            Transport::Udp => FlowType::Udp,
        }
    }

    pub fn flow_id(&self) -> FlowId {
        FlowId::new(
            self.flow_type(),
            self.src,
            self.src_port,
            self.dst,
            self.dst_port,
        )
    }
}

struct IpHeader {
    src: IpAddr,
    dst: IpAddr,
    id: u16,
    ttl: u8,
    total_len: u16,
    protocol: IpNextHeaderProtocol,
}

pub fn parse(raw: &[u8], link_type: LinkType) -> Result<HeaderFields> {
    let offset = match link_type {
        LinkType::Ethernet => return parse_ethernet(raw),
        LinkType::LinuxSLL => {
            if raw.len() < SLL_HEADER_SIZE {
                return Err(Error::Truncated);
            }
            let protocol = u16::from_be_bytes([raw[14], raw[15]]);
            return parse_ether_type(protocol, &raw[SLL_HEADER_SIZE..]);
        }
        LinkType::Null | LinkType::Loop => {
            if raw.len() < NULL_HEADER_SIZE {
                return Err(Error::Truncated);
            }
            let family = u32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]);
            let swapped = family.swap_bytes();
            if family != AF_INET
                && swapped != AF_INET
                && !AF_INET6.contains(&family)
                && !AF_INET6.contains(&swapped)
            {
                return Err(Error::UnsupportedEtherType(family as u16));
            }
            NULL_HEADER_SIZE
        }
        LinkType::Raw | LinkType::Ipv4 | LinkType::Ipv6 => 0,
    };
    parse_ip(&raw[offset..])
}

fn parse_ethernet(raw: &[u8]) -> Result<HeaderFields> {
    let eth = EthernetPacket::new(raw).ok_or(Error::Truncated)?;
    let mut ether_type = eth.get_ethertype().0;
    let mut offset = ETH_HEADER_SIZE;
    while EthernetType::Dot1Q == ether_type || EthernetType::QinQ == ether_type {
        if raw.len() < offset + VLAN_HEADER_SIZE {
            return Err(Error::Truncated);
        }
        ether_type = u16::from_be_bytes([raw[offset + 2], raw[offset + 3]]);
        offset += VLAN_HEADER_SIZE;
    }
    parse_ether_type(ether_type, &raw[offset..])
}

fn parse_ether_type(ether_type: u16, raw: &[u8]) -> Result<HeaderFields> {
    match EthernetType::try_from(ether_type) {
        Ok(EthernetType::Ipv4) | Ok(EthernetType::Ipv6) => parse_ip(raw),
        _ => Err(Error::UnsupportedEtherType(ether_type)),
    }
}

fn parse_ip(raw: &[u8]) -> Result<HeaderFields> {
    let version = raw.first().ok_or(Error::Truncated)? >> 4;
    let (ip, l4) = match version {
        4 => {
            let packet = Ipv4Packet::new(raw).ok_or(Error::Truncated)?;
            let header_len = packet.get_header_length() as usize * 4;
            if header_len < 20 || raw.len() < header_len {
                return Err(Error::Truncated);
            }
            (
                IpHeader {
                    src: packet.get_source().into(),
                    dst: packet.get_destination().into(),
                    id: packet.get_identification(),
                    ttl: packet.get_ttl(),
                    total_len: packet.get_total_length(),
                    protocol: packet.get_next_level_protocol(),
                },
                &raw[header_len..],
            )
        }
        6 => {
            let packet = Ipv6Packet::new(raw).ok_or(Error::Truncated)?;
            (
                IpHeader {
                    src: packet.get_source().into(),
                    dst: packet.get_destination().into(),
                    id: 0,
                    ttl: packet.get_hop_limit(),
                    total_len: packet
                        .get_payload_length()
                        .saturating_add(IPV6_HEADER_SIZE as u16),
                    protocol: packet.get_next_header(),
                },
                &raw[IPV6_HEADER_SIZE..],
            )
        }
        _ => return Err(Error::UnsupportedEtherType(version as u16)),
    };

    let (src_port, dst_port, transport) = match ip.protocol {
        IpNextHeaderProtocols::Tcp => {
            let tcp = TcpPacket::new(l4).ok_or(Error::Truncated)?;
            (
                tcp.get_source(),
                tcp.get_destination(),
                Transport::Tcp(TcpFields {
                    seq: tcp.get_sequence(),
                    ack: tcp.get_acknowledgement(),
                    flags: TcpFlags::from_bits_truncate((tcp.get_flags() & 0xFF) as u8),
                    win: tcp.get_window(),
                }),
            )
        }
        IpNextHeaderProtocols::Udp => {
            let udp = UdpPacket::new(l4).ok_or(Error::Truncated)?;
            (udp.get_source(), udp.get_destination(), Transport::Udp)
        }
        other => return Err(Error::UnsupportedProtocol(other.0)),
    };

    Ok(HeaderFields {
        src: ip.src,
        dst: ip.dst,
        src_port,
        dst_port,
        ip_id: ip.id,
        ip_ttl: ip.ttl,
        ip_len: ip.total_len,
        transport,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    /// Builds an ethernet + ipv4 + tcp/udp frame with the given header values.
    pub(crate) fn ipv4_frame(fields: &HeaderFields) -> Vec<u8> {
        let (src, dst) = match (fields.src, fields.dst) {
            (IpAddr::V4(s), IpAddr::V4(d)) => (s, d),
            _ => panic!("ipv4 only"),
        };
        let mut frame = vec![0u8; ETH_HEADER_SIZE];
        frame[12..14].copy_from_slice(&0x0800u16.to_be_bytes());

        let mut ip = vec![0u8; 20];
        ip[0] = 0x45;
        ip[2..4].copy_from_slice(&fields.ip_len.to_be_bytes());
        ip[4..6].copy_from_slice(&fields.ip_id.to_be_bytes());
        ip[8] = fields.ip_ttl;
        ip[12..16].copy_from_slice(&src.octets());
        ip[16..20].copy_from_slice(&dst.octets());

        let mut l4 = match fields.transport {
            Transport::Tcp(tcp) => {
                ip[9] = 6;
                let mut l4 = vec![0u8; 20];
                l4[4..8].copy_from_slice(&tcp.seq.to_be_bytes());
                l4[8..12].copy_from_slice(&tcp.ack.to_be_bytes());
                l4[12] = 5 << 4;
                l4[13] = tcp.flags.bits();
                l4[14..16].copy_from_slice(&tcp.win.to_be_bytes());
                l4
            }
            Transport::Udp => {
                ip[9] = 17;
                vec![0u8; 8]
            }
        };
        l4[0..2].copy_from_slice(&fields.src_port.to_be_bytes());
        l4[2..4].copy_from_slice(&fields.dst_port.to_be_bytes());

        frame.extend_from_slice(&ip);
        frame.extend_from_slice(&l4);
        frame
    }

    fn tcp_fields() -> HeaderFields {
        HeaderFields {
            src: Ipv4Addr::new(192, 168, 1, 10).into(),
            dst: Ipv4Addr::new(93, 184, 216, 34).into(),
            src_port: 51000,
            dst_port: 443,
            ip_id: 0x1234,
            ip_ttl: 64,
            ip_len: 1500,
            transport: Transport::Tcp(TcpFields {
                seq: 0xdeadbeef,
                ack: 7,
                flags: TcpFlags::PSH_ACK,
                win: 29200,
            }),
        }
    }

    #[test]
    fn ethernet_tcp() {
        let fields = tcp_fields();
        let frame = ipv4_frame(&fields);
        assert_eq!(parse(&frame, LinkType::Ethernet), Ok(fields));
        assert_eq!(fields.flow_id().flow_type, FlowType::Tcp);
    }

    #[test]
    fn keeps_full_flags_byte() {
        let mut frame = ipv4_frame(&tcp_fields());
        frame[ETH_HEADER_SIZE + 20 + 13] = 0xC2;
        let parsed = parse(&frame, LinkType::Ethernet).unwrap();
        match parsed.transport {
            Transport::Tcp(tcp) => {
                assert_eq!(tcp.flags.bits(), 0xC2);
                assert!(tcp.flags.contains(TcpFlags::SYN | TcpFlags::ECE | TcpFlags::CWR));
            }
            Transport::Udp => panic!("expected tcp"),
        }
    }

    #[test]
    fn ethernet_udp_with_vlan() {
        let mut fields = tcp_fields();
        fields.transport = Transport::Udp;
        let plain = ipv4_frame(&fields);
        let mut tagged = plain[..12].to_vec();
        tagged.extend_from_slice(&[0x81, 0x00, 0x00, 0x0a]);
        tagged.extend_from_slice(&plain[12..]);
        assert_eq!(parse(&tagged, LinkType::Ethernet), Ok(fields));
    }

    #[test]
    fn raw_and_sll() {
        let fields = tcp_fields();
        let frame = ipv4_frame(&fields);
        assert_eq!(parse(&frame[ETH_HEADER_SIZE..], LinkType::Raw), Ok(fields));

        let mut sll = vec![0u8; SLL_HEADER_SIZE];
        sll[14..16].copy_from_slice(&0x0800u16.to_be_bytes());
        sll.extend_from_slice(&frame[ETH_HEADER_SIZE..]);
        assert_eq!(parse(&sll, LinkType::LinuxSLL), Ok(fields));
    }

    #[test]
    fn rejects_other_traffic() {
        let fields = tcp_fields();
        let mut frame = ipv4_frame(&fields);
        frame[12..14].copy_from_slice(&0x0806u16.to_be_bytes());
        assert_eq!(
            parse(&frame, LinkType::Ethernet),
            Err(Error::UnsupportedEtherType(0x0806))
        );

        let mut frame = ipv4_frame(&fields);
        frame[ETH_HEADER_SIZE + 9] = 1;
        assert_eq!(
            parse(&frame, LinkType::Ethernet),
            Err(Error::UnsupportedProtocol(1))
        );
    }

    #[test]
    fn truncated() {
        let frame = ipv4_frame(&tcp_fields());
        assert_eq!(
            parse(&frame[..ETH_HEADER_SIZE + 30], LinkType::Ethernet),
            Err(Error::Truncated)
        );
        assert_eq!(parse(&frame[..10], LinkType::Ethernet), Err(Error::Truncated));
        assert_eq!(parse(&[], LinkType::Raw), Err(Error::Truncated));
    }
}
