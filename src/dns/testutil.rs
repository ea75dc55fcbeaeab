//! Shared builders for DNS-layer tests: synthetic query frames, a collecting
//! packet sink and a reply parser.

use std::net::Ipv4Addr;
use std::sync::Mutex;

use pnet::packet::ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{Ipv4Packet, MutableIpv4Packet};
use pnet::packet::udp::{MutableUdpPacket, UdpPacket};
use pnet::packet::Packet;
use pnet::util::MacAddr;
use trust_dns_proto::op::{Message, MessageType, OpCode, Query};
use trust_dns_proto::rr::rdata::A;
use trust_dns_proto::rr::{Name, RData, Record, RecordType};
use trust_dns_proto::serialize::binary::{BinDecodable, BinEncodable, BinEncoder};

use crate::capture::{CaptureError, PacketSink};
use crate::context::InterfaceInfo;

pub(crate) fn test_interface() -> InterfaceInfo {
    InterfaceInfo {
        name: "eth0".to_string(),
        mac: MacAddr::new(0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff),
        ipv4: Ipv4Addr::new(192, 168, 1, 2),
        ipv6: None,
    }
}

/// Packet sink collecting every transmitted frame.
#[derive(Default)]
pub(crate) struct CollectSink {
    frames: Mutex<Vec<Vec<u8>>>,
}

impl CollectSink {
    pub(crate) fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().unwrap().clone()
    }
}

impl PacketSink for CollectSink {
    fn transmit(&self, frame: &[u8]) -> Result<(), CaptureError> {
        self.frames.lock().unwrap().push(frame.to_vec());
        Ok(())
    }
}

/// Knobs for building a synthetic captured DNS query frame.
pub(crate) struct QueryFrameSpec {
    pub name: String,
    pub id: u16,
    pub victim_mac: MacAddr,
    pub server_mac: MacAddr,
    pub victim_ip: Ipv4Addr,
    pub server_ip: Ipv4Addr,
    pub victim_port: u16,
    pub op_code: OpCode,
    pub record_type: RecordType,
    pub with_answer: bool,
    pub no_questions: bool,
}

impl QueryFrameSpec {
    pub(crate) fn new(name: &str, id: u16) -> Self {
        let iface = test_interface();
        Self {
            name: name.to_string(),
            id,
            victim_mac: MacAddr::new(2, 0, 0, 0, 0, 1),
            server_mac: iface.mac,
            victim_ip: Ipv4Addr::new(192, 168, 1, 50),
            server_ip: iface.ipv4,
            victim_port: 40000,
            op_code: OpCode::Query,
            record_type: RecordType::A,
            with_answer: false,
            no_questions: false,
        }
    }
}

/// Build the full Ethernet/IPv4/UDP frame for the spec.
pub(crate) fn query_frame_v4(spec: &QueryFrameSpec) -> Vec<u8> {
    let mut message = Message::new();
    message.set_id(spec.id);
    message.set_message_type(MessageType::Query);
    message.set_op_code(spec.op_code);
    message.set_recursion_desired(true);

    let name = Name::from_utf8(&spec.name).unwrap();
    if !spec.no_questions {
        message.add_query(Query::query(name.clone(), spec.record_type));
    }
    if spec.with_answer {
        message.add_answer(Record::from_rdata(
            name,
            60,
            RData::A(A::from(Ipv4Addr::new(1, 2, 3, 4))),
        ));
    }

    let mut dns = Vec::with_capacity(512);
    let mut encoder = BinEncoder::new(&mut dns);
    message.emit(&mut encoder).unwrap();

    let mut udp_buf = vec![0u8; 8 + dns.len()];
    {
        let mut udp = MutableUdpPacket::new(&mut udp_buf).unwrap();
        udp.set_source(spec.victim_port);
        udp.set_destination(53);
        udp.set_length((8 + dns.len()) as u16);
        udp.set_payload(&dns);
        let csum = pnet::packet::udp::ipv4_checksum(
            &udp.to_immutable(),
            &spec.victim_ip,
            &spec.server_ip,
        );
        udp.set_checksum(csum);
    }

    let mut ip_buf = vec![0u8; 20 + udp_buf.len()];
    {
        let mut ip = MutableIpv4Packet::new(&mut ip_buf).unwrap();
        ip.set_version(4);
        ip.set_header_length(5);
        ip.set_total_length((20 + udp_buf.len()) as u16);
        ip.set_ttl(64);
        ip.set_next_level_protocol(IpNextHeaderProtocols::Udp);
        ip.set_source(spec.victim_ip);
        ip.set_destination(spec.server_ip);
        ip.set_payload(&udp_buf);
        let csum = pnet::packet::ipv4::checksum(&ip.to_immutable());
        ip.set_checksum(csum);
    }

    let mut frame = vec![0u8; 14 + ip_buf.len()];
    {
        let mut eth = MutableEthernetPacket::new(&mut frame).unwrap();
        eth.set_destination(spec.server_mac);
        eth.set_source(spec.victim_mac);
        eth.set_ethertype(EtherTypes::Ipv4);
        eth.set_payload(&ip_buf);
    }
    frame
}

/// Decoded view of a forged reply frame.
pub(crate) struct ReplyView {
    pub eth_src: MacAddr,
    pub eth_dst: MacAddr,
    pub ip_src: Ipv4Addr,
    pub ip_dst: Ipv4Addr,
    pub udp_src: u16,
    pub udp_dst: u16,
    pub message: Message,
}

pub(crate) fn parse_reply(frame: &[u8]) -> ReplyView {
    let eth = EthernetPacket::new(frame).unwrap();
    assert_eq!(eth.get_ethertype(), EtherTypes::Ipv4);
    let ip = Ipv4Packet::new(eth.payload()).unwrap();
    let udp = UdpPacket::new(ip.payload()).unwrap();
    let message = Message::from_bytes(udp.payload()).unwrap();

    ReplyView {
        eth_src: eth.get_source(),
        eth_dst: eth.get_destination(),
        ip_src: ip.get_source(),
        ip_dst: ip.get_destination(),
        udp_src: udp.get_source(),
        udp_dst: udp.get_destination(),
        message,
    }
}
