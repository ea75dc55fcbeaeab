//! Shared helpers for integration tests: a synthetic capture source, a
//! collecting sink, raw DNS query frames and a reply parser.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pnet::packet::ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{Ipv4Packet, MutableIpv4Packet};
use pnet::packet::udp::{MutableUdpPacket, UdpPacket};
use pnet::packet::Packet;
use pnet::util::MacAddr;
use trust_dns_proto::op::{Message, MessageType, Query};
use trust_dns_proto::rr::{Name, RecordType};
use trust_dns_proto::serialize::binary::{BinDecodable, BinEncodable, BinEncoder};

use netsnare::capture::{CaptureError, PacketSink, PacketSource};
use netsnare::context::{EmptyDirectory, InterceptContext, InterfaceInfo};
use netsnare::firewall::NoopFirewall;

pub const VICTIM_MAC: MacAddr = MacAddr(2, 0, 0, 0, 0, 1);
pub const LOCAL_MAC: MacAddr = MacAddr(0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff);
pub const VICTIM_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 50);
pub const LOCAL_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 2);

pub fn interface() -> InterfaceInfo {
    InterfaceInfo {
        name: "eth0".to_string(),
        mac: LOCAL_MAC,
        ipv4: LOCAL_IP,
        ipv6: None,
    }
}

pub fn context(sink: Arc<CollectSink>) -> InterceptContext {
    InterceptContext::new(
        interface(),
        sink,
        Arc::new(NoopFirewall),
        Arc::new(EmptyDirectory),
    )
}

/// Sink collecting every transmitted frame.
#[derive(Default)]
pub struct CollectSink {
    frames: Mutex<Vec<Vec<u8>>>,
}

impl CollectSink {
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().unwrap().clone()
    }

    /// Poll until at least `count` frames were transmitted.
    pub fn wait_for_frames(&self, count: usize, timeout: Duration) -> Vec<Vec<u8>> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let frames = self.frames();
            if frames.len() >= count || std::time::Instant::now() > deadline {
                return frames;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

impl PacketSink for CollectSink {
    fn transmit(&self, frame: &[u8]) -> Result<(), CaptureError> {
        self.frames.lock().unwrap().push(frame.to_vec());
        Ok(())
    }
}

/// Capture source replaying a fixed set of frames, then idling.
pub struct ScriptedSource {
    frames: VecDeque<Vec<u8>>,
}

impl ScriptedSource {
    pub fn new(frames: Vec<Vec<u8>>) -> Box<Self> {
        Box::new(Self {
            frames: frames.into(),
        })
    }
}

impl PacketSource for ScriptedSource {
    fn next_frame(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, CaptureError> {
        match self.frames.pop_front() {
            Some(frame) => Ok(Some(frame)),
            None => {
                std::thread::sleep(timeout.min(Duration::from_millis(10)));
                Ok(None)
            }
        }
    }
}

/// Ethernet/IPv4/UDP frame carrying one A query from the victim to us.
pub fn dns_query_frame(name: &str, id: u16) -> Vec<u8> {
    let mut message = Message::new();
    message.set_id(id);
    message.set_message_type(MessageType::Query);
    message.set_recursion_desired(true);
    message.add_query(Query::query(Name::from_utf8(name).unwrap(), RecordType::A));

    let mut dns = Vec::with_capacity(512);
    let mut encoder = BinEncoder::new(&mut dns);
    message.emit(&mut encoder).unwrap();

    let mut udp_buf = vec![0u8; 8 + dns.len()];
    {
        let mut udp = MutableUdpPacket::new(&mut udp_buf).unwrap();
        udp.set_source(40000);
        udp.set_destination(53);
        udp.set_length((8 + dns.len()) as u16);
        udp.set_payload(&dns);
        let csum = pnet::packet::udp::ipv4_checksum(&udp.to_immutable(), &VICTIM_IP, &LOCAL_IP);
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
        ip.set_source(VICTIM_IP);
        ip.set_destination(LOCAL_IP);
        ip.set_payload(&udp_buf);
        let csum = pnet::packet::ipv4::checksum(&ip.to_immutable());
        ip.set_checksum(csum);
    }

    let mut frame = vec![0u8; 14 + ip_buf.len()];
    {
        let mut eth = MutableEthernetPacket::new(&mut frame).unwrap();
        eth.set_destination(LOCAL_MAC);
        eth.set_source(VICTIM_MAC);
        eth.set_ethertype(EtherTypes::Ipv4);
        eth.set_payload(&ip_buf);
    }
    frame
}

/// Decoded DNS reply frame.
pub struct Reply {
    pub eth_src: MacAddr,
    pub eth_dst: MacAddr,
    pub ip_src: Ipv4Addr,
    pub ip_dst: Ipv4Addr,
    pub udp_src: u16,
    pub udp_dst: u16,
    pub message: Message,
}

pub fn parse_reply(frame: &[u8]) -> Reply {
    let eth = EthernetPacket::new(frame).unwrap();
    assert_eq!(eth.get_ethertype(), EtherTypes::Ipv4);
    let ip = Ipv4Packet::new(eth.payload()).unwrap();
    let udp = UdpPacket::new(ip.payload()).unwrap();

    Reply {
        eth_src: eth.get_source(),
        eth_dst: eth.get_destination(),
        ip_src: ip.get_source(),
        ip_dst: ip.get_destination(),
        udp_src: udp.get_source(),
        udp_dst: udp.get_destination(),
        message: Message::from_bytes(udp.payload()).unwrap(),
    }
}
