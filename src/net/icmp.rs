//! ICMP: echo reply/request and destination-unreachable handling.

use alloc::sync::Arc;
use core::net::Ipv4Addr;

use crate::io::{Error, Result};
use crate::net::device::Nic;
use crate::net::netmsg::NetMsg;
use crate::net::wire::{
	checksum, Checksum, IcmpHeader, IpProto, ICMP_CODE_PORT_UNREACHABLE, ICMP_DEST_UNREACHABLE,
	ICMP_ECHO_REPLY, ICMP_ECHO_REQUEST, ICMP_HDR_LEN, IPV4_HDR_LEN,
};
use crate::net::{ip, tcp, udp};

pub fn ingress(nic: &Arc<Nic>, mut msg: NetMsg) {
	msg.icmp_hdr = Some(msg.start_offset());
	let Some(header) = IcmpHeader::parse(msg.as_slice()) else {
		debug!("malformed icmp message on {}, dropping", nic.name);
		return;
	};

	match header.icmp_type {
		ICMP_ECHO_REQUEST => {
			if msg.cut_off(ICMP_HDR_LEN).is_ok() {
				send_echo(msg.ip_src, ICMP_ECHO_REPLY, header.rest, msg.as_slice());
			}
		}
		// Raw sockets already received their copy at the IP layer.
		ICMP_ECHO_REPLY => {}
		ICMP_DEST_UNREACHABLE => {
			if msg.cut_off(ICMP_HDR_LEN).is_ok() {
				deliver_unreachable(header.code, msg.as_slice());
			}
		}
		_ => {
			trace!("unhandled icmp type {}, dropping", header.icmp_type);
		}
	}
}

/// Surface an unreachable error to the transport that sent the
/// offending datagram. The ICMP payload carries its IP header plus the
/// first 8 transport bytes.
fn deliver_unreachable(code: u8, inner: &[u8]) {
	if inner.len() < IPV4_HDR_LEN + 8 || inner[0] >> 4 != 4 {
		return;
	}
	let header_len = usize::from(inner[0] & 0x0f) * 4;
	if inner.len() < header_len + 8 {
		return;
	}
	let proto = inner[9];
	let dst = Ipv4Addr::new(inner[16], inner[17], inner[18], inner[19]);
	let transport = &inner[header_len..];
	let src_port = u16::from_be_bytes([transport[0], transport[1]]);
	let dst_port = u16::from_be_bytes([transport[2], transport[3]]);

	let error = if code == ICMP_CODE_PORT_UNREACHABLE {
		Error::ECONNREFUSED
	} else {
		Error::EHOSTUNREACH
	};

	match IpProto::try_from(proto) {
		Ok(IpProto::Udp) => udp::icmp_error(src_port, dst, dst_port, error),
		Ok(IpProto::Tcp) => tcp::icmp_error(src_port, dst, dst_port, error),
		_ => {}
	}
}

fn send_echo(dst: Ipv4Addr, icmp_type: u8, rest: u32, payload: &[u8]) {
	if let Err(err) = build_and_send(dst, icmp_type, 0, rest, payload) {
		debug!("icmp echo tx failed: {}", err);
	}
}

/// Originate an echo request (the ping path). `rest` packs id and
/// sequence number.
pub fn send_echo_request(dst: Ipv4Addr, id: u16, seq: u16, payload: &[u8]) -> Result<()> {
	let rest = (u32::from(id) << 16) | u32::from(seq);
	build_and_send(dst, ICMP_ECHO_REQUEST, 0, rest, payload)
}

/// Report a datagram to an unserved port back to its sender.
pub fn send_port_unreachable(orig: &NetMsg) -> Result<()> {
	let Some(ip_hdr) = orig.ip_hdr else {
		return Err(Error::EINVAL);
	};
	let inner = orig.bytes_from(ip_hdr);
	let header_len = usize::from(inner[0] & 0x0f) * 4;
	let quoted = inner.len().min(header_len + 8);
	build_and_send(
		orig.ip_src,
		ICMP_DEST_UNREACHABLE,
		ICMP_CODE_PORT_UNREACHABLE,
		0,
		&inner[..quoted],
	)
}

fn build_and_send(dst: Ipv4Addr, icmp_type: u8, code: u8, rest: u32, payload: &[u8]) -> Result<()> {
	let mut msg = NetMsg::new(ICMP_HDR_LEN + payload.len());
	msg.append(payload.len())?.copy_from_slice(payload);
	let header = IcmpHeader {
		icmp_type,
		code,
		rest,
	};
	header.encode(msg.prepend(ICMP_HDR_LEN)?);
	msg.icmp_hdr = Some(msg.start_offset());
	let csum = checksum(msg.as_slice());
	let buf = msg.as_mut_slice();
	buf[2..4].copy_from_slice(&csum.to_be_bytes());
	debug_assert_eq!(Checksum::new().add_bytes(msg.as_slice()).finish(), 0);
	ip::send(msg, None, dst, IpProto::Icmp, false)
}
