// XNS wire codecs: Ethernet framing, IDP, and the level-2 protocols carried
// in it (RIP, Echo, PEX, SPP, Error, Boot), plus the PEX time service body
// and the expedited Courier envelope SPP streams deliver.
//
// Every type round-trips through from_buffer/to_buffer over a ByteBuffer.
// Numeric fields are big-endian; 48-bit host addresses pack into six bytes.
// A payload that contradicts its own discriminator is a fatal decode error:
// by the time a listener looks inside, the frame was addressed to it.

use crate::bytebuffer::ByteBuffer;
use std::fmt;

pub mod host {
    pub const ALL: u64 = 0xffff_ffff_ffff;

    pub fn to_string(host: u64) -> String {
        format!(
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            (host >> 40) & 0xff,
            (host >> 32) & 0xff,
            (host >> 24) & 0xff,
            (host >> 16) & 0xff,
            (host >> 8) & 0xff,
            host & 0xff
        )
    }

    // "AA:BB:CC:DD:EE:FF" or a plain number
    pub fn parse(text: &str) -> Option<u64> {
        if text.contains(':') {
            let mut value = 0u64;
            let mut count = 0;
            for part in text.split(':') {
                value = (value << 8) | u64::from_str_radix(part, 16).ok()?;
                count += 1;
            }
            if count != 6 {
                return None;
            }
            Some(value)
        } else {
            text.parse().ok()
        }
    }
}

pub mod net {
    pub const ALL: u32 = 0xffff_ffff;
    pub const UNKNOWN: u32 = 0;
}

pub mod socket {
    pub const RIP: u16 = 1;
    pub const ECHO: u16 = 2;
    pub const ERROR: u16 = 3;
    pub const ENVOY: u16 = 4;
    pub const COURIER: u16 = 5;
    pub const CLEARINGHOUSE_OLD: u16 = 7;
    pub const TIME: u16 = 8;
    pub const BOOT: u16 = 10;
    // Everything at or below here is reserved for well-known services.
    pub const MAX_WELLKNOWN: u16 = 3000;
}

//
// Ethernet
//

pub const ETHERNET_TYPE_XNS: u16 = 0x0600;

#[derive(Debug, Clone, PartialEq)]
pub struct Ethernet {
    pub dst: u64,
    pub src: u64,
    pub ethertype: u16,
}

impl Ethernet {
    pub fn from_buffer(bb: &mut ByteBuffer) -> Ethernet {
        Ethernet { dst: bb.read48(), src: bb.read48(), ethertype: bb.read16() }
    }
    pub fn to_buffer(&self, bb: &mut ByteBuffer) {
        bb.write48(self.dst);
        bb.write48(self.src);
        bb.write16(self.ethertype);
    }
}

impl fmt::Display for Ethernet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <- {} {:04X}", host::to_string(self.dst), host::to_string(self.src), self.ethertype)
    }
}

//
// IDP
//

pub mod idp_type {
    pub const RIP: u8 = 1;
    pub const ECHO: u8 = 2;
    pub const ERROR: u8 = 3;
    pub const PEX: u8 = 4;
    pub const SPP: u8 = 5;
    pub const BOOT: u8 = 9;
}

pub const IDP_HEADER_LENGTH: u16 = 30;
pub const IDP_MINIMUM_PACKET_LENGTH: u16 = 30;
pub const CHECKSUM_NOCHECK: u16 = 0xffff;

#[derive(Debug, Clone, PartialEq)]
pub struct Idp {
    pub checksum: u16,
    pub length: u16,
    pub control: u8,
    pub idp_type: u8,
    pub dst_net: u32,
    pub dst_host: u64,
    pub dst_socket: u16,
    pub src_net: u32,
    pub src_host: u64,
    pub src_socket: u16,
    pub block: Vec<u8>,
}

impl Idp {
    pub fn from_buffer(bb: &mut ByteBuffer) -> Idp {
        let checksum = bb.read16();
        let length = bb.read16();
        let control = bb.read8();
        let idp_type = bb.read8();
        let dst_net = bb.read32();
        let dst_host = bb.read48();
        let dst_socket = bb.read16();
        let src_net = bb.read32();
        let src_host = bb.read48();
        let src_socket = bb.read16();
        // The payload extent comes from the length field; trailing padding
        // stays outside the block.
        let payload = if IDP_HEADER_LENGTH <= length {
            let size = (length - IDP_HEADER_LENGTH) as u32;
            bb.read_bytes(size.min(bb.remaining()))
        } else {
            Vec::new()
        };
        Idp {
            checksum,
            length,
            control,
            idp_type,
            dst_net,
            dst_host,
            dst_socket,
            src_net,
            src_host,
            src_socket,
            block: payload,
        }
    }

    pub fn to_buffer(&self, bb: &mut ByteBuffer) {
        bb.write16(self.checksum);
        bb.write16(self.length);
        bb.write8(self.control);
        bb.write8(self.idp_type);
        bb.write32(self.dst_net);
        bb.write48(self.dst_host);
        bb.write16(self.dst_socket);
        bb.write32(self.src_net);
        bb.write48(self.src_host);
        bb.write16(self.src_socket);
        bb.write_bytes(&self.block);
    }
}

impl fmt::Display for Idp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04X} {:4} {:2} {:08X}-{}-{:04X} <- {:08X}-{}-{:04X}",
            self.checksum,
            self.length,
            self.idp_type,
            self.dst_net,
            host::to_string(self.dst_host),
            self.dst_socket,
            self.src_net,
            host::to_string(self.src_host),
            self.src_socket
        )
    }
}

// The XNS ones-complement add-and-left-cycle checksum, computed over the IDP
// extent starting at the checksum field; the field itself is skipped.
pub fn compute_checksum(data: &[u8], idp_offset: usize, length: usize) -> u16 {
    let mut s: u32 = 0;
    let mut i = idp_offset + 2;
    let end = idp_offset + length;
    while i < end {
        let high = data[i] as u32;
        let low = if i + 1 < end { data[i + 1] as u32 } else { 0 };
        s += (high << 8) | low;
        if 0xffff < s {
            s = (s & 0xffff) + 1;
        }
        s <<= 1;
        if 0xffff < s {
            s = (s & 0xffff) + 1;
        }
        i += 2;
    }
    if s == 0xffff {
        s = 0;
    }
    s as u16
}

//
// RIP
//

pub mod rip {
    pub const REQUEST: u16 = 1;
    pub const RESPONSE: u16 = 2;
    pub const HOP_INFINITY: u16 = 16;
    pub const BROADCAST_INTERVAL: u64 = 30; // seconds
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RipEntry {
    pub net: u32,
    pub hop: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rip {
    pub rip_type: u16,
    pub entries: Vec<RipEntry>,
}

impl Rip {
    pub fn from_buffer(bb: &mut ByteBuffer) -> Rip {
        let rip_type = bb.read16();
        let mut entries = Vec::new();
        while 6 <= bb.remaining() {
            entries.push(RipEntry { net: bb.read32(), hop: bb.read16() });
        }
        Rip { rip_type, entries }
    }
    pub fn to_buffer(&self, bb: &mut ByteBuffer) {
        bb.write16(self.rip_type);
        for entry in &self.entries {
            bb.write32(entry.net);
            bb.write16(entry.hop);
        }
    }
}

//
// Echo
//

pub mod echo {
    pub const REQUEST: u16 = 1;
    pub const REPLY: u16 = 2;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Echo {
    pub echo_type: u16,
    pub block: Vec<u8>,
}

impl Echo {
    pub fn from_buffer(bb: &mut ByteBuffer) -> Echo {
        let echo_type = bb.read16();
        Echo { echo_type, block: bb.rest() }
    }
    pub fn to_buffer(&self, bb: &mut ByteBuffer) {
        bb.write16(self.echo_type);
        bb.write_bytes(&self.block);
    }
}

//
// PEX
//

pub mod pex {
    pub const UNSPECIFIED: u16 = 0;
    pub const TIME: u16 = 1;
    pub const CLEARINGHOUSE: u16 = 2;
    pub const TELEDEBUG: u16 = 8;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Pex {
    pub id: u32,
    pub client_type: u16,
    pub block: Vec<u8>,
}

impl Pex {
    pub fn from_buffer(bb: &mut ByteBuffer) -> Pex {
        let id = bb.read32();
        let client_type = bb.read16();
        Pex { id, client_type, block: bb.rest() }
    }
    pub fn to_buffer(&self, bb: &mut ByteBuffer) {
        bb.write32(self.id);
        bb.write16(self.client_type);
        bb.write_bytes(&self.block);
    }
}

//
// SPP
//

pub mod spp {
    pub const BIT_SYSTEM: u8 = 0x80;
    pub const BIT_SEND_ACK: u8 = 0x40;
    pub const BIT_ATTENTION: u8 = 0x20;
    pub const BIT_END: u8 = 0x10;

    pub const SST_DATA: u8 = 0;
    pub const SST_BULK: u8 = 1;
    pub const SST_CLOSE: u8 = 254;
    pub const SST_CLOSE_REPLY: u8 = 255;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Spp {
    pub control: u8,
    pub sst: u8,
    pub id_src: u16,
    pub id_dst: u16,
    pub seq: u16,
    pub ack: u16,
    pub alloc: u16,
    pub block: Vec<u8>,
}

impl Spp {
    pub fn is_system(&self) -> bool {
        self.control & spp::BIT_SYSTEM != 0
    }
    pub fn is_send_ack(&self) -> bool {
        self.control & spp::BIT_SEND_ACK != 0
    }

    pub fn from_buffer(bb: &mut ByteBuffer) -> Spp {
        Spp {
            control: bb.read8(),
            sst: bb.read8(),
            id_src: bb.read16(),
            id_dst: bb.read16(),
            seq: bb.read16(),
            ack: bb.read16(),
            alloc: bb.read16(),
            block: bb.rest(),
        }
    }
    pub fn to_buffer(&self, bb: &mut ByteBuffer) {
        bb.write8(self.control);
        bb.write8(self.sst);
        bb.write16(self.id_src);
        bb.write16(self.id_dst);
        bb.write16(self.seq);
        bb.write16(self.ack);
        bb.write16(self.alloc);
        bb.write_bytes(&self.block);
    }
}

impl fmt::Display for Spp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}-{:02X} {:04X}-{:04X} seq {:4} ack {:4} alloc {:4} [{}]",
            self.control,
            self.sst,
            self.id_src,
            self.id_dst,
            self.seq,
            self.ack,
            self.alloc,
            self.block.len()
        )
    }
}

//
// Error
//

pub mod error {
    pub const UNSPECIFIED: u16 = 0;
    pub const BAD_CHECKSUM: u16 = 1;
    pub const NO_SOCKET: u16 = 2;
    pub const RESOURCE_LIMIT: u16 = 3;
}

#[derive(Debug, Clone, PartialEq)]
pub struct XnsError {
    pub code: u16,
    pub parameter: u16,
    pub block: Vec<u8>,
}

impl XnsError {
    pub fn from_buffer(bb: &mut ByteBuffer) -> XnsError {
        XnsError { code: bb.read16(), parameter: bb.read16(), block: bb.rest() }
    }
    pub fn to_buffer(&self, bb: &mut ByteBuffer) {
        bb.write16(self.code);
        bb.write16(self.parameter);
        bb.write_bytes(&self.block);
    }
}

//
// Boot
//

pub mod boot {
    pub const SIMPLE_REQUEST: u16 = 1;
    pub const SIMPLE_DATA: u16 = 2;
    pub const SPP_REQUEST: u16 = 3;
}

#[derive(Debug, Clone, PartialEq)]
pub enum BootBody {
    SimpleRequest { boot_file_number: u64 },
    SimpleData { boot_file_number: u64, packet_number: u16, block: Vec<u8> },
    SppRequest { boot_file_number: u64, connection_id: u16 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Boot {
    pub boot_type: u16,
    pub body: BootBody,
}

impl Boot {
    pub fn from_buffer(bb: &mut ByteBuffer) -> Boot {
        let boot_type = bb.read16();
        let body = match boot_type {
            boot::SIMPLE_REQUEST => BootBody::SimpleRequest { boot_file_number: bb.read48() },
            boot::SIMPLE_DATA => BootBody::SimpleData {
                boot_file_number: bb.read48(),
                packet_number: bb.read16(),
                block: bb.rest(),
            },
            boot::SPP_REQUEST => {
                BootBody::SppRequest { boot_file_number: bb.read48(), connection_id: bb.read16() }
            }
            _ => panic!("boot type = {}", boot_type),
        };
        Boot { boot_type, body }
    }

    pub fn to_buffer(&self, bb: &mut ByteBuffer) {
        bb.write16(self.boot_type);
        match &self.body {
            BootBody::SimpleRequest { boot_file_number } => {
                assert_eq!(self.boot_type, boot::SIMPLE_REQUEST);
                bb.write48(*boot_file_number);
            }
            BootBody::SimpleData { boot_file_number, packet_number, block } => {
                assert_eq!(self.boot_type, boot::SIMPLE_DATA);
                bb.write48(*boot_file_number);
                bb.write16(*packet_number);
                bb.write_bytes(block);
            }
            BootBody::SppRequest { boot_file_number, connection_id } => {
                assert_eq!(self.boot_type, boot::SPP_REQUEST);
                bb.write48(*boot_file_number);
                bb.write16(*connection_id);
            }
        }
    }
}

//
// PEX time service
//

pub mod time {
    pub const VERSION: u16 = 2;
    pub const REQUEST: u16 = 1;
    pub const RESPONSE: u16 = 2;
    pub const DIRECTION_WEST: u16 = 0;
    pub const DIRECTION_EAST: u16 = 1;
    pub const TOLERANCE_UNKNOWN: u16 = 0;
    pub const TOLERANCE_MILLI: u16 = 1;
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimeResponse {
    pub time: u32,
    pub offset_direction: u16,
    pub offset_hours: u16,
    pub offset_minutes: u16,
    pub dst_start: u16,
    pub dst_end: u16,
    pub tolerance: u16,
    pub tolerance_value: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TimeBody {
    Request,
    Response(TimeResponse),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Time {
    pub version: u16,
    pub time_type: u16,
    pub body: TimeBody,
}

impl Time {
    pub fn from_buffer(bb: &mut ByteBuffer) -> Time {
        let version = bb.read16();
        if version != time::VERSION {
            panic!("time version = {}", version);
        }
        let time_type = bb.read16();
        let body = match time_type {
            time::REQUEST => TimeBody::Request,
            time::RESPONSE => TimeBody::Response(TimeResponse {
                time: bb.read32(),
                offset_direction: bb.read16(),
                offset_hours: bb.read16(),
                offset_minutes: bb.read16(),
                dst_start: bb.read16(),
                dst_end: bb.read16(),
                tolerance: bb.read16(),
                tolerance_value: bb.read32(),
            }),
            _ => panic!("time type = {}", time_type),
        };
        Time { version, time_type, body }
    }

    pub fn to_buffer(&self, bb: &mut ByteBuffer) {
        bb.write16(self.version);
        bb.write16(self.time_type);
        match &self.body {
            TimeBody::Request => assert_eq!(self.time_type, time::REQUEST),
            TimeBody::Response(response) => {
                assert_eq!(self.time_type, time::RESPONSE);
                bb.write32(response.time);
                bb.write16(response.offset_direction);
                bb.write16(response.offset_hours);
                bb.write16(response.offset_minutes);
                bb.write16(response.dst_start);
                bb.write16(response.dst_end);
                bb.write16(response.tolerance);
                bb.write32(response.tolerance_value);
            }
        }
    }
}

//
// Expedited Courier
//

pub mod courier {
    pub const PROTOCOL2: u16 = 2;
    pub const PROTOCOL3: u16 = 3;

    pub const CALL: u16 = 0;
    pub const REJECT: u16 = 1;
    pub const RETURN: u16 = 2;
    pub const ABORT: u16 = 3;

    pub const NO_SUCH_PROGRAM: u16 = 0;
    pub const NO_SUCH_VERSION: u16 = 1;
    pub const NO_SUCH_PROCEDURE: u16 = 2;
    pub const INVALID_ARGUMENTS: u16 = 3;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolRange {
    pub low: u16,
    pub high: u16,
}

impl ProtocolRange {
    pub fn from_buffer(bb: &mut ByteBuffer) -> ProtocolRange {
        ProtocolRange { low: bb.read16(), high: bb.read16() }
    }
    pub fn to_buffer(&self, bb: &mut ByteBuffer) {
        bb.write16(self.low);
        bb.write16(self.high);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Protocol3Body {
    Call { transaction: u16, program: u32, version: u16, procedure: u16, block: Vec<u8> },
    Reject { transaction: u16, code: u16 },
    Return { transaction: u16, block: Vec<u8> },
    Abort { transaction: u16, abort_code: u16, block: Vec<u8> },
}

impl Protocol3Body {
    pub fn from_buffer(bb: &mut ByteBuffer) -> Protocol3Body {
        let message_type = bb.read16();
        match message_type {
            courier::CALL => Protocol3Body::Call {
                transaction: bb.read16(),
                program: bb.read32(),
                version: bb.read16(),
                procedure: bb.read16(),
                block: bb.rest(),
            },
            courier::REJECT => {
                Protocol3Body::Reject { transaction: bb.read16(), code: bb.read16() }
            }
            courier::RETURN => Protocol3Body::Return { transaction: bb.read16(), block: bb.rest() },
            courier::ABORT => Protocol3Body::Abort {
                transaction: bb.read16(),
                abort_code: bb.read16(),
                block: bb.rest(),
            },
            _ => panic!("courier message type = {}", message_type),
        }
    }

    pub fn to_buffer(&self, bb: &mut ByteBuffer) {
        match self {
            Protocol3Body::Call { transaction, program, version, procedure, block } => {
                bb.write16(courier::CALL);
                bb.write16(*transaction);
                bb.write32(*program);
                bb.write16(*version);
                bb.write16(*procedure);
                bb.write_bytes(block);
            }
            Protocol3Body::Reject { transaction, code } => {
                bb.write16(courier::REJECT);
                bb.write16(*transaction);
                bb.write16(*code);
            }
            Protocol3Body::Return { transaction, block } => {
                bb.write16(courier::RETURN);
                bb.write16(*transaction);
                bb.write_bytes(block);
            }
            Protocol3Body::Abort { transaction, abort_code, block } => {
                bb.write16(courier::ABORT);
                bb.write16(*transaction);
                bb.write16(*abort_code);
                bb.write_bytes(block);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExpeditedCourier {
    pub range: ProtocolRange,
    pub body: Protocol3Body,
}

impl ExpeditedCourier {
    pub fn from_buffer(bb: &mut ByteBuffer) -> ExpeditedCourier {
        let range = ProtocolRange::from_buffer(bb);
        if range.low != courier::PROTOCOL3 || range.high != courier::PROTOCOL3 {
            panic!("courier protocol range = {}-{}", range.low, range.high);
        }
        ExpeditedCourier { range, body: Protocol3Body::from_buffer(bb) }
    }
    pub fn to_buffer(&self, bb: &mut ByteBuffer) {
        self.range.to_buffer(bb);
        self.body.to_buffer(bb);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip<T, E, D>(value: &T, encode: E, decode: D) -> Vec<u8>
    where
        T: PartialEq + fmt::Debug,
        E: Fn(&T, &mut ByteBuffer),
        D: Fn(&mut ByteBuffer) -> T,
    {
        let mut bb = ByteBuffer::packet();
        encode(value, &mut bb);
        let bytes = bb.to_vec();
        let mut back = ByteBuffer::from_data(bytes.clone());
        let decoded = decode(&mut back);
        assert_eq!(&decoded, value);
        bytes
    }

    #[test]
    fn ethernet_round_trip() {
        let frame = Ethernet { dst: host::ALL, src: 0x0000_1234_5678, ethertype: ETHERNET_TYPE_XNS };
        let bytes = round_trip(&frame, Ethernet::to_buffer, Ethernet::from_buffer);
        assert_eq!(bytes.len(), 14);
        assert_eq!(&bytes[12..], &[0x06, 0x00]);
    }

    #[test]
    fn idp_round_trip() {
        let idp = Idp {
            checksum: 0x1234,
            length: 34,
            control: 0,
            idp_type: idp_type::ECHO,
            dst_net: 1,
            dst_host: host::ALL,
            dst_socket: socket::ECHO,
            src_net: 2,
            src_host: 0x0000_aabb_ccdd,
            src_socket: 0x1234,
            block: vec![0xDE, 0xAD, 0xBE, 0xEF],
        };
        let bytes = round_trip(&idp, Idp::to_buffer, Idp::from_buffer);
        assert_eq!(bytes.len(), 34);
    }

    #[test]
    fn idp_decode_strips_padding() {
        let idp = Idp {
            checksum: CHECKSUM_NOCHECK,
            length: 32,
            control: 0,
            idp_type: idp_type::ECHO,
            dst_net: 0,
            dst_host: 1,
            dst_socket: 2,
            src_net: 0,
            src_host: 3,
            src_socket: 4,
            block: vec![0x55, 0x66],
        };
        let mut bb = ByteBuffer::packet();
        idp.to_buffer(&mut bb);
        // pad as a transmitter would
        for _ in 0..6 {
            bb.write8(0);
        }
        let mut back = ByteBuffer::from_data(bb.to_vec());
        let decoded = Idp::from_buffer(&mut back);
        assert_eq!(decoded.block, vec![0x55, 0x66]);
    }

    #[test]
    fn checksum_is_stable_and_bit_sensitive() {
        let mut frame = vec![0u8; 40];
        for (i, byte) in frame.iter_mut().enumerate() {
            *byte = (i * 7) as u8;
        }
        let base = compute_checksum(&frame, 0, 40);
        assert_eq!(base, compute_checksum(&frame, 0, 40));
        // flipping any payload bit changes the sum
        for bit in 0..8 {
            let mut copy = frame.clone();
            copy[33] ^= 1 << bit;
            assert_ne!(base, compute_checksum(&copy, 0, 40), "bit {}", bit);
        }
        // the checksum field itself is excluded
        let mut copy = frame;
        copy[0] ^= 0xff;
        copy[1] ^= 0xff;
        assert_eq!(base, compute_checksum(&copy, 0, 40));
    }

    #[test]
    fn checksum_never_returns_all_ones() {
        // all-zero data sums to zero
        let frame = vec![0u8; 32];
        assert_eq!(compute_checksum(&frame, 0, 32), 0);
    }

    #[test]
    fn rip_round_trip() {
        let rip = Rip {
            rip_type: rip::RESPONSE,
            entries: vec![RipEntry { net: 1, hop: 1 }, RipEntry { net: 2, hop: 2 }],
        };
        let bytes = round_trip(&rip, Rip::to_buffer, Rip::from_buffer);
        assert_eq!(bytes.len(), 2 + 2 * 6);
    }

    #[test]
    fn echo_and_pex_round_trip() {
        round_trip(
            &Echo { echo_type: echo::REQUEST, block: vec![1, 2, 3] },
            Echo::to_buffer,
            Echo::from_buffer,
        );
        round_trip(
            &Pex { id: 0xdeadbeef, client_type: pex::TIME, block: vec![9, 8] },
            Pex::to_buffer,
            Pex::from_buffer,
        );
    }

    #[test]
    fn spp_round_trip() {
        let spp = Spp {
            control: spp::BIT_SYSTEM | spp::BIT_SEND_ACK,
            sst: spp::SST_DATA,
            id_src: 0x1111,
            id_dst: 0x2222,
            seq: 3,
            ack: 4,
            alloc: 5,
            block: vec![],
        };
        let bytes = round_trip(&spp, Spp::to_buffer, Spp::from_buffer);
        assert_eq!(bytes.len(), 12);
        assert!(spp.is_system());
        assert!(spp.is_send_ack());
    }

    #[test]
    fn boot_variants_round_trip() {
        round_trip(
            &Boot { boot_type: boot::SIMPLE_REQUEST, body: BootBody::SimpleRequest { boot_file_number: 0x0102_0304_0506 } },
            Boot::to_buffer,
            Boot::from_buffer,
        );
        round_trip(
            &Boot {
                boot_type: boot::SIMPLE_DATA,
                body: BootBody::SimpleData { boot_file_number: 1, packet_number: 7, block: vec![1] },
            },
            Boot::to_buffer,
            Boot::from_buffer,
        );
        round_trip(
            &Boot {
                boot_type: boot::SPP_REQUEST,
                body: BootBody::SppRequest { boot_file_number: 2, connection_id: 0x77 },
            },
            Boot::to_buffer,
            Boot::from_buffer,
        );
    }

    #[test]
    #[should_panic]
    fn boot_variant_mismatch_asserts() {
        let boot = Boot { boot_type: boot::SIMPLE_DATA, body: BootBody::SimpleRequest { boot_file_number: 1 } };
        let mut bb = ByteBuffer::packet();
        boot.to_buffer(&mut bb);
    }

    #[test]
    fn time_round_trip() {
        let time = Time {
            version: time::VERSION,
            time_type: time::RESPONSE,
            body: TimeBody::Response(TimeResponse {
                time: 0x1234_5678,
                offset_direction: time::DIRECTION_WEST,
                offset_hours: 0,
                offset_minutes: 0,
                dst_start: 0,
                dst_end: 0,
                tolerance: time::TOLERANCE_MILLI,
                tolerance_value: 10,
            }),
        };
        round_trip(&time, Time::to_buffer, Time::from_buffer);
    }

    #[test]
    fn courier_round_trip() {
        let envelope = ExpeditedCourier {
            range: ProtocolRange { low: courier::PROTOCOL3, high: courier::PROTOCOL3 },
            body: Protocol3Body::Call {
                transaction: 1,
                program: 2,
                version: 3,
                procedure: 4,
                block: vec![0xAA],
            },
        };
        round_trip(&envelope, ExpeditedCourier::to_buffer, ExpeditedCourier::from_buffer);
    }
}
