// End-to-end scenarios: the boot memory layout, the XNS services behind a
// loopback driver, and a machine booted from a hand-assembled germ image.

use emesa::bytebuffer::ByteBuffer;
use emesa::config::{Boot, Display, Entry, Files, MemorySize, Network};
use emesa::driver::{Driver, DummyDriver};
use emesa::memory::Memory;
use emesa::pilot::*;
use emesa::server::{
    transmit_idp, EchoListener, RipListener, Server, ServerConfig, TimeListener,
};
use emesa::xns::*;
use emesa::Machine;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const LOCAL_HOST: u64 = 0x0000_0000_5678;
const REMOTE_HOST: u64 = 0x0000_0000_9abc;

fn server_config() -> ServerConfig {
    ServerConfig {
        local_net: 0x11,
        local_host: LOCAL_HOST,
        networks: vec![RipEntry { net: 1, hop: 1 }, RipEntry { net: 2, hop: 2 }],
        time_offset_direction: time::DIRECTION_WEST,
        time_offset_hours: 0,
        time_offset_minutes: 0,
    }
}

// Build a complete inbound frame the way a remote peer would: computed
// checksum, length set, minimum size and even padding applied.
fn build_frame(idp_type: u8, dst_socket: u16, block: Vec<u8>) -> Vec<u8> {
    let idp = Idp {
        checksum: 0,
        length: 0,
        control: 0,
        idp_type,
        dst_net: 0x11,
        dst_host: LOCAL_HOST,
        dst_socket,
        src_net: 0x22,
        src_host: REMOTE_HOST,
        src_socket: 0x4001,
        block,
    };
    let capture = DummyDriver::new(REMOTE_HOST);
    transmit_idp(&capture, LOCAL_HOST, REMOTE_HOST, &idp).unwrap();
    capture.take_transmitted().remove(0)
}

fn wait_for_frames(driver: &DummyDriver, count: usize) -> Vec<Vec<u8>> {
    let start = Instant::now();
    loop {
        let frames = driver.transmitted();
        if count <= frames.len() {
            return frames;
        }
        if Duration::from_secs(5) < start.elapsed() {
            panic!("timed out waiting for {} frames, have {}", count, frames.len());
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn decode_frame(frame: &[u8]) -> (Ethernet, Idp) {
    let mut bb = ByteBuffer::from_data(frame.to_vec());
    let ethernet = Ethernet::from_buffer(&mut bb);
    let idp = Idp::from_buffer(&mut bb);
    (ethernet, idp)
}

// S1: the boot memory layout.
#[test]
fn boot_memory_layout() {
    let memory = Memory::new(22, 20, 0x100);
    // With the I/O region page at 0x100 the first block is empty and pages
    // [0..0x100) take real pages [0..0x100): vp 0xFF gets rp 255.
    assert_eq!(memory.read_map(0x00ff).rp, (256 - 0x100) + 0x00ff);
    assert!(!memory.read_map(0x00ff).mf.is_vacant());
    // one-to-one above the io block
    assert_eq!(memory.read_map(0x0100).rp, 0x0100);
    // everything past real memory is vacant with rp zero
    let top = memory.vp_size() - 1;
    assert!(memory.read_map(top).mf.is_vacant());
    assert_eq!(memory.read_map(top).rp, 0);
}

// S2: the RIP responder broadcasts the configured table once per interval.
#[test]
fn rip_periodic_broadcast() {
    let driver = Arc::new(DummyDriver::new(LOCAL_HOST));
    let mut server = Server::new(driver.clone() as Arc<dyn Driver>, server_config());
    server.add(Box::new(RipListener::new()));
    server.start();

    // The ticker fires its first broadcast after one second.
    let frames = wait_for_frames(&driver, 1);
    server.stop();

    let broadcasts: Vec<&Vec<u8>> = frames
        .iter()
        .filter(|frame| {
            let (ethernet, idp) = decode_frame(frame);
            ethernet.dst == host::ALL && idp.idp_type == idp_type::RIP
        })
        .collect();
    assert_eq!(broadcasts.len(), 1);

    let (_, idp) = decode_frame(broadcasts[0]);
    assert_eq!(idp.dst_socket, socket::RIP);
    let mut bb = ByteBuffer::from_data(idp.block);
    let rip = Rip::from_buffer(&mut bb);
    assert_eq!(rip.rip_type, rip::RESPONSE);
    assert_eq!(rip.entries, vec![RipEntry { net: 1, hop: 1 }, RipEntry { net: 2, hop: 2 }]);
}

// S3: an Echo request through the whole receive loop.
#[test]
fn echo_end_to_end() {
    let driver = Arc::new(DummyDriver::new(LOCAL_HOST));
    let mut server = Server::new(driver.clone() as Arc<dyn Driver>, server_config());
    server.add(Box::new(EchoListener));
    server.start();

    let request = Echo { echo_type: echo::REQUEST, block: vec![0xDE, 0xAD, 0xBE, 0xEF] };
    let mut bb = ByteBuffer::packet();
    request.to_buffer(&mut bb);
    driver.inject(build_frame(idp_type::ECHO, socket::ECHO, bb.to_vec()));

    let frames = wait_for_frames(&driver, 1);
    server.stop();

    let (ethernet, idp) = decode_frame(&frames[0]);
    assert_eq!(ethernet.dst, REMOTE_HOST);
    assert_eq!(idp.idp_type, idp_type::ECHO);
    assert_eq!(idp.dst_net, 0x22);
    assert_eq!(idp.dst_host, REMOTE_HOST);
    assert_eq!(idp.dst_socket, 0x4001);
    // reply carries a freshly computed, valid checksum
    assert_ne!(idp.checksum, CHECKSUM_NOCHECK);
    assert_eq!(idp.checksum, compute_checksum(&frames[0], 14, idp.length as usize));

    let mut bb = ByteBuffer::from_data(idp.block);
    let reply = Echo::from_buffer(&mut bb);
    assert_eq!(reply.echo_type, echo::REPLY);
    assert_eq!(reply.block, vec![0xDE, 0xAD, 0xBE, 0xEF]);
}

// A corrupted checksum is dropped without a reply.
#[test]
fn bad_checksum_is_dropped() {
    let driver = Arc::new(DummyDriver::new(LOCAL_HOST));
    let mut server = Server::new(driver.clone() as Arc<dyn Driver>, server_config());
    server.add(Box::new(EchoListener));
    server.start();

    let request = Echo { echo_type: echo::REQUEST, block: vec![1, 2] };
    let mut bb = ByteBuffer::packet();
    request.to_buffer(&mut bb);
    let mut frame = build_frame(idp_type::ECHO, socket::ECHO, bb.to_vec());
    // flip a payload bit after the checksum was computed
    let last = frame.len() - 1;
    frame[last] ^= 0x01;
    driver.inject(frame);

    std::thread::sleep(Duration::from_millis(300));
    server.stop();
    assert!(driver.transmitted().is_empty());
}

// S5: the time service reports seconds since the Pilot epoch.
#[test]
fn time_service_uses_pilot_epoch() {
    let driver = Arc::new(DummyDriver::new(LOCAL_HOST));
    let mut server = Server::new(driver.clone() as Arc<dyn Driver>, server_config());
    server.add(Box::new(TimeListener));
    server.start();

    let request = Time { version: time::VERSION, time_type: time::REQUEST, body: TimeBody::Request };
    let mut level3 = ByteBuffer::packet();
    request.to_buffer(&mut level3);
    let pex = Pex { id: 0xCAFE, client_type: pex::TIME, block: level3.to_vec() };
    let mut level2 = ByteBuffer::packet();
    pex.to_buffer(&mut level2);

    let before = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as u32;
    driver.inject(build_frame(idp_type::PEX, socket::TIME, level2.to_vec()));
    let frames = wait_for_frames(&driver, 1);
    let after = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as u32;
    server.stop();

    let (_, idp) = decode_frame(&frames[0]);
    let mut bb = ByteBuffer::from_data(idp.block);
    let reply_pex = Pex::from_buffer(&mut bb);
    assert_eq!(reply_pex.id, 0xCAFE);
    let mut level3 = ByteBuffer::from_data(reply_pex.block);
    let reply = Time::from_buffer(&mut level3);
    match reply.body {
        TimeBody::Response(response) => {
            // unixNow + (67*365+16)*86400 + 731*86400
            let low = before.wrapping_add(2_114_294_400).wrapping_add(731 * 86_400);
            let high = after.wrapping_add(2_114_294_400).wrapping_add(731 * 86_400);
            assert!(low <= response.time && response.time <= high);
            assert_eq!(response.tolerance, time::TOLERANCE_MILLI);
            assert_eq!(response.tolerance_value, 10);
        }
        TimeBody::Request => panic!("request came back"),
    }
}

// A frame for a socket nobody listens on is dropped, not answered.
#[test]
fn unknown_socket_is_dropped() {
    let driver = Arc::new(DummyDriver::new(LOCAL_HOST));
    let mut server = Server::new(driver.clone() as Arc<dyn Driver>, server_config());
    server.start();

    let request = Echo { echo_type: echo::REQUEST, block: vec![] };
    let mut bb = ByteBuffer::packet();
    request.to_buffer(&mut bb);
    driver.inject(build_frame(idp_type::ECHO, socket::ECHO, bb.to_vec()));

    std::thread::sleep(Duration::from_millis(300));
    server.stop();
    assert!(driver.transmitted().is_empty());
}

// Boot a machine from a miniature germ: the initial XFER lands in germ code
// that loads an immediate, reports it on the maintenance panel, and stops
// the emulator.
#[test]
fn machine_boots_a_germ() {
    // germ page: words, big-endian bytes in the file
    let mut germ = vec![0u16; PAGE_SIZE as usize];
    let gfi = 4u16;
    // initial control link: frame at MDS 0x110, low word first
    germ[0] = 0x0110;
    germ[1] = 0x0000;
    // frame overhead: global link and saved pc
    germ[0x0e] = gfi; // 0x10E = frame - 2
    germ[0x0f] = 2; // 0x10F = frame - 1, entry pc in bytes
    // code segment sits at va 0x180, i.e. germ word 0x80
    // bytes: pad, pad, LIB 42, ESC SETMP, ESC STOPEMULATOR
    let code: [u8; 8] = [0, 0, 0o067, 42, 0o370, 0o243, 0o370, 0o242];
    for (i, pair) in code.chunks(2).enumerate() {
        germ[0x80 + i] = ((pair[0] as u16) << 8) | pair[1] as u16;
    }

    let mut file = tempfile::NamedTempFile::new().unwrap();
    let mut bytes = Vec::with_capacity(germ.len() * 2);
    for word in &germ {
        bytes.extend_from_slice(&word.to_be_bytes());
    }
    file.write_all(&bytes).unwrap();
    file.flush().unwrap();

    let entry = Entry {
        name: "germ-test".to_string(),
        display: Display { display_type: "monochrome".to_string(), width: 64, height: 4 },
        file: Files {
            disk: String::new(),
            germ: file.path().to_str().unwrap().to_string(),
            boot: String::new(),
            floppy: String::new(),
        },
        boot: Boot { switch: "0".to_string(), device: "disk".to_string() },
        memory: MemorySize { vmbits: 20, rmbits: 20 },
        network: Network { interface: "dummy".to_string(), address: "10:00:00:00:00:01".to_string() },
    };

    let mut machine = Machine::build(entry, true).unwrap();
    // the germ's global frame table entry: code base 0x180, global frame 0
    let item = M_GFT + gfi as u32 * GFT_ITEM_SIZE;
    machine.memory.write_dbl(item, 0x0180);
    machine.memory.write_dbl(item + 2, 0x0000);

    machine.boot().unwrap();
    assert_eq!(machine.processor.lf, 0x0110);
    assert_eq!(machine.processor.pc, 2);
    assert_eq!(machine.processor.cb, 0x0180);

    machine.run();
    assert_eq!(machine.processor.mp(), 42);
    // boot switches were posted for the germ
    assert_eq!(machine.memory.read_word(0x0900), 1);
    assert_eq!(machine.memory.read_word(0x0903), 0x8000);
}
