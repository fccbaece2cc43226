// The XNS server: a socket-to-listener registry, the receive loop that
// demultiplexes frames into it, the transmit path that fixes up length,
// padding and checksum, and the built-in listeners (Echo, RIP, Time, SPP).
//
// The registry map sits under one mutex. Handlers run with the map unlocked,
// so a handler may add or remove listeners while it services a frame.

use crate::bytebuffer::ByteBuffer;
use crate::driver::Driver;
use crate::pilot::to_mesa_time;
use crate::xns::*;
use chrono::Local;
use log::{error, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub struct ServerConfig {
    pub local_net: u32,
    pub local_host: u64,
    pub networks: Vec<RipEntry>,
    pub time_offset_direction: u16,
    pub time_offset_hours: u16,
    pub time_offset_minutes: u16,
}

#[derive(Clone)]
pub struct ServerContext {
    pub driver: Arc<dyn Driver>,
    pub config: Arc<ServerConfig>,
    pub listeners: Arc<Listeners>,
}

pub struct FrameData {
    pub timestamp: chrono::DateTime<Local>,
    pub ethernet: Ethernet,
    pub idp: Idp,
}

impl FrameData {
    fn header(&self) -> String {
        format!(
            "{} {} {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.ethernet,
            self.idp
        )
    }
}

pub trait Listener: Send {
    fn socket(&self) -> u16;
    fn name(&self) -> &'static str;
    fn auto_delete(&self) -> bool {
        false
    }
    fn init(&mut self, _context: &ServerContext) {}
    fn start(&mut self) {}
    fn stop(&mut self) {}
    fn handle(&mut self, data: &FrameData, context: &ServerContext);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    New,
    Initialized,
    Started,
    Stopped,
}

struct Slot {
    listener: Arc<Mutex<Box<dyn Listener>>>,
    state: State,
    auto_delete: bool,
    name: &'static str,
}

pub struct Listeners {
    map: Mutex<HashMap<u16, Slot>>,
    started: AtomicBool,
}

impl Listeners {
    pub fn new() -> Listeners {
        Listeners { map: Mutex::new(HashMap::new()), started: AtomicBool::new(false) }
    }

    pub fn add(&self, context: &ServerContext, listener: Box<dyn Listener>) {
        let socket = listener.socket();
        let name = listener.name();
        let auto_delete = listener.auto_delete();
        let mut map = self.map.lock().unwrap();
        if map.contains_key(&socket) {
            panic!("listener already registered  socket = {}  name = {}", socket, name);
        }
        let mut slot = Slot {
            listener: Arc::new(Mutex::new(listener)),
            state: State::New,
            auto_delete,
            name,
        };
        slot.listener.lock().unwrap().init(context);
        slot.state = State::Initialized;
        if self.started.load(Ordering::Relaxed) {
            slot.listener.lock().unwrap().start();
            slot.state = State::Started;
        }
        info!("listener add    {:5} {} {:?}", socket, name, slot.state);
        map.insert(socket, slot);
    }

    pub fn remove(&self, socket: u16) {
        let mut map = self.map.lock().unwrap();
        match map.remove(&socket) {
            Some(slot) => info!("listener remove {:5} {}", socket, slot.name),
            None => panic!("listener remove of unmapped socket  socket = {}", socket),
        }
    }

    pub fn get(&self, socket: u16) -> Option<Arc<Mutex<Box<dyn Listener>>>> {
        let map = self.map.lock().unwrap();
        map.get(&socket).map(|slot| Arc::clone(&slot.listener))
    }

    pub fn contains(&self, socket: u16) -> bool {
        self.map.lock().unwrap().contains_key(&socket)
    }

    // A socket above the well-known range that nothing is listening on.
    pub fn unused_socket(&self) -> u16 {
        let map = self.map.lock().unwrap();
        let mut candidate = (SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis()) as u16;
        loop {
            if socket::MAX_WELLKNOWN < candidate && !map.contains_key(&candidate) {
                return candidate;
            }
            candidate = candidate.wrapping_add(1);
        }
    }

    pub fn start(&self) {
        let mut map = self.map.lock().unwrap();
        for (socket, slot) in map.iter_mut() {
            match slot.state {
                State::Initialized | State::Stopped => {
                    slot.listener.lock().unwrap().start();
                    slot.state = State::Started;
                    info!("listener start  {:5} {}", socket, slot.name);
                }
                _ => panic!("listener start in state {:?}  socket = {}", slot.state, socket),
            }
        }
        self.started.store(true, Ordering::Relaxed);
    }

    pub fn stop(&self) {
        let mut map = self.map.lock().unwrap();
        let sockets: Vec<u16> = map.keys().copied().collect();
        for socket in sockets {
            let auto_delete = {
                let slot = map.get_mut(&socket).unwrap();
                if slot.state == State::Started {
                    slot.listener.lock().unwrap().stop();
                    slot.state = State::Stopped;
                    info!("listener stop   {:5} {}", socket, slot.name);
                }
                slot.auto_delete
            };
            if auto_delete {
                let slot = map.remove(&socket).unwrap();
                info!("listener delete {:5} {}", socket, slot.name);
            }
        }
        self.started.store(false, Ordering::Relaxed);
    }
}

//
// transmit path
//

// Encode, fix the length field, pad to the minimum even frame, compute the
// checksum unless the caller asked for no checking, and hand to the driver.
pub fn transmit_idp(driver: &dyn Driver, dst: u64, src: u64, idp: &Idp) -> io::Result<()> {
    let mut packet = ByteBuffer::packet();
    packet.write48(dst);
    packet.write48(src);
    packet.write16(ETHERNET_TYPE_XNS);

    let idp_start = packet.position();
    idp.to_buffer(&mut packet);

    let length = packet.limit() - idp_start;
    packet.set16(idp_start + 2, length as u16);

    let mut padded = length;
    if padded < IDP_MINIMUM_PACKET_LENGTH as u32 {
        padded = IDP_MINIMUM_PACKET_LENGTH as u32;
    }
    if padded % 2 == 1 {
        padded += 1;
    }
    for _ in length..padded {
        packet.write8(0);
    }

    if idp.checksum != CHECKSUM_NOCHECK {
        let bytes = packet.to_vec();
        let checksum = compute_checksum(&bytes, idp_start as usize, length as usize);
        packet.set16(idp_start, checksum);
    }

    driver.transmit(&packet.to_vec())
}

// Address a reply from the request: destination from the source, our own
// identity from the configuration, the socket pair mirrored. The checksum
// mode follows the requester.
pub fn reply_idp(data: &FrameData, config: &ServerConfig, idp_type: u8, block: Vec<u8>) -> Idp {
    Idp {
        checksum: data.idp.checksum,
        length: 0,
        control: 0,
        idp_type,
        dst_net: data.idp.src_net,
        dst_host: data.idp.src_host,
        dst_socket: data.idp.src_socket,
        src_net: config.local_net,
        src_host: config.local_host,
        src_socket: data.idp.dst_socket,
        block,
    }
}

pub fn transmit_reply(context: &ServerContext, data: &FrameData, idp_type: u8, block: Vec<u8>) {
    let idp = reply_idp(data, &context.config, idp_type, block);
    if let Err(err) = transmit_idp(context.driver.as_ref(), data.idp.src_host, context.config.local_host, &idp) {
        warn!("transmit failed  {}", err);
    }
}

fn encode<F: FnOnce(&mut ByteBuffer)>(encoder: F) -> Vec<u8> {
    let mut bb = ByteBuffer::packet();
    encoder(&mut bb);
    bb.to_vec()
}

//
// the server and its receive loop
//

pub struct Server {
    pub context: ServerContext,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Server {
    pub fn new(driver: Arc<dyn Driver>, config: ServerConfig) -> Server {
        let context = ServerContext {
            driver,
            config: Arc::new(config),
            listeners: Arc::new(Listeners::new()),
        };
        Server { context, stop: Arc::new(AtomicBool::new(false)), thread: None }
    }

    pub fn add(&self, listener: Box<dyn Listener>) {
        self.context.listeners.add(&self.context, listener);
    }

    pub fn start(&mut self) {
        self.stop.store(false, Ordering::Relaxed);
        self.context.listeners.start();
        let context = self.context.clone();
        let stop = Arc::clone(&self.stop);
        self.thread = Some(
            std::thread::Builder::new()
                .name("xns-server".to_string())
                .spawn(move || receive_loop(context, stop))
                .expect("spawn xns server"),
        );
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.context.listeners.stop();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receive_loop(context: ServerContext, stop: Arc<AtomicBool>) {
    info!("server START");
    context.driver.discard();
    let mut buffer = [0u8; crate::driver::MAX_FRAME_SIZE];
    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        match context.driver.select(1000) {
            Ok(false) => continue,
            Ok(true) => {}
            Err(err) => {
                error!("select failed  {}", err);
                continue;
            }
        }
        let size = match context.driver.receive(&mut buffer) {
            Ok(size) => size,
            Err(err) => {
                warn!("receive failed  {}", err);
                continue;
            }
        };
        if size < 14 {
            continue;
        }

        let frame = buffer[..size].to_vec();
        let mut bb = ByteBuffer::from_data(frame.clone());
        let ethernet = Ethernet::from_buffer(&mut bb);
        if ethernet.ethertype != ETHERNET_TYPE_XNS {
            continue;
        }
        // our own transmissions come back on some interfaces
        if ethernet.src == context.config.local_host {
            continue;
        }
        if ethernet.dst != host::ALL && ethernet.dst != context.config.local_host {
            continue;
        }

        let idp_start = bb.position() as usize;
        let idp = Idp::from_buffer(&mut bb);
        let data = FrameData { timestamp: Local::now(), ethernet, idp };

        if data.idp.checksum != CHECKSUM_NOCHECK {
            let computed = compute_checksum(&frame, idp_start, data.idp.length as usize);
            if computed != data.idp.checksum {
                warn!("{}  BAD CHECKSUM", data.header());
                continue;
            }
        }

        match context.listeners.get(data.idp.dst_socket) {
            None => warn!("{}  NO HANDLER", data.header()),
            Some(listener) => {
                let mut listener = listener.lock().unwrap();
                listener.handle(&data, &context);
            }
        }
    }
    info!("server STOP");
}

//
// Echo
//

pub struct EchoListener;

impl Listener for EchoListener {
    fn socket(&self) -> u16 {
        socket::ECHO
    }
    fn name(&self) -> &'static str {
        "echo"
    }

    fn handle(&mut self, data: &FrameData, context: &ServerContext) {
        if data.idp.idp_type != idp_type::ECHO {
            panic!("echo listener got type {}", data.idp.idp_type);
        }
        let mut bb = ByteBuffer::from_data(data.idp.block.clone());
        let request = Echo::from_buffer(&mut bb);
        info!("{}  ECHO  [{}]", data.header(), request.block.len());
        if request.echo_type != echo::REQUEST {
            panic!("echo listener got echo type {}", request.echo_type);
        }
        let reply = Echo { echo_type: echo::REPLY, block: request.block };
        transmit_reply(context, data, idp_type::ECHO, encode(|bb| reply.to_buffer(bb)));
    }
}

//
// RIP
//

pub struct RipListener {
    table: Vec<RipEntry>,
    context: Option<ServerContext>,
    ticker: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl RipListener {
    pub fn new() -> RipListener {
        RipListener { table: Vec::new(), context: None, ticker: None, stop: Arc::new(AtomicBool::new(false)) }
    }

    fn find(&self, net: u32) -> RipEntry {
        for entry in &self.table {
            if entry.net == net {
                return *entry;
            }
        }
        RipEntry { net, hop: rip::HOP_INFINITY }
    }
}

impl Listener for RipListener {
    fn socket(&self) -> u16 {
        socket::RIP
    }
    fn name(&self) -> &'static str {
        "rip"
    }

    fn init(&mut self, context: &ServerContext) {
        self.table = context.config.networks.clone();
        self.context = Some(context.clone());
    }

    fn start(&mut self) {
        self.stop.store(false, Ordering::Relaxed);
        let context = self.context.clone().expect("rip listener started before init");
        let stop = Arc::clone(&self.stop);
        let table = self.table.clone();
        self.ticker = Some(
            std::thread::Builder::new()
                .name("rip-ticker".to_string())
                .spawn(move || {
                    let mut count = rip::BROADCAST_INTERVAL - 1;
                    loop {
                        if stop.load(Ordering::Relaxed) {
                            break;
                        }
                        std::thread::sleep(Duration::from_secs(1));
                        count += 1;
                        if count == rip::BROADCAST_INTERVAL {
                            count = 0;
                            let response = Rip { rip_type: rip::RESPONSE, entries: table.clone() };
                            let idp = Idp {
                                checksum: 0,
                                length: 0,
                                control: 0,
                                idp_type: idp_type::RIP,
                                dst_net: context.config.local_net,
                                dst_host: host::ALL,
                                dst_socket: socket::RIP,
                                src_net: context.config.local_net,
                                src_host: context.config.local_host,
                                src_socket: socket::RIP,
                                block: encode(|bb| response.to_buffer(bb)),
                            };
                            info!("rip periodic broadcast");
                            if let Err(err) = transmit_idp(
                                context.driver.as_ref(),
                                host::ALL,
                                context.config.local_host,
                                &idp,
                            ) {
                                warn!("rip broadcast failed  {}", err);
                            }
                        }
                    }
                })
                .expect("spawn rip ticker"),
        );
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(ticker) = self.ticker.take() {
            let _ = ticker.join();
        }
    }

    fn handle(&mut self, data: &FrameData, context: &ServerContext) {
        if data.idp.idp_type != idp_type::RIP {
            panic!("rip listener got type {}", data.idp.idp_type);
        }
        let mut bb = ByteBuffer::from_data(data.idp.block.clone());
        let request = Rip::from_buffer(&mut bb);
        info!("{}  RIP   type {} entries {}", data.header(), request.rip_type, request.entries.len());
        if request.rip_type != rip::REQUEST {
            panic!("rip listener got rip type {}", request.rip_type);
        }

        let return_all = request.entries.len() == 1
            && request.entries[0].net == net::ALL
            && request.entries[0].hop == rip::HOP_INFINITY;

        let entries = if return_all {
            self.table.clone()
        } else {
            request.entries.iter().map(|entry| self.find(entry.net)).collect()
        };
        let reply = Rip { rip_type: rip::RESPONSE, entries };
        transmit_reply(context, data, idp_type::RIP, encode(|bb| reply.to_buffer(bb)));
    }
}

//
// Time
//

pub struct TimeListener;

impl Listener for TimeListener {
    fn socket(&self) -> u16 {
        socket::TIME
    }
    fn name(&self) -> &'static str {
        "time"
    }

    fn handle(&mut self, data: &FrameData, context: &ServerContext) {
        if data.idp.idp_type != idp_type::PEX {
            panic!("time listener got type {}", data.idp.idp_type);
        }
        let mut bb = ByteBuffer::from_data(data.idp.block.clone());
        let request_pex = Pex::from_buffer(&mut bb);
        if request_pex.client_type != pex::TIME {
            panic!("time listener got pex type {}", request_pex.client_type);
        }
        let mut level3 = ByteBuffer::from_data(request_pex.block.clone());
        let request = Time::from_buffer(&mut level3);
        info!("{}  PEX   time type {}", data.header(), request.time_type);
        if request.time_type != time::REQUEST {
            panic!("time listener got time type {}", request.time_type);
        }

        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as u32;
        let config = &context.config;
        let response = Time {
            version: time::VERSION,
            time_type: time::RESPONSE,
            body: TimeBody::Response(TimeResponse {
                time: to_mesa_time(now),
                offset_direction: config.time_offset_direction,
                offset_hours: config.time_offset_hours,
                offset_minutes: config.time_offset_minutes,
                dst_start: 0,
                dst_end: 0,
                tolerance: time::TOLERANCE_MILLI,
                tolerance_value: 10,
            }),
        };
        let reply_pex = Pex {
            id: request_pex.id,
            client_type: pex::TIME,
            block: encode(|bb| response.to_buffer(bb)),
        };
        transmit_reply(context, data, idp_type::PEX, encode(|bb| reply_pex.to_buffer(bb)));
    }
}

//
// SPP streams
//

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SppKey {
    host: u64,
    socket: u16,
    id: u16,
}

struct SppState {
    local_socket: u16,
    local_id: u16,
    seq: u16,
    ack: u16,
    alloc: u16,
    pending: BTreeMap<u16, Vec<u8>>,
}

// Connection state is shared between the well-known listener and the
// ephemeral per-connection listeners it spawns.
type SppShared = Arc<Mutex<HashMap<SppKey, SppState>>>;

pub struct SppListener {
    socket: u16,
    name: &'static str,
    auto_delete: bool,
    connections: SppShared,
}

impl SppListener {
    pub fn new(socket: u16) -> SppListener {
        SppListener {
            socket,
            name: "spp",
            auto_delete: false,
            connections: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn client(&self, socket: u16) -> SppListener {
        SppListener {
            socket,
            name: "spp-client",
            auto_delete: true,
            connections: Arc::clone(&self.connections),
        }
    }

    fn transmit_spp(&self, data: &FrameData, context: &ServerContext, local_socket: u16, spp: &Spp) {
        let mut idp = reply_idp(data, &context.config, idp_type::SPP, encode(|bb| spp.to_buffer(bb)));
        idp.src_socket = local_socket;
        if let Err(err) =
            transmit_idp(context.driver.as_ref(), data.idp.src_host, context.config.local_host, &idp)
        {
            warn!("spp transmit failed  {}", err);
        }
    }
}

impl Listener for SppListener {
    fn socket(&self) -> u16 {
        self.socket
    }
    fn name(&self) -> &'static str {
        self.name
    }
    fn auto_delete(&self) -> bool {
        self.auto_delete
    }

    fn handle(&mut self, data: &FrameData, context: &ServerContext) {
        if data.idp.idp_type != idp_type::SPP {
            panic!("spp listener got type {}", data.idp.idp_type);
        }
        let mut bb = ByteBuffer::from_data(data.idp.block.clone());
        let spp = Spp::from_buffer(&mut bb);
        info!("{}  SPP   {}", data.header(), spp);

        let key = SppKey { host: data.idp.src_host, socket: data.idp.src_socket, id: spp.id_src };
        let mut new_client: Option<SppListener> = None;
        let mut connections = self.connections.lock().unwrap();
        if !connections.contains_key(&key) {
            let local_socket = context.listeners.unused_socket();
            let millis = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis();
            let state = SppState {
                local_socket,
                local_id: (millis / 100) as u16,
                seq: 0,
                ack: 0,
                alloc: 4,
                pending: BTreeMap::new(),
            };
            info!("spp new connection  localSocket = {:04X}  localID = {:04X}", local_socket, state.local_id);
            connections.insert(key, state);
            new_client = Some(self.client(local_socket));
        }
        let state = connections.get_mut(&key).unwrap();

        if spp.is_system() {
            if spp.is_send_ack() {
                let reply = Spp {
                    control: crate::xns::spp::BIT_SYSTEM,
                    sst: crate::xns::spp::SST_DATA,
                    id_src: state.local_id,
                    id_dst: spp.id_src,
                    seq: state.seq,
                    ack: state.ack,
                    alloc: state.alloc,
                    block: Vec::new(),
                };
                let local_socket = state.local_socket;
                drop(connections);
                self.transmit_spp(data, context, local_socket, &reply);
                if let Some(client) = new_client {
                    context.listeners.add(context, Box::new(client));
                }
                return;
            }
        } else {
            // data packet: accumulate in order against the acknowledged
            // sequence, buffering anything out of order
            state.pending.insert(spp.seq, spp.block.clone());
            let mut delivered = Vec::new();
            while let Some(block) = state.pending.remove(&state.ack) {
                delivered.extend_from_slice(&block);
                state.ack = state.ack.wrapping_add(1);
            }

            let ack_packet = Spp {
                control: crate::xns::spp::BIT_SYSTEM,
                sst: crate::xns::spp::SST_DATA,
                id_src: state.local_id,
                id_dst: spp.id_src,
                seq: state.seq,
                ack: state.ack,
                alloc: state.alloc.wrapping_add(state.ack),
                block: Vec::new(),
            };
            let local_socket = state.local_socket;
            let local_id = state.local_id;
            let remote_id = spp.id_src;
            let seq = state.seq;
            if !delivered.is_empty() {
                state.seq = state.seq.wrapping_add(1);
            }
            drop(connections);
            self.transmit_spp(data, context, local_socket, &ack_packet);

            if !delivered.is_empty() {
                let mut level3 = ByteBuffer::from_data(delivered);
                let envelope = ExpeditedCourier::from_buffer(&mut level3);
                let result = dispatch_courier(&envelope.body);
                let reply = ExpeditedCourier {
                    range: ProtocolRange { low: courier::PROTOCOL3, high: courier::PROTOCOL3 },
                    body: result,
                };
                let reply_spp = Spp {
                    control: crate::xns::spp::BIT_END,
                    sst: crate::xns::spp::SST_DATA,
                    id_src: local_id,
                    id_dst: remote_id,
                    seq,
                    ack: self.connections.lock().unwrap().get(&key).map(|s| s.ack).unwrap_or(0),
                    alloc: 4,
                    block: encode(|bb| reply.to_buffer(bb)),
                };
                self.transmit_spp(data, context, local_socket, &reply_spp);
            }
            if let Some(client) = new_client {
                context.listeners.add(context, Box::new(client));
            }
            return;
        }
        drop(connections);
        if let Some(client) = new_client {
            context.listeners.add(context, Box::new(client));
        }
    }
}

// Courier service dispatch. No programs are exported; every call comes back
// rejected, which is enough for the boot-time probes Pilot sends.
fn dispatch_courier(body: &Protocol3Body) -> Protocol3Body {
    match body {
        Protocol3Body::Call { transaction, program, version, procedure, .. } => {
            info!("courier CALL  {}-{}-{}  transaction {:04X}", program, version, procedure, transaction);
            Protocol3Body::Reject { transaction: *transaction, code: courier::NO_SUCH_PROGRAM }
        }
        _ => {
            error!("courier unexpected message");
            Protocol3Body::Reject { transaction: 0, code: courier::INVALID_ARGUMENTS }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DummyDriver;

    fn test_config() -> ServerConfig {
        ServerConfig {
            local_net: 0x11,
            local_host: 0x0000_0000_5678,
            networks: vec![RipEntry { net: 1, hop: 1 }, RipEntry { net: 2, hop: 2 }],
            time_offset_direction: time::DIRECTION_WEST,
            time_offset_hours: 0,
            time_offset_minutes: 0,
        }
    }

    fn context(driver: Arc<DummyDriver>) -> ServerContext {
        ServerContext {
            driver,
            config: Arc::new(test_config()),
            listeners: Arc::new(Listeners::new()),
        }
    }

    fn frame_data(idp: Idp) -> FrameData {
        FrameData {
            timestamp: Local::now(),
            ethernet: Ethernet {
                dst: 0x0000_0000_5678,
                src: idp.src_host,
                ethertype: ETHERNET_TYPE_XNS,
            },
            idp,
        }
    }

    fn request_idp(idp_type: u8, dst_socket: u16, block: Vec<u8>) -> Idp {
        Idp {
            checksum: CHECKSUM_NOCHECK,
            length: 0,
            control: 0,
            idp_type,
            dst_net: 0x11,
            dst_host: 0x0000_0000_5678,
            dst_socket,
            src_net: 0x22,
            src_host: 0x0000_0000_9abc,
            src_socket: 0x4001,
            block,
        }
    }

    fn decode_frame(frame: &[u8]) -> (Ethernet, Idp) {
        let mut bb = ByteBuffer::from_data(frame.to_vec());
        let ethernet = Ethernet::from_buffer(&mut bb);
        let idp = Idp::from_buffer(&mut bb);
        (ethernet, idp)
    }

    #[test]
    fn transmit_pads_to_minimum_and_sets_length() {
        let driver = DummyDriver::new(1);
        let idp = request_idp(idp_type::ECHO, socket::ECHO, Vec::new());
        transmit_idp(&driver, host::ALL, 1, &idp).unwrap();
        let frames = driver.take_transmitted();
        assert_eq!(frames.len(), 1);
        // 14 ethernet + 30 idp header, no padding needed at exactly 30
        assert_eq!(frames[0].len(), 44);
        let (_ethernet, decoded) = decode_frame(&frames[0]);
        assert_eq!(decoded.length, 30);
    }

    #[test]
    fn transmit_pads_odd_length() {
        let driver = DummyDriver::new(1);
        let idp = request_idp(idp_type::ECHO, socket::ECHO, vec![1, 2, 3]);
        transmit_idp(&driver, host::ALL, 1, &idp).unwrap();
        let frames = driver.take_transmitted();
        // 33 bytes of idp padded to 34
        assert_eq!(frames[0].len(), 14 + 34);
        let (_ethernet, decoded) = decode_frame(&frames[0]);
        assert_eq!(decoded.length, 33);
    }

    #[test]
    fn transmit_computes_checksum_unless_nocheck() {
        let driver = DummyDriver::new(1);
        let mut idp = request_idp(idp_type::ECHO, socket::ECHO, vec![1, 2, 3, 4]);
        idp.checksum = 0;
        transmit_idp(&driver, host::ALL, 1, &idp).unwrap();
        let frame = driver.take_transmitted().remove(0);
        let (_ethernet, decoded) = decode_frame(&frame);
        assert_ne!(decoded.checksum, 0xffff);
        assert_eq!(decoded.checksum, compute_checksum(&frame, 14, decoded.length as usize));

        let mut idp = request_idp(idp_type::ECHO, socket::ECHO, vec![1, 2, 3, 4]);
        idp.checksum = CHECKSUM_NOCHECK;
        transmit_idp(&driver, host::ALL, 1, &idp).unwrap();
        let frame = driver.take_transmitted().remove(0);
        let (_ethernet, decoded) = decode_frame(&frame);
        assert_eq!(decoded.checksum, CHECKSUM_NOCHECK);
    }

    #[test]
    fn echo_listener_replies_with_same_block() {
        let driver = Arc::new(DummyDriver::new(0x5678));
        let context = context(Arc::clone(&driver));
        let mut listener = EchoListener;

        let request = Echo { echo_type: echo::REQUEST, block: vec![0xDE, 0xAD, 0xBE, 0xEF] };
        let idp = request_idp(idp_type::ECHO, socket::ECHO, encode(|bb| request.to_buffer(bb)));
        listener.handle(&frame_data(idp), &context);

        let frame = driver.take_transmitted().remove(0);
        let (ethernet, idp) = decode_frame(&frame);
        assert_eq!(ethernet.dst, 0x0000_0000_9abc);
        assert_eq!(idp.idp_type, idp_type::ECHO);
        assert_eq!(idp.dst_host, 0x0000_0000_9abc);
        assert_eq!(idp.dst_net, 0x22);
        assert_eq!(idp.dst_socket, 0x4001);
        let mut bb = ByteBuffer::from_data(idp.block);
        let reply = Echo::from_buffer(&mut bb);
        assert_eq!(reply.echo_type, echo::REPLY);
        assert_eq!(reply.block, vec![0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn rip_request_all_returns_table() {
        let driver = Arc::new(DummyDriver::new(0x5678));
        let context = context(Arc::clone(&driver));
        let mut listener = RipListener::new();
        listener.init(&context);

        let request = Rip {
            rip_type: rip::REQUEST,
            entries: vec![RipEntry { net: net::ALL, hop: rip::HOP_INFINITY }],
        };
        let idp = request_idp(idp_type::RIP, socket::RIP, encode(|bb| request.to_buffer(bb)));
        listener.handle(&frame_data(idp), &context);

        let frame = driver.take_transmitted().remove(0);
        let (_ethernet, idp) = decode_frame(&frame);
        let mut bb = ByteBuffer::from_data(idp.block);
        let reply = Rip::from_buffer(&mut bb);
        assert_eq!(reply.rip_type, rip::RESPONSE);
        assert_eq!(reply.entries, vec![RipEntry { net: 1, hop: 1 }, RipEntry { net: 2, hop: 2 }]);
    }

    #[test]
    fn rip_request_specific_marks_unknown_infinite() {
        let driver = Arc::new(DummyDriver::new(0x5678));
        let context = context(Arc::clone(&driver));
        let mut listener = RipListener::new();
        listener.init(&context);

        let request = Rip {
            rip_type: rip::REQUEST,
            entries: vec![
                RipEntry { net: 1, hop: rip::HOP_INFINITY },
                RipEntry { net: 9, hop: rip::HOP_INFINITY },
            ],
        };
        let idp = request_idp(idp_type::RIP, socket::RIP, encode(|bb| request.to_buffer(bb)));
        listener.handle(&frame_data(idp), &context);

        let frame = driver.take_transmitted().remove(0);
        let (_ethernet, idp) = decode_frame(&frame);
        let mut bb = ByteBuffer::from_data(idp.block);
        let reply = Rip::from_buffer(&mut bb);
        assert_eq!(
            reply.entries,
            vec![RipEntry { net: 1, hop: 1 }, RipEntry { net: 9, hop: rip::HOP_INFINITY }]
        );
    }

    #[test]
    fn time_listener_reports_pilot_epoch() {
        let driver = Arc::new(DummyDriver::new(0x5678));
        let context = context(Arc::clone(&driver));
        let mut listener = TimeListener;

        let request = Time { version: time::VERSION, time_type: time::REQUEST, body: TimeBody::Request };
        let request_pex = Pex { id: 0x1234, client_type: pex::TIME, block: encode(|bb| request.to_buffer(bb)) };
        let idp = request_idp(idp_type::PEX, socket::TIME, encode(|bb| request_pex.to_buffer(bb)));
        let before = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as u32;
        listener.handle(&frame_data(idp), &context);
        let after = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as u32;

        let frame = driver.take_transmitted().remove(0);
        let (_ethernet, idp) = decode_frame(&frame);
        let mut bb = ByteBuffer::from_data(idp.block);
        let reply_pex = Pex::from_buffer(&mut bb);
        assert_eq!(reply_pex.id, 0x1234);
        let mut level3 = ByteBuffer::from_data(reply_pex.block);
        let reply = Time::from_buffer(&mut level3);
        match reply.body {
            TimeBody::Response(response) => {
                assert!(to_mesa_time(before) <= response.time && response.time <= to_mesa_time(after));
                assert_eq!(response.tolerance, time::TOLERANCE_MILLI);
                assert_eq!(response.tolerance_value, 10);
            }
            TimeBody::Request => panic!("request came back"),
        }
    }

    #[test]
    fn spp_system_send_ack_gets_system_reply() {
        let driver = Arc::new(DummyDriver::new(0x5678));
        let context = context(Arc::clone(&driver));
        let mut listener = SppListener::new(socket::COURIER);

        let spp = Spp {
            control: crate::xns::spp::BIT_SYSTEM | crate::xns::spp::BIT_SEND_ACK,
            sst: crate::xns::spp::SST_DATA,
            id_src: 0x7777,
            id_dst: 0,
            seq: 0,
            ack: 0,
            alloc: 1,
            block: Vec::new(),
        };
        let idp = request_idp(idp_type::SPP, socket::COURIER, encode(|bb| spp.to_buffer(bb)));
        listener.handle(&frame_data(idp), &context);

        let frame = driver.take_transmitted().remove(0);
        let (_ethernet, idp) = decode_frame(&frame);
        let mut bb = ByteBuffer::from_data(idp.block);
        let reply = Spp::from_buffer(&mut bb);
        assert!(reply.is_system());
        assert_eq!(reply.id_dst, 0x7777);
        assert_eq!(reply.seq, 0);
        assert_eq!(reply.ack, 0);
        assert_eq!(reply.alloc, 4);
        // reply comes from the connection's ephemeral socket
        assert!(socket::MAX_WELLKNOWN < idp.src_socket);
        // and that socket now has a listener
        assert!(context.listeners.contains(idp.src_socket));
    }

    #[test]
    fn spp_data_delivers_to_courier_in_order() {
        let driver = Arc::new(DummyDriver::new(0x5678));
        let context = context(Arc::clone(&driver));
        let mut listener = SppListener::new(socket::COURIER);

        let call = ExpeditedCourier {
            range: ProtocolRange { low: courier::PROTOCOL3, high: courier::PROTOCOL3 },
            body: Protocol3Body::Call { transaction: 5, program: 2, version: 3, procedure: 0, block: vec![] },
        };
        let bytes = encode(|bb| call.to_buffer(bb));

        let spp = Spp {
            control: 0,
            sst: crate::xns::spp::SST_DATA,
            id_src: 0x7777,
            id_dst: 0,
            seq: 0,
            ack: 0,
            alloc: 1,
            block: bytes,
        };
        let idp = request_idp(idp_type::SPP, socket::COURIER, encode(|bb| spp.to_buffer(bb)));
        listener.handle(&frame_data(idp), &context);

        let frames = driver.take_transmitted();
        // ack plus the courier reject
        assert_eq!(frames.len(), 2);
        let (_ethernet, ack_idp) = decode_frame(&frames[0]);
        let mut bb = ByteBuffer::from_data(ack_idp.block);
        let ack = Spp::from_buffer(&mut bb);
        assert!(ack.is_system());
        assert_eq!(ack.ack, 1);

        let (_ethernet, reply_idp) = decode_frame(&frames[1]);
        let mut bb = ByteBuffer::from_data(reply_idp.block);
        let reply = Spp::from_buffer(&mut bb);
        let mut level3 = ByteBuffer::from_data(reply.block);
        let envelope = ExpeditedCourier::from_buffer(&mut level3);
        match envelope.body {
            Protocol3Body::Reject { transaction, code } => {
                assert_eq!(transaction, 5);
                assert_eq!(code, courier::NO_SUCH_PROGRAM);
            }
            _ => panic!("expected reject"),
        }
    }

    #[test]
    fn registry_lifecycle_and_auto_delete() {
        let driver = Arc::new(DummyDriver::new(0x5678));
        let context = context(Arc::clone(&driver));
        context.listeners.add(&context, Box::new(EchoListener));
        assert!(context.listeners.contains(socket::ECHO));
        context.listeners.start();

        // a started registry starts late arrivals immediately
        let spp = SppListener::new(socket::COURIER);
        let client = spp.client(0x4000);
        context.listeners.add(&context, Box::new(client));
        assert!(context.listeners.contains(0x4000));

        context.listeners.stop();
        // the auto-delete client is gone, echo stays
        assert!(!context.listeners.contains(0x4000));
        assert!(context.listeners.contains(socket::ECHO));
    }

    #[test]
    fn unused_socket_is_above_wellknown_and_unmapped() {
        let driver = Arc::new(DummyDriver::new(0x5678));
        let context = context(Arc::clone(&driver));
        context.listeners.add(&context, Box::new(EchoListener));
        for _ in 0..16 {
            let socket = context.listeners.unused_socket();
            assert!(socket::MAX_WELLKNOWN < socket);
            assert!(!context.listeners.contains(socket));
        }
    }
}
