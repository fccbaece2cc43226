// Machine assembly: one Machine owns the memory, processor, agents, network
// server and display for a configuration entry, and runs the whole thing.
// Exactly one Machine may exist per process; every subsystem hangs off it
// rather than off globals.

use crate::agent::*;
use crate::config::{parse_switches, Entry};
use crate::diskfile::DiskFile;
use crate::display;
use crate::driver::{Driver, DummyDriver, PacketDriver};
use crate::logger;
use crate::memory::Memory;
use crate::pilot::*;
use crate::processor::{Interrupts, Processor};
use crate::server::{EchoListener, RipListener, Server, ServerConfig, SppListener, TimeListener};
use crate::trace::XferKind;
use crate::xns::{host, socket, RipEntry};
use anyhow::{Context, Result};
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

// The germ loads at virtual page one; its first two words are the control
// link the boot XFER goes through.
pub const GERM_PAGE: u32 = 1;
pub const P_INITIAL_LINK: u16 = (GERM_PAGE * PAGE_SIZE) as u16;

// The germ's boot request block in the MDS.
pub const P_REQUEST: u16 = 0x0900;
pub const BOOT_ACTION_PHYSICAL_VOLUME: u16 = 2;
pub const BOOT_ACTION_ETHER: u16 = 3;
pub const BOOT_ACTION_STREAM: u16 = 4;

static MACHINE_EXISTS: AtomicBool = AtomicBool::new(false);

pub struct Machine {
    pub entry: Entry,
    pub memory: Arc<Memory>,
    pub interrupts: Arc<Interrupts>,
    pub stop: Arc<AtomicBool>,
    pub processor: Processor,
    pub agents: Vec<Arc<dyn Agent>>,
    pub keyboard: Arc<KeyboardAgent>,
    pub mouse: Arc<MouseAgent>,
    pub driver: Arc<dyn Driver>,
    pub server: Option<Server>,
    pub started: Instant,
    display_thread: Option<JoinHandle<()>>,
    no_display: bool,
}

impl Machine {
    pub fn build(entry: Entry, no_display: bool) -> Result<Machine> {
        if MACHINE_EXISTS.swap(true, Ordering::SeqCst) {
            panic!("a Machine already exists in this process");
        }
        let machine = Self::build_inner(entry, no_display);
        if machine.is_err() {
            MACHINE_EXISTS.store(false, Ordering::SeqCst);
        }
        machine
    }

    fn build_inner(entry: Entry, no_display: bool) -> Result<Machine> {
        let memory = Arc::new(Memory::new(
            entry.memory.vmbits,
            entry.memory.rmbits,
            IO_REGION_PAGE_DEFAULT,
        ));
        memory.reserve_display_page(entry.display.width, entry.display.height);

        let interrupts = Arc::new(Interrupts::new());
        let stop = Arc::new(AtomicBool::new(false));
        let mut processor = Processor::new(Arc::clone(&memory), Arc::clone(&interrupts), Arc::clone(&stop));
        processor.add_mp_observer(logger::mp_message());

        let address = host::parse(&entry.network.address)
            .with_context(|| format!("bad network address  {}", entry.network.address))?;
        processor.pid = [
            0,
            (address >> 32) as u16,
            (address >> 16) as u16,
            address as u16,
        ];
        processor.pid[0] =
            processor.pid[1].wrapping_add(processor.pid[2]).wrapping_add(processor.pid[3]);

        let driver: Arc<dyn Driver> = if entry.network.interface.is_empty()
            || entry.network.interface == "dummy"
        {
            Arc::new(DummyDriver::new(address))
        } else {
            match PacketDriver::open(&entry.network.interface, address) {
                Ok(driver) => Arc::new(driver),
                Err(err) => {
                    warn!("cannot open interface {}  {}  using dummy", entry.network.interface, err);
                    Arc::new(DummyDriver::new(address))
                }
            }
        };

        // Agents take FCB slots in the I/O region in index order.
        let mut fcb_cursor = IO_REGION_PAGE_DEFAULT as u32 * PAGE_SIZE;
        let mut take_fcb = |size: u32| {
            let fcb = fcb_cursor;
            fcb_cursor += size;
            fcb
        };

        let mut agents: Vec<Arc<dyn Agent>> = Vec::new();

        if !entry.file.disk.is_empty() {
            let disk = Arc::new(DiskFile::attach(&entry.file.disk)?);
            let agent = Arc::new(DiskAgent::new(
                DiskKind::Disk,
                take_fcb(DISK_FCB_DCB_START + DISK_DCB_SIZE),
                vec![disk],
                Arc::clone(&memory),
                Arc::clone(&interrupts),
            ));
            agents.push(agent);
        }
        if !entry.file.floppy.is_empty() {
            let floppy = Arc::new(DiskFile::attach(&entry.file.floppy)?);
            let agent = Arc::new(DiskAgent::new(
                DiskKind::Floppy,
                take_fcb(DISK_FCB_DCB_START + FLOPPY_DCB_SIZE),
                vec![floppy],
                Arc::clone(&memory),
                Arc::clone(&interrupts),
            ));
            agents.push(agent);
        }

        let network = Arc::new(NetworkAgent::new(
            take_fcb(ETHER_FCB_SIZE),
            Arc::clone(&driver),
            Arc::clone(&memory),
            Arc::clone(&interrupts),
        ));
        agents.push(network);

        let keyboard = Arc::new(KeyboardAgent::new(take_fcb(KEYBOARD_FCB_SIZE)));
        agents.push(Arc::clone(&keyboard) as Arc<dyn Agent>);
        let mouse = Arc::new(MouseAgent::new(take_fcb(MOUSE_FCB_SIZE)));
        agents.push(Arc::clone(&mouse) as Arc<dyn Agent>);
        let display_agent = Arc::new(DisplayAgent::new(
            take_fcb(DISPLAY_FCB_SIZE),
            entry.display.width,
            entry.display.height,
        ));
        agents.push(display_agent);

        for agent in &agents {
            agent.initialize(&memory);
            let hook = Arc::clone(agent);
            processor.set_agent_call(agent.index() as usize, Box::new(move |memory| hook.call(memory)));
            info!("agent {:2} {:8}  fcb = {:06X}+{:X}", agent.index(), agent.name(), agent.fcb_address(), agent.fcb_size());
        }

        // The XNS services ride the same driver as the guest's network agent.
        let server_config = ServerConfig {
            local_net: 1,
            local_host: address,
            networks: vec![RipEntry { net: 1, hop: 1 }],
            time_offset_direction: 0,
            time_offset_hours: 0,
            time_offset_minutes: 0,
        };
        let server = Server::new(Arc::clone(&driver), server_config);
        server.add(Box::new(EchoListener));
        server.add(Box::new(RipListener::new()));
        server.add(Box::new(TimeListener));
        server.add(Box::new(SppListener::new(socket::COURIER)));

        Ok(Machine {
            entry,
            memory,
            interrupts,
            stop,
            processor,
            agents,
            keyboard,
            mouse,
            driver,
            server: Some(server),
            started: Instant::now(),
            display_thread: None,
            no_display,
        })
    }

    // Load a page-aligned image file into virtual memory.
    fn load_image(&self, path: &str, vp: u32) -> Result<u32> {
        let bytes = std::fs::read(path).with_context(|| format!("cannot read image  path = {}", path))?;
        let mut va = vp * PAGE_SIZE;
        for chunk in bytes.chunks(2) {
            let high = chunk[0] as u16;
            let low = if chunk.len() == 2 { chunk[1] as u16 } else { 0 };
            self.memory.write_word(va, (high << 8) | low);
            va += 1;
        }
        let pages = (bytes.len() as u32 + BYTES_PER_PAGE - 1) / BYTES_PER_PAGE;
        info!("loaded {}  {} pages at vp {:04X}", path, pages, vp);
        Ok(pages)
    }

    fn boot_action(&self) -> u16 {
        match self.entry.boot.device.as_str() {
            "disk" => BOOT_ACTION_PHYSICAL_VOLUME,
            "ether" => BOOT_ACTION_ETHER,
            "stream" => BOOT_ACTION_STREAM,
            other => {
                warn!("unknown boot device {}  assuming disk", other);
                BOOT_ACTION_PHYSICAL_VOLUME
            }
        }
    }

    // The booting action: germ into memory, request block filled in, then
    // XFER through the germ's initial link.
    pub fn boot(&mut self) -> Result<()> {
        self.processor.reset();
        self.load_image(&self.entry.file.germ.clone(), GERM_PAGE)?;

        let switches = parse_switches(&self.entry.boot.switch)?;
        let request = P_REQUEST as u32;
        self.memory.write_word(request, 1); // currentRequestBasicVersion
        self.memory.write_word(request + 1, self.boot_action());
        self.memory.write_word(request + 2, 0); // device ordinal
        for (i, &word) in switches.iter().enumerate() {
            self.memory.write_word(request + 3 + i as u32, word);
        }

        self.processor.mds = 0;
        self.processor.wdc = 1;
        self.processor.sp = 0;
        let link = self.processor.read_dbl_mds(P_INITIAL_LINK).map_err(|fault| {
            anyhow::anyhow!("cannot read initial link  {}", fault)
        })?;
        self.processor
            .xfer(link, 0, XferKind::Call, false)
            .map_err(|fault| anyhow::anyhow!("boot transfer failed  {}", fault))?;
        self.processor.running = true;
        info!("boot  link = {:08X}  pc = {:04X}", link, self.processor.pc);
        Ok(())
    }

    // Run until the guest stops the emulator or an operator stops us.
    pub fn run(&mut self) {
        if let Some(server) = self.server.as_mut() {
            server.start();
        }
        if !self.no_display {
            let memory = Arc::clone(&self.memory);
            let stop = Arc::clone(&self.stop);
            self.display_thread = Some(
                std::thread::Builder::new()
                    .name("display".to_string())
                    .spawn(move || display::run_window(memory, stop))
                    .expect("spawn display"),
            );
        }

        self.processor.run();

        self.shutdown();
    }

    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        for agent in &self.agents {
            agent.stop();
        }
        if let Some(mut server) = self.server.take() {
            server.stop();
        }
        if let Some(thread) = self.display_thread.take() {
            let _ = thread.join();
        }
        info!("machine stopped  elapsed = {:?}", self.started.elapsed());
    }

    pub fn elapsed_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        MACHINE_EXISTS.store(false, Ordering::SeqCst);
    }
}
