// The Guam device agents. Each agent owns a guest-visible FCB in the I/O
// region and, where the device does real work, one worker thread fed by a
// queue of IOCB addresses. The guest posts work by linking IOCBs off the FCB
// and raising the agent's CALLAGENT; completions are written back into guest
// memory before the interrupt is raised, and the interrupt publication is the
// release edge the processor acquires.

use crate::diskfile::DiskFile;
use crate::driver::Driver;
use crate::memory::Memory;
use crate::pilot::*;
use crate::processor::Interrupts;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

// Chain walks stop here; a longer chain is a corrupt or cyclic guest list.
const MAX_IOCB_CHAIN: u32 = 4096;

const QUEUE_DEPTH: usize = 1024;
const WORKER_WAIT: Duration = Duration::from_secs(1);

// Agent indices as the head enumerates them.
pub const AGENT_DISK: u16 = 0;
pub const AGENT_FLOPPY: u16 = 1;
pub const AGENT_NETWORK: u16 = 2;
pub const AGENT_KEYBOARD: u16 = 4;
pub const AGENT_MOUSE: u16 = 6;
pub const AGENT_DISPLAY: u16 = 8;

pub trait Agent: Send + Sync {
    fn index(&self) -> u16;
    fn name(&self) -> &'static str;
    fn fcb_address(&self) -> u32;
    fn fcb_size(&self) -> u32;
    // Populate the FCB at boot.
    fn initialize(&self, memory: &Memory);
    // The guest's CALLAGENT entry, on the processor thread.
    fn call(&self, memory: &Memory);
    // Cooperative shutdown; bounded by the worker's timed wait.
    fn stop(&self);
}

//
// Disk and floppy: IOCB chains serviced by a worker thread.
//

#[derive(Clone, Copy, PartialEq)]
pub enum DiskKind {
    Disk,
    Floppy,
}

struct IoItem {
    iocb: u32,
    device: usize,
}

pub struct DiskAgent {
    kind: DiskKind,
    index: u16,
    name: &'static str,
    fcb_address: u32,
    disks: Vec<Arc<DiskFile>>,
    queue: Sender<IoItem>,
    worker: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    // service counters for the perf command
    pub read_count: Arc<AtomicU64>,
    pub write_count: Arc<AtomicU64>,
    pub verify_count: Arc<AtomicU64>,
}

impl DiskAgent {
    pub fn new(
        kind: DiskKind,
        fcb_address: u32,
        disks: Vec<Arc<DiskFile>>,
        memory: Arc<Memory>,
        interrupts: Arc<Interrupts>,
    ) -> DiskAgent {
        if disks.is_empty() {
            panic!("disk agent needs at least one image");
        }
        let (sender, receiver) = bounded::<IoItem>(QUEUE_DEPTH);
        let stop = Arc::new(AtomicBool::new(false));
        let read_count = Arc::new(AtomicU64::new(0));
        let write_count = Arc::new(AtomicU64::new(0));
        let verify_count = Arc::new(AtomicU64::new(0));

        let (index, name) = match kind {
            DiskKind::Disk => (AGENT_DISK, "Disk"),
            DiskKind::Floppy => (AGENT_FLOPPY, "Floppy"),
        };

        let worker = {
            let memory = Arc::clone(&memory);
            let interrupts = Arc::clone(&interrupts);
            let disks = disks.clone();
            let stop = Arc::clone(&stop);
            let counts = (Arc::clone(&read_count), Arc::clone(&write_count), Arc::clone(&verify_count));
            std::thread::Builder::new()
                .name(format!("agent-{}", name.to_lowercase()))
                .spawn(move || {
                    io_worker(kind, fcb_address, receiver, memory, interrupts, disks, stop, counts)
                })
                .expect("spawn agent worker")
        };

        DiskAgent {
            kind,
            index,
            name,
            fcb_address,
            disks,
            queue: sender,
            worker: Some(worker),
            stop,
            read_count,
            write_count,
            verify_count,
        }
    }

    fn dcb_size(&self) -> u32 {
        match self.kind {
            DiskKind::Disk => DISK_DCB_SIZE,
            DiskKind::Floppy => FLOPPY_DCB_SIZE,
        }
    }

    fn write_dcb(&self, memory: &Memory, index: usize) {
        let disk = &self.disks[index];
        let dcb = self.fcb_address + DISK_FCB_DCB_START + index as u32 * self.dcb_size();
        match self.kind {
            DiskKind::Disk => {
                let (cylinders, heads, sectors) = disk.disk_geometry();
                memory.write_word(dcb + DISK_DCB_DEVICE_TYPE, DEVICE_T_ANY_PILOT_DISK);
                memory.write_word(dcb + DISK_DCB_NUMBER_OF_CYLINDERS, cylinders);
                memory.write_word(dcb + DISK_DCB_NUMBER_OF_HEADS, heads);
                memory.write_word(dcb + DISK_DCB_SECTORS_PER_TRACK, sectors);
                for i in 0..6 {
                    memory.write_word(dcb + DISK_DCB_AGENT_DEVICE_DATA + i, 0);
                }
                info!("AGENT {}  {}  CHS = {:5} {:2} {:2}  {}", self.name, index, cylinders, heads, sectors, disk.path());
            }
            DiskKind::Floppy => {
                let (cylinders, heads, sectors) = disk.floppy_geometry();
                memory.write_word(dcb + DISK_DCB_DEVICE_TYPE, DEVICE_T_MICRO_FLOPPY);
                memory.write_word(dcb + DISK_DCB_NUMBER_OF_CYLINDERS, cylinders);
                memory.write_word(dcb + DISK_DCB_NUMBER_OF_HEADS, heads);
                memory.write_word(dcb + DISK_DCB_SECTORS_PER_TRACK, sectors);
                memory.write_word(dcb + FLOPPY_DCB_READY, 1);
                memory.write_word(dcb + FLOPPY_DCB_DISK_CHANGED, 1);
                memory.write_word(dcb + FLOPPY_DCB_TWO_SIDED, 1);
                memory.write_word(dcb + FLOPPY_DCB_SUGGESTED_TRIES, 1);
                info!("AGENT {}  {}  CHS = {:5} {:2} {:2}  {}", self.name, index, cylinders, heads, sectors, disk.path());
            }
        }
    }
}

impl Agent for DiskAgent {
    fn index(&self) -> u16 {
        self.index
    }
    fn name(&self) -> &'static str {
        self.name
    }
    fn fcb_address(&self) -> u32 {
        self.fcb_address
    }
    fn fcb_size(&self) -> u32 {
        DISK_FCB_DCB_START + self.disks.len() as u32 * self.dcb_size()
    }

    fn initialize(&self, memory: &Memory) {
        let fcb = self.fcb_address;
        memory.write_dbl(fcb + DISK_FCB_NEXT_IOCB, 0);
        memory.write_word(fcb + DISK_FCB_INTERRUPT_SELECTOR, 0);
        memory.write_word(fcb + DISK_FCB_STOP_AGENT, 0);
        memory.write_word(fcb + DISK_FCB_AGENT_STOPPED, 1);
        memory.write_word(fcb + DISK_FCB_NUMBER_OF_DCBS, self.disks.len() as u16);
        for i in 0..self.disks.len() {
            self.write_dcb(memory, i);
        }
    }

    fn call(&self, memory: &Memory) {
        let fcb = self.fcb_address;
        if memory.read_word(fcb + DISK_FCB_STOP_AGENT) != 0 {
            if memory.read_word(fcb + DISK_FCB_AGENT_STOPPED) == 0 {
                info!("AGENT {} stop", self.name);
            }
            memory.write_word(fcb + DISK_FCB_AGENT_STOPPED, 1);
            return;
        }
        if memory.read_word(fcb + DISK_FCB_AGENT_STOPPED) != 0 {
            info!("AGENT {} start  {:04X}", self.name, memory.read_word(fcb + DISK_FCB_INTERRUPT_SELECTOR));
        }
        memory.write_word(fcb + DISK_FCB_AGENT_STOPPED, 0);

        let mut next = memory.read_dbl(fcb + DISK_FCB_NEXT_IOCB);
        if next == 0 {
            return;
        }
        let number_of_dcbs = memory.read_word(fcb + DISK_FCB_NUMBER_OF_DCBS);
        let mut walked = 0u32;
        while next != 0 {
            let iocb = next;
            let device_index = memory.read_word(iocb + DISK_IOCB_DEVICE_INDEX);
            if number_of_dcbs <= device_index {
                panic!("AGENT {} deviceIndex = {}", self.name, device_index);
            }
            let command = memory.read_word(iocb + DISK_IOCB_COMMAND);
            match command {
                DISK_COMMAND_READ | DISK_COMMAND_WRITE | DISK_COMMAND_VERIFY => {}
                _ => panic!("AGENT {} command = {}", self.name, command),
            }
            if self.queue.send(IoItem { iocb, device: device_index as usize }).is_err() {
                error!("AGENT {} worker is gone", self.name);
                return;
            }
            next = memory.read_dbl(iocb + DISK_IOCB_NEXT_IOCB);
            walked += 1;
            if MAX_IOCB_CHAIN < walked {
                panic!("AGENT {} iocb chain does not terminate", self.name);
            }
        }
    }

    fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

impl Drop for DiskAgent {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn io_worker(
    kind: DiskKind,
    fcb_address: u32,
    receiver: Receiver<IoItem>,
    memory: Arc<Memory>,
    interrupts: Arc<Interrupts>,
    disks: Vec<Arc<DiskFile>>,
    stop: Arc<AtomicBool>,
    counts: (Arc<AtomicU64>, Arc<AtomicU64>, Arc<AtomicU64>),
) {
    info!("io worker START");
    let (read_count, write_count, verify_count) = counts;
    let mut process_count: u64 = 0;
    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        let item = match receiver.recv_timeout(WORKER_WAIT) {
            Ok(item) => item,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        process_iocb(kind, &memory, &disks[item.device], item.iocb, &read_count, &write_count, &verify_count);
        let selector = memory.read_word(fcb_address + DISK_FCB_INTERRUPT_SELECTOR);
        interrupts.notify_interrupt(selector);
        process_count += 1;
    }
    info!("processCount = {:8}", process_count);
    info!("io worker STOP");
}

fn process_iocb(
    kind: DiskKind,
    memory: &Memory,
    disk: &DiskFile,
    iocb: u32,
    read_count: &AtomicU64,
    write_count: &AtomicU64,
    verify_count: &AtomicU64,
) {
    let cylinder = memory.read_word(iocb + DISK_IOCB_DISK_ADDRESS);
    let head = memory.read_word(iocb + DISK_IOCB_DISK_ADDRESS + 1);
    let sector = memory.read_word(iocb + DISK_IOCB_DISK_ADDRESS + 2);
    let (heads, sectors) = match kind {
        DiskKind::Disk => (DISK_NUMBER_OF_HEADS, DISK_SECTORS_PER_TRACK),
        DiskKind::Floppy => (FLOPPY_NUMBER_OF_HEADS, FLOPPY_SECTORS_PER_TRACK),
    };
    let mut block = disk.block_of(cylinder, head, sector, heads, sectors);
    let command = memory.read_word(iocb + DISK_IOCB_COMMAND);
    let page_count = memory.read_word(iocb + DISK_IOCB_PAGE_COUNT);
    let mut data_ptr = memory.read_dbl(iocb + DISK_IOCB_DATA_PTR);
    debug!(
        "process {:4} {:6} {:08X} + {:3} dataPtr = {:08X}",
        command, block, iocb, page_count, data_ptr
    );

    let mut buffer = vec![0u16; PAGE_SIZE as usize];
    let status = match command {
        DISK_COMMAND_READ => {
            for _ in 0..page_count {
                disk.read_page(block, &mut buffer);
                memory.copy_to_guest(data_ptr, &buffer);
                block += 1;
                data_ptr += PAGE_SIZE;
            }
            read_count.fetch_add(1, Ordering::Relaxed);
            STATUS_GOOD_COMPLETION
        }
        DISK_COMMAND_WRITE => {
            for _ in 0..page_count {
                memory.copy_from_guest(data_ptr, &mut buffer);
                disk.write_page(block, &buffer);
                block += 1;
                data_ptr += PAGE_SIZE;
            }
            write_count.fetch_add(1, Ordering::Relaxed);
            STATUS_GOOD_COMPLETION
        }
        DISK_COMMAND_VERIFY => {
            let mut mismatch = false;
            for _ in 0..page_count {
                memory.copy_from_guest(data_ptr, &mut buffer);
                mismatch |= disk.verify_page(block, &buffer);
                block += 1;
                data_ptr += PAGE_SIZE;
            }
            verify_count.fetch_add(1, Ordering::Relaxed);
            if mismatch {
                STATUS_DATA_VERIFY_ERROR
            } else {
                STATUS_GOOD_COMPLETION
            }
        }
        _ => unreachable!("validated in call"),
    };

    memory.write_word(iocb + DISK_IOCB_PAGE_COUNT, 0);
    memory.write_word(iocb + DISK_IOCB_STATUS, status);
}

//
// Display agent: commands through the FCB, no worker.
//

pub struct DisplayAgent {
    fcb_address: u32,
    width: u16,
    height: u16,
}

impl DisplayAgent {
    pub fn new(fcb_address: u32, width: u16, height: u16) -> DisplayAgent {
        DisplayAgent { fcb_address, width, height }
    }
}

impl Agent for DisplayAgent {
    fn index(&self) -> u16 {
        AGENT_DISPLAY
    }
    fn name(&self) -> &'static str {
        "Display"
    }
    fn fcb_address(&self) -> u32 {
        self.fcb_address
    }
    fn fcb_size(&self) -> u32 {
        DISPLAY_FCB_SIZE
    }

    fn initialize(&self, memory: &Memory) {
        let fcb = self.fcb_address;
        memory.write_word(fcb + DISPLAY_FCB_COMMAND, DISPLAY_COMMAND_NOP);
        memory.write_word(fcb + DISPLAY_FCB_STATUS, 0);
        memory.write_word(fcb + DISPLAY_FCB_RESULT, DISPLAY_RESULT_SUCCESS);
        memory.write_word(fcb + DISPLAY_FCB_WIDTH, self.width);
        memory.write_word(fcb + DISPLAY_FCB_HEIGHT, self.height);
        memory.write_word(fcb + DISPLAY_FCB_PAGE_COUNT, memory.display_page_size() as u16);
        memory.write_dbl(fcb + DISPLAY_FCB_DEST_REAL_PAGE, memory.display_real_page());
    }

    fn call(&self, memory: &Memory) {
        let fcb = self.fcb_address;
        let command = memory.read_word(fcb + DISPLAY_FCB_COMMAND);
        match command {
            DISPLAY_COMMAND_NOP => {}
            DISPLAY_COMMAND_MAP_DISPLAY => {
                // Framebuffer pages were vacant until now, so the processor
                // cannot hold stale translations for them.
                let vp = memory.read_dbl(fcb + DISPLAY_FCB_DEST_VIRTUAL_PAGE);
                let rp = memory.read_dbl(fcb + DISPLAY_FCB_DEST_REAL_PAGE);
                let count = memory.read_word(fcb + DISPLAY_FCB_PAGE_COUNT) as u32;
                memory.map_display(vp, rp, count);
            }
            DISPLAY_COMMAND_POSITION_CURSOR
            | DISPLAY_COMMAND_SET_CURSOR_PATTERN
            | DISPLAY_COMMAND_UPDATE_RECTANGLE
            | DISPLAY_COMMAND_COPY_RECTANGLE
            | DISPLAY_COMMAND_PATTERN_FILL => {
                // Recognized but fully handled by the host redraw.
            }
            DISPLAY_COMMAND_UNMAP_DISPLAY => {
                warn!("AGENT Display unmap ignored");
            }
            _ => panic!("AGENT Display command = {}", command),
        }
        memory.write_word(fcb + DISPLAY_FCB_RESULT, DISPLAY_RESULT_SUCCESS);
    }

    fn stop(&self) {}
}

//
// Keyboard and mouse: event-fed FCBs.
//

pub struct KeyboardAgent {
    fcb_address: u32,
}

impl KeyboardAgent {
    pub fn new(fcb_address: u32) -> KeyboardAgent {
        KeyboardAgent { fcb_address }
    }

    // Key-down bits are active low.
    pub fn key_press(&self, memory: &Memory, scan_code: u16) {
        let word = self.fcb_address + KEYBOARD_FCB_KEYS + (scan_code / 16) as u32;
        if KEYBOARD_FCB_SIZE <= (scan_code / 16) as u32 {
            warn!("key_press out of range  scan_code = {}", scan_code);
            return;
        }
        let value = memory.read_word(word);
        memory.write_word(word, value & !(0x8000 >> (scan_code % 16)));
    }

    pub fn key_release(&self, memory: &Memory, scan_code: u16) {
        let word = self.fcb_address + KEYBOARD_FCB_KEYS + (scan_code / 16) as u32;
        if KEYBOARD_FCB_SIZE <= (scan_code / 16) as u32 {
            warn!("key_release out of range  scan_code = {}", scan_code);
            return;
        }
        let value = memory.read_word(word);
        memory.write_word(word, value | (0x8000 >> (scan_code % 16)));
    }
}

impl Agent for KeyboardAgent {
    fn index(&self) -> u16 {
        AGENT_KEYBOARD
    }
    fn name(&self) -> &'static str {
        "Keyboard"
    }
    fn fcb_address(&self) -> u32 {
        self.fcb_address
    }
    fn fcb_size(&self) -> u32 {
        KEYBOARD_FCB_SIZE
    }
    fn initialize(&self, memory: &Memory) {
        for i in 0..KEYBOARD_FCB_SIZE {
            memory.write_word(self.fcb_address + KEYBOARD_FCB_KEYS + i, 0xffff);
        }
    }
    fn call(&self, _memory: &Memory) {}
    fn stop(&self) {}
}

pub struct MouseAgent {
    fcb_address: u32,
}

impl MouseAgent {
    pub fn new(fcb_address: u32) -> MouseAgent {
        MouseAgent { fcb_address }
    }

    pub fn set_position(&self, memory: &Memory, x: u16, y: u16) {
        memory.write_word(self.fcb_address + MOUSE_FCB_NEW_X, x);
        memory.write_word(self.fcb_address + MOUSE_FCB_NEW_Y, y);
    }
}

impl Agent for MouseAgent {
    fn index(&self) -> u16 {
        AGENT_MOUSE
    }
    fn name(&self) -> &'static str {
        "Mouse"
    }
    fn fcb_address(&self) -> u32 {
        self.fcb_address
    }
    fn fcb_size(&self) -> u32 {
        MOUSE_FCB_SIZE
    }
    fn initialize(&self, memory: &Memory) {
        for i in 0..MOUSE_FCB_SIZE {
            memory.write_word(self.fcb_address + i, 0);
        }
    }
    fn call(&self, memory: &Memory) {
        // The head polls: current position follows the host position.
        let fcb = self.fcb_address;
        let x = memory.read_word(fcb + MOUSE_FCB_NEW_X);
        let y = memory.read_word(fcb + MOUSE_FCB_NEW_Y);
        memory.write_word(fcb + MOUSE_FCB_CURRENT_X, x);
        memory.write_word(fcb + MOUSE_FCB_CURRENT_Y, y);
    }
    fn stop(&self) {}
}

//
// Network agent: transmit IOCBs go straight to the driver; a worker thread
// feeds received frames into posted receive IOCBs.
//

pub struct NetworkAgent {
    fcb_address: u32,
    driver: Arc<dyn Driver>,
    interrupts: Arc<Interrupts>,
    worker: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    receive_enabled: Arc<AtomicBool>,
}

impl NetworkAgent {
    pub fn new(
        fcb_address: u32,
        driver: Arc<dyn Driver>,
        memory: Arc<Memory>,
        interrupts: Arc<Interrupts>,
    ) -> NetworkAgent {
        let stop = Arc::new(AtomicBool::new(false));
        let receive_enabled = Arc::new(AtomicBool::new(false));
        let worker = {
            let driver = Arc::clone(&driver);
            let memory = Arc::clone(&memory);
            let interrupts = Arc::clone(&interrupts);
            let stop = Arc::clone(&stop);
            let receive_enabled = Arc::clone(&receive_enabled);
            std::thread::Builder::new()
                .name("agent-network".to_string())
                .spawn(move || {
                    receive_worker(fcb_address, driver, memory, interrupts, stop, receive_enabled)
                })
                .expect("spawn network worker")
        };
        NetworkAgent { fcb_address, driver, interrupts, worker: Some(worker), stop, receive_enabled }
    }

    fn transmit_chain(&self, memory: &Memory) {
        let fcb = self.fcb_address;
        let mut next = memory.read_dbl(fcb + ETHER_FCB_TRANSMIT_IOCB);
        let mut walked = 0u32;
        while next != 0 {
            let iocb = next;
            let buffer_address = memory.read_dbl(iocb + ETHER_IOCB_BUFFER_ADDRESS);
            let length = memory.read_word(iocb + ETHER_IOCB_BUFFER_LENGTH) as usize;
            let mut words = vec![0u16; (length + 1) / 2];
            memory.copy_from_guest(buffer_address, &mut words);
            let mut frame = Vec::with_capacity(length);
            for word in &words {
                frame.push((word >> 8) as u8);
                frame.push(*word as u8);
            }
            frame.truncate(length);
            match self.driver.transmit(&frame) {
                Ok(()) => {
                    memory.write_word(iocb + ETHER_IOCB_DEQUEUED_PACKET_TYPE, ETHER_STATUS_COMPLETED_OK);
                }
                Err(err) => {
                    warn!("transmit failed  {}", err);
                    memory.write_word(iocb + ETHER_IOCB_DEQUEUED_PACKET_TYPE, ETHER_STATUS_COMPLETED_OK);
                }
            }
            next = memory.read_dbl(iocb + ETHER_IOCB_NEXT_IOCB);
            walked += 1;
            if MAX_IOCB_CHAIN < walked {
                panic!("AGENT Network transmit chain does not terminate");
            }
        }
        memory.write_dbl(fcb + ETHER_FCB_TRANSMIT_IOCB, 0);
        let selector = memory.read_word(fcb + ETHER_FCB_TRANSMIT_INTERRUPT_SELECTOR);
        if selector != 0 {
            self.interrupts.notify_interrupt(selector);
        }
    }
}

impl Agent for NetworkAgent {
    fn index(&self) -> u16 {
        AGENT_NETWORK
    }
    fn name(&self) -> &'static str {
        "Network"
    }
    fn fcb_address(&self) -> u32 {
        self.fcb_address
    }
    fn fcb_size(&self) -> u32 {
        ETHER_FCB_SIZE
    }

    fn initialize(&self, memory: &Memory) {
        let fcb = self.fcb_address;
        memory.write_dbl(fcb + ETHER_FCB_RECEIVE_IOCB, 0);
        memory.write_dbl(fcb + ETHER_FCB_TRANSMIT_IOCB, 0);
        memory.write_word(fcb + ETHER_FCB_RECEIVE_INTERRUPT_SELECTOR, 0);
        memory.write_word(fcb + ETHER_FCB_TRANSMIT_INTERRUPT_SELECTOR, 0);
        memory.write_word(fcb + ETHER_FCB_STOP_AGENT, 0);
        memory.write_word(fcb + ETHER_FCB_RECEIVE_STOPPED, 1);
        memory.write_word(fcb + ETHER_FCB_TRANSMIT_STOPPED, 1);
        memory.write_word(fcb + ETHER_FCB_HEAR_SELF, 0);
        let address = self.driver.address();
        memory.write_word(fcb + ETHER_FCB_PROCESSOR_ID, (address >> 32) as u16);
        memory.write_word(fcb + ETHER_FCB_PROCESSOR_ID + 1, (address >> 16) as u16);
        memory.write_word(fcb + ETHER_FCB_PROCESSOR_ID + 2, address as u16);
        memory.write_word(fcb + ETHER_FCB_PACKETS_MISSED, 0);
        memory.write_word(fcb + ETHER_FCB_AGENT_BLOCK_SIZE, 0);
    }

    fn call(&self, memory: &Memory) {
        let fcb = self.fcb_address;
        if memory.read_word(fcb + ETHER_FCB_STOP_AGENT) != 0 {
            memory.write_word(fcb + ETHER_FCB_RECEIVE_STOPPED, 1);
            memory.write_word(fcb + ETHER_FCB_TRANSMIT_STOPPED, 1);
            self.receive_enabled.store(false, Ordering::Relaxed);
            return;
        }
        memory.write_word(fcb + ETHER_FCB_RECEIVE_STOPPED, 0);
        memory.write_word(fcb + ETHER_FCB_TRANSMIT_STOPPED, 0);
        self.receive_enabled.store(true, Ordering::Relaxed);
        self.transmit_chain(memory);
    }

    fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

impl Drop for NetworkAgent {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn receive_worker(
    fcb_address: u32,
    driver: Arc<dyn Driver>,
    memory: Arc<Memory>,
    interrupts: Arc<Interrupts>,
    stop: Arc<AtomicBool>,
    receive_enabled: Arc<AtomicBool>,
) {
    info!("network receive worker START");
    let mut buffer = [0u8; crate::driver::MAX_FRAME_SIZE];
    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        match driver.select(1000) {
            Ok(false) => continue,
            Ok(true) => {}
            Err(err) => {
                warn!("select failed  {}", err);
                continue;
            }
        }
        let size = match driver.receive(&mut buffer) {
            Ok(size) => size,
            Err(err) => {
                warn!("receive failed  {}", err);
                continue;
            }
        };
        if !receive_enabled.load(Ordering::Relaxed) {
            continue;
        }

        // Hand the frame to the first posted receive IOCB.
        let fcb = fcb_address;
        let iocb = memory.read_dbl(fcb + ETHER_FCB_RECEIVE_IOCB);
        if iocb == 0 {
            let missed = memory.read_word(fcb + ETHER_FCB_PACKETS_MISSED);
            memory.write_word(fcb + ETHER_FCB_PACKETS_MISSED, missed.wrapping_add(1));
            continue;
        }
        let buffer_address = memory.read_dbl(iocb + ETHER_IOCB_BUFFER_ADDRESS);
        let capacity = memory.read_word(iocb + ETHER_IOCB_BUFFER_LENGTH) as usize;
        let size = size.min(capacity);
        let mut words = vec![0u16; (size + 1) / 2];
        for (i, word) in words.iter_mut().enumerate() {
            let high = buffer[i * 2] as u16;
            let low = if i * 2 + 1 < size { buffer[i * 2 + 1] as u16 } else { 0 };
            *word = (high << 8) | low;
        }
        memory.copy_to_guest(buffer_address, &words);
        memory.write_word(iocb + ETHER_IOCB_ACTUAL_LENGTH, size as u16);
        memory.write_word(iocb + ETHER_IOCB_DEQUEUED_PACKET_TYPE, ETHER_STATUS_COMPLETED_OK);
        // Unlink the serviced IOCB.
        let next = memory.read_dbl(iocb + ETHER_IOCB_NEXT_IOCB);
        memory.write_dbl(fcb + ETHER_FCB_RECEIVE_IOCB, next);

        let selector = memory.read_word(fcb + ETHER_FCB_RECEIVE_INTERRUPT_SELECTOR);
        if selector != 0 {
            interrupts.notify_interrupt(selector);
        }
    }
    info!("network receive worker STOP");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Memory;
    use std::io::Write;
    use std::time::Instant;

    fn machine_parts() -> (Arc<Memory>, Arc<Interrupts>) {
        (Arc::new(Memory::new(20, 20, 0x80)), Arc::new(Interrupts::new()))
    }

    fn image(pages: u32) -> (tempfile::NamedTempFile, Arc<DiskFile>) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        // content: page p word w = p * 0x100 + w & 0xff
        let mut bytes = Vec::new();
        for p in 0..pages {
            for w in 0..PAGE_SIZE {
                let word = ((p as u16) << 8) | (w as u16 & 0xff);
                bytes.extend_from_slice(&word.to_ne_bytes());
            }
        }
        file.write_all(&bytes).unwrap();
        file.flush().unwrap();
        let disk = Arc::new(DiskFile::attach(file.path().to_str().unwrap()).unwrap());
        (file, disk)
    }

    fn wait_for<F: Fn() -> bool>(predicate: F) {
        let start = Instant::now();
        while !predicate() {
            if Duration::from_secs(5) < start.elapsed() {
                panic!("timed out");
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    // One IOCB at `iocb`, addressed by plain block number via CHS 0/0/block.
    fn post_iocb(memory: &Memory, fcb: u32, iocb: u32, command: u16, block: u16, pages: u16, data: u32) {
        memory.write_word(iocb + DISK_IOCB_DEVICE_INDEX, 0);
        memory.write_word(iocb + DISK_IOCB_DISK_ADDRESS, 0);
        memory.write_word(iocb + DISK_IOCB_DISK_ADDRESS + 1, 0);
        memory.write_word(iocb + DISK_IOCB_DISK_ADDRESS + 2, block);
        memory.write_dbl(iocb + DISK_IOCB_DATA_PTR, data);
        memory.write_word(iocb + DISK_IOCB_COMMAND, command);
        memory.write_word(iocb + DISK_IOCB_PAGE_COUNT, pages);
        memory.write_word(iocb + DISK_IOCB_STATUS, STATUS_IN_PROGRESS);
        memory.write_dbl(iocb + DISK_IOCB_NEXT_IOCB, 0);
        memory.write_dbl(fcb + DISK_FCB_NEXT_IOCB, iocb);
    }

    #[test]
    fn disk_read_writes_memory_and_interrupts() {
        let (memory, interrupts) = machine_parts();
        let (_file, disk) = image(32);
        let fcb = 0x8000u32;
        let agent = DiskAgent::new(DiskKind::Disk, fcb, vec![disk], Arc::clone(&memory), Arc::clone(&interrupts));
        agent.initialize(&memory);
        memory.write_word(fcb + DISK_FCB_INTERRUPT_SELECTOR, 0x0010);

        let iocb = 0x9000u32;
        let data = 0x0001_0000u32;
        post_iocb(&memory, fcb, iocb, DISK_COMMAND_READ, 5, 3, data);
        agent.call(&memory);

        wait_for(|| memory.read_word(iocb + DISK_IOCB_STATUS) == STATUS_GOOD_COMPLETION);
        assert_eq!(memory.read_word(iocb + DISK_IOCB_PAGE_COUNT), 0);
        // memory now holds image pages 5..8
        for p in 0..3u32 {
            for w in (0..PAGE_SIZE).step_by(97) {
                let expect = (((5 + p) as u16) << 8) | (w as u16 & 0xff);
                assert_eq!(memory.read_word(data + p * PAGE_SIZE + w), expect);
            }
        }
        wait_for(|| interrupts.wp() & 0x0010 != 0);
    }

    #[test]
    fn disk_write_and_verify() {
        let (memory, interrupts) = machine_parts();
        let (_file, disk) = image(16);
        let fcb = 0x8000u32;
        let agent = DiskAgent::new(
            DiskKind::Disk,
            fcb,
            vec![Arc::clone(&disk)],
            Arc::clone(&memory),
            Arc::clone(&interrupts),
        );
        agent.initialize(&memory);

        let iocb = 0x9000u32;
        let data = 0x0001_0000u32;
        let pattern: Vec<u16> = (0..PAGE_SIZE as u16).map(|w| w ^ 0x5a5a).collect();
        memory.copy_to_guest(data, &pattern);

        post_iocb(&memory, fcb, iocb, DISK_COMMAND_WRITE, 2, 1, data);
        agent.call(&memory);
        wait_for(|| memory.read_word(iocb + DISK_IOCB_STATUS) == STATUS_GOOD_COMPLETION);
        let mut back = vec![0u16; PAGE_SIZE as usize];
        disk.read_page(2, &mut back);
        assert_eq!(back, pattern);

        // verify agrees
        post_iocb(&memory, fcb, iocb, DISK_COMMAND_VERIFY, 2, 1, data);
        agent.call(&memory);
        wait_for(|| memory.read_word(iocb + DISK_IOCB_STATUS) == STATUS_GOOD_COMPLETION);

        // perturb one word; verify reports the error
        memory.write_word(data + 100, 0x1234);
        post_iocb(&memory, fcb, iocb, DISK_COMMAND_VERIFY, 2, 1, data);
        agent.call(&memory);
        wait_for(|| memory.read_word(iocb + DISK_IOCB_STATUS) == STATUS_DATA_VERIFY_ERROR);
    }

    #[test]
    fn iocb_chain_is_serviced_in_order() {
        let (memory, interrupts) = machine_parts();
        let (_file, disk) = image(16);
        let fcb = 0x8000u32;
        let agent = DiskAgent::new(DiskKind::Disk, fcb, vec![disk], Arc::clone(&memory), interrupts);
        agent.initialize(&memory);

        // two IOCBs chained: read block 1 and block 2
        let first = 0x9000u32;
        let second = 0x9100u32;
        post_iocb(&memory, fcb, second, DISK_COMMAND_READ, 2, 1, 0x0001_1000);
        post_iocb(&memory, fcb, first, DISK_COMMAND_READ, 1, 1, 0x0001_0000);
        memory.write_dbl(first + DISK_IOCB_NEXT_IOCB, second);
        memory.write_dbl(fcb + DISK_FCB_NEXT_IOCB, first);
        agent.call(&memory);

        wait_for(|| memory.read_word(second + DISK_IOCB_STATUS) == STATUS_GOOD_COMPLETION);
        assert_eq!(memory.read_word(first + DISK_IOCB_STATUS), STATUS_GOOD_COMPLETION);
        assert_eq!(memory.read_word(0x0001_0000), 0x0100);
        assert_eq!(memory.read_word(0x0001_1000), 0x0200);
    }

    #[test]
    fn stopped_agent_drains_nothing() {
        let (memory, interrupts) = machine_parts();
        let (_file, disk) = image(16);
        let fcb = 0x8000u32;
        let agent = DiskAgent::new(DiskKind::Disk, fcb, vec![disk], Arc::clone(&memory), interrupts);
        agent.initialize(&memory);

        let iocb = 0x9000u32;
        post_iocb(&memory, fcb, iocb, DISK_COMMAND_READ, 1, 1, 0x0001_0000);
        memory.write_word(fcb + DISK_FCB_STOP_AGENT, 1);
        agent.call(&memory);
        assert_eq!(memory.read_word(fcb + DISK_FCB_AGENT_STOPPED), 1);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(memory.read_word(iocb + DISK_IOCB_STATUS), STATUS_IN_PROGRESS);
    }

    #[test]
    fn keyboard_bits_are_active_low() {
        let (memory, _interrupts) = machine_parts();
        let agent = KeyboardAgent::new(0x8100);
        agent.initialize(&memory);
        assert_eq!(memory.read_word(0x8100), 0xffff);
        agent.key_press(&memory, 1);
        assert_eq!(memory.read_word(0x8100), 0xffff & !0x4000);
        agent.key_release(&memory, 1);
        assert_eq!(memory.read_word(0x8100), 0xffff);
    }

    #[test]
    fn network_transmit_reaches_driver() {
        use crate::driver::DummyDriver;
        let (memory, interrupts) = machine_parts();
        let driver = Arc::new(DummyDriver::new(0x11_2233_4455));
        let fcb = 0x8200u32;
        let agent = NetworkAgent::new(fcb, driver.clone(), Arc::clone(&memory), interrupts);
        agent.initialize(&memory);

        let iocb = 0x9200u32;
        let data = 0x0001_0000u32;
        memory.copy_to_guest(data, &[0xAABB, 0xCCDD, 0xEE00]);
        memory.write_dbl(iocb + ETHER_IOCB_BUFFER_ADDRESS, data);
        memory.write_word(iocb + ETHER_IOCB_BUFFER_LENGTH, 5);
        memory.write_dbl(iocb + ETHER_IOCB_NEXT_IOCB, 0);
        memory.write_dbl(fcb + ETHER_FCB_TRANSMIT_IOCB, iocb);

        agent.call(&memory);
        let frames = driver.take_transmitted();
        assert_eq!(frames, vec![vec![0xAA, 0xBB, 0xCC, 0xDD, 0xEE]]);
        assert_eq!(memory.read_word(iocb + ETHER_IOCB_DEQUEUED_PACKET_TYPE), ETHER_STATUS_COMPLETED_OK);
    }
}
