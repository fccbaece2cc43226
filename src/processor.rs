// The Mesa processor: register file, evaluation stack, XFER, trap delivery,
// the process scheduler and the fetch/dispatch loop. Opcode bodies live in
// the instructions module; this file owns everything they manipulate.
//
// Faults unwind out of dispatch as `Fault` values and are handled only at the
// loop boundary, where (savedPC, savedSP) is restored before the trap XFER.

use crate::memory::{Map, Memory, PageCache};
use crate::opcode::OpcodeTable;
use crate::pilot::*;
use crate::trace::{LinkKind, TraceBuffer, XferEvent, XferKind};
use crate::trap::{Fault, Run, Trap};
use log::{error, info};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

// Process timeout tick.
const TICK: Duration = Duration::from_millis(40);
const IDLE_WAIT: Duration = Duration::from_millis(10);

// Wakeup-pending register shared with agent workers and the network server.
// notify_interrupt is the only cross-thread entry into the processor: the OR
// into WP is a release, the processor's take is an acquire, which orders the
// completion writes of §5 before the interrupt becomes visible.
pub struct Interrupts {
    wp: AtomicU16,
    lock: Mutex<bool>,
    cond: Condvar,
}

impl Interrupts {
    pub fn new() -> Interrupts {
        Interrupts { wp: AtomicU16::new(0), lock: Mutex::new(false), cond: Condvar::new() }
    }

    pub fn notify_interrupt(&self, selector: u16) {
        self.wp.fetch_or(selector, Ordering::AcqRel);
        let mut wakeup = self.lock.lock().unwrap();
        *wakeup = true;
        self.cond.notify_all();
    }

    pub fn wp(&self) -> u16 {
        self.wp.load(Ordering::Acquire)
    }
    pub fn set_wp(&self, value: u16) {
        self.wp.store(value, Ordering::Release);
    }
    pub fn take_wp(&self) -> u16 {
        self.wp.swap(0, Ordering::AcqRel)
    }
    pub fn pending(&self) -> bool {
        self.wp() != 0
    }

    // Bounded wait for a wakeup; spurious returns are fine.
    pub fn wait(&self, timeout: Duration) {
        let mut wakeup = self.lock.lock().unwrap();
        if !*wakeup {
            let (guard, _) = self.cond.wait_timeout(wakeup, timeout).unwrap();
            wakeup = guard;
        }
        *wakeup = false;
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PsbLink {
    pub priority: u16,
    pub next: u16,
    pub failed: bool,
    pub permanent: bool,
    pub preempted: bool,
}

impl PsbLink {
    fn pack(self) -> u16 {
        (self.priority << 13)
            | ((self.next & 0x3ff) << 3)
            | ((self.failed as u16) << 2)
            | ((self.permanent as u16) << 1)
            | self.preempted as u16
    }
    fn unpack(word: u16) -> PsbLink {
        PsbLink {
            priority: word >> 13,
            next: (word >> 3) & 0x3ff,
            failed: word & 4 != 0,
            permanent: word & 2 != 0,
            preempted: word & 1 != 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PsbFlags {
    pub cleanup: u16,
    pub waiting: bool,
    pub abort: bool,
}

impl PsbFlags {
    fn pack(self) -> u16 {
        ((self.cleanup & 0x3ff) << 3) | ((self.waiting as u16) << 1) | self.abort as u16
    }
    fn unpack(word: u16) -> PsbFlags {
        PsbFlags { cleanup: (word >> 3) & 0x3ff, waiting: word & 2 != 0, abort: word & 1 != 0 }
    }
}

// Condition word: a queue tail plus the wakeup-waiting bit.
fn cond_tail(word: u16) -> u16 {
    (word >> 3) & 0x3ff
}
fn cond_with_tail(word: u16, tail: u16) -> u16 {
    (word & !0x1ff8) | ((tail & 0x3ff) << 3)
}
const COND_WAKEUP: u16 = 1;

pub type Observer<T> = Box<dyn Fn(T) + Send>;

pub struct Processor {
    pub memory: Arc<Memory>,
    pub cache: PageCache,
    pub opcodes: OpcodeTable,
    pub trace: TraceBuffer,
    pub interrupts: Arc<Interrupts>,

    // 3.3.2 evaluation stack
    pub stack: [u16; STACK_DEPTH],
    pub sp: usize,

    // 3.3.1 control registers
    pub psb: u16,
    pub mds: u32,
    pub lf: u16,
    pub gf: u32,
    pub cb: u32,
    pub gfi: u16,
    pub pc: u16,

    // 4.5 instruction execution
    pub saved_pc: u16,
    pub saved_sp: usize,
    pub break_byte: u8,
    pub running: bool,

    // 3.3.3 data and status registers
    pub pid: [u16; 4],
    pub wdc: u16,
    pub ptc: u16,
    pub xts: u16,
    mp: u16,
    it: u32,
    mp_observers: Vec<Observer<u16>>,
    it_observers: Vec<Observer<u32>>,

    pub stop: Arc<AtomicBool>,
    started: Instant,
    last_tick: Instant,

    // Agent call hooks, indexed by agent number; installed at machine build.
    agent_calls: Vec<Option<Box<dyn FnMut(&Memory) + Send>>>,
}

impl Processor {
    pub fn new(memory: Arc<Memory>, interrupts: Arc<Interrupts>, stop: Arc<AtomicBool>) -> Processor {
        let mut processor = Processor {
            memory,
            cache: PageCache::new(),
            opcodes: OpcodeTable::new(),
            trace: TraceBuffer::new(),
            interrupts,
            stack: [0; STACK_DEPTH],
            sp: 0,
            psb: 0,
            mds: 0,
            lf: 0,
            gf: 0,
            cb: 0,
            gfi: 0,
            pc: 0,
            saved_pc: 0,
            saved_sp: 0,
            break_byte: 0,
            running: false,
            pid: [0; 4],
            wdc: 1,
            ptc: 0,
            xts: 0,
            mp: 0,
            it: 0,
            mp_observers: Vec::new(),
            it_observers: Vec::new(),
            stop,
            started: Instant::now(),
            last_tick: Instant::now(),
            agent_calls: Vec::new(),
        };
        crate::instructions::initialize(&mut processor.opcodes);
        processor
    }

    // Guest reboot: registers reset, memory and opcode tables survive.
    pub fn reset(&mut self) {
        self.stack = [0; STACK_DEPTH];
        self.sp = 0;
        self.psb = 0;
        self.mds = 0;
        self.lf = 0;
        self.gf = 0;
        self.cb = 0;
        self.gfi = 0;
        self.pc = 0;
        self.saved_pc = 0;
        self.saved_sp = 0;
        self.break_byte = 0;
        self.running = false;
        self.wdc = 1;
        self.ptc = 0;
        self.xts = 0;
        self.interrupts.set_wp(0);
        self.cache.clear();
    }

    //
    // memory access through the translation cache
    //
    pub fn fetch(&mut self, va: u32) -> Run<u16> {
        self.cache.fetch(&self.memory, va)
    }
    pub fn store(&mut self, va: u32, value: u16) -> Run<()> {
        self.cache.store(&self.memory, va, value)
    }
    pub fn read_dbl(&mut self, va: u32) -> Run<u32> {
        let low = self.fetch(va)? as u32;
        let high = self.fetch(va + 1)? as u32;
        Ok((high << 16) | low)
    }
    pub fn write_dbl(&mut self, va: u32, value: u32) -> Run<()> {
        self.store(va, value as u16)?;
        self.store(va + 1, (value >> 16) as u16)
    }

    pub fn mds_va(&self, ptr: u16) -> u32 {
        self.mds + ptr as u32
    }
    pub fn read_mds(&mut self, ptr: u16) -> Run<u16> {
        let va = self.mds_va(ptr);
        self.fetch(va)
    }
    pub fn write_mds(&mut self, ptr: u16, value: u16) -> Run<()> {
        let va = self.mds_va(ptr);
        self.store(va, value)
    }
    pub fn read_dbl_mds(&mut self, ptr: u16) -> Run<u32> {
        let va = self.mds_va(ptr);
        self.read_dbl(va)
    }
    pub fn write_dbl_mds(&mut self, ptr: u16, value: u32) -> Run<()> {
        let va = self.mds_va(ptr);
        self.write_dbl(va, value)
    }

    pub fn local(&self, offset: i32) -> u16 {
        (self.lf as i32 + offset) as u16
    }

    // The map write path every map-altering opcode and command uses: the
    // cache entry must die with the old mapping.
    pub fn write_map_entry(&mut self, vp: u32, map: Map) {
        self.memory.write_map(vp, map);
        self.cache.invalidate(vp);
    }

    //
    // code stream
    //
    pub fn get_code_byte(&mut self) -> Run<u8> {
        let word = self.fetch(self.cb + (self.pc >> 1) as u32)?;
        let byte = if self.pc & 1 == 0 { (word >> 8) as u8 } else { word as u8 };
        self.pc = self.pc.wrapping_add(1);
        Ok(byte)
    }
    pub fn get_code_word(&mut self) -> Run<u16> {
        let high = self.get_code_byte()? as u16;
        let low = self.get_code_byte()? as u16;
        Ok((high << 8) | low)
    }

    //
    // evaluation stack
    //
    pub fn push(&mut self, value: u16) -> Run<()> {
        if self.sp == STACK_DEPTH {
            return Err(Trap::Stack.into());
        }
        self.stack[self.sp] = value;
        self.sp += 1;
        Ok(())
    }
    pub fn pop(&mut self) -> Run<u16> {
        if self.sp == 0 {
            return Err(Trap::Stack.into());
        }
        self.sp -= 1;
        Ok(self.stack[self.sp])
    }
    pub fn push_long(&mut self, value: u32) -> Run<()> {
        self.push(value as u16)?;
        self.push((value >> 16) as u16)
    }
    pub fn pop_long(&mut self) -> Run<u32> {
        let high = self.pop()? as u32;
        let low = self.pop()? as u32;
        Ok((high << 16) | low)
    }
    // Re-expose a popped word without writing it, for the recover idiom.
    pub fn recover(&mut self) -> Run<u16> {
        if self.sp == STACK_DEPTH {
            return Err(Trap::Stack.into());
        }
        let value = self.stack[self.sp];
        self.sp += 1;
        Ok(value)
    }
    pub fn discard(&mut self) -> Run<()> {
        self.pop().map(|_| ())
    }

    //
    // MP / IT
    //
    pub fn add_mp_observer(&mut self, observer: Observer<u16>) {
        self.mp_observers.push(observer);
    }
    pub fn add_it_observer(&mut self, observer: Observer<u32>) {
        self.it_observers.push(observer);
    }
    pub fn set_mp(&mut self, value: u16) {
        self.mp = value;
        for observer in &self.mp_observers {
            observer(value);
        }
    }
    pub fn mp(&self) -> u16 {
        self.mp
    }
    // IT is a free-running microsecond counter the guest may rebase.
    pub fn set_it(&mut self, value: u32) {
        self.it = value.wrapping_sub(self.started.elapsed().as_micros() as u32);
        for observer in &self.it_observers {
            observer(value);
        }
    }
    pub fn it(&self) -> u32 {
        self.it.wrapping_add(self.started.elapsed().as_micros() as u32)
    }

    //
    // agents
    //
    pub fn set_agent_call(&mut self, index: usize, call: Box<dyn FnMut(&Memory) + Send>) {
        if self.agent_calls.len() <= index {
            self.agent_calls.resize_with(index + 1, || None);
        }
        if self.agent_calls[index].is_some() {
            panic!("agent {} registered twice", index);
        }
        self.agent_calls[index] = Some(call);
    }

    pub fn call_agent(&mut self, index: u16) -> Run<()> {
        match self.agent_calls.get_mut(index as usize).and_then(|c| c.as_mut()) {
            Some(call) => {
                call(&self.memory);
                Ok(())
            }
            None => {
                error!("call_agent unknown agent  index = {}", index);
                Err(Trap::Hardware.into())
            }
        }
    }

    //
    // global frame table
    //
    pub fn set_gfi(&mut self, gfi: u16) -> Run<()> {
        let item = M_GFT + gfi as u32 * GFT_ITEM_SIZE;
        let codebase = self.read_dbl(item)?;
        if codebase & 1 != 0 {
            return Err(Trap::Code(gfi).into());
        }
        let globalframe = self.read_dbl(item + 2)?;
        self.gfi = gfi;
        self.cb = codebase;
        self.gf = globalframe;
        Ok(())
    }

    //
    // frame heap (allocation vector)
    //
    pub fn alloc_frame(&mut self, fsi: u16) -> Run<u16> {
        let mut fsi = fsi & 0xff;
        loop {
            let item = self.read_mds(M_AV + fsi)?;
            match item & 3 {
                LINK_FRAME => {
                    if item == 0 {
                        return Err(Fault::FrameFault(fsi));
                    }
                    let frame = item & !3;
                    let next = self.read_mds(frame)?;
                    self.write_mds(M_AV + fsi, next)?;
                    return Ok(frame);
                }
                1 => return Err(Fault::FrameFault(fsi)),
                2 => fsi = item >> 2,
                _ => return Err(Fault::FrameFault(fsi)),
            }
        }
    }

    pub fn free_frame(&mut self, frame: u16) -> Run<()> {
        let word = self.read_mds(frame.wrapping_add(LOCAL_WORD as u16))?;
        let fsi = word & 0xff;
        let head = self.read_mds(M_AV + fsi)?;
        self.write_mds(frame, head)?;
        self.write_mds(M_AV + fsi, frame)
    }

    //
    // XFER: Mesa's universal control transfer
    //
    pub fn xfer(&mut self, dst: u32, src: u16, kind: XferKind, free: bool) -> Run<()> {
        let old_lf = self.lf;
        let src_gfi = self.gfi;
        let src_pc = self.pc;
        let mut dst = dst;
        let mut link_kind = LinkKind::Frame;
        let mut push_return = false;

        loop {
            match (dst & 3) as u16 {
                LINK_INDIRECT => {
                    if kind == XferKind::Trap {
                        return Err(Trap::Xfer(dst).into());
                    }
                    link_kind = LinkKind::Indirect;
                    let pointer = (dst & !3) as u16;
                    dst = self.read_dbl_mds(pointer)?;
                    continue;
                }
                LINK_NEW_PROCEDURE => {
                    if link_kind != LinkKind::Indirect {
                        link_kind = LinkKind::NewProcedure;
                    }
                    let tagged_gfi = dst as u16;
                    let gfi = tagged_gfi & !3;
                    if gfi == 0 {
                        return Err(Trap::Unbound(dst).into());
                    }
                    let entry_pc = (dst >> 16) as u16;
                    if entry_pc == 0 {
                        return Err(Trap::Unbound(dst).into());
                    }
                    self.set_gfi(gfi)?;
                    // The word at the entry point carries the frame size
                    // index; execution starts just past it.
                    let entry = self.fetch(self.cb + (entry_pc >> 1) as u32)?;
                    let fsi = entry >> 8;
                    let nlf = self.alloc_frame(fsi)?;
                    self.write_mds(nlf.wrapping_add(LOCAL_WORD as u16), fsi)?;
                    self.write_mds(nlf.wrapping_add(LOCAL_GLOBAL as u16), gfi)?;
                    self.lf = nlf;
                    self.pc = entry_pc + 2;
                    push_return = true;
                }
                LINK_OLD_PROCEDURE => {
                    // Old-world global-frame descriptors never occur in the
                    // images this machine boots.
                    return Err(Trap::Unbound(dst).into());
                }
                _ => {
                    // frame link
                    if link_kind != LinkKind::Indirect {
                        link_kind = LinkKind::Frame;
                    }
                    let nlf = dst as u16;
                    if nlf == 0 {
                        return Err(Trap::Control(src).into());
                    }
                    let ngfi = self.read_mds(nlf.wrapping_add(LOCAL_GLOBAL as u16))?;
                    self.set_gfi(ngfi)?;
                    let npc = self.read_mds(nlf.wrapping_add(LOCAL_PC as u16))?;
                    if npc == 0 {
                        return Err(Trap::Unbound(dst).into());
                    }
                    self.lf = nlf;
                    self.pc = npc;
                }
            }
            break;
        }

        if push_return {
            self.write_mds(self.lf.wrapping_add(LOCAL_RETURN as u16), src)?;
        }
        if free {
            self.free_frame(old_lf)?;
        }

        let event = XferEvent {
            kind,
            link: link_kind,
            psb: self.psb,
            src_gfi,
            src_pc,
            dst_gfi: self.gfi,
            dst_pc: self.pc,
            mds: self.mds,
            lf: self.lf,
        };
        self.trace.record(event);

        // An armed xfer-trap status fires after any non-trap transfer.
        if self.xts & 1 != 0 && kind != XferKind::Trap {
            self.xts >>= 1;
            return Err(Trap::Xfer(dst).into());
        }
        Ok(())
    }

    //
    // process queues (PDA resident)
    //
    fn psb_handle(&self, psb: u16) -> u32 {
        M_PDA + psb as u32 * PSB_SIZE
    }
    pub fn read_link(&mut self, psb: u16) -> Run<PsbLink> {
        let handle = self.psb_handle(psb);
        Ok(PsbLink::unpack(self.fetch(handle + PSB_LINK)?))
    }
    pub fn write_link(&mut self, psb: u16, link: PsbLink) -> Run<()> {
        let handle = self.psb_handle(psb);
        self.store(handle + PSB_LINK, link.pack())
    }
    pub fn read_flags(&mut self, psb: u16) -> Run<PsbFlags> {
        let handle = self.psb_handle(psb);
        Ok(PsbFlags::unpack(self.fetch(handle + PSB_FLAGS)?))
    }
    pub fn write_flags(&mut self, psb: u16, flags: PsbFlags) -> Run<()> {
        let handle = self.psb_handle(psb);
        self.store(handle + PSB_FLAGS, flags.pack())
    }

    fn read_queue(&mut self, addr: u32) -> Run<u16> {
        Ok(cond_tail(self.fetch(addr)?))
    }
    fn write_queue(&mut self, addr: u32, tail: u16) -> Run<()> {
        let word = self.fetch(addr)?;
        self.store(addr, cond_with_tail(word, tail))
    }

    // Insert by priority into the circular list whose header holds the tail.
    pub fn enqueue(&mut self, addr: u32, psb: u16) -> Run<()> {
        let tail = self.read_queue(addr)?;
        let mut link = self.read_link(psb)?;
        if tail == 0 {
            link.next = psb;
            self.write_link(psb, link)?;
            return self.write_queue(addr, psb);
        }
        let priority = link.priority;
        let head = self.read_link(tail)?.next;
        let mut prev = tail;
        let mut cur = head;
        let mut at_end = false;
        loop {
            let cur_link = self.read_link(cur)?;
            if cur_link.priority < priority {
                break;
            }
            prev = cur;
            cur = cur_link.next;
            if prev == tail {
                at_end = true;
                break;
            }
        }
        link.next = cur;
        self.write_link(psb, link)?;
        let mut prev_link = self.read_link(prev)?;
        prev_link.next = psb;
        self.write_link(prev, prev_link)?;
        if at_end {
            self.write_queue(addr, psb)?;
        }
        Ok(())
    }

    // Remove the head of the queue, if any.
    pub fn dequeue(&mut self, addr: u32) -> Run<u16> {
        let tail = self.read_queue(addr)?;
        if tail == 0 {
            return Ok(0);
        }
        let mut tail_link = self.read_link(tail)?;
        let head = tail_link.next;
        if head == tail {
            self.write_queue(addr, 0)?;
        } else {
            let head_link = self.read_link(head)?;
            tail_link.next = head_link.next;
            self.write_link(tail, tail_link)?;
        }
        Ok(head)
    }

    // Remove a specific process from a circular queue.
    pub fn unlink(&mut self, addr: u32, psb: u16) -> Run<()> {
        let tail = self.read_queue(addr)?;
        if tail == 0 {
            return Err(Trap::Process.into());
        }
        let mut prev = tail;
        loop {
            let prev_link = self.read_link(prev)?;
            if prev_link.next == psb {
                break;
            }
            prev = prev_link.next;
            if prev == tail {
                return Err(Trap::Process.into());
            }
        }
        let link = self.read_link(psb)?;
        if prev == psb {
            // only element
            self.write_queue(addr, 0)?;
        } else {
            let mut prev_link = self.read_link(prev)?;
            prev_link.next = link.next;
            self.write_link(prev, prev_link)?;
            if tail == psb {
                self.write_queue(addr, prev)?;
            }
        }
        Ok(())
    }

    // Make the head waiter of a condition runnable, or latch the wakeup.
    pub fn notify_wakeup(&mut self, cond_addr: u32) -> Run<bool> {
        let word = self.fetch(cond_addr)?;
        let tail = cond_tail(word);
        if tail == 0 {
            self.store(cond_addr, word | COND_WAKEUP)?;
            return Ok(false);
        }
        let psb = self.dequeue(cond_addr)?;
        let mut flags = self.read_flags(psb)?;
        flags.waiting = false;
        self.write_flags(psb, flags)?;
        let handle = self.psb_handle(psb);
        self.store(handle + PSB_TIMEOUT, 0)?;
        self.enqueue(M_PDA + PDA_READY, psb)?;
        Ok(true)
    }

    // Move the current process onto a condition queue with a timeout.
    pub fn wait_on_condition(&mut self, cond_ptr: u16, timeout: u16) -> Run<()> {
        let cond_addr = self.mds_va(cond_ptr);
        let word = self.fetch(cond_addr)?;
        if word & COND_WAKEUP != 0 {
            // Wakeup already latched: consume it and keep running.
            self.store(cond_addr, word & !COND_WAKEUP)?;
            return Ok(());
        }
        let psb = self.psb;
        let handle = self.psb_handle(psb);
        let mut flags = self.read_flags(psb)?;
        flags.waiting = true;
        self.write_flags(psb, flags)?;
        self.store(handle + PSB_TIMEOUT, timeout)?;
        // Remember the queue for timeout rescue.
        self.store(handle + PSB_DATA, cond_ptr)?;
        self.save_process()?;
        self.unlink(M_PDA + PDA_READY, psb)?;
        self.enqueue(cond_addr, psb)?;
        self.psb = 0;
        Err(Fault::RequestReschedule)
    }

    //
    // process switching
    //
    fn state_vector(&mut self, priority: u16) -> Run<u32> {
        let pointer = self.fetch(M_PDA + PDA_STATE + priority as u32)?;
        if pointer == 0 {
            return Err(Trap::Process.into());
        }
        Ok(M_PDA + pointer as u32)
    }

    fn save_process(&mut self) -> Run<()> {
        let psb = self.psb;
        let handle = self.psb_handle(psb);
        let pc = self.pc;
        let lf = self.lf;
        self.write_mds(lf.wrapping_add(LOCAL_PC as u16), pc)?;
        if self.sp == 0 {
            self.store(handle + PSB_CONTEXT, lf)?;
            let mut link = self.read_link(psb)?;
            link.preempted = false;
            self.write_link(psb, link)?;
        } else {
            // A nonempty stack rides out the switch in a state vector.
            let mut link = self.read_link(psb)?;
            let sv = self.state_vector(link.priority)?;
            for i in 0..STACK_DEPTH {
                let word = self.stack[i];
                self.store(sv + i as u32, word)?;
            }
            self.store(sv + STACK_DEPTH as u32, self.sp as u16)?;
            self.store(sv + STACK_DEPTH as u32 + 1, lf)?;
            self.store(handle + PSB_CONTEXT, sv as u16)?;
            link.preempted = true;
            self.write_link(psb, link)?;
            self.sp = 0;
        }
        Ok(())
    }

    fn load_process(&mut self, psb: u16) -> Run<()> {
        let src_gfi = self.gfi;
        let src_pc = self.pc;
        let handle = self.psb_handle(psb);
        let mds_page = self.fetch(handle + PSB_MDS)?;
        self.mds = (mds_page as u32) << 16;
        let link = self.read_link(psb)?;
        let context = self.fetch(handle + PSB_CONTEXT)?;
        let lf = if link.preempted {
            let sv = M_PDA + context as u32;
            for i in 0..STACK_DEPTH {
                self.stack[i] = self.fetch(sv + i as u32)?;
            }
            self.sp = self.fetch(sv + STACK_DEPTH as u32)? as usize;
            let lf = self.fetch(sv + STACK_DEPTH as u32 + 1)?;
            let mut link = link;
            link.preempted = false;
            self.write_link(psb, link)?;
            lf
        } else {
            self.sp = 0;
            context
        };
        let gfi = self.read_mds(lf.wrapping_add(LOCAL_GLOBAL as u16))?;
        self.set_gfi(gfi)?;
        self.pc = self.read_mds(lf.wrapping_add(LOCAL_PC as u16))?;
        self.lf = lf;
        let old_psb = self.psb;
        self.psb = psb;
        self.trace.record(XferEvent {
            kind: XferKind::ProcessSwitch,
            link: LinkKind::Frame,
            psb: old_psb,
            src_gfi,
            src_pc,
            dst_gfi: self.gfi,
            dst_pc: self.pc,
            mds: self.mds,
            lf: self.lf,
        });
        Ok(())
    }

    // Run the highest-priority ready process; idle when there is none.
    pub fn reschedule(&mut self) -> Run<()> {
        let tail = self.read_queue(M_PDA + PDA_READY)?;
        if tail == 0 {
            self.running = false;
            return Ok(());
        }
        let head = self.read_link(tail)?.next;
        if head == self.psb {
            self.running = true;
            return Ok(());
        }
        if self.psb != 0 {
            self.save_process()?;
        }
        self.load_process(head)?;
        self.running = true;
        Ok(())
    }

    //
    // interrupts and timeouts
    //
    pub fn service_interrupts(&mut self) -> Run<bool> {
        let pending = self.interrupts.take_wp();
        if pending == 0 {
            return Ok(false);
        }
        let mut requeued = false;
        for level in 0..16u32 {
            if pending & (1 << level) != 0 {
                let cond_addr = M_PDA + PDA_INTERRUPT + level * 2;
                requeued |= self.notify_wakeup(cond_addr)?;
            }
        }
        Ok(requeued)
    }

    pub fn check_timeouts(&mut self) -> Run<bool> {
        self.ptc = self.ptc.wrapping_add(1);
        if self.ptc == 0 {
            self.ptc = 1;
        }
        let count = self.fetch(M_PDA + PDA_COUNT)?;
        let mut requeued = false;
        for i in 0..count {
            let psb = START_PSB + i;
            let handle = self.psb_handle(psb);
            let timeout = self.fetch(handle + PSB_TIMEOUT)?;
            if timeout != 0 && timeout == self.ptc {
                let flags = self.read_flags(psb)?;
                if flags.waiting {
                    let cond_ptr = self.fetch(handle + PSB_DATA)?;
                    let cond_addr = self.mds_va(cond_ptr);
                    self.unlink(cond_addr, psb)?;
                    let mut flags = flags;
                    flags.waiting = false;
                    self.write_flags(psb, flags)?;
                    let mut link = self.read_link(psb)?;
                    link.failed = true;
                    self.write_link(psb, link)?;
                    self.store(handle + PSB_TIMEOUT, 0)?;
                    self.enqueue(M_PDA + PDA_READY, psb)?;
                    requeued = true;
                }
            }
        }
        Ok(requeued)
    }

    //
    // trap delivery
    //
    fn trap_link(&mut self, trap: Trap) -> Run<u32> {
        match trap {
            Trap::EscOpcode(code) => self.read_dbl_mds(M_ETT + code as u16 * 2),
            _ => self.read_dbl_mds(M_SD + trap.sd_index() * 2),
        }
    }

    pub fn deliver_trap(&mut self, trap: Trap) -> Run<()> {
        let link = self.trap_link(trap)?;
        self.xfer(link, self.lf, XferKind::Trap, false)?;
        // Trap parameters land in local 0 of the handler frame.
        match trap {
            Trap::Opcode(code) => self.write_mds(self.lf, code as u16)?,
            Trap::EscOpcode(code) => self.write_mds(self.lf, code as u16)?,
            Trap::Control(src) => self.write_mds(self.lf, src)?,
            Trap::Code(gfi) => self.write_mds(self.lf, gfi)?,
            Trap::Unbound(dst) | Trap::Xfer(dst) => self.write_dbl_mds(self.lf, dst)?,
            _ => {}
        }
        Ok(())
    }

    // A faulting process parks on the PDA fault queue until the fault
    // handler process services it.
    fn deliver_fault(&mut self, queue_index: u16, parameter: u32) -> Run<()> {
        if self.psb == 0 {
            panic!("fault without a current process  queue = {}  parameter = {:08X}", queue_index, parameter);
        }
        let psb = self.psb;
        let handle = self.psb_handle(psb);
        self.save_process()?;
        self.store(handle + PSB_DATA, parameter as u16)?;
        self.store(handle + PSB_DATA + 1, (parameter >> 16) as u16)?;
        self.unlink(M_PDA + PDA_READY, psb)?;
        let fault = M_PDA + PDA_FAULT + queue_index as u32 * 2;
        self.enqueue(fault, psb)?;
        self.notify_wakeup(fault + 1)?;
        self.psb = 0;
        self.reschedule()
    }

    // The loop boundary. Traps and faults restore the saved state before
    // delivery; a reschedule request is the completed instruction yielding,
    // so nothing is restored.
    pub fn handle_fault(&mut self, fault: Fault) {
        let result = match fault {
            Fault::RequestReschedule => self.service_interrupts().and_then(|_| self.reschedule()),
            _ => {
                self.pc = self.saved_pc;
                self.sp = self.saved_sp;
                match fault {
                    Fault::Trap(trap) => self.deliver_trap(trap),
                    Fault::PageFault(va) => self.deliver_fault(Q_PAGE_FAULT, va),
                    Fault::WriteProtectFault(va) => self.deliver_fault(Q_WRITE_PROTECT_FAULT, va),
                    Fault::FrameFault(fsi) => self.deliver_fault(Q_FRAME_FAULT, fsi as u32),
                    Fault::RequestReschedule => unreachable!(),
                }
            }
        };
        if let Err(inner) = result {
            // A fault while delivering a fault has no recovery.
            panic!("double fault  outer = {}  inner = {}", fault, inner);
        }
    }

    //
    // the fetch / dispatch loop
    //
    pub fn step(&mut self) -> Run<()> {
        self.saved_pc = self.pc;
        self.saved_sp = self.sp;
        let code = self.get_code_byte()?;
        self.dispatch_mop(code)
    }

    fn tick(&mut self) {
        if TICK <= self.last_tick.elapsed() {
            self.last_tick = Instant::now();
            match self.check_timeouts() {
                Ok(true) => {
                    if let Err(fault) = self.reschedule() {
                        self.handle_fault(fault);
                    }
                }
                Ok(false) => {}
                Err(fault) => self.handle_fault(fault),
            }
        }
    }

    pub fn run(&mut self) {
        info!("processor START");
        self.running = true;
        let mut instruction_count: u64 = 0;
        while !self.stop.load(Ordering::Relaxed) {
            self.tick();
            if self.wdc == 0 && self.interrupts.pending() {
                match self.service_interrupts().and_then(|requeued| {
                    if requeued {
                        self.reschedule()
                    } else {
                        Ok(())
                    }
                }) {
                    Ok(()) => {}
                    Err(fault) => self.handle_fault(fault),
                }
            }
            if !self.running {
                self.interrupts.wait(IDLE_WAIT);
                continue;
            }
            match self.step() {
                Ok(()) => instruction_count += 1,
                Err(fault) => self.handle_fault(fault),
            }
        }
        info!("instruction count = {}", instruction_count);
        info!("{}", self.cache.stats());
        info!("processor STOP");
    }
}

impl fmt::Display for Processor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "PSB {:04X}  MDS {:08X}  LF {:04X}  GF {:08X}", self.psb, self.mds, self.lf, self.gf)?;
        writeln!(f, "CB  {:08X}  GFI {:04X}  PC {:04X}", self.cb, self.gfi, self.pc)?;
        writeln!(
            f,
            "WP {:04X}  WDC {:04X}  PTC {:04X}  XTS {:04X}  MP {:04}",
            self.interrupts.wp(),
            self.wdc,
            self.ptc,
            self.xts,
            self.mp
        )?;
        write!(f, "SP {:2}  stack", self.sp)?;
        for i in 0..self.sp {
            write!(f, " {:04X}", self.stack[i])?;
        }
        Ok(())
    }
}
