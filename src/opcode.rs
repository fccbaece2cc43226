// The two Mesa opcode spaces: MOP (the primary 256 bytecodes) and ESC (the
// secondary space reached through the ESC/ESCL bytecodes). Each slot holds an
// operation and a name; unregistered slots hold a trap operation that raises
// OpcodeTrap/EscOpcodeTrap with the offending byte. A counter per slot feeds
// the statistics dump.

use crate::processor::Processor;
use crate::trap::{Fault, Run, Trap};

pub const TABLE_SIZE: usize = 256;

pub type Op = fn(&mut Processor) -> Run<()>;

fn mop_opcode_trap(p: &mut Processor) -> Run<()> {
    let last = p.opcodes.last_mop;
    Err(Fault::Trap(Trap::Opcode(last)))
}

fn esc_opcode_trap(p: &mut Processor) -> Run<()> {
    let last = p.opcodes.last_esc;
    Err(Fault::Trap(Trap::EscOpcode(last)))
}

#[derive(Clone)]
struct Slot {
    op: Op,
    name: String,
    registered: bool,
}

pub struct OpcodeTable {
    mop: Vec<Slot>,
    esc: Vec<Slot>,
    pub stats_mop: Vec<u64>,
    pub stats_esc: Vec<u64>,
    pub last_mop: u8,
    pub last_esc: u8,
}

impl OpcodeTable {
    pub fn new() -> OpcodeTable {
        let mop = (0..TABLE_SIZE)
            .map(|i| Slot { op: mop_opcode_trap as Op, name: format!("mop-{:03o}", i), registered: false })
            .collect();
        let esc = (0..TABLE_SIZE)
            .map(|i| Slot { op: esc_opcode_trap as Op, name: format!("esc-{:03o}", i), registered: false })
            .collect();
        OpcodeTable {
            mop,
            esc,
            stats_mop: vec![0; TABLE_SIZE],
            stats_esc: vec![0; TABLE_SIZE],
            last_mop: 0,
            last_esc: 0,
        }
    }

    pub fn register_mop(&mut self, code: u8, op: Op, name: &str) {
        let slot = &mut self.mop[code as usize];
        if slot.registered {
            panic!("mop {:03o} registered twice  name = {}", code, name);
        }
        slot.op = op;
        slot.name = name.to_string();
        slot.registered = true;
    }

    pub fn register_esc(&mut self, code: u8, op: Op, name: &str) {
        let slot = &mut self.esc[code as usize];
        if slot.registered {
            panic!("esc {:03o} registered twice  name = {}", code, name);
        }
        slot.op = op;
        slot.name = name.to_string();
        slot.registered = true;
    }

    pub fn mop_name(&self, code: u8) -> &str {
        &self.mop[code as usize].name
    }
    pub fn esc_name(&self, code: u8) -> &str {
        &self.esc[code as usize].name
    }
    pub fn mop_registered(&self, code: u8) -> bool {
        self.mop[code as usize].registered
    }
    pub fn esc_registered(&self, code: u8) -> bool {
        self.esc[code as usize].registered
    }

    // Per-opcode usage with a marker on slots still bound to the trap op.
    pub fn stats(&self) -> String {
        let mut out = String::new();
        let mut total = 0u64;
        out.push_str("==== Opcode stats  START\n");
        for i in 0..TABLE_SIZE {
            let slot = &self.mop[i];
            if self.stats_mop[i] == 0 {
                continue;
            }
            out.push_str(&format!(
                "stats mop  {:3o}  {:<16}  {:10} {}\n",
                i,
                slot.name,
                self.stats_mop[i],
                if slot.registered { "" } else { "*" }
            ));
            total += self.stats_mop[i];
        }
        for i in 0..TABLE_SIZE {
            let slot = &self.esc[i];
            if self.stats_esc[i] == 0 {
                continue;
            }
            out.push_str(&format!(
                "stats esc  {:3o}  {:<16}  {:10} {}\n",
                i,
                slot.name,
                self.stats_esc[i],
                if slot.registered { "" } else { "*" }
            ));
            total += self.stats_esc[i];
        }
        out.push_str(&format!("total = {}\n", total));
        out.push_str("==== Opcode stats  STOP");
        out
    }
}

// Dispatch lives on the processor so operations can borrow it mutably; the
// function pointer is copied out of the slot before the call.
impl Processor {
    pub fn dispatch_mop(&mut self, code: u8) -> Run<()> {
        self.opcodes.last_mop = code;
        self.opcodes.stats_mop[code as usize] += 1;
        let op = self.opcodes.mop[code as usize].op;
        op(self)
    }

    pub fn dispatch_esc(&mut self, code: u8) -> Run<()> {
        self.opcodes.last_esc = code;
        self.opcodes.stats_esc[code as usize] += 1;
        let op = self.opcodes.esc[code as usize].op;
        op(self)
    }
}
