// Control-transfer trace: every XFER appends a record of where control came
// from and went, which the tracer and the `trace` console command read. The
// buffer is a bounded ring; correctness of the machine never depends on it.

use std::collections::VecDeque;
use std::fmt;

const TRACE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XferKind {
    Return,
    Call,
    LocalCall,
    Port,
    Xfer,
    Trap,
    ProcessSwitch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    NewProcedure,
    OldProcedure,
    Frame,
    Indirect,
}

#[derive(Debug, Clone, Copy)]
pub struct XferEvent {
    pub kind: XferKind,
    pub link: LinkKind,
    pub psb: u16,
    pub src_gfi: u16,
    pub src_pc: u16,
    pub dst_gfi: u16,
    pub dst_pc: u16,
    pub mds: u32,
    pub lf: u16,
}

impl fmt::Display for XferEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:13} {:12} psb {:4}  {:04X}:{:04X} -> {:04X}:{:04X}  mds {:08X} lf {:04X}",
            format!("{:?}", self.kind),
            format!("{:?}", self.link),
            self.psb,
            self.src_gfi,
            self.src_pc,
            self.dst_gfi,
            self.dst_pc,
            self.mds,
            self.lf
        )
    }
}

pub struct TraceBuffer {
    events: VecDeque<XferEvent>,
    enabled: bool,
    total: u64,
}

impl TraceBuffer {
    pub fn new() -> TraceBuffer {
        TraceBuffer { events: VecDeque::with_capacity(TRACE_CAPACITY), enabled: false, total: 0 }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }
    pub fn enabled(&self) -> bool {
        self.enabled
    }
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn record(&mut self, event: XferEvent) {
        if !self.enabled {
            return;
        }
        if self.events.len() == TRACE_CAPACITY {
            self.events.pop_front();
        }
        self.events.push_back(event);
        self.total += 1;
    }

    pub fn recent(&self, count: usize) -> Vec<XferEvent> {
        let skip = self.events.len().saturating_sub(count);
        self.events.iter().skip(skip).copied().collect()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(pc: u16) -> XferEvent {
        XferEvent {
            kind: XferKind::Call,
            link: LinkKind::Frame,
            psb: 1,
            src_gfi: 0,
            src_pc: 0,
            dst_gfi: 2,
            dst_pc: pc,
            mds: 0x10000,
            lf: 0x100,
        }
    }

    #[test]
    fn disabled_buffer_records_nothing() {
        let mut trace = TraceBuffer::new();
        trace.record(event(1));
        assert_eq!(trace.total(), 0);
        assert!(trace.recent(10).is_empty());
    }

    #[test]
    fn ring_keeps_most_recent() {
        let mut trace = TraceBuffer::new();
        trace.set_enabled(true);
        for i in 0..(TRACE_CAPACITY + 10) {
            trace.record(event(i as u16));
        }
        let recent = trace.recent(1);
        assert_eq!(recent[0].dst_pc, (TRACE_CAPACITY + 9) as u16);
        assert_eq!(trace.total(), (TRACE_CAPACITY + 10) as u64);
    }
}
