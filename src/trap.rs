// Guest fault and trap tokens. These unwind out of opcode implementations to
// the processor loop boundary, which restores the saved PC/SP and transfers
// control through the system data table. They are control flow, not errors in
// the host sense; only the processor thread raises them.

use crate::pilot::*;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Trap {
    #[error("BreakTrap")]
    Break,
    #[error("BoundsTrap")]
    Bounds,
    #[error("CodeTrap gfi = {0}")]
    Code(u16),
    #[error("ControlTrap src = {0:04X}")]
    Control(u16),
    #[error("DivCheckTrap")]
    DivCheck,
    #[error("DivZeroTrap")]
    DivZero,
    #[error("InterruptError")]
    InterruptError,
    #[error("OpcodeTrap {0:03o}")]
    Opcode(u8),
    #[error("EscOpcodeTrap {0:03o}")]
    EscOpcode(u8),
    #[error("PointerTrap")]
    Pointer,
    #[error("ProcessTrap")]
    Process,
    #[error("RescheduleError")]
    RescheduleError,
    #[error("StackError")]
    Stack,
    #[error("UnboundTrap dst = {0:08X}")]
    Unbound(u32),
    #[error("XferTrap dst = {0:08X}")]
    Xfer(u32),
    #[error("HardwareError")]
    Hardware,
}

impl Trap {
    // System data table index of the trap handler.
    pub fn sd_index(self) -> u16 {
        match self {
            Trap::Break => S_BREAK_TRAP,
            Trap::Bounds => S_BOUNDS_TRAP,
            Trap::Code(_) => S_CODE_TRAP,
            Trap::Control(_) => S_CONTROL_TRAP,
            Trap::DivCheck => S_DIV_CHECK_TRAP,
            Trap::DivZero => S_DIV_ZERO_TRAP,
            Trap::InterruptError => S_INTERRUPT_ERROR,
            Trap::Opcode(_) => S_OPCODE_TRAP,
            // Esc opcode traps vector through the ETT, keyed by the byte.
            Trap::EscOpcode(_) => S_OPCODE_TRAP,
            Trap::Pointer => S_POINTER_TRAP,
            Trap::Process => S_PROCESS_TRAP,
            Trap::RescheduleError => S_RESCHEDULE_ERROR,
            Trap::Stack => S_STACK_ERROR,
            Trap::Unbound(_) => S_UNBOUND_TRAP,
            Trap::Xfer(_) => S_XFER_TRAP,
            Trap::Hardware => S_HARDWARE_ERROR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Fault {
    #[error("PageFault va = {0:08X}")]
    PageFault(u32),
    #[error("WriteProtectFault va = {0:08X}")]
    WriteProtectFault(u32),
    #[error("FrameFault fsi = {0}")]
    FrameFault(u16),
    #[error("{0}")]
    Trap(Trap),
    // Not an error: the scheduler asked the fetch loop to run its queues.
    #[error("RequestReschedule")]
    RequestReschedule,
}

impl From<Trap> for Fault {
    fn from(trap: Trap) -> Fault {
        Fault::Trap(trap)
    }
}

// Result alias used throughout the opcode implementations.
pub type Run<T> = Result<T, Fault>;
