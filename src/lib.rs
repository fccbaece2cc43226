// emesa: a user-mode emulator for the Xerox Pilot/Mesa "Guam" environment.
// The processor executes Mesa bytecodes against Pilot's paged virtual memory;
// the device agents give the guest its disk, floppy, display, keyboard and
// network; the XNS server answers the protocols a Pilot workstation expects
// to find on the wire.

pub mod agent;
pub mod bytebuffer;
pub mod config;
pub mod control;
pub mod diskfile;
pub mod display;
pub mod driver;
pub mod floppy;
pub mod guam;
mod instructions;
pub mod logger;
pub mod memory;
pub mod opcode;
pub mod pilot;
pub mod processor;
pub mod server;
pub mod trace;
pub mod trap;
pub mod xns;

pub use config::Config;
pub use guam::Machine;
pub use processor::Processor;
