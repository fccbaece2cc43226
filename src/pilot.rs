// Constants of the Pilot/Mesa environment: page geometry, the MDS layout
// (AV/SD/ETT/GFT/PDA), trap vector indices, agent face values and the Pilot
// epoch. Everything here is guest-visible layout, not emulator policy.

pub type Word = u16;

pub const PAGE_SIZE: u32 = 256; // words
pub const LOG_PAGE_SIZE: u32 = 8;
pub const BYTES_PER_WORD: u32 = 2;
pub const BYTES_PER_PAGE: u32 = PAGE_SIZE * BYTES_PER_WORD;

// 3.3.2 Evaluation Stack
pub const STACK_DEPTH: usize = 14;

// 3.1.4.3 Code Segments: PC is a byte offset into the code segment at CB.
// 3.2.2 Main Data Space layout
pub const M_AV: u16 = 0x0100; // allocation vector, 256 entries
pub const M_SD: u16 = 0x0200; // system data table, 256 control links
pub const M_ETT: u16 = 0x0400; // esc trap table, 256 control links
pub const M_PDA: u32 = 0x0001_0000; // process data area (long pointer)
pub const M_GFT: u32 = 0x0002_0000; // global frame table (long pointer)

// 9.2.2 Trap Handlers: indices into the system data table.
pub const S_BREAK_TRAP: u16 = 0o0;
pub const S_BOOT: u16 = 0o1;
pub const S_STACK_ERROR: u16 = 0o2;
pub const S_RESCHEDULE_ERROR: u16 = 0o3;
pub const S_XFER_TRAP: u16 = 0o4;
pub const S_OPCODE_TRAP: u16 = 0o5;
pub const S_CONTROL_TRAP: u16 = 0o6;
pub const S_CODE_TRAP: u16 = 0o7;
pub const S_HARDWARE_ERROR: u16 = 0o10;
pub const S_UNBOUND_TRAP: u16 = 0o11;
pub const S_DIV_ZERO_TRAP: u16 = 0o12;
pub const S_DIV_CHECK_TRAP: u16 = 0o13;
pub const S_INTERRUPT_ERROR: u16 = 0o14;
pub const S_PROCESS_TRAP: u16 = 0o15;
pub const S_BOUNDS_TRAP: u16 = 0o16;
pub const S_POINTER_TRAP: u16 = 0o17;

// 9.5.2 Fault queue indices in the PDA fault vector.
pub const Q_FRAME_FAULT: u16 = 0;
pub const Q_PAGE_FAULT: u16 = 1;
pub const Q_WRITE_PROTECT_FAULT: u16 = 2;

// 10.1.1 Process Data Area header layout (word offsets from PDA).
pub const PDA_READY: u32 = 0;
pub const PDA_COUNT: u32 = 1;
pub const PDA_STATE: u32 = 8; // state allocation table, 8 words
pub const PDA_INTERRUPT: u32 = 16; // 16 interrupt items of 2 words
pub const PDA_FAULT: u32 = 48; // 8 fault queues of 2 words
pub const PDA_BLOCK: u32 = 64; // process state blocks begin here
pub const PSB_SIZE: u32 = 8;
pub const START_PSB: u16 = (PDA_BLOCK / PSB_SIZE) as u16;

// ProcessStateBlock word offsets.
pub const PSB_LINK: u32 = 0;
pub const PSB_FLAGS: u32 = 1;
pub const PSB_CONTEXT: u32 = 2;
pub const PSB_TIMEOUT: u32 = 3;
pub const PSB_MDS: u32 = 4;
pub const PSB_DATA: u32 = 6; // sticky register image, 2 words

// 9.1 Control links: low two bits select the link variant.
pub const LINK_FRAME: u16 = 0;
pub const LINK_OLD_PROCEDURE: u16 = 1;
pub const LINK_INDIRECT: u16 = 2;
pub const LINK_NEW_PROCEDURE: u16 = 3;

// GlobalFrameTable entry: codebase (2 words), global frame (1 word), unused.
pub const GFT_ITEM_SIZE: u32 = 4;

// Local frame overhead words relative to LF.
pub const LOCAL_WORD: i32 = -4; // word: {available, fsi}
pub const LOCAL_RETURN: i32 = -3; // returnlink
pub const LOCAL_GLOBAL: i32 = -2; // globallink (gfi)
pub const LOCAL_PC: i32 = -1; // saved pc

// Global frame overhead words relative to GF.
pub const GLOBAL_WORD: i32 = -2;

// Guam I/O region: FCB addresses handed to the head parts live in the first
// 256 virtual pages. Each agent gets a fixed slot assigned at machine build.
pub const IO_REGION_PAGE_DEFAULT: u16 = 0x80;

// HTSP/PilotDiskFace.mesa
pub const DISK_COMMAND_READ: u16 = 0;
pub const DISK_COMMAND_WRITE: u16 = 1;
pub const DISK_COMMAND_VERIFY: u16 = 2;

pub const STATUS_IN_PROGRESS: u16 = 0;
pub const STATUS_GOOD_COMPLETION: u16 = 1;
pub const STATUS_DATA_VERIFY_ERROR: u16 = 9;

// Device.mesa device type codes.
pub const DEVICE_T_ANY_PILOT_DISK: u16 = 64;
pub const DEVICE_T_MICRO_FLOPPY: u16 = 21;
pub const DEVICE_T_ETHERNET: u16 = 6;
pub const DEVICE_T_DISPLAY: u16 = 0;

// Fixed image geometry: cylinders are derived from the file size.
pub const DISK_NUMBER_OF_HEADS: u16 = 2;
pub const DISK_SECTORS_PER_TRACK: u16 = 16;
pub const FLOPPY_NUMBER_OF_HEADS: u16 = 2;
pub const FLOPPY_SECTORS_PER_TRACK: u16 = 15;

// DiskFCBType word offsets (DiskIOFaceGuam.mesa).
pub const DISK_FCB_NEXT_IOCB: u32 = 0; // long pointer
pub const DISK_FCB_INTERRUPT_SELECTOR: u32 = 2;
pub const DISK_FCB_STOP_AGENT: u32 = 3;
pub const DISK_FCB_AGENT_STOPPED: u32 = 4;
pub const DISK_FCB_NUMBER_OF_DCBS: u32 = 5;
pub const DISK_FCB_DCB_START: u32 = 6;

// DiskDCBType word offsets and size.
pub const DISK_DCB_DEVICE_TYPE: u32 = 0;
pub const DISK_DCB_NUMBER_OF_CYLINDERS: u32 = 1;
pub const DISK_DCB_NUMBER_OF_HEADS: u32 = 2;
pub const DISK_DCB_SECTORS_PER_TRACK: u32 = 3;
pub const DISK_DCB_AGENT_DEVICE_DATA: u32 = 4; // 6 words
pub const DISK_DCB_SIZE: u32 = 10;

// DiskIOCBType word offsets.
pub const DISK_IOCB_OPERATION: u32 = 0; // {clientHeader(4), reserved..}
pub const DISK_IOCB_DEVICE_INDEX: u32 = 4;
pub const DISK_IOCB_DISK_ADDRESS: u32 = 5; // cylinder, head, sector
pub const DISK_IOCB_DATA_PTR: u32 = 8; // long pointer
pub const DISK_IOCB_COMMAND: u32 = 10;
pub const DISK_IOCB_PAGE_COUNT: u32 = 11;
pub const DISK_IOCB_STATUS: u32 = 12;
pub const DISK_IOCB_NEXT_IOCB: u32 = 14; // long pointer

// Floppy FCB/DCB/IOCB share the disk shapes; the DCB carries extra flags.
pub const FLOPPY_DCB_READY: u32 = 4;
pub const FLOPPY_DCB_DISK_CHANGED: u32 = 5;
pub const FLOPPY_DCB_TWO_SIDED: u32 = 6;
pub const FLOPPY_DCB_SUGGESTED_TRIES: u32 = 7;
pub const FLOPPY_DCB_SIZE: u32 = 8;

// DisplayIOFaceGuam.mesa command values.
pub const DISPLAY_COMMAND_NOP: u16 = 0;
pub const DISPLAY_COMMAND_MAP_DISPLAY: u16 = 1;
pub const DISPLAY_COMMAND_UNMAP_DISPLAY: u16 = 2;
pub const DISPLAY_COMMAND_POSITION_CURSOR: u16 = 3;
pub const DISPLAY_COMMAND_SET_CURSOR_PATTERN: u16 = 4;
pub const DISPLAY_COMMAND_UPDATE_RECTANGLE: u16 = 5;
pub const DISPLAY_COMMAND_COPY_RECTANGLE: u16 = 6;
pub const DISPLAY_COMMAND_PATTERN_FILL: u16 = 7;

pub const DISPLAY_RESULT_SUCCESS: u16 = 0;

// Display FCB word offsets (DisplayIOFaceGuam.mesa, trimmed to the words the
// head actually exchanges with the agent).
pub const DISPLAY_FCB_COMMAND: u32 = 0;
pub const DISPLAY_FCB_STATUS: u32 = 1;
pub const DISPLAY_FCB_RESULT: u32 = 2;
pub const DISPLAY_FCB_INTERRUPT_SELECTOR: u32 = 3;
pub const DISPLAY_FCB_CURSOR_PATTERN: u32 = 4; // 16 words
pub const DISPLAY_FCB_DEST_REAL_PAGE: u32 = 20; // 2 words
pub const DISPLAY_FCB_DEST_VIRTUAL_PAGE: u32 = 22; // 2 words
pub const DISPLAY_FCB_PAGE_COUNT: u32 = 24;
pub const DISPLAY_FCB_WIDTH: u32 = 25;
pub const DISPLAY_FCB_HEIGHT: u32 = 26;
pub const DISPLAY_FCB_SIZE: u32 = 27;

// Keyboard FCB: seven words of key-down bits.
pub const KEYBOARD_FCB_KEYS: u32 = 0;
pub const KEYBOARD_FCB_SIZE: u32 = 7;

// Mouse FCB: current and new cursor position.
pub const MOUSE_FCB_CURRENT_X: u32 = 0;
pub const MOUSE_FCB_CURRENT_Y: u32 = 1;
pub const MOUSE_FCB_NEW_X: u32 = 2;
pub const MOUSE_FCB_NEW_Y: u32 = 3;
pub const MOUSE_FCB_SIZE: u32 = 4;

// EthernetIOFaceGuam.mesa
pub const ETHER_FCB_RECEIVE_IOCB: u32 = 0; // long pointer
pub const ETHER_FCB_TRANSMIT_IOCB: u32 = 2; // long pointer
pub const ETHER_FCB_RECEIVE_INTERRUPT_SELECTOR: u32 = 4;
pub const ETHER_FCB_TRANSMIT_INTERRUPT_SELECTOR: u32 = 5;
pub const ETHER_FCB_STOP_AGENT: u32 = 6;
pub const ETHER_FCB_RECEIVE_STOPPED: u32 = 7;
pub const ETHER_FCB_TRANSMIT_STOPPED: u32 = 8;
pub const ETHER_FCB_HEAR_SELF: u32 = 9;
pub const ETHER_FCB_PROCESSOR_ID: u32 = 10; // 3 words
pub const ETHER_FCB_PACKETS_MISSED: u32 = 13;
pub const ETHER_FCB_AGENT_BLOCK_SIZE: u32 = 14;
pub const ETHER_FCB_SIZE: u32 = 15;

pub const ETHER_IOCB_BUFFER_ADDRESS: u32 = 0; // long pointer
pub const ETHER_IOCB_BUFFER_LENGTH: u32 = 2;
pub const ETHER_IOCB_ACTUAL_LENGTH: u32 = 3;
pub const ETHER_IOCB_DEQUEUED_PACKET_TYPE: u32 = 4; // also completion status
pub const ETHER_IOCB_NEXT_IOCB: u32 = 6; // long pointer
pub const ETHER_IOCB_SIZE: u32 = 8;

pub const ETHER_STATUS_IN_PROGRESS: u16 = 1;
pub const ETHER_STATUS_COMPLETED_OK: u16 = 2;

// FileTypes.mesa / CommonSoftwareFileTypes.mesa
pub const COMMON_SOFTWARE_FILE_TYPE: u16 = 2048;
pub const T_UNASSIGNED: u16 = COMMON_SOFTWARE_FILE_TYPE + 0;
pub const T_DIRECTORY: u16 = COMMON_SOFTWARE_FILE_TYPE + 1;
pub const T_BACKSTOP_LOG: u16 = COMMON_SOFTWARE_FILE_TYPE + 3;
pub const T_CARRY_VOLUME_DIRECTORY: u16 = COMMON_SOFTWARE_FILE_TYPE + 4;
pub const T_FILE_LIST: u16 = COMMON_SOFTWARE_FILE_TYPE + 6;
// AccessFloppy.mesa: a floppy leader page is tagged as a carry volume directory.
pub const T_FLOPPY_LEADER_PAGE: u16 = T_CARRY_VOLUME_DIRECTORY;

// Mesa time is seconds since 1901-01-01 plus the Alto/Pilot skew of 731 days.
pub const EPOCH_DIFF: u32 = 2_114_294_400 + 731 * 60 * 60 * 24;

pub fn to_mesa_time(unix_time: u32) -> u32 {
    unix_time.wrapping_add(EPOCH_DIFF)
}

pub fn to_unix_time(mesa_time: u32) -> u32 {
    mesa_time.wrapping_sub(EPOCH_DIFF)
}

// Boot switches are a 512-bit set; the germ reads them as 32 words.
pub const SWITCH_WORDS: usize = 32;
