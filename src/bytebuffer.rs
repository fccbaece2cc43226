// A position/limit/capacity cursor over a byte region, in the java.nio mold.
// Every wire and on-disk decode path in the emulator goes through this type.
// All multi-byte values are network byte order.
//
// Overrunning limit (read) or capacity (write) is a caller bug and panics;
// nothing in the guest can trigger it.

use byteorder::{BigEndian, ByteOrder};
use std::cell::RefCell;
use std::rc::Rc;

// Largest ethernet frame the drivers exchange.
pub const PACKET_SIZE: usize = 1536;

type Storage = Rc<RefCell<Box<[u8]>>>;

pub struct ByteBuffer {
    data: Storage,
    base: u32,
    position: u32,
    limit: u32,
    capacity: u32,
    mark: Option<u32>,
}

impl ByteBuffer {
    pub fn new(capacity: u32) -> Self {
        let data: Box<[u8]> = vec![0u8; capacity as usize].into_boxed_slice();
        ByteBuffer {
            data: Rc::new(RefCell::new(data)),
            base: 0,
            position: 0,
            limit: 0,
            capacity,
            mark: None,
        }
    }

    // A frame-sized buffer for the network paths.
    pub fn packet() -> Self {
        ByteBuffer::new(PACKET_SIZE as u32)
    }

    // Wraps existing bytes for decoding: position at 0, limit at the end.
    pub fn from_data(data: Vec<u8>) -> Self {
        let capacity = data.len() as u32;
        ByteBuffer {
            data: Rc::new(RefCell::new(data.into_boxed_slice())),
            base: 0,
            position: 0,
            limit: capacity,
            capacity,
            mark: None,
        }
    }

    pub fn base(&self) -> u32 {
        self.base
    }
    pub fn position(&self) -> u32 {
        self.position
    }
    pub fn limit(&self) -> u32 {
        self.limit
    }
    pub fn capacity(&self) -> u32 {
        self.capacity
    }
    pub fn remaining(&self) -> u32 {
        self.limit - self.position
    }
    pub fn has_remaining(&self) -> bool {
        self.position < self.limit
    }

    // Valid positions are [base, limit].
    pub fn set_position(&mut self, position: u32) {
        if position < self.base || self.limit < position {
            panic!(
                "ByteBuffer position out of range  position = {}  base = {}  limit = {}",
                position, self.base, self.limit
            );
        }
        self.position = position;
    }
    pub fn set_limit(&mut self, limit: u32) {
        if limit < self.base || self.capacity < limit {
            panic!(
                "ByteBuffer limit out of range  limit = {}  base = {}  capacity = {}",
                limit, self.base, self.capacity
            );
        }
        self.limit = limit;
    }

    pub fn rewind(&mut self) {
        self.position = self.base;
    }
    pub fn flip(&mut self) {
        self.limit = self.position;
        self.position = self.base;
    }
    pub fn clear(&mut self) {
        self.position = self.base;
        self.limit = self.base;
        self.mark = None;
    }

    // mark/reset is single-shot: a second mark without a reset is a bug.
    pub fn mark(&mut self) {
        if self.mark.is_some() {
            panic!("ByteBuffer mark while mark is pending");
        }
        self.mark = Some(self.position);
    }
    pub fn reset(&mut self) {
        match self.mark.take() {
            Some(position) => self.position = position,
            None => panic!("ByteBuffer reset without mark"),
        }
    }

    fn check_read(&self, byte_size: u32) {
        if self.limit < self.position + byte_size {
            panic!(
                "ByteBuffer read overrun  size = {}  position = {}  limit = {}",
                byte_size, self.position, self.limit
            );
        }
    }
    fn check_write(&self, byte_size: u32) {
        if self.capacity < self.position + byte_size {
            panic!(
                "ByteBuffer write overrun  size = {}  position = {}  capacity = {}",
                byte_size, self.position, self.capacity
            );
        }
    }
    fn advance_write(&mut self, byte_size: u32) {
        self.position += byte_size;
        if self.limit < self.position {
            self.limit = self.position;
        }
    }

    pub fn read8(&mut self) -> u8 {
        self.check_read(1);
        let value = self.data.borrow()[self.position as usize];
        self.position += 1;
        value
    }
    pub fn read16(&mut self) -> u16 {
        self.check_read(2);
        let p = self.position as usize;
        let value = BigEndian::read_u16(&self.data.borrow()[p..p + 2]);
        self.position += 2;
        value
    }
    pub fn read32(&mut self) -> u32 {
        self.check_read(4);
        let p = self.position as usize;
        let value = BigEndian::read_u32(&self.data.borrow()[p..p + 4]);
        self.position += 4;
        value
    }
    pub fn read48(&mut self) -> u64 {
        self.check_read(6);
        let p = self.position as usize;
        let value = BigEndian::read_u48(&self.data.borrow()[p..p + 6]);
        self.position += 6;
        value
    }
    pub fn read_bytes(&mut self, byte_size: u32) -> Vec<u8> {
        self.check_read(byte_size);
        let p = self.position as usize;
        let value = self.data.borrow()[p..p + byte_size as usize].to_vec();
        self.position += byte_size;
        value
    }
    // The rest of the readable region, position unchanged.
    pub fn rest(&self) -> Vec<u8> {
        let p = self.position as usize;
        self.data.borrow()[p..self.limit as usize].to_vec()
    }

    pub fn write8(&mut self, value: u8) {
        self.check_write(1);
        self.data.borrow_mut()[self.position as usize] = value;
        self.advance_write(1);
    }
    pub fn write16(&mut self, value: u16) {
        self.check_write(2);
        let p = self.position as usize;
        BigEndian::write_u16(&mut self.data.borrow_mut()[p..p + 2], value);
        self.advance_write(2);
    }
    pub fn write32(&mut self, value: u32) {
        self.check_write(4);
        let p = self.position as usize;
        BigEndian::write_u32(&mut self.data.borrow_mut()[p..p + 4], value);
        self.advance_write(4);
    }
    pub fn write48(&mut self, value: u64) {
        self.check_write(6);
        let p = self.position as usize;
        BigEndian::write_u48(&mut self.data.borrow_mut()[p..p + 6], value);
        self.advance_write(6);
    }
    pub fn write_bytes(&mut self, value: &[u8]) {
        let byte_size = value.len() as u32;
        self.check_write(byte_size);
        let p = self.position as usize;
        self.data.borrow_mut()[p..p + value.len()].copy_from_slice(value);
        self.advance_write(byte_size);
    }

    // Positional variants: absolute offsets, cursor untouched. Used by the
    // transmit path to patch the IDP length and checksum after encoding.
    pub fn get8(&self, offset: u32) -> u8 {
        if self.capacity <= offset {
            panic!("ByteBuffer get8 out of range  offset = {}", offset);
        }
        self.data.borrow()[offset as usize]
    }
    pub fn get16(&self, offset: u32) -> u16 {
        if self.capacity < offset + 2 {
            panic!("ByteBuffer get16 out of range  offset = {}", offset);
        }
        let p = offset as usize;
        BigEndian::read_u16(&self.data.borrow()[p..p + 2])
    }
    pub fn set16(&mut self, offset: u32, value: u16) {
        if self.capacity < offset + 2 {
            panic!("ByteBuffer set16 out of range  offset = {}", offset);
        }
        let p = offset as usize;
        BigEndian::write_u16(&mut self.data.borrow_mut()[p..p + 2], value);
    }

    // Sub-view sharing storage, word granular. A size reaching past the end
    // of the storage is clamped, as the volume decoders expect.
    pub fn range(&self, word_offset: u32, word_size: u32) -> ByteBuffer {
        let base = self.base + word_offset * 2;
        let mut byte_size = word_size * 2;
        if self.capacity < base + byte_size {
            byte_size = self.capacity - base;
        }
        ByteBuffer {
            data: Rc::clone(&self.data),
            base,
            position: base,
            limit: base + byte_size,
            capacity: base + byte_size,
            mark: None,
        }
    }

    // Readable extent [base, limit) as an owned copy, for handing frames to
    // the network driver.
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.borrow()[self.base as usize..self.limit as usize].to_vec()
    }
}

impl Clone for ByteBuffer {
    fn clone(&self) -> Self {
        ByteBuffer {
            data: Rc::clone(&self.data),
            base: self.base,
            position: self.position,
            limit: self.limit,
            capacity: self.capacity,
            mark: None,
        }
    }
}
