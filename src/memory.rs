// Pilot's paged virtual memory: a flat array of real pages, the virtual page
// map, the framebuffer reservation, and the processor's translation cache.
//
// Real pages and map entries are atomics so agent workers can service IOCBs
// against guest memory while the processor runs. The guest quiesces any page
// it hands to an agent, so plain relaxed accesses are sufficient; the
// happens-before edge for completions comes from the interrupt notification.

use crate::pilot::*;
use crate::trap::{Fault, Run};
use log::info;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};

const VMBITS_MIN: u32 = 20;
const VMBITS_MAX: u32 = 25;
const MAX_REALMEMORY_PAGE_SIZE: u32 = 0x10000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapFlags(pub u16);

impl MapFlags {
    pub const CLEAR: MapFlags = MapFlags(0);
    pub const VACANT: MapFlags = MapFlags(6);

    pub fn is_referenced(self) -> bool {
        self.0 & 1 != 0
    }
    pub fn is_dirty(self) -> bool {
        self.0 & 2 != 0
    }
    pub fn is_protected(self) -> bool {
        self.0 & 4 != 0
    }
    // The vacant encoding: protected and dirty without referenced.
    pub fn is_vacant(self) -> bool {
        self.0 & 7 == 6
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Map {
    pub mf: MapFlags,
    pub rp: u32,
}

impl Map {
    fn pack(self) -> u32 {
        (self.rp << 3) | (self.mf.0 as u32 & 7)
    }
    fn unpack(raw: u32) -> Map {
        Map { mf: MapFlags((raw & 7) as u16), rp: raw >> 3 }
    }
}

pub struct Memory {
    vp_size: u32,
    rp_size: u32,
    maps: Box<[AtomicU32]>,
    pages: Box<[AtomicU16]>,
    display_page_size: AtomicU32,
    display_real_page: AtomicU32,
    display_virtual_page: AtomicU32,
    display_width: AtomicU32,
    display_height: AtomicU32,
    display_bytes_per_line: AtomicU32,
}

impl Memory {
    pub fn new(vm_bits: u32, rm_bits: u32, io_region_page: u16) -> Memory {
        if vm_bits < VMBITS_MIN || VMBITS_MAX < vm_bits {
            panic!("vm_bits out of range  vm_bits = {}", vm_bits);
        }
        if vm_bits < rm_bits {
            panic!("rm_bits exceeds vm_bits  rm_bits = {}", rm_bits);
        }
        let vp_size = 1u32 << (vm_bits - LOG_PAGE_SIZE);
        let mut rp_size = 1u32 << (rm_bits - LOG_PAGE_SIZE);
        if MAX_REALMEMORY_PAGE_SIZE < rp_size {
            rp_size = MAX_REALMEMORY_PAGE_SIZE;
        }
        let io_region_page = io_region_page as u32;
        if 256 < io_region_page {
            panic!("io_region_page out of range  io_region_page = {}", io_region_page);
        }

        let pages = (0..rp_size * PAGE_SIZE).map(|_| AtomicU16::new(0)).collect::<Vec<_>>();
        let maps = (0..vp_size).map(|_| AtomicU32::new(0)).collect::<Vec<_>>();
        let memory = Memory {
            vp_size,
            rp_size,
            maps: maps.into_boxed_slice(),
            pages: pages.into_boxed_slice(),
            display_page_size: AtomicU32::new(0),
            display_real_page: AtomicU32::new(0),
            display_virtual_page: AtomicU32::new(0),
            display_width: AtomicU32::new(0),
            display_height: AtomicU32::new(0),
            display_bytes_per_line: AtomicU32::new(0),
        };

        // Boot layout: real memory goes behind the I/O region first, then the
        // pages below it, then one-to-one; the remainder of virtual space is
        // vacant until the guest maps it.
        let mut rp = 0u32;
        for vp in io_region_page..256 {
            memory.set_map(vp, Map { mf: MapFlags::CLEAR, rp });
            rp += 1;
        }
        for vp in 0..io_region_page {
            memory.set_map(vp, Map { mf: MapFlags::CLEAR, rp });
            rp += 1;
        }
        for vp in 256..rp_size {
            memory.set_map(vp, Map { mf: MapFlags::CLEAR, rp });
            rp += 1;
        }
        if rp != rp_size {
            panic!("boot layout exhausted real memory incorrectly  rp = {}", rp);
        }
        for vp in rp_size..vp_size {
            memory.set_map(vp, Map { mf: MapFlags::VACANT, rp: 0 });
        }
        memory
    }

    pub fn vp_size(&self) -> u32 {
        self.vp_size
    }
    // Real pages available to the guest, net of the framebuffer reservation.
    pub fn rp_size(&self) -> u32 {
        self.rp_size - self.display_page_size.load(Ordering::Relaxed)
    }

    fn set_map(&self, vp: u32, map: Map) {
        self.maps[vp as usize].store(map.pack(), Ordering::Relaxed);
    }
    fn map(&self, vp: u32) -> Map {
        Map::unpack(self.maps[vp as usize].load(Ordering::Relaxed))
    }

    pub fn read_map(&self, vp: u32) -> Map {
        if self.vp_size <= vp {
            panic!("read_map vp out of range  vp = {:06X}", vp);
        }
        let mut map = self.map(vp);
        if map.mf.is_vacant() {
            map.rp = 0;
        }
        map
    }

    pub fn write_map(&self, vp: u32, mut map: Map) {
        if self.vp_size <= vp {
            panic!("write_map vp out of range  vp = {:06X}", vp);
        }
        if self.rp_size <= map.rp {
            panic!("write_map rp out of range  rp = {:06X}", map.rp);
        }
        if map.mf.is_vacant() {
            map.rp = 0;
        }
        self.set_map(vp, map);
    }

    // Page-granular access used by the translation cache. Returns the real
    // page; the fault, if any, is raised before any caller state changes.
    pub fn fetch_page(&self, vp: u32) -> Run<u32> {
        if self.vp_size <= vp {
            panic!("fetch_page vp out of range  vp = {:06X}", vp);
        }
        let map = self.map(vp);
        if map.mf.is_vacant() {
            return Err(Fault::PageFault(vp * PAGE_SIZE));
        }
        if !map.mf.is_referenced() {
            self.set_map(vp, Map { mf: MapFlags(map.mf.0 | 1), rp: map.rp });
        }
        Ok(map.rp)
    }

    pub fn store_page(&self, vp: u32) -> Run<u32> {
        if self.vp_size <= vp {
            panic!("store_page vp out of range  vp = {:06X}", vp);
        }
        let map = self.map(vp);
        if map.mf.is_vacant() {
            return Err(Fault::PageFault(vp * PAGE_SIZE));
        }
        if map.mf.is_protected() {
            return Err(Fault::WriteProtectFault(vp * PAGE_SIZE));
        }
        if !map.mf.is_referenced() || !map.mf.is_dirty() {
            self.set_map(vp, Map { mf: MapFlags(map.mf.0 | 3), rp: map.rp });
        }
        Ok(map.rp)
    }

    pub fn set_referenced(&self, vp: u32) {
        if self.vp_size <= vp {
            panic!("set_referenced vp out of range  vp = {:06X}", vp);
        }
        let map = self.map(vp);
        self.set_map(vp, Map { mf: MapFlags(map.mf.0 | 1), rp: map.rp });
    }

    pub fn set_referenced_dirty(&self, vp: u32) {
        if self.vp_size <= vp {
            panic!("set_referenced_dirty vp out of range  vp = {:06X}", vp);
        }
        let map = self.map(vp);
        self.set_map(vp, Map { mf: MapFlags(map.mf.0 | 3), rp: map.rp });
    }

    // Address resolution without flag maintenance. Vacant is fatal here:
    // callers are the emulator itself (agents, framebuffer, guest structure
    // walks), never the guest.
    fn resolve(&self, va: u32) -> (u32, u32) {
        let vp = va / PAGE_SIZE;
        let of = va % PAGE_SIZE;
        if self.vp_size <= vp {
            panic!("resolve va out of range  va = {:08X}", va);
        }
        let map = self.map(vp);
        if map.mf.is_vacant() {
            panic!("resolve vacant page  va = {:08X}  vp = {:06X}", va, vp);
        }
        (map.rp, of)
    }

    pub fn peek(&self, va: u32) -> u16 {
        let (rp, of) = self.resolve(va);
        self.word(rp, of)
    }

    pub fn is_vacant(&self, va: u32) -> bool {
        let vp = va / PAGE_SIZE;
        if self.vp_size <= vp {
            panic!("is_vacant va out of range  va = {:08X}", va);
        }
        self.map(vp).mf.is_vacant()
    }

    pub fn read_word(&self, va: u32) -> u16 {
        self.peek(va)
    }
    pub fn write_word(&self, va: u32, value: u16) {
        let (rp, of) = self.resolve(va);
        self.set_word(rp, of, value);
    }
    // Long values in guest memory are stored low word first.
    pub fn read_dbl(&self, va: u32) -> u32 {
        let low = self.read_word(va) as u32;
        let high = self.read_word(va + 1) as u32;
        (high << 16) | low
    }
    pub fn write_dbl(&self, va: u32, value: u32) {
        self.write_word(va, value as u16);
        self.write_word(va + 1, (value >> 16) as u16);
    }

    pub fn word(&self, rp: u32, offset: u32) -> u16 {
        self.pages[(rp * PAGE_SIZE + offset) as usize].load(Ordering::Relaxed)
    }
    pub fn set_word(&self, rp: u32, offset: u32, value: u16) {
        self.pages[(rp * PAGE_SIZE + offset) as usize].store(value, Ordering::Relaxed);
    }

    // Bulk copies for the agents. Regions may cross page boundaries; each
    // page is resolved once.
    pub fn copy_from_guest(&self, va: u32, buffer: &mut [u16]) {
        let mut va = va;
        let mut done = 0usize;
        while done < buffer.len() {
            let (rp, of) = self.resolve(va);
            let run = ((PAGE_SIZE - of) as usize).min(buffer.len() - done);
            for i in 0..run {
                buffer[done + i] = self.word(rp, of + i as u32);
            }
            done += run;
            va += run as u32;
        }
    }
    pub fn copy_to_guest(&self, va: u32, buffer: &[u16]) {
        let mut va = va;
        let mut done = 0usize;
        while done < buffer.len() {
            let (rp, of) = self.resolve(va);
            let run = ((PAGE_SIZE - of) as usize).min(buffer.len() - done);
            for i in 0..run {
                self.set_word(rp, of + i as u32, buffer[done + i]);
            }
            done += run;
            va += run as u32;
        }
    }

    // Framebuffer reservation: the last display_page_size real pages leave
    // the normal pool and wait for the guest's mapDisplay.
    pub fn reserve_display_page(&self, width: u16, height: u16) {
        // UserTerminalHeadGuam rounds the scan line up to 32 bits.
        let bits_per_dword = 32u32;
        let aligned_width = (width as u32 + bits_per_dword - 1) / bits_per_dword * bits_per_dword;
        let image_size = aligned_width * height as u32 / 8;
        let display_page_size = (image_size + BYTES_PER_PAGE - 1) / BYTES_PER_PAGE;

        self.display_width.store(width as u32, Ordering::Relaxed);
        self.display_height.store(height as u32, Ordering::Relaxed);
        self.display_bytes_per_line.store(aligned_width / 8, Ordering::Relaxed);
        self.display_page_size.store(display_page_size, Ordering::Relaxed);

        let vp = self.rp_size - display_page_size;
        self.display_real_page.store(self.map(vp).rp, Ordering::Relaxed);

        for i in 0..display_page_size {
            self.write_map(vp + i, Map { mf: MapFlags::VACANT, rp: 0 });
        }
        info!("reserve_display_page rp = {:06X}+{:02X}", vp, display_page_size);
    }

    pub fn map_display(&self, vp: u32, rp: u32, page_count: u32) {
        info!("map_display  {:06X}+{:02X}  {:06X}", vp, page_count, rp);
        if rp != self.display_real_page.load(Ordering::Relaxed) {
            panic!("map_display rp mismatch  rp = {:06X}", rp);
        }
        if page_count != self.display_page_size.load(Ordering::Relaxed) {
            panic!("map_display page count mismatch  page_count = {}", page_count);
        }
        self.display_virtual_page.store(vp, Ordering::Relaxed);
        for i in 0..page_count {
            self.write_map(vp + i, Map { mf: MapFlags::CLEAR, rp: rp + i });
        }
    }

    pub fn display_page_size(&self) -> u32 {
        self.display_page_size.load(Ordering::Relaxed)
    }
    pub fn display_real_page(&self) -> u32 {
        self.display_real_page.load(Ordering::Relaxed)
    }
    pub fn display_virtual_page(&self) -> u32 {
        self.display_virtual_page.load(Ordering::Relaxed)
    }
    pub fn display_width(&self) -> u32 {
        self.display_width.load(Ordering::Relaxed)
    }
    pub fn display_height(&self) -> u32 {
        self.display_height.load(Ordering::Relaxed)
    }
    pub fn display_bytes_per_line(&self) -> u32 {
        self.display_bytes_per_line.load(Ordering::Relaxed)
    }
}

// The processor's direct-mapped translation cache. One owner, no locking;
// agents bypass it through Memory's uncached accessors.
const CACHE_BITS: u32 = 12;
const CACHE_SIZE: usize = 1 << CACHE_BITS;
const CACHE_MASK: u32 = (CACHE_SIZE as u32) - 1;

#[derive(Clone, Copy, Default)]
struct CacheEntry {
    vpno: u32,
    rp: u32,
    flag_fetch: bool,
    flag_store: bool,
}

pub struct PageCache {
    entry: Box<[CacheEntry]>,
    pub hit: u64,
    pub miss_empty: u64,
    pub miss_conflict: u64,
}

impl PageCache {
    pub fn new() -> PageCache {
        PageCache {
            entry: vec![CacheEntry::default(); CACHE_SIZE].into_boxed_slice(),
            hit: 0,
            miss_empty: 0,
            miss_conflict: 0,
        }
    }

    pub fn clear(&mut self) {
        for e in self.entry.iter_mut() {
            *e = CacheEntry::default();
        }
        self.hit = 0;
        self.miss_empty = 0;
        self.miss_conflict = 0;
    }

    pub fn fetch(&mut self, memory: &Memory, va: u32) -> Run<u16> {
        let vp = va / PAGE_SIZE;
        let of = va % PAGE_SIZE;
        let index = (vp & CACHE_MASK) as usize;
        let e = self.entry[index];
        if e.vpno == vp && e.flag_fetch {
            self.hit += 1;
            return Ok(memory.word(e.rp, of));
        }
        if e.vpno == vp && e.flag_store {
            // Same page, fetch flag not yet maintained.
            memory.set_referenced(vp);
            self.entry[index].flag_fetch = true;
            return Ok(memory.word(e.rp, of));
        }
        // Reload. The fault must escape before the entry changes.
        if e.flag_fetch || e.flag_store {
            self.miss_conflict += 1;
        } else {
            self.miss_empty += 1;
        }
        let rp = memory.fetch_page(vp)?;
        self.entry[index] = CacheEntry { vpno: vp, rp, flag_fetch: true, flag_store: false };
        Ok(memory.word(rp, of))
    }

    pub fn store(&mut self, memory: &Memory, va: u32, value: u16) -> Run<()> {
        let rp = self.store_page(memory, va / PAGE_SIZE)?;
        memory.set_word(rp, va % PAGE_SIZE, value);
        Ok(())
    }

    // Translate for store, returning the real page.
    pub fn store_page(&mut self, memory: &Memory, vp: u32) -> Run<u32> {
        let index = (vp & CACHE_MASK) as usize;
        let e = self.entry[index];
        if e.vpno == vp && e.flag_store {
            self.hit += 1;
            return Ok(e.rp);
        }
        if e.vpno == vp && e.flag_fetch {
            // The protection check still has to run; a fetch entry says
            // nothing about writability.
            let rp = memory.store_page(vp)?;
            self.entry[index].flag_store = true;
            return Ok(rp);
        }
        if e.flag_fetch || e.flag_store {
            self.miss_conflict += 1;
        } else {
            self.miss_empty += 1;
        }
        let rp = memory.store_page(vp)?;
        self.entry[index] = CacheEntry { vpno: vp, rp, flag_fetch: true, flag_store: true };
        Ok(rp)
    }

    pub fn invalidate(&mut self, vp: u32) {
        let index = (vp & CACHE_MASK) as usize;
        let e = &mut self.entry[index];
        if e.vpno == vp {
            *e = CacheEntry::default();
        }
    }

    pub fn stats(&self) -> String {
        let used = self.entry.iter().filter(|e| e.flag_fetch || e.flag_store).count();
        let total = self.hit + self.miss_empty + self.miss_conflict;
        if total == 0 {
            format!("PageCache {:5} / {:5}", used, CACHE_SIZE)
        } else {
            format!(
                "PageCache {:5} / {:5}  {:10}  {:6.2}%   miss empty {:10}  conflict {:10}",
                used,
                CACHE_SIZE,
                total,
                (self.hit as f64 / total as f64) * 100.0,
                self.miss_empty,
                self.miss_conflict
            )
        }
    }
}
