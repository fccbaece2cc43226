// Page-addressable image files backing the disk and floppy agents, accessed
// through an OS memory mapping. One Pilot page is 512 bytes on the host.
//
// Concurrent access follows the agent discipline: the guest owns the blocks
// named in an IOCB until the completion interrupt, so plain loads and stores
// through the mapping are unsynchronized by design.

use crate::pilot::*;
use anyhow::{bail, Context, Result};
use log::{info, warn};
use std::ffi::CString;
use std::ptr;

pub struct DiskFile {
    path: String,
    data: *mut u16,
    size: u32, // bytes
    max_block: u32,
}

// The mapping is plain memory; all mutation goes through raw page copies
// whose exclusivity the IOCB protocol guarantees.
unsafe impl Send for DiskFile {}
unsafe impl Sync for DiskFile {}

impl DiskFile {
    pub fn attach(path: &str) -> Result<DiskFile> {
        let cpath = CString::new(path).context("path")?;
        let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDWR) };
        if fd < 0 {
            bail!("cannot open image  path = {}", path);
        }
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut stat) } != 0 {
            unsafe { libc::close(fd) };
            bail!("cannot stat image  path = {}", path);
        }
        let size = stat.st_size as u32;
        if size == 0 || size % BYTES_PER_PAGE != 0 {
            unsafe { libc::close(fd) };
            bail!("image size is not page aligned  path = {}  size = {}", path, size);
        }
        let data = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };
        if data == libc::MAP_FAILED {
            bail!("mmap failed  path = {}", path);
        }
        info!("DiskFile attach  size = {:8X}  path = {}", size, path);
        Ok(DiskFile { path: path.to_string(), data: data as *mut u16, size, max_block: size / BYTES_PER_PAGE })
    }

    pub fn path(&self) -> &str {
        &self.path
    }
    pub fn size(&self) -> u32 {
        self.size
    }
    pub fn block_size(&self) -> u32 {
        self.max_block
    }

    fn page(&self, block: u32) -> *mut u16 {
        if self.max_block <= block {
            panic!("block out of range  block = {}  max_block = {}  path = {}", block, self.max_block, self.path);
        }
        unsafe { self.data.add((block * PAGE_SIZE) as usize) }
    }

    pub fn read_page(&self, block: u32, buffer: &mut [u16]) {
        let page = self.page(block);
        for (i, word) in buffer.iter_mut().enumerate().take(PAGE_SIZE as usize) {
            *word = unsafe { *page.add(i) };
        }
    }

    pub fn write_page(&self, block: u32, buffer: &[u16]) {
        let page = self.page(block);
        for (i, &word) in buffer.iter().enumerate().take(PAGE_SIZE as usize) {
            unsafe { *page.add(i) = word };
        }
    }

    pub fn zero_page(&self, block: u32) {
        let page = self.page(block);
        for i in 0..PAGE_SIZE as usize {
            unsafe { *page.add(i) = 0 };
        }
    }

    // true on mismatch
    pub fn verify_page(&self, block: u32, buffer: &[u16]) -> bool {
        let page = self.page(block);
        for (i, &word) in buffer.iter().enumerate().take(PAGE_SIZE as usize) {
            if unsafe { *page.add(i) } != word {
                return true;
            }
        }
        false
    }

    // CHS geometry with fixed heads and sectors per track; cylinders come
    // from the image size. A size that is not an exact multiple keeps the
    // derived cylinder count and logs the discrepancy.
    pub fn disk_geometry(&self) -> (u16, u16, u16) {
        self.geometry(DISK_NUMBER_OF_HEADS, DISK_SECTORS_PER_TRACK)
    }
    pub fn floppy_geometry(&self) -> (u16, u16, u16) {
        self.geometry(FLOPPY_NUMBER_OF_HEADS, FLOPPY_SECTORS_PER_TRACK)
    }
    fn geometry(&self, heads: u16, sectors: u16) -> (u16, u16, u16) {
        let track = heads as u32 * sectors as u32 * BYTES_PER_PAGE;
        let cylinders = (self.size / track) as u16;
        if self.size != cylinders as u32 * track {
            warn!(
                "image size is not a whole number of cylinders  path = {}  size = {:8X}",
                self.path, self.size
            );
        }
        (cylinders, heads, sectors)
    }

    pub fn block_of(&self, cylinder: u16, head: u16, sector: u16, heads: u16, sectors: u16) -> u32 {
        (cylinder as u32 * heads as u32 + head as u32) * sectors as u32 + sector as u32
    }
}

impl Drop for DiskFile {
    fn drop(&mut self) {
        unsafe {
            libc::msync(self.data as *mut libc::c_void, self.size as usize, libc::MS_SYNC);
            libc::munmap(self.data as *mut libc::c_void, self.size as usize);
        }
        info!("DiskFile detach  path = {}", self.path);
    }
}
