// Framebuffer extraction: the monochrome display lives in the reserved real
// pages, one bit per pixel, zero white, scan lines padded to 32 bits. The
// host copies those bits into a 32-bit RGBA buffer; a minifb window presents
// the buffer when the machine runs with a display.

use crate::memory::Memory;
use crate::pilot::*;
use log::warn;
use minifb::{Window, WindowOptions};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const PIXEL_WHITE: u32 = 0x00ff_ffff;
pub const PIXEL_BLACK: u32 = 0x0000_0000;

// Expand the framebuffer into `buffer`, one u32 per visible pixel. Until the
// guest maps the display the buffer stays white.
pub fn extract(memory: &Memory, buffer: &mut [u32]) {
    let width = memory.display_width() as usize;
    let height = memory.display_height() as usize;
    if buffer.len() != width * height {
        panic!("framebuffer size mismatch  buffer = {}  expected = {}", buffer.len(), width * height);
    }
    let vp = memory.display_virtual_page();
    if vp == 0 {
        for pixel in buffer.iter_mut() {
            *pixel = PIXEL_WHITE;
        }
        return;
    }
    let words_per_line = (memory.display_bytes_per_line() / 2) as usize;
    let base = vp * PAGE_SIZE;
    for y in 0..height {
        let line = base + (y * words_per_line) as u32;
        for x in 0..width {
            let word = memory.read_word(line + (x / 16) as u32);
            let bit = word & (0x8000 >> (x % 16)) != 0;
            buffer[y * width + x] = if bit { PIXEL_BLACK } else { PIXEL_WHITE };
        }
    }
}

// Fill the visible framebuffer with a word pattern; the `display fill`
// console command uses this.
pub fn fill(memory: &Memory, pattern: u16) {
    let vp = memory.display_virtual_page();
    if vp == 0 {
        warn!("display fill before mapDisplay");
        return;
    }
    let base = vp * PAGE_SIZE;
    for i in 0..memory.display_page_size() * PAGE_SIZE {
        memory.write_word(base + i, pattern);
    }
}

// Present the framebuffer in a host window until the machine stops. Runs on
// its own thread; the window must be created there too.
pub fn run_window(memory: Arc<Memory>, stop: Arc<AtomicBool>) {
    let width = memory.display_width() as usize;
    let height = memory.display_height() as usize;
    let mut window = match Window::new("guam", width, height, WindowOptions::default()) {
        Ok(window) => window,
        Err(err) => {
            warn!("cannot open display window  {}", err);
            return;
        }
    };
    window.limit_update_rate(Some(Duration::from_millis(33)));
    let mut buffer = vec![PIXEL_WHITE; width * height];
    while !stop.load(Ordering::Relaxed) && window.is_open() {
        extract(&memory, &mut buffer);
        if let Err(err) = window.update_with_buffer(&buffer, width, height) {
            warn!("display update failed  {}", err);
            break;
        }
    }
}
