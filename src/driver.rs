// Ethernet drivers behind the network agent and the XNS server: a raw
// AF_PACKET socket bound to a named interface, and an in-memory loopback
// driver for tests and network-less configurations.
//
// The surface is the original head's: select with a timeout, receive one
// frame, transmit one frame, discard whatever queued while we were away.
// Errors carry errno so callers can distinguish a dead interface (log and
// continue) from a programming error.

use log::{info, warn};
use std::collections::VecDeque;
use std::ffi::CString;
use std::io;
use std::sync::Mutex;

pub const ETHERTYPE_XNS: u16 = 0x0600;
pub const MAX_FRAME_SIZE: usize = 1536;

pub trait Driver: Send + Sync {
    // Returns true when a frame is ready within the timeout.
    fn select(&self, timeout_ms: u32) -> io::Result<bool>;
    fn receive(&self, buffer: &mut [u8]) -> io::Result<usize>;
    fn transmit(&self, frame: &[u8]) -> io::Result<()>;
    // Drain anything queued before the caller starts listening.
    fn discard(&self);
    fn address(&self) -> u64;
}

pub struct PacketDriver {
    fd: i32,
    address: u64,
}

unsafe impl Send for PacketDriver {}
unsafe impl Sync for PacketDriver {}

impl PacketDriver {
    pub fn open(interface: &str, address: u64) -> io::Result<PacketDriver> {
        let fd = unsafe {
            libc::socket(libc::AF_PACKET, libc::SOCK_RAW, (ETHERTYPE_XNS as u16).to_be() as i32)
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let ifname = CString::new(interface).expect("interface name");
        let index = unsafe { libc::if_nametoindex(ifname.as_ptr()) };
        if index == 0 {
            unsafe { libc::close(fd) };
            return Err(io::Error::last_os_error());
        }

        let mut sll: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        sll.sll_family = libc::AF_PACKET as u16;
        sll.sll_protocol = (ETHERTYPE_XNS as u16).to_be();
        sll.sll_ifindex = index as i32;
        let ret = unsafe {
            libc::bind(fd, &sll as *const libc::sockaddr_ll as *const libc::sockaddr, std::mem::size_of::<libc::sockaddr_ll>() as u32)
        };
        if ret != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        info!("PacketDriver open  interface = {}  index = {}", interface, index);
        Ok(PacketDriver { fd, address })
    }
}

impl Driver for PacketDriver {
    fn select(&self, timeout_ms: u32) -> io::Result<bool> {
        let mut pollfd = libc::pollfd { fd: self.fd, events: libc::POLLIN, revents: 0 };
        let ret = unsafe { libc::poll(&mut pollfd, 1, timeout_ms as i32) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ret > 0)
    }

    fn receive(&self, buffer: &mut [u8]) -> io::Result<usize> {
        let ret = unsafe {
            libc::recv(self.fd, buffer.as_mut_ptr() as *mut libc::c_void, buffer.len(), 0)
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ret as usize)
    }

    fn transmit(&self, frame: &[u8]) -> io::Result<()> {
        let ret = unsafe { libc::send(self.fd, frame.as_ptr() as *const libc::c_void, frame.len(), 0) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // A downed interface is survivable; the caller logs and goes on.
            if err.raw_os_error() == Some(libc::ENETDOWN) {
                warn!("transmit ENETDOWN");
                return Err(err);
            }
            return Err(err);
        }
        Ok(())
    }

    fn discard(&self) {
        let mut buffer = [0u8; MAX_FRAME_SIZE];
        loop {
            let ret = unsafe {
                libc::recv(self.fd, buffer.as_mut_ptr() as *mut libc::c_void, buffer.len(), libc::MSG_DONTWAIT)
            };
            if ret <= 0 {
                break;
            }
        }
    }

    fn address(&self) -> u64 {
        self.address
    }
}

impl Drop for PacketDriver {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

// Loopback driver: transmitted frames become receivable, and tests can
// inject inbound frames and inspect outbound ones.
pub struct DummyDriver {
    address: u64,
    inbound: Mutex<VecDeque<Vec<u8>>>,
    outbound: Mutex<Vec<Vec<u8>>>,
}

impl DummyDriver {
    pub fn new(address: u64) -> DummyDriver {
        DummyDriver { address, inbound: Mutex::new(VecDeque::new()), outbound: Mutex::new(Vec::new()) }
    }

    pub fn inject(&self, frame: Vec<u8>) {
        self.inbound.lock().unwrap().push_back(frame);
    }
    pub fn transmitted(&self) -> Vec<Vec<u8>> {
        self.outbound.lock().unwrap().clone()
    }
    pub fn take_transmitted(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.outbound.lock().unwrap())
    }
}

impl Driver for DummyDriver {
    fn select(&self, timeout_ms: u32) -> io::Result<bool> {
        if !self.inbound.lock().unwrap().is_empty() {
            return Ok(true);
        }
        // No frame; emulate the poll delay so callers do not spin.
        std::thread::sleep(std::time::Duration::from_millis(timeout_ms.min(10) as u64));
        Ok(!self.inbound.lock().unwrap().is_empty())
    }

    fn receive(&self, buffer: &mut [u8]) -> io::Result<usize> {
        match self.inbound.lock().unwrap().pop_front() {
            Some(frame) => {
                let size = frame.len().min(buffer.len());
                buffer[..size].copy_from_slice(&frame[..size]);
                Ok(size)
            }
            None => Err(io::Error::new(io::ErrorKind::WouldBlock, "no frame")),
        }
    }

    fn transmit(&self, frame: &[u8]) -> io::Result<()> {
        self.outbound.lock().unwrap().push(frame.to_vec());
        Ok(())
    }

    fn discard(&self) {
        self.inbound.lock().unwrap().clear();
    }

    fn address(&self) -> u64 {
        self.address
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dummy_driver_round_trip() {
        let driver = DummyDriver::new(0x0000_1122_3344);
        assert!(!driver.select(0).unwrap());
        driver.inject(vec![1, 2, 3]);
        assert!(driver.select(0).unwrap());
        let mut buffer = [0u8; 16];
        assert_eq!(driver.receive(&mut buffer).unwrap(), 3);
        assert_eq!(&buffer[..3], &[1, 2, 3]);

        driver.transmit(&[9, 9]).unwrap();
        assert_eq!(driver.take_transmitted(), vec![vec![9, 9]]);
        assert!(driver.transmitted().is_empty());
    }
}
