//! BAR1 DMA buffer (spec.md §3, §9). Modeled as a single byte array
//! shared by two thin views — port A (DMAEngine, DWORD-granular) and
//! port B (BAR1 handler, byte-granular writes / DWORD reads) — behind
//! one lock rather than per-byte locks, per spec.md §9's "simpler"
//! option: since the core runs as a single cooperative step loop
//! (spec.md §5), at most one port ever commits within a given `tick()`,
//! so the lock is never contended in practice. `Arc`/`Mutex` (rather
//! than `Rc`/`RefCell`) so a whole `Core` can be moved onto the
//! adapter's worker thread (spec.md §9 ambient stack, `adapter.rs`).

use std::sync::{Arc, Mutex};

pub const DEFAULT_DMA_BUFFER_LEN: usize = 64 * 1024;

#[derive(Debug)]
pub struct DmaBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl DmaBuffer {
    pub fn new(len: usize) -> Self {
        DmaBuffer {
            bytes: Arc::new(Mutex::new(vec![0u8; len])),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn port_a(&self) -> PortA {
        PortA {
            bytes: self.bytes.clone(),
        }
    }

    pub fn port_b(&self) -> PortB {
        PortB {
            bytes: self.bytes.clone(),
        }
    }
}

impl Default for DmaBuffer {
    fn default() -> Self {
        DmaBuffer::new(DEFAULT_DMA_BUFFER_LEN)
    }
}

/// DMAEngine's exclusive view: aligned DWORD read/write.
#[derive(Debug, Clone)]
pub struct PortA {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl PortA {
    pub fn len(&self) -> usize {
        self.bytes.lock().unwrap().len()
    }

    pub fn read_dword(&self, offset: usize) -> u32 {
        let buf = self.bytes.lock().unwrap();
        u32::from_le_bytes([
            buf[offset],
            buf[offset + 1],
            buf[offset + 2],
            buf[offset + 3],
        ])
    }

    pub fn write_dword(&self, offset: usize, value: u32) {
        let mut buf = self.bytes.lock().unwrap();
        buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn read_bytes(&self, offset: usize, len: usize) -> Vec<u8> {
        self.bytes.lock().unwrap()[offset..offset + len].to_vec()
    }
}

/// BAR1 handler's exclusive view: byte-granular write, DWORD read.
#[derive(Debug, Clone)]
pub struct PortB {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl PortB {
    pub fn len(&self) -> usize {
        self.bytes.lock().unwrap().len()
    }

    pub fn write_bytes(&self, offset: usize, data: &[u8], be: u8) {
        let mut buf = self.bytes.lock().unwrap();
        for (i, &b) in data.iter().enumerate().take(4) {
            if be & (1 << i) != 0 && offset + i < buf.len() {
                buf[offset + i] = b;
            }
        }
    }

    pub fn write_all(&self, offset: usize, data: &[u8]) {
        let mut buf = self.bytes.lock().unwrap();
        buf[offset..offset + data.len()].copy_from_slice(data);
    }

    pub fn read_dword(&self, offset: usize) -> u32 {
        let buf = self.bytes.lock().unwrap();
        u32::from_le_bytes([
            buf[offset],
            buf[offset + 1],
            buf[offset + 2],
            buf[offset + 3],
        ])
    }

    pub fn read_bytes(&self, offset: usize, len: usize) -> Vec<u8> {
        self.bytes.lock().unwrap()[offset..offset + len].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_a_dword_roundtrip() {
        let buf = DmaBuffer::new(4096);
        let a = buf.port_a();
        a.write_dword(0x100, 0xDEAD_BEEF);
        assert_eq!(a.read_dword(0x100), 0xDEAD_BEEF);
    }

    #[test]
    fn port_b_byte_write_is_visible_on_port_a() {
        let buf = DmaBuffer::new(4096);
        let a = buf.port_a();
        let b = buf.port_b();
        b.write_bytes(0x10, &[0xAA, 0xBB, 0xCC, 0xDD], 0xF);
        assert_eq!(a.read_dword(0x10), 0xDDCC_BBAA);
    }

    #[test]
    fn port_b_partial_byte_enable() {
        let buf = DmaBuffer::new(4096);
        let b = buf.port_b();
        b.write_bytes(0, &[0xFF, 0xFF, 0xFF, 0xFF], 0xF);
        b.write_bytes(0, &[0x00, 0x00, 0x00, 0x00], 0b0101);
        assert_eq!(b.read_dword(0), 0xFF00_FF00);
    }
}
