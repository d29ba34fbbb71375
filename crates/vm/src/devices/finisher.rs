//! Test finisher (shutdown/reset MMIO)
//!
//! SiFive-style test device at 0x0010_0000. A 32-bit write of 0x5555 halts
//! the machine with that code; 0x3333 requests a machine reset; any other
//! value halts with the raw low 16 bits as the code and is logged. Reads
//! return zero.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

pub const FINISHER_PASS: u32 = 0x5555;
pub const FINISHER_RESET: u32 = 0x3333;

pub struct Finisher {
    halted: AtomicBool,
    halt_code: AtomicU32,
    reset_requested: AtomicBool,
}

impl Finisher {
    pub fn new() -> Self {
        Self {
            halted: AtomicBool::new(false),
            halt_code: AtomicU32::new(0),
            reset_requested: AtomicBool::new(false),
        }
    }

    pub fn write(&self, off: u64, val: u32) -> Option<()> {
        if off != 0 {
            return None;
        }
        let code = val & 0xFFFF;
        match code {
            FINISHER_RESET => {
                log::info!("finisher: reset requested");
                self.reset_requested.store(true, Ordering::Release);
            }
            FINISHER_PASS => {
                self.halt_code.store(code, Ordering::Relaxed);
                self.halted.store(true, Ordering::Release);
            }
            other => {
                log::warn!("finisher: halt with code {:#06x}", other);
                self.halt_code.store(other, Ordering::Relaxed);
                self.halted.store(true, Ordering::Release);
            }
        }
        Some(())
    }

    pub fn read(&self, off: u64) -> Option<u32> {
        if off != 0 {
            return None;
        }
        Some(0)
    }

    pub fn halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    pub fn halt_code(&self) -> u16 {
        self.halt_code.load(Ordering::Relaxed) as u16
    }

    pub fn take_reset_request(&self) -> bool {
        self.reset_requested.swap(false, Ordering::AcqRel)
    }

    pub fn reset(&self) {
        self.halted.store(false, Ordering::Relaxed);
        self.halt_code.store(0, Ordering::Relaxed);
        self.reset_requested.store(false, Ordering::Relaxed);
    }
}

impl Default for Finisher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pass_write_halts() {
        let f = Finisher::new();
        assert!(!f.halted());
        f.write(0, FINISHER_PASS).unwrap();
        assert!(f.halted());
        assert_eq!(f.halt_code(), 0x5555);
    }

    #[test]
    fn test_other_code_is_raw_exit() {
        let f = Finisher::new();
        f.write(0, 0x0042).unwrap();
        assert!(f.halted());
        assert_eq!(f.halt_code(), 0x42);
    }

    #[test]
    fn test_reset_request_latches_once() {
        let f = Finisher::new();
        f.write(0, FINISHER_RESET).unwrap();
        assert!(!f.halted());
        assert!(f.take_reset_request());
        assert!(!f.take_reset_request());
    }

    #[test]
    fn test_bad_offset() {
        let f = Finisher::new();
        assert!(f.write(4, 1).is_none());
        assert_eq!(f.read(0), Some(0));
    }
}
