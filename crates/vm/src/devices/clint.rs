//! Core Local Interruptor
//!
//! One global `mtime`, one `mtimecmp` and one `msip` word per hart. State
//! is atomic rather than locked: every hart reads `mtime` on its interrupt
//! check and ticks it on retire, so a mutex here would serialize the whole
//! machine in parallel mode.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

pub const CLINT_MSIP: u64 = 0x0000;
pub const CLINT_MTIMECMP: u64 = 0x4000;
pub const CLINT_MTIME: u64 = 0xBFF8;

/// `mtime` increment per retired instruction.
pub const TICK_PER_INSN: u64 = 1;

pub struct Clint {
    msip: Vec<AtomicU32>,
    mtimecmp: Vec<AtomicU64>,
    mtime: AtomicU64,
}

impl Clint {
    pub fn new(n_harts: usize) -> Self {
        Self {
            msip: (0..n_harts).map(|_| AtomicU32::new(0)).collect(),
            // Reset high so no timer fires before the guest programs it.
            mtimecmp: (0..n_harts).map(|_| AtomicU64::new(u64::MAX)).collect(),
            mtime: AtomicU64::new(0),
        }
    }

    pub fn n_harts(&self) -> usize {
        self.msip.len()
    }

    /// Advance `mtime`. Called once per retired instruction.
    #[inline(always)]
    pub fn tick(&self, n: u64) {
        self.mtime.fetch_add(n * TICK_PER_INSN, Ordering::Relaxed);
    }

    pub fn mtime(&self) -> u64 {
        self.mtime.load(Ordering::Relaxed)
    }

    /// Machine timer line for hart i: high whenever mtime >= mtimecmp[i].
    #[inline]
    pub fn mtip(&self, hart: usize) -> bool {
        self.mtime() >= self.mtimecmp[hart].load(Ordering::Relaxed)
    }

    /// Machine software line for hart i.
    #[inline]
    pub fn msip(&self, hart: usize) -> bool {
        self.msip[hart].load(Ordering::Relaxed) & 1 != 0
    }

    /// MMIO read; `size` is 4 or 8 as validated by the bus.
    pub fn read(&self, off: u64, size: u8) -> Option<u64> {
        match off {
            CLINT_MTIME => {
                let v = self.mtime();
                Some(if size == 4 { v & 0xFFFF_FFFF } else { v })
            }
            _ if off < 0x4000 => {
                if size != 4 || off % 4 != 0 {
                    return None;
                }
                let hart = (off / 4) as usize;
                self.msip.get(hart).map(|m| m.load(Ordering::Relaxed) as u64)
            }
            _ if (CLINT_MTIMECMP..CLINT_MTIME).contains(&off) => {
                let idx = (off - CLINT_MTIMECMP) / 8;
                let cmp = self.mtimecmp.get(idx as usize)?;
                let v = cmp.load(Ordering::Relaxed);
                match (size, off % 8) {
                    (8, 0) => Some(v),
                    (4, 0) => Some(v & 0xFFFF_FFFF),
                    (4, 4) => Some(v >> 32),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// MMIO write; returns `None` on bad offset/width (bus raises an
    /// access fault).
    pub fn write(&self, off: u64, size: u8, val: u64) -> Option<()> {
        match off {
            CLINT_MTIME => {
                if size != 8 {
                    return None;
                }
                self.mtime.store(val, Ordering::Relaxed);
                Some(())
            }
            _ if off < 0x4000 => {
                if size != 4 || off % 4 != 0 {
                    return None;
                }
                let hart = (off / 4) as usize;
                let m = self.msip.get(hart)?;
                m.store(val as u32 & 1, Ordering::Relaxed);
                Some(())
            }
            _ if (CLINT_MTIMECMP..CLINT_MTIME).contains(&off) => {
                let idx = ((off - CLINT_MTIMECMP) / 8) as usize;
                let cmp = self.mtimecmp.get(idx)?;
                match (size, off % 8) {
                    (8, 0) => cmp.store(val, Ordering::Relaxed),
                    (4, 0) => {
                        let old = cmp.load(Ordering::Relaxed);
                        cmp.store((old & !0xFFFF_FFFF) | (val & 0xFFFF_FFFF), Ordering::Relaxed)
                    }
                    (4, 4) => {
                        let old = cmp.load(Ordering::Relaxed);
                        cmp.store((old & 0xFFFF_FFFF) | (val << 32), Ordering::Relaxed)
                    }
                    _ => return None,
                }
                Some(())
            }
            _ => None,
        }
    }

    pub fn state(&self) -> ClintState {
        ClintState {
            msip: self.msip.iter().map(|m| m.load(Ordering::Relaxed)).collect(),
            mtimecmp: self.mtimecmp.iter().map(|m| m.load(Ordering::Relaxed)).collect(),
            mtime: self.mtime(),
        }
    }

    pub fn restore(&self, s: &ClintState) {
        for (m, v) in self.msip.iter().zip(&s.msip) {
            m.store(*v, Ordering::Relaxed);
        }
        for (m, v) in self.mtimecmp.iter().zip(&s.mtimecmp) {
            m.store(*v, Ordering::Relaxed);
        }
        self.mtime.store(s.mtime, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        for m in &self.msip {
            m.store(0, Ordering::Relaxed);
        }
        for m in &self.mtimecmp {
            m.store(u64::MAX, Ordering::Relaxed);
        }
        self.mtime.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClintState {
    pub msip: Vec<u32>,
    pub mtimecmp: Vec<u64>,
    pub mtime: u64,
}
