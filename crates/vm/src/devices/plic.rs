//! Platform-Level Interrupt Controller
//!
//! 32 sources (source 0 reserved), one M and one S context per hart,
//! context number = 2*hart + (0 for M, 1 for S). Sources are
//! level-triggered: devices drive the level through `set_level` and the
//! claim/complete protocol gates redelivery while a source is in service.

use serde::{Deserialize, Serialize};

pub const PLIC_NSOURCES: usize = 32;

// Register window offsets.
const PRIORITY_BASE: u64 = 0x0000;
const PENDING_BASE: u64 = 0x1000;
const ENABLE_BASE: u64 = 0x2000;
const ENABLE_STRIDE: u64 = 0x80;
const CONTEXT_BASE: u64 = 0x20_0000;
const CONTEXT_STRIDE: u64 = 0x1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plic {
    priority: [u32; PLIC_NSOURCES],
    /// Pending bitmap, one bit per source.
    pending: u32,
    /// Current device-driven level per source.
    level: u32,
    /// Per-context enable bitmap.
    enable: Vec<u32>,
    /// Per-context priority threshold.
    threshold: Vec<u32>,
    /// Per-context claimed-but-not-completed bitmap.
    claimed: Vec<u32>,
}

impl Plic {
    pub fn new(n_harts: usize) -> Self {
        let n_ctx = n_harts * 2;
        Self {
            priority: [0; PLIC_NSOURCES],
            pending: 0,
            level: 0,
            enable: vec![0; n_ctx],
            threshold: vec![0; n_ctx],
            claimed: vec![0; n_ctx],
        }
    }

    pub fn n_contexts(&self) -> usize {
        self.enable.len()
    }

    /// Drive a source's level. A rising edge latches the pending bit.
    pub fn set_level(&mut self, src: u32, high: bool) {
        if src == 0 || src as usize >= PLIC_NSOURCES {
            return;
        }
        let bit = 1u32 << src;
        if high && self.level & bit == 0 {
            self.pending |= bit;
        }
        if high {
            self.level |= bit;
        } else {
            self.level &= !bit;
        }
    }

    pub fn raise(&mut self, src: u32) {
        self.set_level(src, true);
    }

    pub fn lower(&mut self, src: u32) {
        self.set_level(src, false);
    }

    /// Highest-priority pending enabled source above the context's
    /// threshold, if any. Does not claim.
    fn best(&self, ctx: usize) -> Option<u32> {
        let candidates = self.pending & self.enable[ctx] & !self.claimed[ctx];
        let mut best: Option<(u32, u32)> = None;
        for src in 1..PLIC_NSOURCES as u32 {
            if candidates & 1 << src == 0 {
                continue;
            }
            let prio = self.priority[src as usize];
            if prio <= self.threshold[ctx] {
                continue;
            }
            // Ties break toward the lowest source id.
            if best.map_or(true, |(_, p)| prio > p) {
                best = Some((src, prio));
            }
        }
        best.map(|(src, _)| src)
    }

    /// External interrupt line for a context.
    pub fn irq_line(&self, ctx: usize) -> bool {
        ctx < self.enable.len() && self.best(ctx).is_some()
    }

    /// Claim: return the best source and clear its pending bit.
    pub fn claim(&mut self, ctx: usize) -> u32 {
        match self.best(ctx) {
            Some(src) => {
                self.pending &= !(1 << src);
                self.claimed[ctx] |= 1 << src;
                src
            }
            None => 0,
        }
    }

    /// Complete: re-arm the source for this context. A source whose level
    /// is still high goes pending again immediately.
    pub fn complete(&mut self, ctx: usize, src: u32) {
        if src == 0 || src as usize >= PLIC_NSOURCES {
            return;
        }
        let bit = 1u32 << src;
        if self.claimed[ctx] & bit == 0 {
            return;
        }
        self.claimed[ctx] &= !bit;
        if self.level & bit != 0 {
            self.pending |= bit;
        }
    }

    /// MMIO read (4-byte accesses only; the bus enforces the width).
    pub fn read(&mut self, off: u64) -> Option<u32> {
        match off {
            _ if off < PENDING_BASE => {
                let src = (off / 4) as usize;
                if off % 4 != 0 || src >= PLIC_NSOURCES {
                    return None;
                }
                Some(self.priority[src])
            }
            PENDING_BASE => Some(self.pending),
            _ if (ENABLE_BASE..CONTEXT_BASE).contains(&off) => {
                let ctx = ((off - ENABLE_BASE) / ENABLE_STRIDE) as usize;
                if (off - ENABLE_BASE) % ENABLE_STRIDE != 0 || ctx >= self.enable.len() {
                    return None;
                }
                Some(self.enable[ctx])
            }
            _ if off >= CONTEXT_BASE => {
                let ctx = ((off - CONTEXT_BASE) / CONTEXT_STRIDE) as usize;
                if ctx >= self.threshold.len() {
                    return None;
                }
                match (off - CONTEXT_BASE) % CONTEXT_STRIDE {
                    0 => Some(self.threshold[ctx]),
                    4 => Some(self.claim(ctx)),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// MMIO write (4-byte accesses only).
    pub fn write(&mut self, off: u64, val: u32) -> Option<()> {
        match off {
            _ if off < PENDING_BASE => {
                let src = (off / 4) as usize;
                if off % 4 != 0 || src >= PLIC_NSOURCES {
                    return None;
                }
                if src != 0 {
                    self.priority[src] = val;
                }
                Some(())
            }
            _ if (ENABLE_BASE..CONTEXT_BASE).contains(&off) => {
                let ctx = ((off - ENABLE_BASE) / ENABLE_STRIDE) as usize;
                if (off - ENABLE_BASE) % ENABLE_STRIDE != 0 || ctx >= self.enable.len() {
                    return None;
                }
                // Source 0 is reserved and never enabled.
                self.enable[ctx] = val & !1;
                Some(())
            }
            _ if off >= CONTEXT_BASE => {
                let ctx = ((off - CONTEXT_BASE) / CONTEXT_STRIDE) as usize;
                if ctx >= self.threshold.len() {
                    return None;
                }
                match (off - CONTEXT_BASE) % CONTEXT_STRIDE {
                    0 => self.threshold[ctx] = val,
                    4 => self.complete(ctx, val),
                    _ => return None,
                }
                Some(())
            }
            _ => None,
        }
    }

    pub fn reset(&mut self) {
        *self = Plic::new(self.enable.len() / 2);
    }
}
