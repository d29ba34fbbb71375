//! Physical memory
//!
//! A flat byte-addressable region shared by every hart. The backing buffer
//! is allocated as `u64` words so that any naturally aligned 1/2/4/8-byte
//! access can be performed through a host atomic of the same width, which
//! is enough for RVWMO: plain accesses are Relaxed, AMOs are SeqCst, and
//! guest `fence` maps to a host fence.
//!
//! Offsets here are RAM-relative; the bus subtracts the DRAM base before
//! calling in and guarantees bounds and natural alignment.

use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};

pub struct Ram {
    words: Box<[AtomicU64]>,
    size: usize,
}

impl Ram {
    /// Allocate zero-initialised RAM. The size is rounded up to a multiple
    /// of 8 so every aligned u64 slot exists.
    pub fn new(size: usize) -> Self {
        let n_words = size.div_ceil(8);
        let mut v = Vec::with_capacity(n_words);
        v.resize_with(n_words, || AtomicU64::new(0));
        Self {
            words: v.into_boxed_slice(),
            size: n_words * 8,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    #[inline(always)]
    fn base_ptr(&self) -> *const u8 {
        self.words.as_ptr() as *const u8
    }

    // SAFETY invariants for the pointer casts below:
    // - `off + width <= self.size` (checked by the caller, debug-asserted
    //   here), so the access stays inside the allocation;
    // - `off` is a multiple of the access width, so the cast target is
    //   properly aligned for its atomic type;
    // - the buffer lives as long as `self`, and all concurrent access goes
    //   through these same atomics.

    #[inline(always)]
    pub fn read_u8(&self, off: usize) -> u8 {
        debug_assert!(off < self.size);
        unsafe { (*(self.base_ptr().add(off) as *const AtomicU8)).load(Ordering::Relaxed) }
    }

    #[inline(always)]
    pub fn read_u16(&self, off: usize) -> u16 {
        debug_assert!(off % 2 == 0 && off + 2 <= self.size);
        unsafe { (*(self.base_ptr().add(off) as *const AtomicU16)).load(Ordering::Relaxed) }
    }

    #[inline(always)]
    pub fn read_u32(&self, off: usize) -> u32 {
        debug_assert!(off % 4 == 0 && off + 4 <= self.size);
        unsafe { (*(self.base_ptr().add(off) as *const AtomicU32)).load(Ordering::Relaxed) }
    }

    #[inline(always)]
    pub fn read_u64(&self, off: usize) -> u64 {
        debug_assert!(off % 8 == 0 && off + 8 <= self.size);
        unsafe { (*(self.base_ptr().add(off) as *const AtomicU64)).load(Ordering::Relaxed) }
    }

    #[inline(always)]
    pub fn write_u8(&self, off: usize, val: u8) {
        debug_assert!(off < self.size);
        unsafe { (*(self.base_ptr().add(off) as *const AtomicU8)).store(val, Ordering::Relaxed) }
    }

    #[inline(always)]
    pub fn write_u16(&self, off: usize, val: u16) {
        debug_assert!(off % 2 == 0 && off + 2 <= self.size);
        unsafe { (*(self.base_ptr().add(off) as *const AtomicU16)).store(val, Ordering::Relaxed) }
    }

    #[inline(always)]
    pub fn write_u32(&self, off: usize, val: u32) {
        debug_assert!(off % 4 == 0 && off + 4 <= self.size);
        unsafe { (*(self.base_ptr().add(off) as *const AtomicU32)).store(val, Ordering::Relaxed) }
    }

    #[inline(always)]
    pub fn write_u64(&self, off: usize, val: u64) {
        debug_assert!(off % 8 == 0 && off + 8 <= self.size);
        unsafe { (*(self.base_ptr().add(off) as *const AtomicU64)).store(val, Ordering::Relaxed) }
    }

    /// 32-bit atomic read-modify-write for the AMO instructions. SeqCst:
    /// AMOs are sequentially consistent with respect to each other.
    #[inline]
    pub fn amo_u32<F: Fn(u32) -> u32>(&self, off: usize, f: F) -> u32 {
        debug_assert!(off % 4 == 0 && off + 4 <= self.size);
        let a = unsafe { &*(self.base_ptr().add(off) as *const AtomicU32) };
        let mut cur = a.load(Ordering::SeqCst);
        loop {
            match a.compare_exchange_weak(cur, f(cur), Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return cur,
                Err(v) => cur = v,
            }
        }
    }

    /// 64-bit atomic read-modify-write for the AMO instructions.
    #[inline]
    pub fn amo_u64<F: Fn(u64) -> u64>(&self, off: usize, f: F) -> u64 {
        debug_assert!(off % 8 == 0 && off + 8 <= self.size);
        let a = unsafe { &*(self.base_ptr().add(off) as *const AtomicU64) };
        let mut cur = a.load(Ordering::SeqCst);
        loop {
            match a.compare_exchange_weak(cur, f(cur), Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return cur,
                Err(v) => cur = v,
            }
        }
    }

    /// Copy host bytes into RAM (image loading, device DMA).
    pub fn load(&self, data: &[u8], off: usize) -> Result<(), ()> {
        if off.checked_add(data.len()).map_or(true, |end| end > self.size) {
            return Err(());
        }
        for (i, &b) in data.iter().enumerate() {
            self.write_u8(off + i, b);
        }
        Ok(())
    }

    /// Zero a range (bss extension).
    pub fn zero_range(&self, off: usize, len: usize) -> Result<(), ()> {
        if off.checked_add(len).map_or(true, |end| end > self.size) {
            return Err(());
        }
        for i in 0..len {
            self.write_u8(off + i, 0);
        }
        Ok(())
    }

    /// Copy a range out to the host (snapshots, device DMA).
    pub fn read_range(&self, off: usize, len: usize) -> Result<Vec<u8>, ()> {
        if off.checked_add(len).map_or(true, |end| end > self.size) {
            return Err(());
        }
        Ok((0..len).map(|i| self.read_u8(off + i)).collect())
    }

    /// Zero the whole region (machine reset).
    pub fn clear(&self) {
        for w in self.words.iter() {
            w.store(0, Ordering::Relaxed);
        }
    }
}
