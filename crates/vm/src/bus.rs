//! System bus
//!
//! Routes physical addresses to RAM or the owning device and carries the
//! cross-hart pieces of the memory model: the LR/SC reservation table and
//! the polled IRQ lines. The bus is the sole owner of the RAM backing
//! buffer and of every device; harts borrow it for the duration of a step,
//! and in parallel mode it is shared behind an `Arc` with each device
//! guarded by its own small lock (MMIO-only critical sections).

use crate::devices::clint::Clint;
use crate::devices::finisher::Finisher;
use crate::devices::plic::Plic;
use crate::devices::uart::Uart;
use crate::devices::virtio::blk::VirtioBlk;
use crate::devices::virtio::gpu::VirtioGpu;
use crate::devices::virtio::net::VirtioNet;
use crate::devices::virtio::Dma;
use crate::devices::{IRQ_UART, IRQ_VIRTIO_BLK, IRQ_VIRTIO_GPU, IRQ_VIRTIO_NET};
use crate::mem::Ram;
use crate::trap::Exception;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

// Physical memory map (qemu-virt wiring).
pub const NULL_BASE: u64 = 0x0000_0000;
pub const NULL_SIZE: u64 = 0x1000;
pub const FINISHER_BASE: u64 = 0x0010_0000;
pub const FINISHER_SIZE: u64 = 0x1000;
pub const CLINT_BASE: u64 = 0x0200_0000;
pub const CLINT_SIZE: u64 = 0x1_0000;
pub const PLIC_BASE: u64 = 0x0C00_0000;
pub const PLIC_SIZE: u64 = 0x40_0000;
pub const UART0_BASE: u64 = 0x1000_0000;
pub const UART0_SIZE: u64 = 0x100;
pub const VIRTIO_BLK_BASE: u64 = 0x1000_1000;
pub const VIRTIO_NET_BASE: u64 = 0x1000_2000;
pub const VIRTIO_GPU_BASE: u64 = 0x1000_3000;
pub const VIRTIO_SLOT_SIZE: u64 = 0x1000;
pub const DRAM_BASE: u64 = 0x8000_0000;

/// One hart's load reservation: address and access width.
type Reservation = Option<(u64, u8)>;

/// Shared LR/SC bookkeeping. `sc` must never succeed when a competing
/// store intervened, so stores that might overlap a reservation and the
/// `sc` itself serialize on the slot lock; the atomic active-count keeps
/// the common no-reservation store on a lock-free fast path.
struct ReservationTable {
    active: AtomicUsize,
    slots: Mutex<Vec<Reservation>>,
}

impl ReservationTable {
    fn new(n_harts: usize) -> Self {
        Self {
            active: AtomicUsize::new(0),
            slots: Mutex::new(vec![None; n_harts]),
        }
    }

    fn overlaps(r: &Reservation, addr: u64, len: u8) -> bool {
        match r {
            Some((ra, rl)) => addr < ra + *rl as u64 && *ra < addr + len as u64,
            None => false,
        }
    }
}

pub struct SystemBus {
    pub ram: Ram,
    pub clint: Clint,
    pub finisher: Finisher,
    pub plic: Mutex<Plic>,
    pub uart: Mutex<Uart>,
    pub blk: Option<Mutex<VirtioBlk>>,
    pub net: Option<Mutex<VirtioNet>>,
    pub gpu: Option<Mutex<VirtioGpu>>,
    reservations: ReservationTable,
}

impl SystemBus {
    pub fn new(
        ram_size: usize,
        n_harts: usize,
        blk: Option<VirtioBlk>,
        net: Option<VirtioNet>,
        gpu: Option<VirtioGpu>,
    ) -> Self {
        Self {
            ram: Ram::new(ram_size),
            clint: Clint::new(n_harts),
            finisher: Finisher::new(),
            plic: Mutex::new(Plic::new(n_harts)),
            uart: Mutex::new(Uart::new()),
            blk: blk.map(Mutex::new),
            net: net.map(Mutex::new),
            gpu: gpu.map(Mutex::new),
            reservations: ReservationTable::new(n_harts),
        }
    }

    fn dma(&self) -> Dma {
        Dma::new(&self.ram, DRAM_BASE)
    }

    #[inline]
    fn ram_offset(&self, addr: u64, size: u8) -> Option<usize> {
        let off = addr.checked_sub(DRAM_BASE)?;
        let end = off.checked_add(size as u64)?;
        if end > self.ram.size() as u64 {
            return None;
        }
        Some(off as usize)
    }

    /// Physical read. `size` is 1, 2, 4, or 8; the address is naturally
    /// aligned (the hart faults misaligned accesses before routing).
    pub fn read(&self, addr: u64, size: u8) -> Result<u64, Exception> {
        if let Some(off) = self.ram_offset(addr, size) {
            let v = match size {
                1 => self.ram.read_u8(off) as u64,
                2 => self.ram.read_u16(off) as u64,
                4 => self.ram.read_u32(off) as u64,
                _ => self.ram.read_u64(off),
            };
            return Ok(v);
        }
        self.mmio_read(addr, size)
            .ok_or(Exception::LoadAccessFault(addr))
    }

    /// Physical write. Stores into RAM invalidate overlapping LR
    /// reservations on every hart.
    pub fn write(&self, addr: u64, size: u8, val: u64) -> Result<(), Exception> {
        if let Some(off) = self.ram_offset(addr, size) {
            if self.reservations.active.load(Ordering::Acquire) != 0 {
                let mut slots = self.reservations.slots.lock().unwrap();
                self.clear_overlapping(&mut slots, addr, size);
                self.ram_store(off, size, val);
            } else {
                self.ram_store(off, size, val);
            }
            return Ok(());
        }
        self.mmio_write(addr, size, val)
            .ok_or(Exception::StoreAccessFault(addr))
    }

    fn ram_store(&self, off: usize, size: u8, val: u64) {
        match size {
            1 => self.ram.write_u8(off, val as u8),
            2 => self.ram.write_u16(off, val as u16),
            4 => self.ram.write_u32(off, val as u32),
            _ => self.ram.write_u64(off, val),
        }
    }

    fn clear_overlapping(&self, slots: &mut [Reservation], addr: u64, size: u8) {
        for slot in slots.iter_mut() {
            if ReservationTable::overlaps(slot, addr, size) {
                *slot = None;
                self.reservations.active.fetch_sub(1, Ordering::Release);
            }
        }
    }

    /// Load-reserved: read the word and register a reservation for it.
    pub fn load_reserved(&self, hart: usize, addr: u64, size: u8) -> Result<u64, Exception> {
        let off = self
            .ram_offset(addr, size)
            .ok_or(Exception::LoadAccessFault(addr))?;
        let mut slots = self.reservations.slots.lock().unwrap();
        if slots[hart].is_none() {
            self.reservations.active.fetch_add(1, Ordering::Release);
        }
        slots[hart] = Some((addr, size));
        Ok(match size {
            4 => self.ram.read_u32(off) as u64,
            _ => self.ram.read_u64(off),
        })
    }

    /// Store-conditional: 0 on success, 1 on failure. The reservation is
    /// consumed either way, and a successful store invalidates overlapping
    /// reservations held by other harts.
    pub fn store_conditional(
        &self,
        hart: usize,
        addr: u64,
        size: u8,
        val: u64,
    ) -> Result<u64, Exception> {
        let off = self
            .ram_offset(addr, size)
            .ok_or(Exception::StoreAccessFault(addr))?;
        let mut slots = self.reservations.slots.lock().unwrap();
        let ok = slots[hart] == Some((addr, size));
        if slots[hart].is_some() {
            slots[hart] = None;
            self.reservations.active.fetch_sub(1, Ordering::Release);
        }
        if !ok {
            return Ok(1);
        }
        self.clear_overlapping(&mut slots, addr, size);
        self.ram_store(off, size, val);
        Ok(0)
    }

    /// Drop a hart's reservation (taken trap, context switch).
    pub fn clear_reservation(&self, hart: usize) {
        let mut slots = self.reservations.slots.lock().unwrap();
        if slots[hart].take().is_some() {
            self.reservations.active.fetch_sub(1, Ordering::Release);
        }
    }

    /// Atomic read-modify-write for the AMO instructions. Counts as a
    /// store for reservation invalidation.
    pub fn amo<F: Fn(u64) -> u64>(&self, addr: u64, size: u8, f: F) -> Result<u64, Exception> {
        let off = self
            .ram_offset(addr, size)
            .ok_or(Exception::StoreAccessFault(addr))?;
        let _slots = if self.reservations.active.load(Ordering::Acquire) != 0 {
            let mut slots = self.reservations.slots.lock().unwrap();
            self.clear_overlapping(&mut slots, addr, size);
            Some(slots)
        } else {
            None
        };
        Ok(match size {
            4 => self.ram.amo_u32(off, |v| f(v as u64) as u32) as u64,
            _ => self.ram.amo_u64(off, f),
        })
    }

    fn mmio_read(&self, addr: u64, size: u8) -> Option<u64> {
        match addr {
            _ if (NULL_BASE..NULL_BASE + NULL_SIZE).contains(&addr) => Some(0),
            _ if (FINISHER_BASE..FINISHER_BASE + FINISHER_SIZE).contains(&addr) => {
                if size != 4 {
                    return None;
                }
                self.finisher.read(addr - FINISHER_BASE).map(u64::from)
            }
            _ if (CLINT_BASE..CLINT_BASE + CLINT_SIZE).contains(&addr) => {
                if size != 4 && size != 8 {
                    return None;
                }
                self.clint.read(addr - CLINT_BASE, size)
            }
            _ if (PLIC_BASE..PLIC_BASE + PLIC_SIZE).contains(&addr) => {
                if size != 4 {
                    return None;
                }
                let mut plic = self.plic.lock().unwrap();
                plic.read(addr - PLIC_BASE).map(u64::from)
            }
            _ if (UART0_BASE..UART0_BASE + UART0_SIZE).contains(&addr) => {
                if size != 1 {
                    return None;
                }
                // RBR/IIR reads change the interrupt condition; resync.
                let v = { self.uart.lock().unwrap().read(addr - UART0_BASE) };
                self.sync_plic_line(IRQ_UART);
                v.map(u64::from)
            }
            _ if (VIRTIO_BLK_BASE..VIRTIO_BLK_BASE + VIRTIO_SLOT_SIZE).contains(&addr) => {
                let dev = self.blk.as_ref()?;
                dev.lock().unwrap().read(addr - VIRTIO_BLK_BASE, size)
            }
            _ if (VIRTIO_NET_BASE..VIRTIO_NET_BASE + VIRTIO_SLOT_SIZE).contains(&addr) => {
                let dev = self.net.as_ref()?;
                dev.lock().unwrap().read(addr - VIRTIO_NET_BASE, size)
            }
            _ if (VIRTIO_GPU_BASE..VIRTIO_GPU_BASE + VIRTIO_SLOT_SIZE).contains(&addr) => {
                let dev = self.gpu.as_ref()?;
                dev.lock().unwrap().read(addr - VIRTIO_GPU_BASE, size)
            }
            _ => None,
        }
    }

    fn mmio_write(&self, addr: u64, size: u8, val: u64) -> Option<()> {
        match addr {
            // Null page: writes ignored on this platform.
            _ if (NULL_BASE..NULL_BASE + NULL_SIZE).contains(&addr) => Some(()),
            _ if (FINISHER_BASE..FINISHER_BASE + FINISHER_SIZE).contains(&addr) => {
                if size != 4 {
                    return None;
                }
                self.finisher.write(addr - FINISHER_BASE, val as u32)
            }
            _ if (CLINT_BASE..CLINT_BASE + CLINT_SIZE).contains(&addr) => {
                if size != 4 && size != 8 {
                    return None;
                }
                self.clint.write(addr - CLINT_BASE, size, val)
            }
            _ if (PLIC_BASE..PLIC_BASE + PLIC_SIZE).contains(&addr) => {
                if size != 4 {
                    return None;
                }
                let mut plic = self.plic.lock().unwrap();
                plic.write(addr - PLIC_BASE, val as u32)
            }
            _ if (UART0_BASE..UART0_BASE + UART0_SIZE).contains(&addr) => {
                if size != 1 {
                    return None;
                }
                let r = { self.uart.lock().unwrap().write(addr - UART0_BASE, val as u8) };
                self.sync_plic_line(IRQ_UART);
                r
            }
            _ if (VIRTIO_BLK_BASE..VIRTIO_BLK_BASE + VIRTIO_SLOT_SIZE).contains(&addr) => {
                let dev = self.blk.as_ref()?;
                let r = dev
                    .lock()
                    .unwrap()
                    .write(addr - VIRTIO_BLK_BASE, size, val, &self.dma());
                self.sync_plic_line(IRQ_VIRTIO_BLK);
                r
            }
            _ if (VIRTIO_NET_BASE..VIRTIO_NET_BASE + VIRTIO_SLOT_SIZE).contains(&addr) => {
                let dev = self.net.as_ref()?;
                let r = dev
                    .lock()
                    .unwrap()
                    .write(addr - VIRTIO_NET_BASE, size, val, &self.dma());
                self.sync_plic_line(IRQ_VIRTIO_NET);
                r
            }
            _ if (VIRTIO_GPU_BASE..VIRTIO_GPU_BASE + VIRTIO_SLOT_SIZE).contains(&addr) => {
                let dev = self.gpu.as_ref()?;
                let r = dev
                    .lock()
                    .unwrap()
                    .write(addr - VIRTIO_GPU_BASE, size, val, &self.dma());
                self.sync_plic_line(IRQ_VIRTIO_GPU);
                r
            }
            _ => None,
        }
    }

    /// Mirror one device's interrupt line into the PLIC.
    fn sync_plic_line(&self, src: u32) {
        let level = match src {
            IRQ_UART => self.uart.lock().unwrap().irq_pending(),
            IRQ_VIRTIO_BLK => self
                .blk
                .as_ref()
                .map_or(false, |d| d.lock().unwrap().irq_pending()),
            IRQ_VIRTIO_NET => self
                .net
                .as_ref()
                .map_or(false, |d| d.lock().unwrap().irq_pending()),
            IRQ_VIRTIO_GPU => self
                .gpu
                .as_ref()
                .map_or(false, |d| d.lock().unwrap().irq_pending()),
            _ => return,
        };
        self.plic.lock().unwrap().set_level(src, level);
    }

    /// Poll every device IRQ line into the PLIC and give queued RX frames
    /// a chance to land in posted buffers. Called between quanta.
    pub fn poll_irqs(&self) {
        if let Some(net) = self.net.as_ref() {
            net.lock().unwrap().deliver_rx(&self.dma());
        }
        let uart = self.uart.lock().unwrap().irq_pending();
        let blk = self
            .blk
            .as_ref()
            .map_or(false, |d| d.lock().unwrap().irq_pending());
        let net = self
            .net
            .as_ref()
            .map_or(false, |d| d.lock().unwrap().irq_pending());
        let gpu = self
            .gpu
            .as_ref()
            .map_or(false, |d| d.lock().unwrap().irq_pending());
        let mut plic = self.plic.lock().unwrap();
        plic.set_level(IRQ_UART, uart);
        plic.set_level(IRQ_VIRTIO_BLK, blk);
        plic.set_level(IRQ_VIRTIO_NET, net);
        plic.set_level(IRQ_VIRTIO_GPU, gpu);
    }

    /// External interrupt lines for a hart: (M-context, S-context).
    pub fn external_lines(&self, hart: usize) -> (bool, bool) {
        let plic = self.plic.lock().unwrap();
        (plic.irq_line(2 * hart), plic.irq_line(2 * hart + 1))
    }

    /// Reset everything except the disk pristine copy held by the block
    /// device (which restores itself).
    pub fn reset(&self) {
        self.ram.clear();
        self.clint.reset();
        self.finisher.reset();
        self.plic.lock().unwrap().reset();
        self.uart.lock().unwrap().reset();
        if let Some(d) = self.blk.as_ref() {
            d.lock().unwrap().reset();
        }
        if let Some(d) = self.net.as_ref() {
            d.lock().unwrap().reset();
        }
        if let Some(d) = self.gpu.as_ref() {
            d.lock().unwrap().reset();
        }
        let mut slots = self.reservations.slots.lock().unwrap();
        slots.iter_mut().for_each(|s| *s = None);
        self.reservations.active.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus() -> SystemBus {
        SystemBus::new(1 << 20, 2, None, None, None)
    }

    #[test]
    fn test_ram_routing() {
        let b = bus();
        b.write(DRAM_BASE + 16, 8, 0x0123_4567_89AB_CDEF).unwrap();
        assert_eq!(b.read(DRAM_BASE + 16, 8).unwrap(), 0x0123_4567_89AB_CDEF);
        assert_eq!(b.read(DRAM_BASE + 16, 1).unwrap(), 0xEF);
    }

    #[test]
    fn test_unmapped_access_faults() {
        let b = bus();
        assert_eq!(
            b.read(0x4000_0000, 4),
            Err(Exception::LoadAccessFault(0x4000_0000))
        );
        assert_eq!(
            b.write(0x4000_0000, 4, 0),
            Err(Exception::StoreAccessFault(0x4000_0000))
        );
        // Past the end of RAM.
        let end = DRAM_BASE + (1 << 20);
        assert_eq!(b.read(end, 4), Err(Exception::LoadAccessFault(end)));
        // Wrap-around addresses fault instead of overflowing.
        assert_eq!(
            b.read(u64::MAX, 1),
            Err(Exception::LoadAccessFault(u64::MAX))
        );
    }

    #[test]
    fn test_null_page_reads_zero() {
        let b = bus();
        assert_eq!(b.read(0x0, 4).unwrap(), 0);
        assert!(b.write(0x800, 4, 0xFFFF).is_ok());
        assert_eq!(b.read(0x800, 4).unwrap(), 0);
    }

    #[test]
    fn test_width_mismatch_is_access_fault() {
        let b = bus();
        assert!(b.read(UART0_BASE, 4).is_err());
        assert!(b.write(CLINT_BASE, 1, 0).is_err());
        assert!(b.read(PLIC_BASE, 8).is_err());
    }

    #[test]
    fn test_missing_device_faults() {
        let b = bus();
        assert!(b.read(VIRTIO_BLK_BASE, 4).is_err());
        assert!(b.read(VIRTIO_NET_BASE, 4).is_err());
    }

    #[test]
    fn test_sc_without_reservation_fails() {
        let b = bus();
        assert_eq!(b.store_conditional(0, DRAM_BASE, 8, 1).unwrap(), 1);
    }

    #[test]
    fn test_lr_sc_roundtrip() {
        let b = bus();
        b.write(DRAM_BASE + 64, 8, 7).unwrap();
        assert_eq!(b.load_reserved(0, DRAM_BASE + 64, 8).unwrap(), 7);
        assert_eq!(b.store_conditional(0, DRAM_BASE + 64, 8, 9).unwrap(), 0);
        assert_eq!(b.read(DRAM_BASE + 64, 8).unwrap(), 9);
        // Reservation consumed by the successful sc.
        assert_eq!(b.store_conditional(0, DRAM_BASE + 64, 8, 11).unwrap(), 1);
    }

    #[test]
    fn test_store_by_other_hart_kills_reservation() {
        let b = bus();
        b.load_reserved(0, DRAM_BASE + 64, 8).unwrap();
        // A one-byte store inside the reserved doubleword.
        b.write(DRAM_BASE + 67, 1, 0xFF).unwrap();
        assert_eq!(b.store_conditional(0, DRAM_BASE + 64, 8, 1).unwrap(), 1);
    }

    #[test]
    fn test_adjacent_store_keeps_reservation() {
        let b = bus();
        b.load_reserved(0, DRAM_BASE + 64, 4).unwrap();
        b.write(DRAM_BASE + 68, 4, 0xFF).unwrap();
        assert_eq!(b.store_conditional(0, DRAM_BASE + 64, 4, 1).unwrap(), 0);
    }

    #[test]
    fn test_amo_kills_reservation() {
        let b = bus();
        b.load_reserved(1, DRAM_BASE + 128, 4).unwrap();
        b.amo(DRAM_BASE + 128, 4, |v| v + 1).unwrap();
        assert_eq!(b.store_conditional(1, DRAM_BASE + 128, 4, 5).unwrap(), 1);
    }

    #[test]
    fn test_sc_address_mismatch_fails_and_consumes() {
        let b = bus();
        b.load_reserved(0, DRAM_BASE + 64, 8).unwrap();
        assert_eq!(b.store_conditional(0, DRAM_BASE + 72, 8, 1).unwrap(), 1);
        assert_eq!(b.store_conditional(0, DRAM_BASE + 64, 8, 1).unwrap(), 1);
    }

    #[test]
    fn test_finisher_halts_machine() {
        let b = bus();
        b.write(FINISHER_BASE, 4, 0x5555).unwrap();
        assert!(b.finisher.halted());
        assert_eq!(b.finisher.halt_code(), 0x5555);
    }
}
