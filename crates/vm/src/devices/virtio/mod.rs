//! VirtIO MMIO transport and split-virtqueue machinery
//!
//! Device side of the transport the guest drivers in xv6-style kernels
//! program. The device reports version 2 and implements the v2 register
//! set (QueueDesc/Driver/Device + QueueReady); legacy GuestPageSize /
//! QueueAlign / QueuePFN writes are also honored, with the split-ring
//! layout derived from the PFN, so both driver generations land on the
//! same `QueueConfig`. Only the split-queue subset those drivers exercise
//! is implemented; indirect descriptors and event suppression are not.

pub mod blk;
pub mod gpu;
pub mod net;

use crate::mem::Ram;
use serde::{Deserialize, Serialize};

pub const VIRTIO_MAGIC: u32 = 0x7472_6976; // "virt"
pub const VIRTIO_VERSION: u32 = 2;
pub const VIRTIO_VENDOR: u32 = 0x554D_4551; // "QEMU"

pub const DEVICE_ID_NET: u32 = 1;
pub const DEVICE_ID_BLK: u32 = 2;
pub const DEVICE_ID_GPU: u32 = 16;

// Register offsets.
pub const REG_MAGIC: u64 = 0x000;
pub const REG_VERSION: u64 = 0x004;
pub const REG_DEVICE_ID: u64 = 0x008;
pub const REG_VENDOR_ID: u64 = 0x00C;
pub const REG_DEVICE_FEATURES: u64 = 0x010;
pub const REG_DEVICE_FEATURES_SEL: u64 = 0x014;
pub const REG_DRIVER_FEATURES: u64 = 0x020;
pub const REG_DRIVER_FEATURES_SEL: u64 = 0x024;
pub const REG_GUEST_PAGE_SIZE: u64 = 0x028; // legacy
pub const REG_QUEUE_SEL: u64 = 0x030;
pub const REG_QUEUE_NUM_MAX: u64 = 0x034;
pub const REG_QUEUE_NUM: u64 = 0x038;
pub const REG_QUEUE_ALIGN: u64 = 0x03C; // legacy
pub const REG_QUEUE_PFN: u64 = 0x040; // legacy
pub const REG_QUEUE_READY: u64 = 0x044;
pub const REG_QUEUE_NOTIFY: u64 = 0x050;
pub const REG_INTERRUPT_STATUS: u64 = 0x060;
pub const REG_INTERRUPT_ACK: u64 = 0x064;
pub const REG_STATUS: u64 = 0x070;
pub const REG_QUEUE_DESC_LOW: u64 = 0x080;
pub const REG_QUEUE_DESC_HIGH: u64 = 0x084;
pub const REG_QUEUE_DRIVER_LOW: u64 = 0x090;
pub const REG_QUEUE_DRIVER_HIGH: u64 = 0x094;
pub const REG_QUEUE_DEVICE_LOW: u64 = 0x0A0;
pub const REG_QUEUE_DEVICE_HIGH: u64 = 0x0A4;
pub const REG_CONFIG_GENERATION: u64 = 0x0FC;
pub const REG_CONFIG: u64 = 0x100;

/// InterruptStatus bit 0: used ring updated.
pub const INT_USED_RING: u32 = 1 << 0;

// Descriptor flags.
pub const DESC_F_NEXT: u16 = 1;
pub const DESC_F_WRITE: u16 = 2;

/// Largest queue size a device here advertises.
pub const QUEUE_NUM_MAX: u32 = 8;

/// One split-virtqueue descriptor as laid out in guest memory.
#[derive(Debug, Clone, Copy)]
pub struct VirtqDesc {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

impl VirtqDesc {
    pub fn device_writes(&self) -> bool {
        self.flags & DESC_F_WRITE != 0
    }
}

/// Driver-programmed state of one virtqueue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueConfig {
    pub num: u32,
    pub ready: bool,
    desc: u64,
    driver: u64,
    device: u64,
    // Legacy layout inputs.
    align: u32,
    pfn: u32,
    guest_page_size: u32,
    /// Next avail ring slot this device will look at.
    pub last_avail_idx: u16,
}

impl QueueConfig {
    fn legacy(&self) -> bool {
        self.pfn != 0
    }

    pub fn active(&self) -> bool {
        (self.ready || self.legacy()) && self.num != 0
    }

    pub fn desc_addr(&self) -> u64 {
        if self.legacy() {
            self.pfn as u64 * self.guest_page_size.max(4096) as u64
        } else {
            self.desc
        }
    }

    pub fn avail_addr(&self) -> u64 {
        if self.legacy() {
            self.desc_addr() + 16 * self.num as u64
        } else {
            self.driver
        }
    }

    pub fn used_addr(&self) -> u64 {
        if self.legacy() {
            // Used ring starts at the next align boundary after the
            // avail ring (flags + idx + ring + used_event).
            let end = self.avail_addr() + 6 + 2 * self.num as u64;
            let align = self.align.max(4) as u64;
            (end + align - 1) & !(align - 1)
        } else {
            self.device
        }
    }
}

/// Guest-physical-memory accessor for device DMA. All virtqueue traffic
/// goes through RAM; addresses outside it are malformed driver state and
/// surface as `Err(())` so the device can fail the request.
pub struct Dma<'a> {
    ram: &'a Ram,
    base: u64,
}

impl<'a> Dma<'a> {
    pub fn new(ram: &'a Ram, base: u64) -> Self {
        Self { ram, base }
    }

    fn off(&self, pa: u64, len: u64) -> Result<usize, ()> {
        let o = pa.checked_sub(self.base).ok_or(())?;
        if o.checked_add(len).map_or(true, |end| end > self.ram.size() as u64) {
            return Err(());
        }
        Ok(o as usize)
    }

    pub fn read_u16(&self, pa: u64) -> Result<u16, ()> {
        Ok(self.ram.read_u16(self.off(pa, 2)?))
    }

    pub fn read_u32(&self, pa: u64) -> Result<u32, ()> {
        Ok(self.ram.read_u32(self.off(pa, 4)?))
    }

    pub fn read_u64(&self, pa: u64) -> Result<u64, ()> {
        Ok(self.ram.read_u64(self.off(pa, 8)?))
    }

    pub fn write_u8(&self, pa: u64, v: u8) -> Result<(), ()> {
        self.ram.write_u8(self.off(pa, 1)?, v);
        Ok(())
    }

    pub fn write_u16(&self, pa: u64, v: u16) -> Result<(), ()> {
        self.ram.write_u16(self.off(pa, 2)?, v);
        Ok(())
    }

    pub fn write_u32(&self, pa: u64, v: u32) -> Result<(), ()> {
        self.ram.write_u32(self.off(pa, 4)?, v);
        Ok(())
    }

    pub fn read_bytes(&self, pa: u64, len: usize) -> Result<Vec<u8>, ()> {
        let o = self.off(pa, len as u64)?;
        self.ram.read_range(o, len)
    }

    pub fn write_bytes(&self, pa: u64, data: &[u8]) -> Result<(), ()> {
        let o = self.off(pa, data.len() as u64)?;
        self.ram.load(data, o)
    }
}

/// A descriptor chain popped from the avail ring.
pub struct Chain {
    pub head: u16,
    pub descs: Vec<VirtqDesc>,
}

impl Chain {
    /// Total length of the device-writable descriptors.
    pub fn writable_len(&self) -> u32 {
        self.descs
            .iter()
            .filter(|d| d.device_writes())
            .map(|d| d.len)
            .sum()
    }
}

/// Common MMIO state shared by every virtio device model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MmioTransport {
    device_id: u32,
    device_features: u64,
    driver_features: u64,
    device_features_sel: u32,
    driver_features_sel: u32,
    queue_sel: u32,
    pub queues: Vec<QueueConfig>,
    pub status: u32,
    pub interrupt_status: u32,
    guest_page_size: u32,
}

/// Side effect of an MMIO write the owning device must act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    None,
    /// Driver kicked the given queue.
    Notify(u32),
}

impl MmioTransport {
    pub fn new(device_id: u32, device_features: u64, n_queues: usize) -> Self {
        Self {
            device_id,
            device_features,
            driver_features: 0,
            device_features_sel: 0,
            driver_features_sel: 0,
            queue_sel: 0,
            queues: vec![QueueConfig::default(); n_queues],
            status: 0,
            interrupt_status: 0,
            guest_page_size: 4096,
        }
    }

    pub fn irq_pending(&self) -> bool {
        self.interrupt_status != 0
    }

    /// Raise the used-ring interrupt condition.
    pub fn signal_used(&mut self) {
        self.interrupt_status |= INT_USED_RING;
    }

    fn sel_queue(&mut self) -> Option<&mut QueueConfig> {
        self.queues.get_mut(self.queue_sel as usize)
    }

    /// Read a common register. Offsets at or above `REG_CONFIG` are the
    /// owning device's responsibility and return `None` here.
    pub fn read(&self, off: u64) -> Option<u32> {
        let v = match off {
            REG_MAGIC => VIRTIO_MAGIC,
            REG_VERSION => VIRTIO_VERSION,
            REG_DEVICE_ID => self.device_id,
            REG_VENDOR_ID => VIRTIO_VENDOR,
            REG_DEVICE_FEATURES => {
                (self.device_features >> (32 * self.device_features_sel.min(1))) as u32
            }
            REG_QUEUE_NUM_MAX => QUEUE_NUM_MAX,
            REG_QUEUE_PFN => self.queues.get(self.queue_sel as usize).map_or(0, |q| q.pfn),
            REG_QUEUE_READY => {
                self.queues.get(self.queue_sel as usize).map_or(0, |q| q.ready as u32)
            }
            REG_INTERRUPT_STATUS => self.interrupt_status,
            REG_STATUS => self.status,
            REG_CONFIG_GENERATION => 0,
            _ => return None,
        };
        Some(v)
    }

    /// Write a common register.
    pub fn write(&mut self, off: u64, val: u32) -> Option<TransportEvent> {
        match off {
            REG_DEVICE_FEATURES_SEL => self.device_features_sel = val,
            REG_DRIVER_FEATURES => {
                let shift = 32 * self.driver_features_sel.min(1);
                self.driver_features =
                    (self.driver_features & !(0xFFFF_FFFF << shift)) | (val as u64) << shift;
            }
            REG_DRIVER_FEATURES_SEL => self.driver_features_sel = val,
            REG_GUEST_PAGE_SIZE => self.guest_page_size = val,
            REG_QUEUE_SEL => self.queue_sel = val,
            REG_QUEUE_NUM => {
                if let Some(q) = self.sel_queue() {
                    q.num = val.min(QUEUE_NUM_MAX);
                }
            }
            REG_QUEUE_ALIGN => {
                if let Some(q) = self.sel_queue() {
                    q.align = val;
                }
            }
            REG_QUEUE_PFN => {
                let page = self.guest_page_size;
                if let Some(q) = self.sel_queue() {
                    q.pfn = val;
                    q.guest_page_size = page;
                }
            }
            REG_QUEUE_READY => {
                if let Some(q) = self.sel_queue() {
                    q.ready = val & 1 != 0;
                }
            }
            REG_QUEUE_NOTIFY => return Some(TransportEvent::Notify(val)),
            REG_INTERRUPT_ACK => self.interrupt_status &= !val,
            REG_STATUS => {
                // Writing zero resets the device.
                if val == 0 {
                    let (id, features, n) =
                        (self.device_id, self.device_features, self.queues.len());
                    *self = MmioTransport::new(id, features, n);
                } else {
                    self.status = val;
                }
            }
            REG_QUEUE_DESC_LOW => self.set_addr(off, val),
            REG_QUEUE_DESC_HIGH => self.set_addr(off, val),
            REG_QUEUE_DRIVER_LOW => self.set_addr(off, val),
            REG_QUEUE_DRIVER_HIGH => self.set_addr(off, val),
            REG_QUEUE_DEVICE_LOW => self.set_addr(off, val),
            REG_QUEUE_DEVICE_HIGH => self.set_addr(off, val),
            _ => return None,
        }
        Some(TransportEvent::None)
    }

    fn set_addr(&mut self, off: u64, val: u32) {
        let Some(q) = self.queues.get_mut(self.queue_sel as usize) else {
            return;
        };
        let field = match off {
            REG_QUEUE_DESC_LOW | REG_QUEUE_DESC_HIGH => &mut q.desc,
            REG_QUEUE_DRIVER_LOW | REG_QUEUE_DRIVER_HIGH => &mut q.driver,
            _ => &mut q.device,
        };
        if off & 4 == 0 {
            *field = (*field & !0xFFFF_FFFF) | val as u64;
        } else {
            *field = (*field & 0xFFFF_FFFF) | (val as u64) << 32;
        }
    }

    /// Pop the next available descriptor chain from a queue, if any.
    pub fn pop_avail(&mut self, queue: usize, dma: &Dma) -> Option<Chain> {
        let q = self.queues.get_mut(queue)?;
        if !q.active() {
            return None;
        }
        let avail = q.avail_addr();
        let idx = dma.read_u16(avail + 2).ok()?;
        if idx == q.last_avail_idx {
            return None;
        }
        let slot = q.last_avail_idx % q.num as u16;
        let head = dma.read_u16(avail + 4 + 2 * slot as u64).ok()?;
        q.last_avail_idx = q.last_avail_idx.wrapping_add(1);

        let mut descs = Vec::new();
        let mut di = head;
        // Chains longer than the queue imply a next-field loop; stop there.
        for _ in 0..q.num {
            let base = q.desc_addr() + 16 * di as u64;
            let desc = VirtqDesc {
                addr: dma.read_u64(base).ok()?,
                len: dma.read_u32(base + 8).ok()?,
                flags: dma.read_u16(base + 12).ok()?,
                next: dma.read_u16(base + 14).ok()?,
            };
            let has_next = desc.flags & DESC_F_NEXT != 0;
            let next = desc.next;
            descs.push(desc);
            if !has_next {
                break;
            }
            di = next;
        }
        Some(Chain { head, descs })
    }

    /// Append a finished chain to the used ring and bump `used.idx`.
    pub fn push_used(&mut self, queue: usize, dma: &Dma, head: u16, len: u32) {
        let Some(q) = self.queues.get(queue) else {
            return;
        };
        let used = q.used_addr();
        let Ok(idx) = dma.read_u16(used + 2) else {
            return;
        };
        let slot = idx % q.num as u16;
        let elem = used + 4 + 8 * slot as u64;
        let _ = dma.write_u32(elem, head as u32);
        let _ = dma.write_u32(elem + 4, len);
        let _ = dma.write_u16(used + 2, idx.wrapping_add(1));
        self.signal_used();
    }
}
