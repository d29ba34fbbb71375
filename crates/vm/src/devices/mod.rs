//! Memory-mapped peripherals
//!
//! Each device exposes `read`/`write` over its register window (offsets are
//! window-relative, widths already validated against the device's rules by
//! the bus) plus whatever host-side surface it needs. IRQ wiring follows
//! the polled-line model: a device reports its level via `irq_pending()`
//! and the bus mirrors that into the PLIC; devices hold no reference back
//! into the interrupt fabric.

pub mod clint;
pub mod finisher;
pub mod plic;
pub mod uart;
pub mod virtio;

/// PLIC source numbers on this platform (qemu-virt wiring).
pub const IRQ_VIRTIO_BLK: u32 = 1;
pub const IRQ_VIRTIO_NET: u32 = 2;
pub const IRQ_VIRTIO_GPU: u32 = 3;
pub const IRQ_UART: u32 = 10;
