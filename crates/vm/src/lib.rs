//! RISC-V 64-bit virtual machine library
//!
//! Emulates a qemu-virt-style machine: RV64IMAC harts with Sv39 paging and
//! M/S/U privilege, a CLINT and PLIC for the trap fabric, a 16550 UART, and
//! VirtIO MMIO block/net/gpu devices, enough to boot an xv6-style kernel to
//! a shell over the serial line.
//!
//! The crate is a library: hosts construct a [`Machine`], feed bytes into
//! its UART/net queues, drive it with [`Machine::step`] or
//! [`Machine::run_batch`] (or spawn one thread per hart with
//! [`Machine::spawn_harts`]), and drain the outbound queues.
//!
//! ```no_run
//! use rv64vm::{Machine, MachineConfig};
//!
//! let image = std::fs::read("kernel.bin").unwrap();
//! let disk = std::fs::read("fs.img").ok();
//! let mut m = Machine::new(MachineConfig {
//!     image,
//!     disk,
//!     ..MachineConfig::default()
//! }).unwrap();
//! while !m.is_halted() {
//!     m.run_batch(100_000);
//!     while let Some(b) = m.uart_drain() {
//!         print!("{}", b as char);
//!     }
//! }
//! ```

pub mod bus;
pub mod csr;
pub mod devices;
pub mod hart;
pub mod loader;
pub mod machine;
pub mod mem;
pub mod mmu;
pub mod snapshot;
pub mod trap;

pub use bus::SystemBus;
pub use hart::{Hart, StepResult};
pub use machine::{Machine, MachineConfig};
pub use snapshot::Snapshot;
pub use trap::{Exception, Interrupt, Privilege};

use thiserror::Error;

/// Host-visible failures.
///
/// The guest itself can never produce one of these: any instruction
/// sequence is a retire, an architectural trap, or a halt. These surface
/// only from construction, image loading, snapshots, and host resource
/// limits.
#[derive(Debug, Error)]
pub enum VmError {
    /// Kernel image could not be parsed or does not fit in RAM.
    #[error("image load failed: {0}")]
    ImageLoad(String),
    /// Disk backing store is unusable (bad geometry, I/O error).
    #[error("disk backing error: {0}")]
    DiskBacking(String),
    /// Host-side resource limit (thread spawn, allocation).
    #[error("host resource exhausted: {0}")]
    HostResource(String),
    /// Snapshot serialization, validation, or I/O failure.
    #[error("snapshot error: {0}")]
    Snapshot(String),
}
