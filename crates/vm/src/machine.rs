//! Machine orchestrator
//!
//! Owns the harts and the bus, loads the kernel image, and drives
//! execution in one of two equivalent modes:
//!
//! - **Single-threaded round-robin** ([`Machine::step`] /
//!   [`Machine::run_batch`]): each hart executes one instruction per round
//!   in ascending hart-id order; given identical inputs the interleaving
//!   is deterministic.
//! - **Parallel SMP** ([`Machine::spawn_harts`]): each hart runs on a
//!   dedicated host thread against the shared bus; inter-hart ordering
//!   comes only from the ISA primitives (atomic RAM, AMOs, LR/SC,
//!   fences).
//!
//! Host I/O is queue-based in both modes: bytes in/out of the UART,
//! frames in/out of the virtio-net device. The host never blocks a hart
//! and a hart never blocks on the host.

use crate::bus::SystemBus;
use crate::devices::virtio::blk::VirtioBlk;
use crate::devices::virtio::gpu::VirtioGpu;
use crate::devices::virtio::net::VirtioNet;
use crate::hart::{Hart, StepResult};
use crate::{loader, VmError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Default RAM size: 128 MiB.
pub const DEFAULT_RAM_SIZE: usize = 128 * 1024 * 1024;

/// MAC assigned to the virtio-net device when none is given.
pub const DEFAULT_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];

/// Construction parameters for a [`Machine`].
pub struct MachineConfig {
    /// Kernel image, ELF64 or raw flat binary.
    pub image: Vec<u8>,
    pub ram_size: usize,
    pub n_harts: usize,
    /// Block device backing image (512-byte-sector granular).
    pub disk: Option<Vec<u8>>,
    /// Attach a virtio-net device.
    pub net: bool,
    pub mac: [u8; 6],
    /// Attach a virtio-gpu device with this display geometry.
    pub gpu: Option<(u32, u32)>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            image: Vec::new(),
            ram_size: DEFAULT_RAM_SIZE,
            n_harts: 1,
            disk: None,
            net: false,
            mac: DEFAULT_MAC,
            gpu: None,
        }
    }
}

/// Host-side coordination flags shared with hart threads.
struct SharedState {
    halt_requested: AtomicBool,
}

/// Hart 0 comes up running at the entry; secondaries park in WFI with the
/// machine software interrupt enabled in `mie`, so hart 0's `msip` write
/// through the CLINT is the start signal. Global interrupt enables stay
/// off, so the woken hart falls through the WFI into the entry code
/// rather than vectoring.
fn parked_hart(id: usize, entry: u64) -> Hart {
    let mut hart = Hart::new(id, entry);
    if id != 0 {
        hart.wfi = true;
        hart.csrs.mie = crate::csr::IRQ_MSIP;
    }
    hart
}

pub struct Machine {
    bus: Arc<SystemBus>,
    /// Harts, ascending id. Empty while parallel threads own them.
    harts: Vec<Hart>,
    threads: Vec<JoinHandle<Hart>>,
    shared: Arc<SharedState>,
    /// Pristine image and entry for reset.
    image: Vec<u8>,
    entry: u64,
    n_harts: usize,
}

impl Machine {
    /// Build the machine: allocate RAM, attach devices, load the image,
    /// and park secondary harts in WFI until hart 0 wakes them (the
    /// conventional start signal is a software interrupt through the
    /// CLINT `msip` registers).
    pub fn new(config: MachineConfig) -> Result<Self, VmError> {
        if config.n_harts == 0 {
            return Err(VmError::HostResource("at least one hart required".into()));
        }
        let blk = config.disk.map(VirtioBlk::new).transpose()?;
        let net = config.net.then(|| VirtioNet::new(config.mac));
        let gpu = config.gpu.map(|(w, h)| VirtioGpu::new(w, h));
        let bus = Arc::new(SystemBus::new(config.ram_size, config.n_harts, blk, net, gpu));

        let entry = loader::load_image(&bus, &config.image)?;
        let mut harts = Vec::with_capacity(config.n_harts);
        for id in 0..config.n_harts {
            harts.push(parked_hart(id, entry));
        }
        log::info!(
            "machine: {} hart(s), {} MiB RAM, entry {:#x}",
            config.n_harts,
            config.ram_size >> 20,
            entry
        );

        Ok(Self {
            bus,
            harts,
            threads: Vec::new(),
            shared: Arc::new(SharedState {
                halt_requested: AtomicBool::new(false),
            }),
            image: config.image,
            entry,
            n_harts: config.n_harts,
        })
    }

    pub fn n_harts(&self) -> usize {
        self.n_harts
    }

    pub fn entry_pc(&self) -> u64 {
        self.entry
    }

    pub fn bus(&self) -> &SystemBus {
        &self.bus
    }

    /// Architectural state of a hart (single-threaded mode only).
    pub fn hart(&self, id: usize) -> &Hart {
        &self.harts[id]
    }

    pub fn hart_mut(&mut self, id: usize) -> &mut Hart {
        &mut self.harts[id]
    }

    /// Guest-initiated halt?
    pub fn is_halted(&self) -> bool {
        self.bus.finisher.halted()
    }

    /// Raw 16-bit code the guest wrote to the shutdown MMIO word.
    pub fn halt_code(&self) -> u16 {
        self.bus.finisher.halt_code()
    }

    /// Ask every hart to stop at its next quantum boundary.
    pub fn request_halt(&self) {
        self.shared.halt_requested.store(true, Ordering::Release);
    }

    /// One round-robin quantum: each hart runs exactly one instruction in
    /// ascending hart-id order, with device IRQ lines polled first.
    /// Returns the step results per hart.
    pub fn step(&mut self) -> Vec<StepResult> {
        debug_assert!(
            self.threads.is_empty(),
            "step() is the single-threaded mode; join_harts() first"
        );
        self.bus.poll_irqs();
        let mut results = Vec::with_capacity(self.harts.len());
        for hart in &mut self.harts {
            results.push(hart.step(&self.bus));
        }
        if self.bus.finisher.take_reset_request() {
            self.reset();
        }
        results
    }

    /// Execute up to `n` instructions per hart, stopping early on guest
    /// halt or a host halt request. Returns the number of rounds run.
    pub fn run_batch(&mut self, n: u64) -> u64 {
        for i in 0..n {
            if self.is_halted() || self.shared.halt_requested.load(Ordering::Acquire) {
                return i;
            }
            self.step();
        }
        n
    }

    /// Switch to parallel SMP mode: move every hart onto its own host
    /// thread. Harts come back via [`Machine::join_harts`].
    pub fn spawn_harts(&mut self) -> Result<(), VmError> {
        for hart in self.harts.drain(..) {
            let bus = Arc::clone(&self.bus);
            let shared = Arc::clone(&self.shared);
            let handle = thread::Builder::new()
                .name(format!("hart-{}", hart.id))
                .spawn(move || hart_thread(hart, bus, shared))
                .map_err(|e| VmError::HostResource(format!("thread spawn: {e}")))?;
            self.threads.push(handle);
        }
        Ok(())
    }

    /// True while hart threads own the cores.
    pub fn parallel(&self) -> bool {
        !self.threads.is_empty()
    }

    /// Wait for every hart thread to stop (guest halt or
    /// [`Machine::request_halt`]) and take the harts back.
    pub fn join_harts(&mut self) {
        for handle in self.threads.drain(..) {
            match handle.join() {
                Ok(hart) => self.harts.push(hart),
                Err(e) => log::error!("machine: hart thread panicked: {e:?}"),
            }
        }
        self.harts.sort_by_key(|h| h.id);
    }

    /// Restore power-on state: RAM re-zeroed, image reloaded, devices and
    /// harts reset (the disk returns to its pristine contents). Identical
    /// I/O replayed after a reset reproduces identical UART output.
    pub fn reset(&mut self) {
        debug_assert!(self.threads.is_empty(), "join_harts() before reset");
        log::info!("machine: reset");
        self.bus.reset();
        // The image loaded at construction; a reload cannot fail now.
        let entry = loader::load_image(&self.bus, &self.image).expect("reset reload");
        for hart in &mut self.harts {
            *hart = parked_hart(hart.id, entry);
        }
        self.shared.halt_requested.store(false, Ordering::Release);
    }

    // Host I/O queues.

    /// Feed one byte into the UART receive queue.
    pub fn uart_input(&self, byte: u8) {
        self.bus.uart.lock().unwrap().push_input(byte);
    }

    /// Drain one transmitted UART byte.
    pub fn uart_drain(&self) -> Option<u8> {
        self.bus.uart.lock().unwrap().pop_output()
    }

    /// Drain every transmitted UART byte.
    pub fn uart_drain_all(&self) -> Vec<u8> {
        self.bus.uart.lock().unwrap().drain_output()
    }

    /// Queue one Ethernet frame for the guest. No-op without a net device.
    pub fn net_inject(&self, frame: Vec<u8>) {
        if let Some(net) = self.bus.net.as_ref() {
            net.lock().unwrap().inject(frame);
        }
    }

    /// Take one frame the guest transmitted.
    pub fn net_extract(&self) -> Option<Vec<u8>> {
        self.bus.net.as_ref()?.lock().unwrap().extract()
    }

    /// Copy of the scanned-out framebuffer, if a GPU is attached and the
    /// guest configured a scanout.
    pub fn gpu_framebuffer(&self) -> Option<(u32, u32, Vec<u8>)> {
        let gpu = self.bus.gpu.as_ref()?;
        let gpu = gpu.lock().unwrap();
        let (w, h, px) = gpu.framebuffer()?;
        Some((w, h, px.to_vec()))
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        self.request_halt();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Dedicated-thread hart loop for the parallel mode.
///
/// Device IRQ polling batches to keep MMIO locks off the hot path; a hart
/// sitting in WFI polls every iteration and yields so an idle guest does
/// not burn a host core.
fn hart_thread(mut hart: Hart, bus: Arc<SystemBus>, shared: Arc<SharedState>) -> Hart {
    const IRQ_POLL_INTERVAL: u64 = 64;
    const HALT_CHECK_INTERVAL: u64 = 4096;

    let mut steps: u64 = 0;
    loop {
        if steps % IRQ_POLL_INTERVAL == 0 {
            bus.poll_irqs();
        }
        if steps % HALT_CHECK_INTERVAL == 0
            && (shared.halt_requested.load(Ordering::Relaxed) || bus.finisher.halted())
        {
            break;
        }
        steps = steps.wrapping_add(1);

        match hart.step(&bus) {
            StepResult::Retired | StepResult::TrapTaken => {}
            StepResult::Wfi => {
                bus.poll_irqs();
                thread::yield_now();
            }
            StepResult::Halted(code) => {
                log::info!("hart{}: guest halt, code {:#06x}", hart.id, code);
                break;
            }
        }
    }
    log::debug!("hart{}: thread exit after {} steps", hart.id, steps);
    hart
}
