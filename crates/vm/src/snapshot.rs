//! Machine snapshots
//!
//! A deterministic capture of the architectural state: every hart (GPRs,
//! PC, privilege, CSRs), the interrupt fabric and UART, and RAM with a
//! SHA-256 integrity hash. Virtio devices are not captured; snapshot a
//! machine only while its queues are quiescent (no in-flight requests)
//! and in single-threaded mode. `bincode` handles the on-disk format.

use crate::devices::clint::ClintState;
use crate::devices::plic::Plic;
use crate::devices::uart::Uart;
use crate::hart::HartState;
use crate::machine::Machine;
use crate::VmError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::path::Path;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RamRegion {
    pub size: u64,
    /// SHA-256 of `data`, hex-encoded.
    pub hash: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub harts: Vec<HartState>,
    pub clint: ClintState,
    pub plic: Plic,
    pub uart: Uart,
    pub ram: RamRegion,
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

impl Machine {
    /// Capture the current architectural state.
    ///
    /// Single-threaded mode only; callers must not snapshot while hart
    /// threads are running.
    pub fn snapshot(&self) -> Result<Snapshot, VmError> {
        if self.parallel() {
            return Err(VmError::Snapshot(
                "cannot snapshot while hart threads run; join_harts() first".into(),
            ));
        }
        let bus = self.bus();
        let data = bus
            .ram
            .read_range(0, bus.ram.size())
            .map_err(|_| VmError::Snapshot("RAM read failed".into()))?;
        let hash = sha256_hex(&data);

        Ok(Snapshot {
            version: SNAPSHOT_VERSION,
            harts: (0..self.n_harts()).map(|i| self.hart(i).state()).collect(),
            clint: bus.clint.state(),
            plic: bus.plic.lock().unwrap().clone(),
            uart: bus.uart.lock().unwrap().clone(),
            ram: RamRegion {
                size: data.len() as u64,
                hash,
                data,
            },
        })
    }

    /// Restore a snapshot taken from a machine with identical geometry.
    pub fn restore(&mut self, snap: &Snapshot) -> Result<(), VmError> {
        if self.parallel() {
            return Err(VmError::Snapshot(
                "cannot restore while hart threads run; join_harts() first".into(),
            ));
        }
        if snap.version != SNAPSHOT_VERSION {
            return Err(VmError::Snapshot(format!(
                "version mismatch: expected {SNAPSHOT_VERSION}, found {}",
                snap.version
            )));
        }
        if snap.harts.len() != self.n_harts() {
            return Err(VmError::Snapshot(format!(
                "hart count mismatch: machine has {}, snapshot has {}",
                self.n_harts(),
                snap.harts.len()
            )));
        }
        let bus = self.bus();
        if snap.ram.size != bus.ram.size() as u64 || snap.ram.data.len() as u64 != snap.ram.size {
            return Err(VmError::Snapshot("RAM geometry mismatch".into()));
        }
        if sha256_hex(&snap.ram.data) != snap.ram.hash {
            return Err(VmError::Snapshot("RAM hash mismatch".into()));
        }

        bus.ram
            .load(&snap.ram.data, 0)
            .map_err(|_| VmError::Snapshot("RAM restore failed".into()))?;
        bus.clint.restore(&snap.clint);
        *bus.plic.lock().unwrap() = snap.plic.clone();
        *bus.uart.lock().unwrap() = snap.uart.clone();
        for (i, hs) in snap.harts.iter().enumerate() {
            self.hart_mut(i).restore(hs);
        }
        Ok(())
    }

    /// Serialize a snapshot to disk with bincode.
    pub fn save_snapshot_to_path<P: AsRef<Path>>(&self, path: P) -> Result<(), VmError> {
        let snap = self.snapshot()?;
        let file = File::create(path).map_err(|e| VmError::Snapshot(format!("create: {e}")))?;
        bincode::serialize_into(file, &snap)
            .map_err(|e| VmError::Snapshot(format!("serialize: {e}")))
    }

    /// Load a snapshot from disk and apply it.
    pub fn restore_snapshot_from_path<P: AsRef<Path>>(&mut self, path: P) -> Result<(), VmError> {
        let file = File::open(path).map_err(|e| VmError::Snapshot(format!("open: {e}")))?;
        let snap: Snapshot = bincode::deserialize_from(file)
            .map_err(|e| VmError::Snapshot(format!("deserialize: {e}")))?;
        self.restore(&snap)
    }
}
