//! Kernel image loading
//!
//! Accepts either an ELF64-RISCV executable or a raw flat binary. ELF
//! loading walks the program headers and copies every `PT_LOAD` segment to
//! its physical address, zero-extending `.bss`; the entry point comes from
//! `e_entry`. Raw images land at the DRAM base and enter there.

use crate::bus::{SystemBus, DRAM_BASE};
use crate::VmError;
use goblin::elf::{program_header::PT_LOAD, Elf};

/// Load an image into RAM and return the entry PC.
pub fn load_image(bus: &SystemBus, image: &[u8]) -> Result<u64, VmError> {
    if image.starts_with(b"\x7FELF") {
        load_elf(bus, image)
    } else {
        bus.ram
            .load(image, 0)
            .map_err(|_| VmError::ImageLoad(format!("raw image ({} bytes) exceeds RAM", image.len())))?;
        Ok(DRAM_BASE)
    }
}

fn load_elf(bus: &SystemBus, image: &[u8]) -> Result<u64, VmError> {
    let elf = Elf::parse(image).map_err(|e| VmError::ImageLoad(format!("ELF parse: {e}")))?;
    let dram_end = DRAM_BASE + bus.ram.size() as u64;

    for ph in &elf.program_headers {
        if ph.p_type != PT_LOAD || ph.p_memsz == 0 {
            continue;
        }
        let file_size = ph.p_filesz as usize;
        let mem_size = ph.p_memsz as usize;
        let file_offset = ph.p_offset as usize;
        if file_offset + file_size > image.len() {
            return Err(VmError::ImageLoad(format!(
                "segment at file offset {file_offset:#x} exceeds file bounds"
            )));
        }

        // Physical address wins when the linker provides one.
        let target = if ph.p_paddr != 0 { ph.p_paddr } else { ph.p_vaddr };
        if target < DRAM_BASE {
            return Err(VmError::ImageLoad(format!(
                "segment start {target:#x} below DRAM base {DRAM_BASE:#x}"
            )));
        }
        let seg_end = target
            .checked_add(mem_size as u64)
            .ok_or_else(|| VmError::ImageLoad("segment end overflows".into()))?;
        if seg_end > dram_end {
            return Err(VmError::ImageLoad(format!(
                "segment {target:#x}..{seg_end:#x} exceeds DRAM end {dram_end:#x}"
            )));
        }

        let off = (target - DRAM_BASE) as usize;
        if file_size > 0 {
            bus.ram
                .load(&image[file_offset..file_offset + file_size], off)
                .map_err(|_| VmError::ImageLoad("segment copy failed".into()))?;
        }
        if mem_size > file_size {
            bus.ram
                .zero_range(off + file_size, mem_size - file_size)
                .map_err(|_| VmError::ImageLoad("bss zeroing failed".into()))?;
        }
        log::debug!(
            "loader: segment paddr={:#x} filesz={:#x} memsz={:#x}",
            target,
            file_size,
            mem_size
        );
    }

    log::debug!("loader: entry {:#x}", elf.entry);
    Ok(elf.entry)
}
