//! VirtIO block device
//!
//! One request queue. Requests are the xv6-compatible shape: a 16-byte
//! header descriptor {type, reserved, sector}, one or more data
//! descriptors, and a single device-writable status byte which is written
//! only after the data transfer has completed. The backing store is a
//! host-provided byte vector addressed in 512-byte sectors; writes are
//! visible to subsequent reads on every hart because the image lives
//! behind the device lock.

use super::{Chain, Dma, MmioTransport, TransportEvent, DEVICE_ID_BLK};
use crate::VmError;

pub const SECTOR_SIZE: usize = 512;

// Request types.
const BLK_T_IN: u32 = 0; // device-to-guest (read)
const BLK_T_OUT: u32 = 1; // guest-to-device (write)

// Status byte values.
const BLK_S_OK: u8 = 0;
const BLK_S_IOERR: u8 = 1;
const BLK_S_UNSUPP: u8 = 2;

pub struct VirtioBlk {
    pub transport: MmioTransport,
    disk: Vec<u8>,
    /// Pristine copy for machine reset.
    pristine: Vec<u8>,
}

impl VirtioBlk {
    pub fn new(disk: Vec<u8>) -> Result<Self, VmError> {
        if disk.is_empty() {
            return Err(VmError::DiskBacking("empty disk image".into()));
        }
        if disk.len() % SECTOR_SIZE != 0 {
            return Err(VmError::DiskBacking(format!(
                "image length {} is not a multiple of {} bytes",
                disk.len(),
                SECTOR_SIZE
            )));
        }
        Ok(Self {
            transport: MmioTransport::new(DEVICE_ID_BLK, 0, 1),
            pristine: disk.clone(),
            disk,
        })
    }

    pub fn capacity_sectors(&self) -> u64 {
        (self.disk.len() / SECTOR_SIZE) as u64
    }

    /// Host-side view of the (possibly guest-modified) image.
    pub fn disk(&self) -> &[u8] {
        &self.disk
    }

    pub fn irq_pending(&self) -> bool {
        self.transport.irq_pending()
    }

    pub fn read(&mut self, off: u64, size: u8) -> Option<u64> {
        if off >= super::REG_CONFIG {
            // Config space: 64-bit capacity in sectors, any aligned width.
            let cap = self.capacity_sectors();
            let byte = (off - super::REG_CONFIG) as u32;
            if byte + size as u32 > 8 {
                return None;
            }
            let v = cap >> (8 * byte);
            return Some(match size {
                1 => v & 0xFF,
                2 => v & 0xFFFF,
                4 => v & 0xFFFF_FFFF,
                _ => v,
            });
        }
        if size != 4 {
            return None;
        }
        self.transport.read(off).map(u64::from)
    }

    pub fn write(&mut self, off: u64, size: u8, val: u64, dma: &Dma) -> Option<()> {
        if off >= super::REG_CONFIG {
            return Some(()); // config space is read-only; writes ignored
        }
        if size != 4 {
            return None;
        }
        match self.transport.write(off, val as u32)? {
            TransportEvent::Notify(q) if q == 0 => {
                self.process_queue(dma);
                Some(())
            }
            _ => Some(()),
        }
    }

    /// Walk every new avail-ring entry and execute it.
    fn process_queue(&mut self, dma: &Dma) {
        while let Some(chain) = self.transport.pop_avail(0, dma) {
            let written = self.execute(&chain, dma);
            self.transport.push_used(0, dma, chain.head, written);
        }
    }

    /// Execute one request chain. Returns the number of bytes the device
    /// wrote into the chain (data for reads, plus the status byte).
    fn execute(&mut self, chain: &Chain, dma: &Dma) -> u32 {
        let Some((status_desc, data_descs)) = split_chain(chain) else {
            log::warn!("virtio-blk: malformed descriptor chain, head {}", chain.head);
            return 0;
        };
        let header = &chain.descs[0];

        let status = self.transfer(header, data_descs, dma);
        let _ = dma.write_u8(status_desc.addr, status);

        let mut written = 1u32;
        if status == BLK_S_OK {
            written += data_descs
                .iter()
                .filter(|d| d.device_writes())
                .map(|d| d.len)
                .sum::<u32>();
        }
        written
    }

    fn transfer(&mut self, header: &super::VirtqDesc, data: &[super::VirtqDesc], dma: &Dma) -> u8 {
        if header.len < 16 {
            return BLK_S_IOERR;
        }
        let Ok(req_type) = dma.read_u32(header.addr) else {
            return BLK_S_IOERR;
        };
        let Ok(sector) = dma.read_u64(header.addr + 8) else {
            return BLK_S_IOERR;
        };

        let mut pos = match (sector as usize).checked_mul(SECTOR_SIZE) {
            Some(p) => p,
            None => return BLK_S_IOERR,
        };
        for d in data {
            let len = d.len as usize;
            if pos + len > self.disk.len() {
                log::warn!(
                    "virtio-blk: request past end of image (sector {}, len {})",
                    sector,
                    len
                );
                return BLK_S_IOERR;
            }
            let ok = match req_type {
                BLK_T_IN => dma.write_bytes(d.addr, &self.disk[pos..pos + len]).is_ok(),
                BLK_T_OUT => match dma.read_bytes(d.addr, len) {
                    Ok(bytes) => {
                        self.disk[pos..pos + len].copy_from_slice(&bytes);
                        true
                    }
                    Err(()) => false,
                },
                _ => return BLK_S_UNSUPP,
            };
            if !ok {
                return BLK_S_IOERR;
            }
            pos += len;
        }
        BLK_S_OK
    }

    pub fn reset(&mut self) {
        self.disk.copy_from_slice(&self.pristine);
        self.transport = MmioTransport::new(DEVICE_ID_BLK, 0, 1);
    }
}

/// A valid chain ends in exactly one device-writable status byte; the
/// descriptors between header and status carry the data.
fn split_chain(chain: &Chain) -> Option<(&super::VirtqDesc, &[super::VirtqDesc])> {
    if chain.descs.len() < 2 {
        return None;
    }
    let status = chain.descs.last()?;
    if !status.device_writes() || status.len < 1 {
        return None;
    }
    Some((status, &chain.descs[1..chain.descs.len() - 1]))
}

#[cfg(test)]
mod tests {
    use super::super::*;
    use super::*;
    use crate::mem::Ram;

    const BASE: u64 = 0x8000_0000;

    /// Lay out an 8-entry queue plus a request at fixed guest addresses
    /// and kick the device, returning (ram, device).
    fn run_request(req_type: u32, sector: u64, data_len: u32, payload: &[u8]) -> (Ram, VirtioBlk) {
        let ram = Ram::new(1 << 20);
        let mut blk = VirtioBlk::new(vec![0xAB; 4 * SECTOR_SIZE]).unwrap();
        if !payload.is_empty() {
            // Pre-seed the data buffer for OUT requests.
            ram.load(payload, 0x3000).unwrap();
        }

        let dma = Dma::new(&ram, BASE);
        let desc = BASE + 0x1000;
        let avail = BASE + 0x1100;
        let used = BASE + 0x1200;
        let header = BASE + 0x2000;
        let data = BASE + 0x3000;
        let status = BASE + 0x4000;

        // Request header.
        dma.write_u32(header, req_type).unwrap();
        dma.write_u32(header + 4, 0).unwrap();
        dma.write_u32(header + 8, sector as u32).unwrap();
        dma.write_u32(header + 12, (sector >> 32) as u32).unwrap();

        // Descriptor chain 0 -> 1 -> 2.
        let write_desc = |i: u64, addr: u64, len: u32, flags: u16, next: u16| {
            dma.write_u32(desc + 16 * i, addr as u32).unwrap();
            dma.write_u32(desc + 16 * i + 4, (addr >> 32) as u32).unwrap();
            dma.write_u32(desc + 16 * i + 8, len).unwrap();
            dma.write_u16(desc + 16 * i + 12, flags).unwrap();
            dma.write_u16(desc + 16 * i + 14, next).unwrap();
        };
        write_desc(0, header, 16, DESC_F_NEXT, 1);
        let data_flags = if req_type == BLK_T_IN {
            DESC_F_NEXT | DESC_F_WRITE
        } else {
            DESC_F_NEXT
        };
        write_desc(1, data, data_len, data_flags, 2);
        write_desc(2, status, 1, DESC_F_WRITE, 0);

        // Avail ring: one entry, head 0.
        dma.write_u16(avail + 4, 0).unwrap();
        dma.write_u16(avail + 2, 1).unwrap();

        // Program the v2 transport and kick.
        blk.write(REG_QUEUE_SEL, 4, 0, &dma).unwrap();
        blk.write(REG_QUEUE_NUM, 4, 8, &dma).unwrap();
        blk.write(REG_QUEUE_DESC_LOW, 4, desc, &dma).unwrap();
        blk.write(REG_QUEUE_DRIVER_LOW, 4, avail, &dma).unwrap();
        blk.write(REG_QUEUE_DEVICE_LOW, 4, used, &dma).unwrap();
        blk.write(REG_QUEUE_READY, 4, 1, &dma).unwrap();
        blk.write(REG_QUEUE_NOTIFY, 4, 0, &dma).unwrap();

        (ram, blk)
    }

    #[test]
    fn test_read_request_copies_image_to_guest() {
        let (ram, blk) = run_request(BLK_T_IN, 1, SECTOR_SIZE as u32, &[]);
        let dma = Dma::new(&ram, BASE);

        // Data buffer now holds the image sector; status byte is OK.
        let got = dma.read_bytes(BASE + 0x3000, SECTOR_SIZE).unwrap();
        assert!(got.iter().all(|&b| b == 0xAB));
        assert_eq!(dma.read_bytes(BASE + 0x4000, 1).unwrap()[0], BLK_S_OK);

        // Used ring advanced with the full written length.
        assert_eq!(dma.read_u16(BASE + 0x1200 + 2).unwrap(), 1);
        assert_eq!(dma.read_u32(BASE + 0x1200 + 4).unwrap(), 0); // head id
        assert_eq!(
            dma.read_u32(BASE + 0x1200 + 8).unwrap(),
            SECTOR_SIZE as u32 + 1
        );
        assert!(blk.irq_pending());
    }

    #[test]
    fn test_write_request_updates_image() {
        let payload = vec![0x5A; SECTOR_SIZE];
        let (ram, blk) = run_request(BLK_T_OUT, 2, SECTOR_SIZE as u32, &payload);
        let dma = Dma::new(&ram, BASE);

        assert_eq!(dma.read_bytes(BASE + 0x4000, 1).unwrap()[0], BLK_S_OK);
        assert!(blk.disk()[2 * SECTOR_SIZE..3 * SECTOR_SIZE]
            .iter()
            .all(|&b| b == 0x5A));
        // Only the status byte counts as device-written for OUT.
        assert_eq!(dma.read_u32(BASE + 0x1200 + 8).unwrap(), 1);
    }

    #[test]
    fn test_out_of_range_sector_fails() {
        let (ram, _blk) = run_request(BLK_T_IN, 100, SECTOR_SIZE as u32, &[]);
        let dma = Dma::new(&ram, BASE);
        assert_eq!(dma.read_bytes(BASE + 0x4000, 1).unwrap()[0], BLK_S_IOERR);
    }

    #[test]
    fn test_capacity_in_config_space() {
        let mut blk = VirtioBlk::new(vec![0; 8 * SECTOR_SIZE]).unwrap();
        assert_eq!(blk.read(REG_CONFIG, 8).unwrap(), 8);
        assert_eq!(blk.read(REG_CONFIG, 4).unwrap(), 8);
        assert_eq!(blk.read(REG_CONFIG + 4, 4).unwrap(), 0);
    }

    #[test]
    fn test_bad_geometry_rejected() {
        assert!(VirtioBlk::new(vec![]).is_err());
        assert!(VirtioBlk::new(vec![0; 100]).is_err());
    }
}
