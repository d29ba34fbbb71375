//! VirtIO GPU device
//!
//! Control queue only (queue 0; the cursor queue 1 is accepted and
//! completed without effect). Implements the minimal 2D command set a
//! simple framebuffer guest uses: display info, resource create, backing
//! attach, scanout select, transfer, flush. The host reads the rendered
//! RGBA framebuffer with [`VirtioGpu::framebuffer`].

use super::{Chain, Dma, MmioTransport, TransportEvent, DEVICE_ID_GPU};
use std::collections::HashMap;

// Control command/response types.
const CMD_GET_DISPLAY_INFO: u32 = 0x0100;
const CMD_RESOURCE_CREATE_2D: u32 = 0x0101;
const CMD_SET_SCANOUT: u32 = 0x0103;
const CMD_RESOURCE_FLUSH: u32 = 0x0104;
const CMD_TRANSFER_TO_HOST_2D: u32 = 0x0105;
const CMD_RESOURCE_ATTACH_BACKING: u32 = 0x0106;
const RESP_OK_NODATA: u32 = 0x1100;
const RESP_OK_DISPLAY_INFO: u32 = 0x1101;
const RESP_ERR_UNSPEC: u32 = 0x1200;
const RESP_ERR_INVALID_RESOURCE_ID: u32 = 0x1204;

/// Control header prefixed to every command and response.
const CTRL_HDR_LEN: usize = 24;

const BYTES_PER_PIXEL: usize = 4;

struct Resource {
    width: u32,
    height: u32,
    /// RGBA pixels, host side.
    pixels: Vec<u8>,
    /// Guest-physical backing entries (addr, len).
    backing: Vec<(u64, u32)>,
}

pub struct VirtioGpu {
    pub transport: MmioTransport,
    width: u32,
    height: u32,
    resources: HashMap<u32, Resource>,
    scanout_resource: u32,
    /// Bumped on every RESOURCE_FLUSH so hosts can cheaply poll.
    flush_count: u64,
}

impl VirtioGpu {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            transport: MmioTransport::new(DEVICE_ID_GPU, 0, 2),
            width,
            height,
            resources: HashMap::new(),
            scanout_resource: 0,
            flush_count: 0,
        }
    }

    pub fn irq_pending(&self) -> bool {
        self.transport.irq_pending()
    }

    pub fn flush_count(&self) -> u64 {
        self.flush_count
    }

    /// The scanned-out framebuffer, if the guest has configured one.
    pub fn framebuffer(&self) -> Option<(u32, u32, &[u8])> {
        let r = self.resources.get(&self.scanout_resource)?;
        Some((r.width, r.height, &r.pixels))
    }

    pub fn read(&mut self, off: u64, size: u8) -> Option<u64> {
        if off >= super::REG_CONFIG {
            // Config space: events_read, events_clear, num_scanouts.
            if size != 4 {
                return None;
            }
            return match off - super::REG_CONFIG {
                0 | 4 => Some(0),
                8 => Some(1),
                _ => None,
            };
        }
        if size != 4 {
            return None;
        }
        self.transport.read(off).map(u64::from)
    }

    pub fn write(&mut self, off: u64, size: u8, val: u64, dma: &Dma) -> Option<()> {
        if off >= super::REG_CONFIG {
            return Some(());
        }
        if size != 4 {
            return None;
        }
        match self.transport.write(off, val as u32)? {
            TransportEvent::Notify(q) => {
                self.process_queue(q as usize, dma);
                Some(())
            }
            TransportEvent::None => Some(()),
        }
    }

    fn process_queue(&mut self, queue: usize, dma: &Dma) {
        if queue > 1 {
            return;
        }
        while let Some(chain) = self.transport.pop_avail(queue, dma) {
            let written = if queue == 0 {
                self.execute(&chain, dma)
            } else {
                0 // cursor queue: complete without effect
            };
            self.transport.push_used(queue, dma, chain.head, written);
        }
    }

    /// Execute one control command; returns bytes written for the used
    /// ring entry.
    fn execute(&mut self, chain: &Chain, dma: &Dma) -> u32 {
        let Some(req) = chain.descs.first().filter(|d| !d.device_writes()) else {
            return 0;
        };
        let Some(resp) = chain.descs.iter().find(|d| d.device_writes()) else {
            return 0;
        };
        let Ok(cmd) = dma.read_u32(req.addr) else {
            return 0;
        };

        let (resp_type, payload) = match cmd {
            CMD_GET_DISPLAY_INFO => (RESP_OK_DISPLAY_INFO, self.display_info()),
            CMD_RESOURCE_CREATE_2D => (self.resource_create(req.addr, dma), Vec::new()),
            CMD_RESOURCE_ATTACH_BACKING => (self.attach_backing(req.addr, dma), Vec::new()),
            CMD_SET_SCANOUT => (self.set_scanout(req.addr, dma), Vec::new()),
            CMD_TRANSFER_TO_HOST_2D => (self.transfer(req.addr, dma), Vec::new()),
            CMD_RESOURCE_FLUSH => {
                self.flush_count += 1;
                (RESP_OK_NODATA, Vec::new())
            }
            other => {
                log::warn!("virtio-gpu: unhandled command {:#06x}", other);
                (RESP_ERR_UNSPEC, Vec::new())
            }
        };

        let mut out = vec![0u8; CTRL_HDR_LEN + payload.len()];
        out[0..4].copy_from_slice(&resp_type.to_le_bytes());
        out[CTRL_HDR_LEN..].copy_from_slice(&payload);
        let n = out.len().min(resp.len as usize);
        if dma.write_bytes(resp.addr, &out[..n]).is_err() {
            return 0;
        }
        n as u32
    }

    /// RESP_OK_DISPLAY_INFO body: 16 pmodes of {rect, enabled, flags};
    /// only scanout 0 is populated.
    fn display_info(&self) -> Vec<u8> {
        let mut body = vec![0u8; 16 * 24];
        body[8..12].copy_from_slice(&self.width.to_le_bytes());
        body[12..16].copy_from_slice(&self.height.to_le_bytes());
        body[16..20].copy_from_slice(&1u32.to_le_bytes()); // enabled
        body
    }

    fn resource_create(&mut self, req: u64, dma: &Dma) -> u32 {
        let hdr = req + CTRL_HDR_LEN as u64;
        let (Ok(id), Ok(_format), Ok(w), Ok(h)) = (
            dma.read_u32(hdr),
            dma.read_u32(hdr + 4),
            dma.read_u32(hdr + 8),
            dma.read_u32(hdr + 12),
        ) else {
            return RESP_ERR_UNSPEC;
        };
        if id == 0 || w == 0 || h == 0 || w > 16384 || h > 16384 {
            return RESP_ERR_INVALID_RESOURCE_ID;
        }
        self.resources.insert(
            id,
            Resource {
                width: w,
                height: h,
                pixels: vec![0; w as usize * h as usize * BYTES_PER_PIXEL],
                backing: Vec::new(),
            },
        );
        RESP_OK_NODATA
    }

    fn attach_backing(&mut self, req: u64, dma: &Dma) -> u32 {
        let hdr = req + CTRL_HDR_LEN as u64;
        let (Ok(id), Ok(nr)) = (dma.read_u32(hdr), dma.read_u32(hdr + 4)) else {
            return RESP_ERR_UNSPEC;
        };
        let Some(res) = self.resources.get_mut(&id) else {
            return RESP_ERR_INVALID_RESOURCE_ID;
        };
        res.backing.clear();
        // Entries follow the request body: {addr u64, length u32, pad u32}.
        for i in 0..nr.min(64) as u64 {
            let e = hdr + 8 + 16 * i;
            let (Ok(addr), Ok(len)) = (dma.read_u64(e), dma.read_u32(e + 8)) else {
                return RESP_ERR_UNSPEC;
            };
            res.backing.push((addr, len));
        }
        RESP_OK_NODATA
    }

    fn set_scanout(&mut self, req: u64, dma: &Dma) -> u32 {
        // Body: rect (16 bytes), scanout_id, resource_id.
        let hdr = req + CTRL_HDR_LEN as u64;
        let Ok(id) = dma.read_u32(hdr + 20) else {
            return RESP_ERR_UNSPEC;
        };
        if id != 0 && !self.resources.contains_key(&id) {
            return RESP_ERR_INVALID_RESOURCE_ID;
        }
        self.scanout_resource = id;
        RESP_OK_NODATA
    }

    /// Copy the guest backing pages into the host-side pixel buffer for
    /// the requested rectangle.
    fn transfer(&mut self, req: u64, dma: &Dma) -> u32 {
        let hdr = req + CTRL_HDR_LEN as u64;
        let (Ok(rx), Ok(ry), Ok(rw), Ok(rh), Ok(offset), Ok(id)) = (
            dma.read_u32(hdr),
            dma.read_u32(hdr + 4),
            dma.read_u32(hdr + 8),
            dma.read_u32(hdr + 12),
            dma.read_u64(hdr + 16),
            dma.read_u32(hdr + 24),
        ) else {
            return RESP_ERR_UNSPEC;
        };
        let Some(res) = self.resources.get_mut(&id) else {
            return RESP_ERR_INVALID_RESOURCE_ID;
        };
        if rx as u64 + rw as u64 > res.width as u64 || ry as u64 + rh as u64 > res.height as u64 {
            return RESP_ERR_UNSPEC;
        }

        let stride = res.width as usize * BYTES_PER_PIXEL;
        for row in 0..rh as usize {
            let row_bytes = rw as usize * BYTES_PER_PIXEL;
            let src_off = offset as usize + row * stride + rx as usize * BYTES_PER_PIXEL;
            let Some(src) = read_backing(&res.backing, dma, src_off, row_bytes) else {
                return RESP_ERR_UNSPEC;
            };
            let dst = (ry as usize + row) * stride + rx as usize * BYTES_PER_PIXEL;
            res.pixels[dst..dst + row_bytes].copy_from_slice(&src);
        }
        RESP_OK_NODATA
    }

    pub fn reset(&mut self) {
        let (w, h) = (self.width, self.height);
        *self = VirtioGpu::new(w, h);
    }
}

/// Read `len` bytes starting at logical offset `off` within a scattered
/// backing list.
fn read_backing(backing: &[(u64, u32)], dma: &Dma, mut off: usize, len: usize) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(len);
    let mut iter = backing.iter();
    let (mut addr, mut seg_len) = loop {
        let &(a, l) = iter.next()?;
        if off < l as usize {
            break (a + off as u64, l as usize - off);
        }
        off -= l as usize;
    };
    while out.len() < len {
        let n = seg_len.min(len - out.len());
        out.extend(dma.read_bytes(addr, n).ok()?);
        if out.len() == len {
            break;
        }
        let &(a, l) = iter.next()?;
        addr = a;
        seg_len = l as usize;
    }
    Some(out)
}
