//! VirtIO network device
//!
//! Queue 0 receives, queue 1 transmits. Every frame on the wire side is a
//! raw Ethernet frame (no FCS); on the guest side each buffer carries the
//! 12-byte virtio-net header first, per the legacy framing. The host feeds
//! frames in through `inject` and drains transmitted frames with
//! `extract`; pending RX frames are copied into posted buffers whenever
//! the driver kicks the RX queue or the machine polls the device.

use super::{Dma, MmioTransport, TransportEvent, DEVICE_ID_NET};
use std::collections::VecDeque;

/// Legacy virtio-net header: flags, gso_type, hdr_len, gso_size,
/// csum_start, csum_offset, num_buffers.
pub const NET_HDR_LEN: usize = 12;

/// Device feature bit: a stable MAC is provided in config space.
const F_MAC: u64 = 1 << 5;

const QUEUE_RX: u32 = 0;
const QUEUE_TX: u32 = 1;

/// Frames queued in either direction before the oldest is dropped.
const FRAME_QUEUE_LIMIT: usize = 256;

pub struct VirtioNet {
    pub transport: MmioTransport,
    mac: [u8; 6],
    /// Host -> guest frames awaiting RX buffers.
    rx_frames: VecDeque<Vec<u8>>,
    /// Guest -> host frames awaiting extraction.
    tx_frames: VecDeque<Vec<u8>>,
}

impl VirtioNet {
    pub fn new(mac: [u8; 6]) -> Self {
        Self {
            transport: MmioTransport::new(DEVICE_ID_NET, F_MAC, 2),
            mac,
            rx_frames: VecDeque::new(),
            tx_frames: VecDeque::new(),
        }
    }

    pub fn irq_pending(&self) -> bool {
        self.transport.irq_pending()
    }

    /// Host queues an inbound Ethernet frame.
    pub fn inject(&mut self, frame: Vec<u8>) {
        if self.rx_frames.len() >= FRAME_QUEUE_LIMIT {
            log::warn!("virtio-net: RX queue full, dropping oldest frame");
            self.rx_frames.pop_front();
        }
        self.rx_frames.push_back(frame);
    }

    /// Host drains one outbound Ethernet frame.
    pub fn extract(&mut self) -> Option<Vec<u8>> {
        self.tx_frames.pop_front()
    }

    pub fn read(&mut self, off: u64, size: u8) -> Option<u64> {
        if off >= super::REG_CONFIG {
            // Config space: MAC bytes 0-5, then a 16-bit link-up status.
            let byte = (off - super::REG_CONFIG) as usize;
            if size != 1 {
                return None;
            }
            return match byte {
                0..=5 => Some(self.mac[byte] as u64),
                6 => Some(1), // status low: VIRTIO_NET_S_LINK_UP
                7 => Some(0),
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
            TransportEvent::Notify(QUEUE_TX) => {
                self.process_tx(dma);
                Some(())
            }
            TransportEvent::Notify(_) => {
                // Fresh RX buffers may unblock queued frames.
                self.deliver_rx(dma);
                Some(())
            }
            TransportEvent::None => Some(()),
        }
    }

    /// Move queued inbound frames into posted RX buffers. Called on RX
    /// notify and from the machine's poll loop.
    pub fn deliver_rx(&mut self, dma: &Dma) {
        while let Some(frame) = self.rx_frames.front() {
            let needed = (NET_HDR_LEN + frame.len()) as u32;
            let Some(chain) = self.transport.pop_avail(QUEUE_RX as usize, dma) else {
                return; // no buffers posted; keep the frame queued
            };
            if chain.writable_len() < needed {
                log::warn!(
                    "virtio-net: RX buffer too small ({} < {}), dropping frame",
                    chain.writable_len(),
                    needed
                );
                self.rx_frames.pop_front();
                self.transport.push_used(QUEUE_RX as usize, dma, chain.head, 0);
                continue;
            }

            let mut payload = vec![0u8; NET_HDR_LEN + frame.len()];
            payload[10] = 1; // num_buffers = 1
            payload[NET_HDR_LEN..].copy_from_slice(frame);

            let mut off = 0usize;
            for d in chain.descs.iter().filter(|d| d.device_writes()) {
                if off >= payload.len() {
                    break;
                }
                let n = (d.len as usize).min(payload.len() - off);
                if dma.write_bytes(d.addr, &payload[off..off + n]).is_err() {
                    break;
                }
                off += n;
            }
            self.rx_frames.pop_front();
            self.transport.push_used(QUEUE_RX as usize, dma, chain.head, needed);
        }
    }

    fn process_tx(&mut self, dma: &Dma) {
        while let Some(chain) = self.transport.pop_avail(QUEUE_TX as usize, dma) {
            let mut bytes = Vec::new();
            for d in chain.descs.iter().filter(|d| !d.device_writes()) {
                match dma.read_bytes(d.addr, d.len as usize) {
                    Ok(mut b) => bytes.append(&mut b),
                    Err(()) => {
                        bytes.clear();
                        break;
                    }
                }
            }
            if bytes.len() > NET_HDR_LEN {
                if self.tx_frames.len() >= FRAME_QUEUE_LIMIT {
                    self.tx_frames.pop_front();
                }
                self.tx_frames.push_back(bytes.split_off(NET_HDR_LEN));
            }
            self.transport.push_used(QUEUE_TX as usize, dma, chain.head, 0);
        }
    }

    pub fn reset(&mut self) {
        self.transport = MmioTransport::new(DEVICE_ID_NET, F_MAC, 2);
        self.rx_frames.clear();
        self.tx_frames.clear();
    }
}
