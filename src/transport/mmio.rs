//! Legacy (version-1) MMIO transport: register map, discovery/init
//! handshake, per-queue setup, notification, and interrupt dispatch.

use alloc::vec::Vec;

use crate::device::{feature, DeviceId, Status, VirtioDeviceOps, VirtqueueSpec};
use crate::error::VqError;
use crate::platform::Platform;
use crate::virtqueue::Virtqueue;
use crate::vring::vring_size;

/// Register byte offsets from the device's MMIO base.
pub mod regs {
    pub const MAGIC: usize = 0x000;
    pub const VERSION: usize = 0x004;
    pub const DEVICE_ID: usize = 0x008;
    pub const VENDOR_ID: usize = 0x00c;
    pub const DEVICE_FEATURES: usize = 0x010;
    pub const DEVICE_FEATURES_SEL: usize = 0x014;
    pub const DRIVER_FEATURES: usize = 0x020;
    pub const DRIVER_FEATURES_SEL: usize = 0x024;
    pub const GUEST_PAGE_SIZE: usize = 0x028;
    pub const QUEUE_SEL: usize = 0x030;
    pub const QUEUE_NUM_MAX: usize = 0x034;
    pub const QUEUE_NUM: usize = 0x038;
    pub const QUEUE_ALIGN: usize = 0x03c;
    pub const QUEUE_PFN: usize = 0x040;
    pub const QUEUE_NOTIFY: usize = 0x050;
    pub const INTERRUPT_STATUS: usize = 0x060;
    pub const INTERRUPT_ACK: usize = 0x064;
    pub const STATUS: usize = 0x070;
    pub const CONFIG: usize = 0x100;
}

const MAGIC_VALUE: u32 = 0x7472_6976; // "virt" little-endian
const LEGACY_VERSION: u32 = 1;
const VRING_ALIGNMENT: usize = 4096;
const GUEST_PAGE_SIZE: u32 = 4096;

const INT_VRING: u32 = 1 << 0;

struct QueueSlot<P: Platform> {
    // Never read; keeps the vring's backing allocation alive for as
    // long as `vq` holds a raw pointer into it.
    #[allow(dead_code)]
    _mem: Vec<u8>,
    vq: Virtqueue<P>,
}

/// A bound legacy MMIO virtio device. Owns the shared memory backing
/// each of its virtqueues.
pub struct MmioTransport<P: Platform + Clone> {
    platform: P,
    id: DeviceId,
    features: u64,
    queues: Vec<QueueSlot<P>>,
}

impl<P: Platform + Clone> MmioTransport<P> {
    /// Probe and bring up the device at `platform`'s register base,
    /// following the legacy discovery handshake: magic check, version
    /// and device-id read (a zero device id means the slot is empty),
    /// version must be the legacy `1`, then ACK the device and publish
    /// the guest page size.
    pub fn probe(platform: P) -> Result<Self, VqError> {
        let magic = platform.reg_read32(regs::MAGIC);
        if magic != MAGIC_VALUE {
            return Err(VqError::NoDevice);
        }

        let version = platform.reg_read32(regs::VERSION);
        let device_id = platform.reg_read32(regs::DEVICE_ID);
        if device_id == 0 {
            return Err(VqError::NoDevice);
        }
        if version != LEGACY_VERSION {
            return Err(VqError::NotSupported);
        }

        let vendor_id = platform.reg_read32(regs::VENDOR_ID);

        platform.reg_write32(regs::STATUS, Status::ACK.bits() as u32);
        platform.reg_write32(regs::GUEST_PAGE_SIZE, GUEST_PAGE_SIZE);

        log::info!(
            "virtio-mmio: found {} device (vendor 0x{:x}, version {})",
            crate::id::name(device_id),
            vendor_id,
            version
        );

        Ok(MmioTransport {
            platform,
            id: DeviceId {
                device: device_id,
                vendor: vendor_id,
                version,
            },
            features: 0,
            queues: Vec::new(),
        })
    }

    pub fn device_id(&self) -> DeviceId {
        self.id
    }

    pub fn queue_mut(&mut self, index: usize) -> Option<&mut Virtqueue<P>> {
        self.queues.get_mut(index).map(|s| &mut s.vq)
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    /// Maximum descriptor count the device will accept for the
    /// currently-selected queue.
    fn queue_num_max(&self, index: u16) -> u16 {
        self.platform.reg_write32(regs::QUEUE_SEL, index as u32);
        self.platform.reg_read32(regs::QUEUE_NUM_MAX) as u16
    }

    /// Read the interrupt status register, dispatch per-queue
    /// callbacks in queue order when the vring-interrupt bit is set,
    /// warn about any other bit, then unconditionally ack the whole
    /// value.
    pub fn isr(&mut self) {
        let isr = self.platform.reg_read32(regs::INTERRUPT_STATUS);

        if isr & INT_VRING != 0 {
            for slot in self.queues.iter_mut() {
                slot.vq.notification();
            }
        }
        if isr & !INT_VRING != 0 {
            log::warn!("virtio-mmio: unhandled interrupt type: 0x{:x}", isr);
        }

        self.platform.reg_write32(regs::INTERRUPT_ACK, isr);
    }
}

impl<P: Platform + Clone> VirtioDeviceOps for MmioTransport<P> {
    fn create_virtqueues(&mut self, specs: &[VirtqueueSpec]) -> Result<(), VqError> {
        self.queues = Vec::new();
        self.queues
            .try_reserve_exact(specs.len())
            .map_err(|_| VqError::NoMem)?;

        let event_idx = self.features & feature::EVENT_IDX != 0;

        for (index, spec) in specs.iter().enumerate() {
            let max = self.queue_num_max(index as u16);
            if max == 0 {
                return Err(VqError::NoDevice);
            }
            if spec.num_descs > max {
                return Err(VqError::MaxDesc);
            }

            let size = vring_size(spec.num_descs, VRING_ALIGNMENT);
            let mut mem = Vec::new();
            mem.try_reserve_exact(size).map_err(|_| VqError::NoMem)?;
            mem.resize(size, 0u8);

            let vq = unsafe {
                Virtqueue::new(
                    mem.as_mut_ptr(),
                    crate::device::Role::Driver,
                    spec.num_descs,
                    VRING_ALIGNMENT,
                    index as u16,
                    event_idx,
                    self.platform.clone(),
                )?
            };

            let pfn = (vq.phys_addr() / GUEST_PAGE_SIZE as u64) as u32;

            self.platform.reg_write32(regs::QUEUE_SEL, index as u32);
            self.platform
                .reg_write32(regs::QUEUE_NUM, spec.num_descs as u32);
            self.platform
                .reg_write32(regs::QUEUE_ALIGN, VRING_ALIGNMENT as u32);
            self.platform.reg_write32(regs::QUEUE_PFN, pfn);

            log::debug!(
                "virtio-mmio: queue {} '{}' ready ({} descriptors)",
                index,
                spec.name,
                spec.num_descs
            );

            self.queues.push(QueueSlot { _mem: mem, vq });
        }

        Ok(())
    }

    fn delete_virtqueues(&mut self) -> Result<(), VqError> {
        self.queues.clear();
        Ok(())
    }

    fn get_status(&self) -> Status {
        Status::from_bits_truncate(self.platform.reg_read32(regs::STATUS) as u8)
    }

    fn set_status(&mut self, status: Status) {
        self.platform
            .reg_write32(regs::STATUS, status.bits() as u32);
    }

    fn get_features(&self) -> u64 {
        self.platform.reg_write32(regs::DEVICE_FEATURES_SEL, 0);
        self.platform.reg_read32(regs::DEVICE_FEATURES) as u64
    }

    fn set_features(&mut self, features: u64) {
        self.platform.reg_write32(regs::DEVICE_FEATURES_SEL, 0);
        let offered = self.platform.reg_read32(regs::DEVICE_FEATURES) as u64;
        let accepted = offered & features;
        self.platform.reg_write32(regs::DRIVER_FEATURES_SEL, 0);
        self.platform
            .reg_write32(regs::DRIVER_FEATURES, accepted as u32);
        self.features = accepted;
    }

    fn read_config(&self, offset: u32, dst: &mut [u8]) -> Result<(), VqError> {
        for (i, byte) in dst.iter_mut().enumerate() {
            *byte = self
                .platform
                .reg_read8(regs::CONFIG + offset as usize + i);
        }
        Ok(())
    }

    fn write_config(&mut self, offset: u32, _src: &[u8]) -> Result<(), VqError> {
        let _ = offset;
        log::warn!("virtio-mmio: device config space is read-only on this transport");
        Err(VqError::NotSupported)
    }

    fn notify(&mut self, queue_index: u16) {
        self.platform
            .reg_write32(regs::QUEUE_NOTIFY, queue_index as u32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockRegisterBank;

    #[test]
    fn s5_probe_rejects_bad_magic() {
        let bank = MockRegisterBank::new();
        bank.write32(regs::MAGIC, 0xdead_beef);
        let err = MmioTransport::probe(bank).unwrap_err();
        assert_eq!(err, VqError::NoDevice);
    }

    #[test]
    fn s5_probe_rejects_empty_slot() {
        let bank = MockRegisterBank::new();
        bank.write32(regs::MAGIC, MAGIC_VALUE);
        bank.write32(regs::VERSION, 1);
        bank.write32(regs::DEVICE_ID, 0);
        let err = MmioTransport::probe(bank).unwrap_err();
        assert_eq!(err, VqError::NoDevice);
    }

    #[test]
    fn s5_probe_rejects_future_version() {
        let bank = MockRegisterBank::new();
        bank.write32(regs::MAGIC, MAGIC_VALUE);
        bank.write32(regs::VERSION, 2);
        bank.write32(regs::DEVICE_ID, crate::id::NETWORK);
        let err = MmioTransport::probe(bank).unwrap_err();
        assert_eq!(err, VqError::NotSupported);
    }

    #[test]
    fn s5_probe_acks_and_publishes_page_size() {
        let bank = MockRegisterBank::new();
        bank.write32(regs::MAGIC, MAGIC_VALUE);
        bank.write32(regs::VERSION, 1);
        bank.write32(regs::DEVICE_ID, crate::id::NETWORK);
        bank.write32(regs::VENDOR_ID, 0x1af4);

        let transport = MmioTransport::probe(bank.clone()).unwrap();
        assert_eq!(transport.device_id().device, crate::id::NETWORK);
        assert_eq!(bank.read32(regs::STATUS), Status::ACK.bits() as u32);
        assert_eq!(bank.read32(regs::GUEST_PAGE_SIZE), 4096);
    }

    #[test]
    fn s6_isr_fans_out_and_warns_on_unknown_bits() {
        let bank = MockRegisterBank::new();
        bank.write32(regs::MAGIC, MAGIC_VALUE);
        bank.write32(regs::VERSION, 1);
        bank.write32(regs::DEVICE_ID, crate::id::BLOCK);
        bank.write32(regs::QUEUE_NUM_MAX, 8);
        let mut transport = MmioTransport::probe(bank.clone()).unwrap();
        transport
            .create_virtqueues(&[VirtqueueSpec {
                name: "requestq",
                num_descs: 8,
            }])
            .unwrap();

        let fired = alloc::rc::Rc::new(core::cell::Cell::new(false));
        let fired2 = fired.clone();
        transport
            .queue_mut(0)
            .unwrap()
            .set_callback(move || fired2.set(true));

        bank.write32(regs::INTERRUPT_STATUS, INT_VRING | 0x2);
        transport.isr();

        assert!(fired.get());
        assert_eq!(bank.read32(regs::INTERRUPT_ACK), INT_VRING | 0x2);
    }
}
