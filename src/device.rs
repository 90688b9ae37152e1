//! Virtual device abstraction: status lifecycle, feature negotiation,
//! queue creation, configuration-space access, and the polymorphic
//! operation table a transport binding implements.

use alloc::boxed::Box;

use crate::error::VqError;

/// Which side of the vring this process is. Determines who threads the
/// free list at construction and which ring each side owns.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Role {
    Driver,
    Device,
}

bitflags::bitflags! {
    /// Device status byte. Reset is the empty set.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct Status: u8 {
        const ACK          = 0x01;
        const DRIVER       = 0x02;
        const DRIVER_OK    = 0x04;
        const FEATURES_OK  = 0x08;
        const NEEDS_RESET  = 0x40;
        const FAILED       = 0x80;
    }
}

/// Reserved transport feature bits (28-31) plus the one non-reserved bit
/// the engine itself inspects (`NOTIFY_ON_EMPTY`, 24). Per-device bits
/// below 24 are opaque to this crate.
pub mod feature {
    pub const NOTIFY_ON_EMPTY: u64 = 1 << 24;
    pub const INDIRECT_DESC: u64 = 1 << 28;
    pub const EVENT_IDX: u64 = 1 << 29;
    /// Reserved sentinel. A driver that negotiates this bit is buggy;
    /// the device wrapper refuses to ever grant it.
    pub const BAD_FEATURE: u64 = 1 << 30;
}

/// Identification triple read from the device during initialization.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct DeviceId {
    pub device: u32,
    pub vendor: u32,
    pub version: u32,
}

/// One queue's static setup parameters, passed to `create_virtqueues`.
pub struct VirtqueueSpec<'a> {
    pub name: &'a str,
    pub num_descs: u16,
}

/// The polymorphic operation table a transport binding implements.
///
/// Every method has a default that reports the operation as absent
/// (`NotSupported`, or a no-op for accessors with no failure mode),
/// mirroring the "each entry may be absent" contract of the original
/// function-pointer table. A binding overrides only what it backs.
pub trait VirtioDeviceOps {
    /// Create `specs.len()` virtqueues. If this side is the driver, the
    /// vring memory for each is zeroed before being handed to
    /// `Virtqueue::new`.
    fn create_virtqueues(&mut self, specs: &[VirtqueueSpec]) -> Result<(), VqError>;

    /// Release all queue resources. Idempotent.
    fn delete_virtqueues(&mut self) -> Result<(), VqError> {
        Ok(())
    }

    fn get_status(&self) -> Status;
    fn set_status(&mut self, status: Status);

    /// Offered feature bits from the device's point of view.
    fn get_features(&self) -> u64;
    /// Acknowledge a feature subset. Implementations AND it with what
    /// they actually offer before recording it.
    fn set_features(&mut self, features: u64);

    /// Propose `wanted`; returns the intersection with what's offered.
    /// Refuses to grant the reserved `BAD_FEATURE` bit under any
    /// circumstances, per the wire invariant.
    fn negotiate_features(&mut self, wanted: u64) -> Result<u64, VqError> {
        let offered = self.get_features();
        let granted = offered & wanted & !feature::BAD_FEATURE;
        self.set_features(granted);
        Ok(granted)
    }

    fn read_config(&self, offset: u32, dst: &mut [u8]) -> Result<(), VqError> {
        let _ = (offset, dst);
        Err(VqError::NotSupported)
    }

    fn write_config(&mut self, offset: u32, src: &[u8]) -> Result<(), VqError> {
        let _ = (offset, src);
        log::warn!("write_config not supported by this transport");
        Err(VqError::NotSupported)
    }

    /// Drive status to empty. Peer is expected to discard all queue state.
    fn reset_device(&mut self) {
        self.set_status(Status::empty());
    }

    /// Tell the peer that `queue_index` has work.
    fn notify(&mut self, queue_index: u16);

    /// Optional blocking wait for when the driver has no free buffer.
    /// May return early for any reason; callers must re-check the queue.
    fn wait_notified(&mut self, queue_index: u16) {
        let _ = queue_index;
    }
}

/// Container holding one device's identity, role, negotiated features,
/// and its transport-specific operation table.
pub struct VirtioDevice<T: VirtioDeviceOps> {
    pub notify_id: u32,
    pub id: DeviceId,
    pub role: Role,
    pub features: u64,
    pub ops: T,
    reset_callback: Option<Box<dyn FnMut()>>,
}

impl<T: VirtioDeviceOps> VirtioDevice<T> {
    pub fn new(notify_id: u32, id: DeviceId, role: Role, ops: T) -> Self {
        VirtioDevice {
            notify_id,
            id,
            role,
            features: 0,
            ops,
            reset_callback: None,
        }
    }

    pub fn set_reset_callback(&mut self, cb: impl FnMut() + 'static) {
        self.reset_callback = Some(Box::new(cb));
    }

    pub fn status(&self) -> Status {
        self.ops.get_status()
    }

    pub fn set_status(&mut self, status: Status) {
        self.ops.set_status(status);
    }

    pub fn negotiate_features(&mut self, wanted: u64) -> Result<u64, VqError> {
        let granted = self.ops.negotiate_features(wanted)?;
        self.features = granted;
        Ok(granted)
    }

    pub fn read_config(&self, offset: u32, dst: &mut [u8]) -> Result<(), VqError> {
        self.ops.read_config(offset, dst)
    }

    pub fn write_config(&mut self, offset: u32, src: &[u8]) -> Result<(), VqError> {
        self.ops.write_config(offset, src)
    }

    pub fn reset(&mut self) {
        self.ops.reset_device();
        self.features = 0;
        if let Some(cb) = self.reset_callback.as_mut() {
            cb();
        }
    }

    pub fn notify(&mut self, queue_index: u16) {
        self.ops.notify(queue_index);
    }

    pub fn create_virtqueues(&mut self, specs: &[VirtqueueSpec]) -> Result<(), VqError> {
        self.ops.create_virtqueues(specs)
    }
}
