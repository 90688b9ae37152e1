//! Split-ring virtqueue engine, virtual device abstraction, and a
//! legacy MMIO transport binding for virtio-style shared-memory I/O.
//!
//! The engine (`vring`, `virtqueue`) only knows about descriptor
//! chains, indices, and memory ordering — it never interprets what a
//! buffer contains. `device` models the status/feature/config-space
//! lifecycle every transport shares. `transport::mmio` is the one
//! concrete binding provided; other transports implement
//! [`device::VirtioDeviceOps`] the same way.
#![no_std]

extern crate alloc;

pub mod device;
pub mod error;
pub mod id;
pub mod platform;
pub mod transport;
pub mod virtqueue;
pub mod vring;

#[cfg(test)]
pub(crate) mod testing;

pub use device::{DeviceId, Role, Status, VirtioDevice, VirtioDeviceOps, VirtqueueSpec};
pub use error::{VqError, VQ_ERROR_BASE};
pub use platform::Platform;
pub use virtqueue::{QueueState, Virtqueue, VirtqueueBuf};
pub use vring::{vring_size, VringLayout};
