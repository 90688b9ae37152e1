//! Transport bindings: concrete [`crate::device::VirtioDeviceOps`]
//! implementations over a particular register layout and discovery
//! protocol.

pub mod mmio;
