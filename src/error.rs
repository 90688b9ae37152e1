//! Error codes for the virtqueue engine and device wrapper, in a
//! dedicated negative range below `VQ_ERROR_BASE`.

/// Base of the dedicated error range. Kept for diagnostics; individual
/// variants carry their own fixed code rather than an offset from this.
pub const VQ_ERROR_BASE: i32 = -3000;

/// Contract, protocol, and invariant-violation errors the engine and
/// device wrapper return. See module docs for which errors are which
/// kind; invariant violations additionally degrade to a panic under
/// `debug_assertions`.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VqError {
    /// Queue does not have enough free descriptors for the request.
    VringFull = -3001,
    /// A descriptor index referred to a slot outside `0..num`.
    InvalidDescIdx = -3002,
    /// No new completion/availability to consume.
    EmptyRing = -3003,
    /// Backing allocation (side-table, queue array) could not be made.
    NoMem = -3004,
    /// Descriptor count exceeds the maximum the transport allows.
    MaxDesc = -3005,
    /// Alignment requirement violated (zero, non-power-of-two, or a
    /// memory address not aligned to the requested boundary).
    Align = -3006,
    /// `add_consumed_buffer` given a head index with no matching slot.
    NoBuff = -3007,
    /// Null pointer, zero count, or out-of-range argument.
    InvalidParam = -3008,
    /// Operation absent from the device's operation table.
    NotSupported = -3009,
    /// No device is present (empty MMIO slot, or op table unset).
    NoDevice = -3010,
}

impl VqError {
    /// The dedicated negative error code, stable across releases.
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Contract errors are normal backpressure: never logged at error
    /// level, callers are expected to retry or report upward quietly.
    pub fn is_contract_error(self) -> bool {
        matches!(
            self,
            VqError::VringFull
                | VqError::InvalidDescIdx
                | VqError::EmptyRing
                | VqError::NoMem
                | VqError::MaxDesc
                | VqError::Align
                | VqError::NoBuff
                | VqError::InvalidParam
        )
    }
}

impl core::fmt::Display for VqError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            VqError::VringFull => "virtqueue has no free descriptors for this request",
            VqError::InvalidDescIdx => "descriptor index out of range",
            VqError::EmptyRing => "no new entry on the ring",
            VqError::NoMem => "allocation failed",
            VqError::MaxDesc => "descriptor count exceeds transport maximum",
            VqError::Align => "alignment requirement violated",
            VqError::NoBuff => "no buffer at the given head index",
            VqError::InvalidParam => "invalid parameter",
            VqError::NotSupported => "operation not supported by this device",
            VqError::NoDevice => "no device present",
        };
        write!(f, "{} ({})", msg, self.code())
    }
}
