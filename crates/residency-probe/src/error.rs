//! Probe error types and result handling

use crate::device::DeviceId;
use thiserror::Error;

/// Residency probe errors
///
/// Every variant is fatal to a probe run. The harness never retries a
/// device operation: a retry cannot tell a transient fault from the
/// addressing bug the probe exists to surface.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The selection policy matched no device
    #[error("No devices found for selector: {selector}")]
    NoDevicesFound {
        /// Rendered selector
        selector: String,
    },

    /// Device allocation failed
    #[error("Allocation of {bytes} bytes failed on device {device}: {message}")]
    AllocationFailure {
        /// Device the allocation targeted
        device: DeviceId,
        /// Requested bytes
        bytes: usize,
        /// Error message
        message: String,
    },

    /// Kernel submission or execution failed
    #[error("Kernel dispatch failed on device {device}: {message}")]
    DispatchFailure {
        /// Issuing device
        device: DeviceId,
        /// Error message
        message: String,
    },

    /// Device-to-host copy failed
    #[error("Read-back failed for buffer on device {device}: {message}")]
    ReadBackFailure {
        /// Device owning the buffer
        device: DeviceId,
        /// Error message
        message: String,
    },

    /// Device fill failed
    #[error("Fill failed for buffer on device {device}: {message}")]
    FillFailure {
        /// Device owning the buffer
        device: DeviceId,
        /// Error message
        message: String,
    },

    /// Address not inside any live allocation
    #[error("Unmapped device address: {address:#x}")]
    UnmappedAddress {
        /// Offending address
        address: u64,
    },

    /// Device unknown to the runtime
    #[error("Invalid device: {device}")]
    InvalidDevice {
        /// Device ID
        device: DeviceId,
    },

    /// Probe configuration rejected
    #[error("Invalid probe configuration: {message}")]
    InvalidConfig {
        /// Error message
        message: String,
    },
}

impl ProbeError {
    /// Device the failure is attributed to, if any
    pub fn device(&self) -> Option<DeviceId> {
        match self {
            Self::AllocationFailure { device, .. }
            | Self::DispatchFailure { device, .. }
            | Self::ReadBackFailure { device, .. }
            | Self::FillFailure { device, .. }
            | Self::InvalidDevice { device } => Some(*device),
            Self::NoDevicesFound { .. }
            | Self::UnmappedAddress { .. }
            | Self::InvalidConfig { .. } => None,
        }
    }
}

/// Result type for probe operations
pub type ProbeResult<T> = Result<T, ProbeError>;
