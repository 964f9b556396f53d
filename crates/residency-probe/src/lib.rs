//! Device-memory residency probe for offloaded kernels
//!
//! This crate checks whether a device pointer captured into offloaded work
//! still addresses the original allocation, comparing:
//! - Raw pointer captures
//! - Captures of an aggregate wrapping the pointer
//! - Mixed captures of both
//!
//! It provides device discovery and peer-access probing, per-device buffer
//! allocation, the capture strategies, read-back validation and a
//! simulated multi-device runtime to run them against.

#![warn(missing_docs)]

pub mod allocator;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod harness;
pub mod printer;
pub mod runtime;
pub mod simulated;
pub mod topology;
pub mod validate;

pub use allocator::{allocate_all, clear_all, BufferSet, DeviceBuffer};
pub use device::{Device, DeviceId, DeviceSelector, DeviceType, Partitioning};
pub use dispatch::{pattern_value, CaptureStrategy, Dispatcher};
pub use error::{ProbeError, ProbeResult};
pub use harness::{run_probe, ProbeConfig, ProbeReport, Verdict};
pub use printer::{render, RangeDisplay};
pub use runtime::{
    Capture, CaptureFrame, CaptureKind, CaptureList, CaptureSlot, CompletionToken, DevicePointer,
    DeviceRuntime, KernelContext, KernelLaunch, LaneMemory, PointerHandle,
};
pub use simulated::{AggregateCapture, PeerPolicy, RuntimeStats, SimulatedConfig, SimulatedRuntime};
pub use topology::{discover, probe_peer_access, PeerAccessMatrix, Topology};
pub use validate::{
    compare_outcomes, expect_pattern, first_mismatch, mismatch_count, read_back, BufferReadout,
    Divergence, EquivalenceCheck, StrategyOutcome,
};

/// Re-export common types
pub mod prelude {
    pub use crate::{
        run_probe, AggregateCapture, BufferSet, CaptureStrategy, Device, DeviceBuffer, DeviceId,
        DevicePointer, DeviceRuntime, DeviceSelector, DeviceType, PeerAccessMatrix, PeerPolicy,
        PointerHandle, ProbeConfig, ProbeError, ProbeReport, ProbeResult, SimulatedConfig,
        SimulatedRuntime, Topology, Verdict,
    };
}

#[cfg(test)]
mod tests;
