//! Pointer-capture strategies and their dispatch from one issuing device
//!
//! Every strategy writes `i` to element `i` of each buffer. They differ
//! only in how the buffer address travels into the offloaded work.

use crate::allocator::{BufferSet, DeviceBuffer};
use crate::device::{Device, DeviceId};
use crate::error::{ProbeError, ProbeResult};
use crate::runtime::{CaptureList, DeviceRuntime, KernelLaunch};
use crate::topology::PeerAccessMatrix;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, instrument, warn};

/// How the buffer address is captured into the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureStrategy {
    /// Raw pointer extracted from the handle on the host
    DirectPointer,
    /// Whole handle captured by value
    WrappedPointer,
    /// Handle plus a separately extracted raw pointer and the element count
    Mixed,
}

impl CaptureStrategy {
    /// Every strategy, in run order
    pub const ALL: [Self; 3] = [Self::DirectPointer, Self::WrappedPointer, Self::Mixed];

    /// Short name used in logs and reports
    pub fn name(&self) -> &'static str {
        match self {
            Self::DirectPointer => "direct_pointer",
            Self::WrappedPointer => "wrapped_pointer",
            Self::Mixed => "mixed",
        }
    }

    /// Human description of the capture
    pub fn description(&self) -> &'static str {
        match self {
            Self::DirectPointer => "raw pointer",
            Self::WrappedPointer => "smart pointer",
            Self::Mixed => "smart pointer (and sending regular pointer)",
        }
    }

    /// Build the write kernel for `buffer`
    pub fn launch<'a>(&self, buffer: &DeviceBuffer, element_count: usize) -> KernelLaunch<'a> {
        match self {
            Self::DirectPointer => direct_pointer_launch(buffer, element_count),
            Self::WrappedPointer => wrapped_pointer_launch(buffer, element_count),
            Self::Mixed => mixed_launch(buffer, element_count),
        }
    }
}

impl fmt::Display for CaptureStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Value every strategy writes at `index`
pub fn pattern_value(index: usize) -> i32 {
    index as i32
}

fn direct_pointer_launch<'a>(buffer: &DeviceBuffer, element_count: usize) -> KernelLaunch<'a> {
    let mut captures = CaptureList::new();
    let ptr = captures.raw(buffer.handle.pointer());
    KernelLaunch::new(
        "direct_pointer_write",
        captures,
        element_count,
        move |ctx, index| {
            let base = ctx.raw(ptr)?;
            ctx.store(base.element(index), pattern_value(index))
        },
    )
}

fn wrapped_pointer_launch<'a>(buffer: &DeviceBuffer, element_count: usize) -> KernelLaunch<'a> {
    let mut captures = CaptureList::new();
    let handle = captures.aggregate(buffer.handle);
    KernelLaunch::new(
        "wrapped_pointer_write",
        captures,
        element_count,
        move |ctx, index| {
            let base = ctx.aggregate(handle)?.pointer();
            ctx.store(base.element(index), pattern_value(index))
        },
    )
}

fn mixed_launch<'a>(buffer: &DeviceBuffer, element_count: usize) -> KernelLaunch<'a> {
    let mut captures = CaptureList::new();
    let handle = captures.aggregate(buffer.handle);
    let ptr = captures.raw(buffer.handle.pointer());
    let size = captures.scalar(element_count as u64);
    KernelLaunch::new(
        "mixed_capture_write",
        captures,
        element_count,
        move |ctx, index| {
            // Never true for a valid index; keeps the raw capture live
            let base = if index as u64 > ctx.scalar(size)? {
                ctx.raw(ptr)?
            } else {
                ctx.aggregate(handle)?.pointer()
            };
            ctx.store(base.element(index), pattern_value(index))
        },
    )
}

/// Runs capture strategies against a buffer set
pub struct Dispatcher<'a> {
    runtime: &'a dyn DeviceRuntime,
    peers: &'a PeerAccessMatrix,
}

impl<'a> Dispatcher<'a> {
    /// Dispatcher over `runtime`, consulting `peers` for reachability
    pub fn new(runtime: &'a dyn DeviceRuntime, peers: &'a PeerAccessMatrix) -> Self {
        Self { runtime, peers }
    }

    /// Write the pattern into every reachable buffer from `issuer`
    ///
    /// Each launch is waited on before the next is submitted. Buffers the
    /// issuer cannot reach are skipped; their owners are returned.
    #[instrument(skip(self, strategy, issuer, buffers), fields(strategy = %strategy, issuer = %issuer.id))]
    pub fn dispatch(
        &self,
        strategy: CaptureStrategy,
        issuer: &Device,
        buffers: &BufferSet,
        element_count: usize,
    ) -> ProbeResult<Vec<DeviceId>> {
        info!("writing buffers using {}", strategy.description());

        let mut unreachable = Vec::new();
        for buffer in buffers.iter() {
            if !self.peers.can_access(issuer.id, buffer.device) {
                warn!(owner = %buffer.device, "issuer cannot access buffer, skipping");
                unreachable.push(buffer.device);
                continue;
            }

            let launch = strategy.launch(buffer, element_count);
            debug!(owner = %buffer.device, kernel = launch.name, "submitting");
            let token = self
                .runtime
                .submit(issuer, launch)
                .map_err(|err| dispatch_failure(issuer.id, err))?;
            token.wait().map_err(|err| dispatch_failure(issuer.id, err))?;
        }
        Ok(unreachable)
    }
}

fn dispatch_failure(issuer: DeviceId, err: ProbeError) -> ProbeError {
    match err {
        err @ ProbeError::DispatchFailure { .. } => err,
        other => ProbeError::DispatchFailure {
            device: issuer,
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{allocate_all, clear_all};
    use crate::device::DeviceSelector;
    use crate::runtime::CaptureKind;
    use crate::simulated::{PeerPolicy, SimulatedConfig, SimulatedRuntime};
    use crate::topology::Topology;

    fn read(runtime: &SimulatedRuntime, buffer: &DeviceBuffer) -> Vec<i32> {
        let mut values = vec![0; buffer.len];
        runtime
            .copy_to_host(&mut values, buffer.pointer())
            .unwrap()
            .wait()
            .unwrap();
        values
    }

    fn expected(n: usize) -> Vec<i32> {
        (0..n).map(pattern_value).collect()
    }

    #[test]
    fn test_strategy_names() {
        assert_eq!(CaptureStrategy::DirectPointer.to_string(), "direct_pointer");
        assert_eq!(CaptureStrategy::Mixed.description(), "smart pointer (and sending regular pointer)");
        assert_eq!(CaptureStrategy::ALL.len(), 3);

        let json = serde_json::to_string(&CaptureStrategy::WrappedPointer).unwrap();
        assert_eq!(json, "\"wrapped_pointer\"");
    }

    #[test]
    fn test_launch_captures() {
        let buffer = DeviceBuffer {
            id: uuid::Uuid::new_v4(),
            device: DeviceId(0),
            handle: crate::runtime::PointerHandle::new(crate::runtime::DevicePointer::from_addr(0x1000)),
            len: 8,
        };

        let kinds = |strategy: CaptureStrategy| -> Vec<CaptureKind> {
            strategy
                .launch(&buffer, 8)
                .captures
                .iter()
                .map(|capture| capture.kind())
                .collect()
        };
        assert_eq!(kinds(CaptureStrategy::DirectPointer), vec![CaptureKind::Raw]);
        assert_eq!(kinds(CaptureStrategy::WrappedPointer), vec![CaptureKind::Aggregate]);
        assert_eq!(
            kinds(CaptureStrategy::Mixed),
            vec![CaptureKind::Aggregate, CaptureKind::Raw, CaptureKind::Scalar]
        );
        assert_eq!(CaptureStrategy::Mixed.launch(&buffer, 8).range, 8);
    }

    #[test]
    fn test_every_strategy_writes_pattern() {
        let runtime = SimulatedRuntime::new(SimulatedConfig::default());
        let topology = Topology::probe(&runtime, &DeviceSelector::gpus()).unwrap();
        let buffers = allocate_all(&runtime, &topology.devices, 25).unwrap();
        let dispatcher = Dispatcher::new(&runtime, &topology.peers);

        for strategy in CaptureStrategy::ALL {
            clear_all(&runtime, &buffers).unwrap();
            let unreachable = dispatcher
                .dispatch(strategy, &topology.devices[0], &buffers, 25)
                .unwrap();
            assert!(unreachable.is_empty());
            for buffer in buffers.iter() {
                assert_eq!(read(&runtime, buffer), expected(25), "{strategy} on {}", buffer.device);
            }
        }
    }

    #[test]
    fn test_unreachable_buffers_skipped() {
        let runtime = SimulatedRuntime::new(SimulatedConfig::default().with_peer_policy(PeerPolicy::SelfOnly));
        let topology = Topology::probe(&runtime, &DeviceSelector::gpus()).unwrap();
        let buffers = allocate_all(&runtime, &topology.devices, 4).unwrap();
        clear_all(&runtime, &buffers).unwrap();

        let dispatcher = Dispatcher::new(&runtime, &topology.peers);
        let unreachable = dispatcher
            .dispatch(CaptureStrategy::DirectPointer, &topology.devices[0], &buffers, 4)
            .unwrap();

        assert_eq!(unreachable, vec![DeviceId(1)]);
        assert_eq!(read(&runtime, buffers.get(DeviceId(0)).unwrap()), expected(4));
        assert_eq!(read(&runtime, buffers.get(DeviceId(1)).unwrap()), vec![0; 4]);
        assert_eq!(runtime.stats().kernels_launched, 1);
    }

    #[test]
    fn test_fault_names_issuer() {
        // The matrix claims access the runtime then denies
        let permissive = SimulatedRuntime::new(SimulatedConfig::default());
        let topology = Topology::probe(&permissive, &DeviceSelector::gpus()).unwrap();

        let strict = SimulatedRuntime::new(SimulatedConfig::default().with_peer_policy(PeerPolicy::SelfOnly));
        let devices = strict.devices().to_vec();
        let buffers = allocate_all(&strict, &devices, 4).unwrap();

        let dispatcher = Dispatcher::new(&strict, &topology.peers);
        let result = dispatcher.dispatch(CaptureStrategy::WrappedPointer, &devices[1], &buffers, 4);
        match result {
            Err(ProbeError::DispatchFailure { device, message }) => {
                assert_eq!(device, DeviceId(1));
                assert!(message.starts_with("wrapped_pointer_write"));
            }
            other => panic!("Expected DispatchFailure, got {other:?}"),
        }
    }

    #[test]
    fn test_foreign_issuer_rejected() {
        let runtime = SimulatedRuntime::new(SimulatedConfig::default());
        let topology = Topology::probe(&runtime, &DeviceSelector::gpus()).unwrap();
        let buffers = allocate_all(&runtime, &topology.devices, 4).unwrap();

        let mut stranger = topology.devices[0].clone();
        stranger.uuid = uuid::Uuid::new_v4();

        let dispatcher = Dispatcher::new(&runtime, &topology.peers);
        let result = dispatcher.dispatch(CaptureStrategy::Mixed, &stranger, &buffers, 4);
        assert!(matches!(
            result,
            Err(ProbeError::DispatchFailure { device: DeviceId(0), .. })
        ));
    }

    #[test]
    fn test_empty_range() {
        let runtime = SimulatedRuntime::new(SimulatedConfig::default());
        let topology = Topology::probe(&runtime, &DeviceSelector::gpus()).unwrap();
        let buffers = allocate_all(&runtime, &topology.devices, 0).unwrap();
        let dispatcher = Dispatcher::new(&runtime, &topology.peers);

        for strategy in CaptureStrategy::ALL {
            assert!(dispatcher
                .dispatch(strategy, &topology.devices[1], &buffers, 0)
                .unwrap()
                .is_empty());
        }
        assert_eq!(runtime.stats().kernels_launched, 6);
    }
}
