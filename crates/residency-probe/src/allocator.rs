//! Per-device buffer allocation

use crate::device::{Device, DeviceId};
use crate::error::{ProbeError, ProbeResult};
use crate::runtime::{CompletionToken, DevicePointer, DeviceRuntime, PointerHandle, ELEMENT_SIZE};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Contiguous `i32` region resident on one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceBuffer {
    /// Unique buffer ID
    pub id: Uuid,
    /// Device the memory is resident on
    pub device: DeviceId,
    /// Aggregate wrapping the base address
    pub handle: PointerHandle,
    /// Number of `i32` elements
    pub len: usize,
}

impl DeviceBuffer {
    /// Base address
    pub fn pointer(&self) -> DevicePointer {
        self.handle.pointer()
    }

    /// Size in bytes
    pub fn size_bytes(&self) -> usize {
        self.len * ELEMENT_SIZE
    }
}

/// One buffer per discovered device, in discovery order
#[derive(Debug, Default)]
pub struct BufferSet {
    buffers: Vec<DeviceBuffer>,
}

impl BufferSet {
    /// Buffer resident on `device`
    pub fn get(&self, device: DeviceId) -> Option<&DeviceBuffer> {
        self.buffers.iter().find(|buffer| buffer.device == device)
    }

    /// Buffers in discovery order
    pub fn iter(&self) -> impl Iterator<Item = &DeviceBuffer> {
        self.buffers.iter()
    }

    /// Number of buffers
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Check if the set holds no buffers
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Free every buffer
    ///
    /// All buffers are released even if one fails; the first failure is
    /// returned.
    pub fn release(self, runtime: &dyn DeviceRuntime) -> ProbeResult<()> {
        let mut first_error = None;
        for buffer in self.buffers {
            if let Err(err) = runtime.free(buffer.pointer()) {
                warn!(device = %buffer.device, buffer = %buffer.id, error = %err, "failed to release buffer");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Allocate one `element_count`-element buffer on each device
///
/// Contents are unspecified until cleared. On failure every buffer already
/// allocated is released.
#[instrument(skip(runtime, devices), fields(device_count = devices.len()))]
pub fn allocate_all(
    runtime: &dyn DeviceRuntime,
    devices: &[Device],
    element_count: usize,
) -> ProbeResult<BufferSet> {
    let mut set = BufferSet::default();
    for device in devices {
        match runtime.allocate(element_count, device) {
            Ok(pointer) => {
                let buffer = DeviceBuffer {
                    id: Uuid::new_v4(),
                    device: device.id,
                    handle: PointerHandle::new(pointer),
                    len: element_count,
                };
                debug!(device = %device.id, buffer = %buffer.id, %pointer, "buffer allocated");
                set.buffers.push(buffer);
            }
            Err(err) => {
                // The release error, if any, is already logged
                let _ = set.release(runtime);
                return Err(match err {
                    err @ ProbeError::AllocationFailure { .. } => err,
                    other => ProbeError::AllocationFailure {
                        device: device.id,
                        bytes: element_count.saturating_mul(ELEMENT_SIZE),
                        message: other.to_string(),
                    },
                });
            }
        }
    }

    info!(buffers = set.len(), element_count, "buffers allocated");
    Ok(set)
}

/// Zero every buffer, waiting on each fill before the next is submitted
pub fn clear_all(runtime: &dyn DeviceRuntime, buffers: &BufferSet) -> ProbeResult<()> {
    let fill_failure = |buffer: &DeviceBuffer, err: ProbeError| match err {
        err @ ProbeError::FillFailure { .. } => err,
        other => ProbeError::FillFailure {
            device: buffer.device,
            message: other.to_string(),
        },
    };

    for buffer in buffers.iter() {
        runtime
            .fill(buffer.pointer(), 0, buffer.len)
            .and_then(CompletionToken::wait)
            .map_err(|err| fill_failure(buffer, err))?;
    }

    debug!(buffers = buffers.len(), "buffers cleared");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceSelector;
    use crate::simulated::{SimulatedConfig, SimulatedRuntime};
    use crate::runtime::KernelLaunch;
    use crate::topology::discover;
    use parking_lot::Mutex;

    /// Delegates to a simulated runtime, recording fills and faulting the first one on wait
    struct FaultingFills {
        inner: SimulatedRuntime,
        fills: Mutex<Vec<DevicePointer>>,
    }

    impl DeviceRuntime for FaultingFills {
        fn name(&self) -> &str {
            "faulting-fills"
        }

        fn enumerate_devices(&self, selector: &DeviceSelector) -> ProbeResult<Vec<Device>> {
            self.inner.enumerate_devices(selector)
        }

        fn can_access_peer(&self, device: &Device, peer: &Device) -> ProbeResult<bool> {
            self.inner.can_access_peer(device, peer)
        }

        fn allocate(&self, elements: usize, device: &Device) -> ProbeResult<DevicePointer> {
            self.inner.allocate(elements, device)
        }

        fn free(&self, ptr: DevicePointer) -> ProbeResult<()> {
            self.inner.free(ptr)
        }

        fn submit(&self, device: &Device, launch: KernelLaunch<'_>) -> ProbeResult<CompletionToken> {
            self.inner.submit(device, launch)
        }

        fn copy_to_host(&self, dst: &mut [i32], src: DevicePointer) -> ProbeResult<CompletionToken> {
            self.inner.copy_to_host(dst, src)
        }

        fn fill(&self, dst: DevicePointer, value: i32, elements: usize) -> ProbeResult<CompletionToken> {
            let mut fills = self.fills.lock();
            fills.push(dst);
            let token = self.inner.fill(dst, value, elements)?;
            if fills.len() == 1 {
                return Ok(CompletionToken::faulted(
                    "fill",
                    token.device(),
                    ProbeError::UnmappedAddress { address: dst.addr() },
                ));
            }
            Ok(token)
        }
    }

    fn setup(config: SimulatedConfig) -> (SimulatedRuntime, Vec<Device>) {
        let runtime = SimulatedRuntime::new(config);
        let devices = discover(&runtime, &DeviceSelector::gpus()).unwrap();
        (runtime, devices)
    }

    #[test]
    fn test_one_buffer_per_device() {
        let (runtime, devices) = setup(SimulatedConfig::default().with_root_devices(3));
        let buffers = allocate_all(&runtime, &devices, 16).unwrap();

        assert_eq!(buffers.len(), 3);
        for (buffer, device) in buffers.iter().zip(&devices) {
            assert_eq!(buffer.device, device.id);
            assert_eq!(buffer.len, 16);
            assert_eq!(buffer.size_bytes(), 64);
        }
        assert!(buffers.get(DeviceId(2)).is_some());
        assert!(buffers.get(DeviceId(7)).is_none());

        buffers.release(&runtime).unwrap();
        assert_eq!(runtime.stats().live_allocations, 0);
    }

    #[test]
    fn test_failed_allocation_releases_partial_set() {
        // Device 0 is listed twice but only has room for one buffer
        let (runtime, devices) = setup(
            SimulatedConfig::default()
                .with_root_devices(2)
                .with_memory_per_device(512),
        );
        let mut listed = devices.clone();
        listed.push(devices[0].clone());

        let result = allocate_all(&runtime, &listed, 100);
        match result {
            Err(ProbeError::AllocationFailure { device, .. }) => assert_eq!(device, DeviceId(0)),
            other => panic!("Expected AllocationFailure, got {other:?}"),
        }
        assert_eq!(runtime.stats().live_allocations, 0);
    }

    #[test]
    fn test_allocation_over_capacity() {
        let (runtime, devices) = setup(SimulatedConfig::default().with_memory_per_device(64));
        let result = allocate_all(&runtime, &devices, 100);
        assert!(matches!(
            result,
            Err(ProbeError::AllocationFailure { device: DeviceId(0), bytes: 400, .. })
        ));
    }

    #[test]
    fn test_clear_zeroes_every_buffer() {
        let (runtime, devices) = setup(SimulatedConfig::default());
        let buffers = allocate_all(&runtime, &devices, 10).unwrap();
        clear_all(&runtime, &buffers).unwrap();

        for buffer in buffers.iter() {
            let mut values = vec![1; buffer.len];
            runtime
                .copy_to_host(&mut values, buffer.pointer())
                .unwrap()
                .wait()
                .unwrap();
            assert_eq!(values, vec![0; 10]);
        }
    }

    #[test]
    fn test_clear_after_release_fails() {
        let (runtime, devices) = setup(SimulatedConfig::default());
        let buffers = allocate_all(&runtime, &devices, 4).unwrap();
        for buffer in buffers.iter() {
            runtime.free(buffer.pointer()).unwrap();
        }

        let result = clear_all(&runtime, &buffers);
        assert!(matches!(
            result,
            Err(ProbeError::FillFailure { device: DeviceId(0), .. })
        ));
        assert!(buffers.release(&runtime).is_err());
    }

    #[test]
    fn test_clear_waits_before_next_fill() {
        let runtime = FaultingFills {
            inner: SimulatedRuntime::new(SimulatedConfig::default().with_root_devices(3)),
            fills: Mutex::new(Vec::new()),
        };
        let devices = discover(&runtime, &DeviceSelector::gpus()).unwrap();
        let buffers = allocate_all(&runtime, &devices, 8).unwrap();

        // The first fill faults on wait, so nothing else is submitted
        let result = clear_all(&runtime, &buffers);
        match result {
            Err(ProbeError::FillFailure { device, .. }) => assert_eq!(device, DeviceId(0)),
            other => panic!("Expected FillFailure, got {other:?}"),
        }
        let first = buffers.get(DeviceId(0)).unwrap().pointer();
        assert_eq!(*runtime.fills.lock(), vec![first]);

        buffers.release(&runtime).unwrap();
    }

    #[test]
    fn test_empty_buffers() {
        let (runtime, devices) = setup(SimulatedConfig::default());
        let buffers = allocate_all(&runtime, &devices, 0).unwrap();
        assert_eq!(buffers.len(), 2);
        clear_all(&runtime, &buffers).unwrap();
        buffers.release(&runtime).unwrap();
    }
}
