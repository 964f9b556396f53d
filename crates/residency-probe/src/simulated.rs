//! In-process simulated accelerator runtime
//!
//! Devices share one virtual address space. Each allocation is owned by a
//! single device; kernels executing on a device may only touch memory the
//! device owns or can reach through peer access. Captured values are
//! materialized into a private frame on the executing device before the
//! body runs.

use crate::device::{Device, DeviceId, DeviceSelector, DeviceType, Partitioning};
use crate::error::{ProbeError, ProbeResult};
use crate::runtime::{
    Capture, CaptureFrame, CompletionToken, DevicePointer, DeviceRuntime, KernelContext,
    KernelLaunch, LaneMemory, CAPTURE_SIZE, ELEMENT_SIZE,
};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Allocation alignment in bytes
pub const ALLOCATION_ALIGNMENT: u64 = 256;

/// First address handed out
const ADDRESS_SPACE_BASE: u64 = 0x7f00_0000_0000;

/// Default per-device memory capacity (64 MiB)
pub const DEFAULT_MEMORY_PER_DEVICE: usize = 64 * 1024 * 1024;

/// Default peer relation between distinct devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerPolicy {
    /// Every device can access every other device
    #[default]
    All,
    /// Only devices partitioned from the same root can access each other
    SameRoot,
    /// Devices can access only their own memory
    SelfOnly,
}

/// How aggregate captures are materialized on the executing device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateCapture {
    /// Byte-for-byte copy; the pointer field keeps its address
    #[default]
    Faithful,
    /// Pointer fields naming another device's memory are re-targeted at a
    /// shadow allocation private to the executing device
    DevicePrivate,
}

/// Explicit peer relation for one ordered device pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerOverride {
    /// Accessing device
    pub from: DeviceId,
    /// Device owning the memory
    pub to: DeviceId,
    /// Whether access is allowed
    pub allowed: bool,
}

/// Simulated topology and behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatedConfig {
    /// Number of root devices
    pub root_devices: u32,
    /// NUMA sub-devices per root (0 = roots cannot be partitioned)
    pub numa_domains: u32,
    /// Class of every root device
    pub device_type: DeviceType,
    /// Default peer relation
    pub peer_policy: PeerPolicy,
    /// Per-pair exceptions to the default relation
    #[serde(default)]
    pub peer_overrides: Vec<PeerOverride>,
    /// Aggregate capture fidelity
    pub aggregate_capture: AggregateCapture,
    /// Capacity of each device in bytes
    pub memory_per_device: usize,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            root_devices: 2,
            numa_domains: 2,
            device_type: DeviceType::GPU,
            peer_policy: PeerPolicy::All,
            peer_overrides: Vec::new(),
            aggregate_capture: AggregateCapture::Faithful,
            memory_per_device: DEFAULT_MEMORY_PER_DEVICE,
        }
    }
}

impl SimulatedConfig {
    /// Set the number of root devices
    pub fn with_root_devices(mut self, count: u32) -> Self {
        self.root_devices = count;
        self
    }

    /// Set NUMA sub-devices per root
    pub fn with_numa_domains(mut self, count: u32) -> Self {
        self.numa_domains = count;
        self
    }

    /// Set the root device class
    pub fn with_device_type(mut self, device_type: DeviceType) -> Self {
        self.device_type = device_type;
        self
    }

    /// Set the default peer relation
    pub fn with_peer_policy(mut self, policy: PeerPolicy) -> Self {
        self.peer_policy = policy;
        self
    }

    /// Override the relation for one ordered pair
    pub fn with_peer_override(mut self, from: u32, to: u32, allowed: bool) -> Self {
        self.peer_overrides.push(PeerOverride {
            from: DeviceId(from),
            to: DeviceId(to),
            allowed,
        });
        self
    }

    /// Set aggregate capture fidelity
    pub fn with_aggregate_capture(mut self, mode: AggregateCapture) -> Self {
        self.aggregate_capture = mode;
        self
    }

    /// Set per-device capacity in bytes
    pub fn with_memory_per_device(mut self, bytes: usize) -> Self {
        self.memory_per_device = bytes;
        self
    }
}

/// Operation counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RuntimeStats {
    /// Kernels executed
    pub kernels_launched: u64,
    /// Device-to-host copies
    pub copies: u64,
    /// Fill operations
    pub fills: u64,
    /// Buffers currently allocated
    pub live_allocations: usize,
    /// Shadow allocations created for unfaithful aggregate captures
    pub shadow_allocations: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AllocationKind {
    Buffer,
    CaptureFrame,
    Shadow,
}

impl AllocationKind {
    fn is_private(self) -> bool {
        !matches!(self, Self::Buffer)
    }
}

#[derive(Debug)]
struct Allocation {
    owner: DeviceId,
    kind: AllocationKind,
    reserved: usize,
    data: Vec<i32>,
}

/// Where an address falls inside an allocation
#[derive(Debug, Clone, Copy)]
struct Span {
    base: u64,
    start: usize,
}

#[derive(Debug)]
enum SpanError {
    Unmapped,
    Misaligned { base: u64 },
    OutOfRange { base: u64, len: usize },
}

#[derive(Debug, Default)]
struct MemoryState {
    allocations: BTreeMap<u64, Allocation>,
    next_addr: u64,
    used: HashMap<DeviceId, usize>,
    /// (executing device, origin base) -> shadow base
    shadows: HashMap<(DeviceId, u64), u64>,
}

impl MemoryState {
    fn new() -> Self {
        Self {
            next_addr: ADDRESS_SPACE_BASE,
            ..Self::default()
        }
    }

    fn reserve(
        &mut self,
        owner: DeviceId,
        kind: AllocationKind,
        data: Vec<i32>,
        capacity: usize,
    ) -> Result<u64, String> {
        let bytes = data.len() * ELEMENT_SIZE;
        let reserved = align_up(bytes.max(1) as u64, ALLOCATION_ALIGNMENT) as usize;
        let used = self.used.get(&owner).copied().unwrap_or(0);
        if used + reserved > capacity {
            return Err(format!(
                "out of memory: {used} of {capacity} bytes in use, {reserved} requested"
            ));
        }

        let base = self.next_addr;
        self.next_addr += reserved as u64;
        *self.used.entry(owner).or_insert(0) += reserved;
        self.allocations.insert(
            base,
            Allocation {
                owner,
                kind,
                reserved,
                data,
            },
        );
        Ok(base)
    }

    fn release(&mut self, base: u64) -> Option<Allocation> {
        let allocation = self.allocations.remove(&base)?;
        if let Some(used) = self.used.get_mut(&allocation.owner) {
            *used = used.saturating_sub(allocation.reserved);
        }
        Some(allocation)
    }

    fn resolve(&self, ptr: DevicePointer, elements: usize) -> Result<Span, SpanError> {
        let addr = ptr.addr();
        let (&base, allocation) = self
            .allocations
            .range(..=addr)
            .next_back()
            .ok_or(SpanError::Unmapped)?;

        let offset = addr - base;
        if offset >= allocation.reserved as u64 {
            return Err(SpanError::Unmapped);
        }
        if offset % ELEMENT_SIZE as u64 != 0 {
            return Err(SpanError::Misaligned { base });
        }

        let start = (offset / ELEMENT_SIZE as u64) as usize;
        let len = allocation.data.len();
        match start.checked_add(elements) {
            Some(end) if end <= len => Ok(Span { base, start }),
            _ => Err(SpanError::OutOfRange { base, len }),
        }
    }

    fn allocation(&self, base: u64) -> &Allocation {
        &self.allocations[&base]
    }

    fn allocation_mut(&mut self, base: u64) -> &mut Allocation {
        self.allocations
            .get_mut(&base)
            .unwrap_or_else(|| unreachable!("span resolved to a released allocation"))
    }
}

fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

/// Simulated multi-device runtime
pub struct SimulatedRuntime {
    config: SimulatedConfig,
    devices: Vec<Device>,
    memory: Mutex<MemoryState>,
    kernels_launched: AtomicU64,
    copies: AtomicU64,
    fills: AtomicU64,
}

impl SimulatedRuntime {
    /// Build the device table described by `config`
    pub fn new(config: SimulatedConfig) -> Self {
        let mut devices = Vec::new();
        for root in 0..config.root_devices {
            devices.push(Device {
                id: DeviceId(root),
                uuid: Uuid::new_v4(),
                name: format!("Simulated {} {}", type_label(config.device_type), root),
                device_type: config.device_type,
                parent: None,
                numa_domain: None,
            });
        }

        let mut next_id = config.root_devices;
        for root in 0..config.root_devices {
            for domain in 0..config.numa_domains {
                devices.push(Device {
                    id: DeviceId(next_id),
                    uuid: Uuid::new_v4(),
                    name: format!(
                        "Simulated {} {}.{}",
                        type_label(config.device_type),
                        root,
                        domain
                    ),
                    device_type: config.device_type,
                    parent: Some(DeviceId(root)),
                    numa_domain: Some(domain),
                });
                next_id += 1;
            }
        }

        debug!(
            roots = config.root_devices,
            numa_domains = config.numa_domains,
            aggregate_capture = ?config.aggregate_capture,
            "simulated runtime created"
        );

        Self {
            config,
            devices,
            memory: Mutex::new(MemoryState::new()),
            kernels_launched: AtomicU64::new(0),
            copies: AtomicU64::new(0),
            fills: AtomicU64::new(0),
        }
    }

    /// Active configuration
    pub fn config(&self) -> &SimulatedConfig {
        &self.config
    }

    /// Every device the runtime knows, roots first
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Operation counters
    pub fn stats(&self) -> RuntimeStats {
        let state = self.memory.lock();
        let count = |kind: AllocationKind| {
            state
                .allocations
                .values()
                .filter(|allocation| allocation.kind == kind)
                .count()
        };
        RuntimeStats {
            // Relaxed: counters are independent statistics
            kernels_launched: self.kernels_launched.load(Ordering::Relaxed),
            copies: self.copies.load(Ordering::Relaxed),
            fills: self.fills.load(Ordering::Relaxed),
            live_allocations: count(AllocationKind::Buffer),
            shadow_allocations: count(AllocationKind::Shadow),
        }
    }

    fn device(&self, device: &Device) -> ProbeResult<&Device> {
        self.devices
            .get(device.id.0 as usize)
            .filter(|known| known.uuid == device.uuid)
            .ok_or(ProbeError::InvalidDevice { device: device.id })
    }

    fn root_of(&self, id: DeviceId) -> DeviceId {
        self.devices
            .get(id.0 as usize)
            .map(Device::root)
            .unwrap_or(id)
    }

    fn peer_allowed(&self, from: DeviceId, to: DeviceId) -> bool {
        if from == to {
            return true;
        }
        if let Some(rule) = self
            .config
            .peer_overrides
            .iter()
            .rev()
            .find(|rule| rule.from == from && rule.to == to)
        {
            return rule.allowed;
        }
        match self.config.peer_policy {
            PeerPolicy::All => true,
            PeerPolicy::SameRoot => self.root_of(from) == self.root_of(to),
            PeerPolicy::SelfOnly => false,
        }
    }

    /// Bytes an aggregate capture carries into the executing device's frame
    fn materialize_aggregate(
        &self,
        state: &mut MemoryState,
        executor: DeviceId,
        capture: &Capture,
    ) -> ProbeResult<[u8; CAPTURE_SIZE]> {
        let Capture::Aggregate(handle) = capture else {
            return Ok(capture.to_bytes());
        };
        if self.config.aggregate_capture == AggregateCapture::Faithful {
            return Ok(capture.to_bytes());
        }

        let target = handle.pointer();
        let Ok(span) = state.resolve(target, 0) else {
            return Ok(capture.to_bytes());
        };
        let origin = state.allocation(span.base);
        if origin.kind != AllocationKind::Buffer || origin.owner == executor {
            return Ok(capture.to_bytes());
        }

        let shadow = match state.shadows.get(&(executor, span.base)) {
            Some(&shadow) => shadow,
            None => {
                let len = origin.data.len();
                let shadow = state
                    .reserve(
                        executor,
                        AllocationKind::Shadow,
                        vec![0; len],
                        self.config.memory_per_device,
                    )
                    .map_err(|message| ProbeError::DispatchFailure {
                        device: executor,
                        message,
                    })?;
                state.shadows.insert((executor, span.base), shadow);
                shadow
            }
        };

        let retargeted = shadow + (target.addr() - span.base);
        trace!(
            executor = %executor,
            origin = %target,
            shadow = %DevicePointer::from_addr(retargeted),
            "aggregate pointer field re-targeted to device-private shadow"
        );
        Ok(retargeted.to_le_bytes())
    }

    fn materialize(
        &self,
        state: &mut MemoryState,
        executor: DeviceId,
        launch: &KernelLaunch<'_>,
    ) -> ProbeResult<CaptureFrame> {
        let words = launch.captures.frame_size() / ELEMENT_SIZE;
        let base = state
            .reserve(
                executor,
                AllocationKind::CaptureFrame,
                vec![0; words],
                self.config.memory_per_device,
            )
            .map_err(|message| ProbeError::DispatchFailure {
                device: executor,
                message: format!("{}: capture frame: {message}", launch.name),
            })?;

        let mut frame = CaptureFrame::new(executor, DevicePointer::from_addr(base));
        let mut image = Vec::with_capacity(words);
        for capture in launch.captures.iter() {
            let bytes = match self.materialize_aggregate(state, executor, capture) {
                Ok(bytes) => bytes,
                Err(err) => {
                    state.release(base);
                    return Err(err);
                }
            };
            frame.push(capture.kind(), bytes);
            for word in bytes.chunks_exact(ELEMENT_SIZE) {
                image.push(i32::from_le_bytes([word[0], word[1], word[2], word[3]]));
            }
        }
        state.allocation_mut(base).data = image;
        Ok(frame)
    }
}

fn type_label(device_type: DeviceType) -> &'static str {
    if device_type.contains(DeviceType::GPU) {
        "GPU"
    } else if device_type.contains(DeviceType::ACCELERATOR) {
        "Accelerator"
    } else {
        "CPU"
    }
}

/// Device memory as seen by a kernel executing on one device
///
/// The memory lock is taken per access, so a body may call back into the
/// runtime between accesses.
struct LaneView<'a> {
    runtime: &'a SimulatedRuntime,
    executor: DeviceId,
}

impl LaneView<'_> {
    fn check_access(&self, state: &MemoryState, ptr: DevicePointer) -> ProbeResult<Span> {
        let span = state.resolve(ptr, 1).map_err(|err| {
            let message = match err {
                SpanError::Unmapped => format!("access to unmapped address {ptr}"),
                SpanError::Misaligned { base } => {
                    format!("misaligned access to {ptr} (allocation {base:#x})")
                }
                SpanError::OutOfRange { base, len } => format!(
                    "access to {ptr} past the end of allocation {base:#x} ({len} elements)"
                ),
            };
            ProbeError::DispatchFailure {
                device: self.executor,
                message,
            }
        })?;

        let allocation = state.allocation(span.base);
        let allowed = if allocation.kind.is_private() {
            allocation.owner == self.executor
        } else {
            self.runtime.peer_allowed(self.executor, allocation.owner)
        };
        if !allowed {
            return Err(ProbeError::DispatchFailure {
                device: self.executor,
                message: format!(
                    "illegal access to {ptr} resident on device {}",
                    allocation.owner
                ),
            });
        }
        Ok(span)
    }
}

impl LaneMemory for LaneView<'_> {
    fn store(&mut self, ptr: DevicePointer, value: i32) -> ProbeResult<()> {
        let mut state = self.runtime.memory.lock();
        let span = self.check_access(&state, ptr)?;
        state.allocation_mut(span.base).data[span.start] = value;
        Ok(())
    }

    fn load(&self, ptr: DevicePointer) -> ProbeResult<i32> {
        let state = self.runtime.memory.lock();
        let span = self.check_access(&state, ptr)?;
        Ok(state.allocation(span.base).data[span.start])
    }
}

impl DeviceRuntime for SimulatedRuntime {
    fn name(&self) -> &str {
        "simulated"
    }

    fn enumerate_devices(&self, selector: &DeviceSelector) -> ProbeResult<Vec<Device>> {
        let roots = self
            .devices
            .iter()
            .filter(|device| !device.is_sub_device() && selector.accepts(device.device_type));

        let selected: Vec<Device> = match selector.partition {
            Partitioning::Root => roots.cloned().collect(),
            Partitioning::Numa => roots
                .flat_map(|root| {
                    self.devices
                        .iter()
                        .filter(move |device| device.parent == Some(root.id))
                })
                .cloned()
                .collect(),
        };
        Ok(selected)
    }

    fn can_access_peer(&self, device: &Device, peer: &Device) -> ProbeResult<bool> {
        let device = self.device(device)?;
        let peer = self.device(peer)?;
        Ok(self.peer_allowed(device.id, peer.id))
    }

    fn allocate(&self, elements: usize, device: &Device) -> ProbeResult<DevicePointer> {
        let device = self.device(device)?;
        let bytes = elements
            .checked_mul(ELEMENT_SIZE)
            .ok_or(ProbeError::AllocationFailure {
                device: device.id,
                bytes: usize::MAX,
                message: "size overflow".to_string(),
            })?;
        if bytes > self.config.memory_per_device {
            return Err(ProbeError::AllocationFailure {
                device: device.id,
                bytes,
                message: format!(
                    "exceeds device capacity of {} bytes",
                    self.config.memory_per_device
                ),
            });
        }

        // Fresh device memory holds whatever was there before.
        let mut rng = rand::thread_rng();
        let data: Vec<i32> = (0..elements).map(|_| rng.gen()).collect();

        let base = self
            .memory
            .lock()
            .reserve(
                device.id,
                AllocationKind::Buffer,
                data,
                self.config.memory_per_device,
            )
            .map_err(|message| ProbeError::AllocationFailure {
                device: device.id,
                bytes,
                message,
            })?;

        let ptr = DevicePointer::from_addr(base);
        debug!(device = %device.id, %ptr, elements, "allocated device buffer");
        Ok(ptr)
    }

    fn free(&self, ptr: DevicePointer) -> ProbeResult<()> {
        let mut state = self.memory.lock();
        match state.allocations.get(&ptr.addr()) {
            Some(allocation) if allocation.kind == AllocationKind::Buffer => {}
            _ => return Err(ProbeError::UnmappedAddress { address: ptr.addr() }),
        }
        state.release(ptr.addr());

        let stale: Vec<(DeviceId, u64)> = state
            .shadows
            .keys()
            .filter(|(_, origin)| *origin == ptr.addr())
            .copied()
            .collect();
        for key in stale {
            if let Some(shadow) = state.shadows.remove(&key) {
                state.release(shadow);
            }
        }

        debug!(%ptr, "released device buffer");
        Ok(())
    }

    fn submit(&self, device: &Device, launch: KernelLaunch<'_>) -> ProbeResult<CompletionToken> {
        let device = self.device(device)?;
        debug!(
            kernel = launch.name,
            device = %device.id,
            range = launch.range,
            captures = launch.captures.len(),
            "submitting kernel"
        );

        let frame = self.materialize(&mut self.memory.lock(), device.id, &launch)?;

        let outcome = {
            let mut lane = LaneView {
                runtime: self,
                executor: device.id,
            };
            let mut context = KernelContext::new(device, &frame, &mut lane);
            launch.execute(&mut context)
        };
        self.memory.lock().release(frame.base().addr());

        // Relaxed: independent counter
        self.kernels_launched.fetch_add(1, Ordering::Relaxed);

        Ok(match outcome {
            Ok(()) => CompletionToken::completed("kernel", device.id),
            Err(err) => {
                warn!(kernel = launch.name, device = %device.id, error = %err, "kernel faulted");
                let message = match err {
                    ProbeError::DispatchFailure { message, .. } => message,
                    other => other.to_string(),
                };
                CompletionToken::faulted(
                    "kernel",
                    device.id,
                    ProbeError::DispatchFailure {
                        device: device.id,
                        message: format!("{}: {message}", launch.name),
                    },
                )
            }
        })
    }

    fn copy_to_host(&self, dst: &mut [i32], src: DevicePointer) -> ProbeResult<CompletionToken> {
        let state = self.memory.lock();
        let span = match state.resolve(src, dst.len()) {
            Ok(span) => span,
            Err(SpanError::Unmapped) => {
                return Err(ProbeError::UnmappedAddress { address: src.addr() })
            }
            Err(SpanError::Misaligned { base }) => {
                return Err(ProbeError::ReadBackFailure {
                    device: state.allocation(base).owner,
                    message: format!("misaligned source {src}"),
                })
            }
            Err(SpanError::OutOfRange { base, len }) => {
                return Err(ProbeError::ReadBackFailure {
                    device: state.allocation(base).owner,
                    message: format!(
                        "copy of {} elements from {src} exceeds allocation of {len}",
                        dst.len()
                    ),
                })
            }
        };

        let allocation = state.allocation(span.base);
        if allocation.kind.is_private() {
            return Err(ProbeError::ReadBackFailure {
                device: allocation.owner,
                message: format!("{src} is device-private"),
            });
        }
        dst.copy_from_slice(&allocation.data[span.start..span.start + dst.len()]);

        // Relaxed: independent counter
        self.copies.fetch_add(1, Ordering::Relaxed);
        Ok(CompletionToken::completed("copy", allocation.owner))
    }

    fn fill(&self, dst: DevicePointer, value: i32, elements: usize) -> ProbeResult<CompletionToken> {
        let mut state = self.memory.lock();
        let span = match state.resolve(dst, elements) {
            Ok(span) => span,
            Err(SpanError::Unmapped) => {
                return Err(ProbeError::UnmappedAddress { address: dst.addr() })
            }
            Err(SpanError::Misaligned { base }) => {
                return Err(ProbeError::FillFailure {
                    device: state.allocation(base).owner,
                    message: format!("misaligned destination {dst}"),
                })
            }
            Err(SpanError::OutOfRange { base, len }) => {
                return Err(ProbeError::FillFailure {
                    device: state.allocation(base).owner,
                    message: format!(
                        "fill of {elements} elements at {dst} exceeds allocation of {len}"
                    ),
                })
            }
        };

        let allocation = state.allocation_mut(span.base);
        if allocation.kind.is_private() {
            return Err(ProbeError::FillFailure {
                device: allocation.owner,
                message: format!("{dst} is device-private"),
            });
        }
        allocation.data[span.start..span.start + elements].fill(value);
        let owner = allocation.owner;

        // Relaxed: independent counter
        self.fills.fetch_add(1, Ordering::Relaxed);
        Ok(CompletionToken::completed("fill", owner))
    }
}
