//! Device runtime interface and the offloaded-work capture model
//!
//! A unit of work never closes over host variables directly. Its captured
//! values are declared up front in a [`CaptureList`]; the runtime
//! materializes them into a [`CaptureFrame`] that lives in the executing
//! device's private context, and the kernel body reads them back through
//! [`KernelContext`]. This keeps the two capture modes under test (a bare
//! address versus an aggregate holding an address) observable to the
//! runtime instead of hidden inside a closure environment.

use crate::device::{Device, DeviceId, DeviceSelector};
use crate::error::{ProbeError, ProbeResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of one buffer element in bytes
pub const ELEMENT_SIZE: usize = std::mem::size_of::<i32>();

/// Size of one materialized capture in bytes
pub const CAPTURE_SIZE: usize = std::mem::size_of::<u64>();

/// Opaque device address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct DevicePointer(u64);

impl DevicePointer {
    /// Null address
    pub const NULL: Self = Self(0);

    /// Wrap a raw address value
    pub const fn from_addr(addr: u64) -> Self {
        Self(addr)
    }

    /// Raw address value
    pub const fn addr(self) -> u64 {
        self.0
    }

    /// Check for the null address
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address of the `index`-th `i32` element starting at this address
    pub const fn element(self, index: usize) -> Self {
        Self(self.0 + (index * ELEMENT_SIZE) as u64)
    }

    /// Address `bytes` past this one
    pub const fn byte_offset(self, bytes: usize) -> Self {
        Self(self.0 + bytes as u64)
    }
}

impl fmt::Display for DevicePointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Aggregate wrapping exactly one device pointer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct PointerHandle {
    pointer: DevicePointer,
}

impl PointerHandle {
    /// Wrap a device pointer
    pub const fn new(pointer: DevicePointer) -> Self {
        Self { pointer }
    }

    /// The wrapped pointer
    pub const fn pointer(&self) -> DevicePointer {
        self.pointer
    }
}

/// Kind of a captured value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureKind {
    /// Bare device pointer
    Raw,
    /// Pointer-wrapping aggregate
    Aggregate,
    /// Plain integer
    Scalar,
}

/// One value captured into a unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capture {
    /// Bare device pointer captured by value
    Raw(DevicePointer),
    /// Aggregate captured by value
    Aggregate(PointerHandle),
    /// Integer captured by value
    Scalar(u64),
}

impl Capture {
    /// Kind tag
    pub fn kind(&self) -> CaptureKind {
        match self {
            Self::Raw(_) => CaptureKind::Raw,
            Self::Aggregate(_) => CaptureKind::Aggregate,
            Self::Scalar(_) => CaptureKind::Scalar,
        }
    }

    /// Byte image of the captured value as it is copied to the device
    pub fn to_bytes(&self) -> [u8; CAPTURE_SIZE] {
        match self {
            Self::Raw(ptr) => ptr.addr().to_le_bytes(),
            Self::Aggregate(handle) => handle.pointer().addr().to_le_bytes(),
            Self::Scalar(value) => value.to_le_bytes(),
        }
    }
}

/// Index of a capture within its list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CaptureSlot(usize);

impl CaptureSlot {
    /// Position in the capture list
    pub fn index(self) -> usize {
        self.0
    }
}

/// Values captured by one unit of work, in declaration order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureList {
    captures: Vec<Capture>,
}

impl CaptureList {
    /// Empty capture list
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture a bare device pointer by value
    pub fn raw(&mut self, pointer: DevicePointer) -> CaptureSlot {
        self.push(Capture::Raw(pointer))
    }

    /// Capture a pointer-wrapping aggregate by value
    pub fn aggregate(&mut self, handle: PointerHandle) -> CaptureSlot {
        self.push(Capture::Aggregate(handle))
    }

    /// Capture an integer by value
    pub fn scalar(&mut self, value: u64) -> CaptureSlot {
        self.push(Capture::Scalar(value))
    }

    fn push(&mut self, capture: Capture) -> CaptureSlot {
        self.captures.push(capture);
        CaptureSlot(self.captures.len() - 1)
    }

    /// Captures in declaration order
    pub fn iter(&self) -> impl Iterator<Item = &Capture> {
        self.captures.iter()
    }

    /// Number of captures
    pub fn len(&self) -> usize {
        self.captures.len()
    }

    /// Check if nothing is captured
    pub fn is_empty(&self) -> bool {
        self.captures.is_empty()
    }

    /// Bytes needed to materialize the list on a device
    pub fn frame_size(&self) -> usize {
        self.captures.len() * CAPTURE_SIZE
    }
}

#[derive(Debug, Clone, Copy)]
struct FrameEntry {
    kind: CaptureKind,
    bytes: [u8; CAPTURE_SIZE],
}

/// Captured values as materialized in one device's private context
///
/// Entries are laid out contiguously from `base`, one `CAPTURE_SIZE`
/// slot each, in capture-list order.
#[derive(Debug, Clone)]
pub struct CaptureFrame {
    device: DeviceId,
    base: DevicePointer,
    entries: Vec<FrameEntry>,
}

impl CaptureFrame {
    /// Empty frame at `base` on `device`
    pub fn new(device: DeviceId, base: DevicePointer) -> Self {
        Self {
            device,
            base,
            entries: Vec::new(),
        }
    }

    /// Byte-for-byte copy of every capture
    pub fn materialize(captures: &CaptureList, device: DeviceId, base: DevicePointer) -> Self {
        let mut frame = Self::new(device, base);
        for capture in captures.iter() {
            frame.push(capture.kind(), capture.to_bytes());
        }
        frame
    }

    /// Append a materialized capture
    pub fn push(&mut self, kind: CaptureKind, bytes: [u8; CAPTURE_SIZE]) {
        self.entries.push(FrameEntry { kind, bytes });
    }

    /// Device holding the frame
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Frame base address
    pub fn base(&self) -> DevicePointer {
        self.base
    }

    /// Device-private address of a captured copy
    pub fn location(&self, slot: CaptureSlot) -> Option<DevicePointer> {
        (slot.0 < self.entries.len()).then(|| self.base.byte_offset(slot.0 * CAPTURE_SIZE))
    }

    fn read(&self, slot: CaptureSlot, expected: CaptureKind) -> ProbeResult<u64> {
        let entry = self
            .entries
            .get(slot.0)
            .ok_or_else(|| ProbeError::DispatchFailure {
                device: self.device,
                message: format!("capture slot {} out of range", slot.0),
            })?;
        if entry.kind != expected {
            return Err(ProbeError::DispatchFailure {
                device: self.device,
                message: format!(
                    "capture slot {} holds {:?}, not {:?}",
                    slot.0, entry.kind, expected
                ),
            });
        }
        Ok(u64::from_le_bytes(entry.bytes))
    }
}

/// Device memory as seen by an executing kernel
pub trait LaneMemory {
    /// Write one element
    fn store(&mut self, ptr: DevicePointer, value: i32) -> ProbeResult<()>;

    /// Read one element
    fn load(&self, ptr: DevicePointer) -> ProbeResult<i32>;
}

/// Execution context handed to a kernel body for each work item
pub struct KernelContext<'a> {
    device: &'a Device,
    frame: &'a CaptureFrame,
    memory: &'a mut dyn LaneMemory,
}

impl<'a> KernelContext<'a> {
    /// Bind a frame and device memory view to an executing device
    pub fn new(device: &'a Device, frame: &'a CaptureFrame, memory: &'a mut dyn LaneMemory) -> Self {
        Self {
            device,
            frame,
            memory,
        }
    }

    /// Executing device
    pub fn device(&self) -> &Device {
        self.device
    }

    /// Captured bare pointer, decoded from the device-private copy
    pub fn raw(&self, slot: CaptureSlot) -> ProbeResult<DevicePointer> {
        self.frame
            .read(slot, CaptureKind::Raw)
            .map(DevicePointer::from_addr)
    }

    /// Captured aggregate, decoded from the device-private copy
    pub fn aggregate(&self, slot: CaptureSlot) -> ProbeResult<PointerHandle> {
        self.frame
            .read(slot, CaptureKind::Aggregate)
            .map(|addr| PointerHandle::new(DevicePointer::from_addr(addr)))
    }

    /// Captured integer
    pub fn scalar(&self, slot: CaptureSlot) -> ProbeResult<u64> {
        self.frame.read(slot, CaptureKind::Scalar)
    }

    /// Where the captured copy itself lives on the executing device
    pub fn capture_location(&self, slot: CaptureSlot) -> ProbeResult<DevicePointer> {
        self.frame
            .location(slot)
            .ok_or_else(|| ProbeError::DispatchFailure {
                device: self.device.id,
                message: format!("capture slot {} out of range", slot.0),
            })
    }

    /// Write one element of device memory
    pub fn store(&mut self, ptr: DevicePointer, value: i32) -> ProbeResult<()> {
        self.memory.store(ptr, value)
    }

    /// Read one element of device memory
    pub fn load(&self, ptr: DevicePointer) -> ProbeResult<i32> {
        self.memory.load(ptr)
    }
}

/// Kernel body, invoked once per index of the iteration space
pub type KernelBody<'a> = dyn Fn(&mut KernelContext<'_>, usize) -> ProbeResult<()> + 'a;

/// One offloaded unit of work
pub struct KernelLaunch<'a> {
    /// Kernel name for logs and fault messages
    pub name: &'static str,
    /// Values captured by value into the work
    pub captures: CaptureList,
    /// One-dimensional iteration space `[0, range)`
    pub range: usize,
    body: Box<KernelBody<'a>>,
}

impl<'a> KernelLaunch<'a> {
    /// Build a launch from its captures, range and body
    pub fn new<F>(name: &'static str, captures: CaptureList, range: usize, body: F) -> Self
    where
        F: Fn(&mut KernelContext<'_>, usize) -> ProbeResult<()> + 'a,
    {
        Self {
            name,
            captures,
            range,
            body: Box::new(body),
        }
    }

    /// Run the body over the whole iteration space, stopping at the first fault
    pub fn execute(&self, context: &mut KernelContext<'_>) -> ProbeResult<()> {
        for index in 0..self.range {
            (self.body)(context, index)?;
        }
        Ok(())
    }
}

impl fmt::Debug for KernelLaunch<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelLaunch")
            .field("name", &self.name)
            .field("captures", &self.captures)
            .field("range", &self.range)
            .finish_non_exhaustive()
    }
}

/// Completion handle for an asynchronous device operation
#[must_use = "device operations must be waited on before their results are used"]
#[derive(Debug)]
pub struct CompletionToken {
    operation: &'static str,
    device: DeviceId,
    outcome: ProbeResult<()>,
}

impl CompletionToken {
    /// Token for an operation that finished cleanly
    pub fn completed(operation: &'static str, device: DeviceId) -> Self {
        Self {
            operation,
            device,
            outcome: Ok(()),
        }
    }

    /// Token for an operation whose fault is reported on wait
    pub fn faulted(operation: &'static str, device: DeviceId, error: ProbeError) -> Self {
        Self {
            operation,
            device,
            outcome: Err(error),
        }
    }

    /// Operation name
    pub fn operation(&self) -> &'static str {
        self.operation
    }

    /// Device the operation ran on
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Block until the operation completes and surface any fault
    pub fn wait(self) -> ProbeResult<()> {
        self.outcome
    }
}

/// Accelerator runtime services consumed by the probe
///
/// Every operation returning a [`CompletionToken`] may complete
/// asynchronously; callers wait on the token before touching results.
pub trait DeviceRuntime {
    /// Backend name for logs and reports
    fn name(&self) -> &str;

    /// Devices matching `selector`, in a stable order
    fn enumerate_devices(&self, selector: &DeviceSelector) -> ProbeResult<Vec<Device>>;

    /// Whether `device` can directly access memory resident on `peer`
    fn can_access_peer(&self, device: &Device, peer: &Device) -> ProbeResult<bool>;

    /// Allocate `elements` `i32` slots resident on `device`; contents are unspecified
    fn allocate(&self, elements: usize, device: &Device) -> ProbeResult<DevicePointer>;

    /// Release an allocation
    fn free(&self, ptr: DevicePointer) -> ProbeResult<()>;

    /// Submit a unit of work to execute on `device`
    fn submit(&self, device: &Device, launch: KernelLaunch<'_>) -> ProbeResult<CompletionToken>;

    /// Copy `dst.len()` elements from device memory at `src` to the host
    fn copy_to_host(&self, dst: &mut [i32], src: DevicePointer) -> ProbeResult<CompletionToken>;

    /// Set `elements` elements starting at `dst` to `value`
    fn fill(&self, dst: DevicePointer, value: i32, elements: usize) -> ProbeResult<CompletionToken>;
}
