//! Host-side read-back and pattern validation

use crate::allocator::{BufferSet, DeviceBuffer};
use crate::device::DeviceId;
use crate::dispatch::{pattern_value, CaptureStrategy};
use crate::error::{ProbeError, ProbeResult};
use crate::runtime::DeviceRuntime;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Copy the first `element_count` elements of `buffer` to the host
pub fn read_back(
    runtime: &dyn DeviceRuntime,
    buffer: &DeviceBuffer,
    element_count: usize,
) -> ProbeResult<Vec<i32>> {
    let read_failure = |err: ProbeError| match err {
        err @ ProbeError::ReadBackFailure { .. } => err,
        other => ProbeError::ReadBackFailure {
            device: buffer.device,
            message: other.to_string(),
        },
    };

    let mut values = vec![0; element_count];
    runtime
        .copy_to_host(&mut values, buffer.pointer())
        .map_err(read_failure)?
        .wait()
        .map_err(read_failure)?;
    Ok(values)
}

/// Whether `values` is exactly `0, 1, ..., element_count - 1`
pub fn expect_pattern(values: &[i32], element_count: usize) -> bool {
    values.len() == element_count && first_mismatch(values, element_count).is_none()
}

/// First index whose value differs from the pattern
///
/// A length difference counts as a mismatch at the shorter length.
pub fn first_mismatch(values: &[i32], element_count: usize) -> Option<usize> {
    values
        .iter()
        .take(element_count)
        .enumerate()
        .position(|(index, &value)| value != pattern_value(index))
        .or_else(|| (values.len() != element_count).then(|| values.len().min(element_count)))
}

/// Number of indices whose value differs from the pattern
pub fn mismatch_count(values: &[i32], element_count: usize) -> usize {
    let differing = values
        .iter()
        .take(element_count)
        .enumerate()
        .filter(|&(index, &value)| value != pattern_value(index))
        .count();
    differing + values.len().abs_diff(element_count)
}

/// One buffer's contents after a strategy ran
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferReadout {
    /// Device owning the buffer
    pub device: DeviceId,
    /// Values read back
    pub values: Vec<i32>,
    /// Whether the values are the expected pattern
    pub matches_pattern: bool,
    /// Number of indices off-pattern
    pub mismatches: usize,
}

impl BufferReadout {
    /// Read `buffer` back and score it against the pattern
    pub fn capture(
        runtime: &dyn DeviceRuntime,
        buffer: &DeviceBuffer,
        element_count: usize,
    ) -> ProbeResult<Self> {
        let values = read_back(runtime, buffer, element_count)?;
        let mismatches = mismatch_count(&values, element_count);
        debug!(device = %buffer.device, mismatches, "buffer read back");
        Ok(Self {
            device: buffer.device,
            matches_pattern: mismatches == 0,
            mismatches,
            values,
        })
    }
}

/// Result of running one strategy from one issuer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyOutcome {
    /// Strategy that ran
    pub strategy: CaptureStrategy,
    /// Issuing device
    pub issuer: DeviceId,
    /// Buffers read back, in discovery order
    pub readouts: Vec<BufferReadout>,
    /// Buffers skipped because the issuer cannot access them
    pub unreachable: Vec<DeviceId>,
}

impl StrategyOutcome {
    /// Read back every buffer the strategy wrote
    pub fn collect(
        runtime: &dyn DeviceRuntime,
        strategy: CaptureStrategy,
        issuer: DeviceId,
        buffers: &BufferSet,
        element_count: usize,
        unreachable: Vec<DeviceId>,
    ) -> ProbeResult<Self> {
        let readouts = buffers
            .iter()
            .filter(|buffer| !unreachable.contains(&buffer.device))
            .map(|buffer| BufferReadout::capture(runtime, buffer, element_count))
            .collect::<ProbeResult<Vec<_>>>()?;
        Ok(Self {
            strategy,
            issuer,
            readouts,
            unreachable,
        })
    }

    /// Readout of the buffer on `device`
    pub fn readout(&self, device: DeviceId) -> Option<&BufferReadout> {
        self.readouts.iter().find(|readout| readout.device == device)
    }

    /// Whether every reachable buffer holds the pattern
    pub fn all_match(&self) -> bool {
        self.readouts.iter().all(|readout| readout.matches_pattern)
    }
}

/// A buffer whose contents differ between two strategies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Divergence {
    /// Device owning the buffer
    pub device: DeviceId,
    /// First differing index
    pub first_index: usize,
}

/// Bitwise comparison of two strategies over the same buffers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquivalenceCheck {
    /// Strategy compared against
    pub reference: CaptureStrategy,
    /// Strategy under comparison
    pub candidate: CaptureStrategy,
    /// Buffers that differ
    pub divergent: Vec<Divergence>,
}

impl EquivalenceCheck {
    /// Whether both strategies left identical contents
    pub fn is_equivalent(&self) -> bool {
        self.divergent.is_empty()
    }
}

/// Compare every buffer read back in both outcomes
///
/// Buffers present in only one outcome diverge at index 0.
pub fn compare_outcomes(reference: &StrategyOutcome, candidate: &StrategyOutcome) -> EquivalenceCheck {
    let mut divergent = Vec::new();
    for expected in &reference.readouts {
        let first_index = match candidate.readout(expected.device) {
            Some(actual) => first_difference(&expected.values, &actual.values),
            None => Some(0),
        };
        if let Some(first_index) = first_index {
            divergent.push(Divergence {
                device: expected.device,
                first_index,
            });
        }
    }
    for actual in &candidate.readouts {
        if reference.readout(actual.device).is_none() {
            divergent.push(Divergence {
                device: actual.device,
                first_index: 0,
            });
        }
    }

    EquivalenceCheck {
        reference: reference.strategy,
        candidate: candidate.strategy,
        divergent,
    }
}

fn first_difference(a: &[i32], b: &[i32]) -> Option<usize> {
    a.iter()
        .zip(b)
        .position(|(x, y)| x != y)
        .or_else(|| (a.len() != b.len()).then(|| a.len().min(b.len())))
}
