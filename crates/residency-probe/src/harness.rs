//! End-to-end probe run

use crate::allocator::{allocate_all, clear_all, BufferSet};
use crate::device::{Device, DeviceSelector};
use crate::dispatch::{CaptureStrategy, Dispatcher};
use crate::error::{ProbeError, ProbeResult};
use crate::runtime::DeviceRuntime;
use crate::topology::{PeerAccessMatrix, Topology};
use crate::validate::{compare_outcomes, EquivalenceCheck, StrategyOutcome};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, instrument, warn};

/// Default elements per buffer
pub const DEFAULT_ELEMENT_COUNT: usize = 100;

/// Probe run parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Elements per buffer
    pub element_count: usize,
    /// Discovery index of the device issuing every kernel
    pub issuer: usize,
    /// Devices to probe
    pub selector: DeviceSelector,
    /// Strategies to run, in order
    pub strategies: Vec<CaptureStrategy>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            element_count: DEFAULT_ELEMENT_COUNT,
            issuer: 0,
            selector: DeviceSelector::default(),
            strategies: CaptureStrategy::ALL.to_vec(),
        }
    }
}

impl ProbeConfig {
    /// Reject configurations the probe cannot run
    pub fn validate(&self) -> ProbeResult<()> {
        // Pattern values are the indices themselves
        if self.element_count > i32::MAX as usize {
            return Err(ProbeError::InvalidConfig {
                message: format!(
                    "element count {} exceeds {}",
                    self.element_count,
                    i32::MAX
                ),
            });
        }
        if self.strategies.is_empty() {
            return Err(ProbeError::InvalidConfig {
                message: "no capture strategies selected".to_string(),
            });
        }
        Ok(())
    }
}

/// Overall result of a probe run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Every strategy wrote the pattern and all strategies agree
    Pass,
    /// Strategies agree but some buffer is off-pattern
    PatternMismatch,
    /// Strategies left different contents in the same buffer
    Divergent,
}

impl Verdict {
    /// Process exit status for this verdict
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Pass => 0,
            Self::PatternMismatch => 2,
            Self::Divergent => 3,
        }
    }

    /// Short name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::PatternMismatch => "pattern_mismatch",
            Self::Divergent => "divergent",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything a probe run observed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeReport {
    /// Backend that ran the probe
    pub runtime: String,
    /// Parameters of the run
    pub config: ProbeConfig,
    /// Discovered devices
    pub devices: Vec<Device>,
    /// Peer access between them
    pub peers: PeerAccessMatrix,
    /// One outcome per strategy, in run order
    pub outcomes: Vec<StrategyOutcome>,
    /// Cross-strategy comparisons
    pub checks: Vec<EquivalenceCheck>,
    /// Overall result
    pub verdict: Verdict,
}

impl ProbeReport {
    /// Outcome of `strategy`, if it ran
    pub fn outcome(&self, strategy: CaptureStrategy) -> Option<&StrategyOutcome> {
        self.outcomes.iter().find(|outcome| outcome.strategy == strategy)
    }

    /// Device that issued every kernel
    pub fn issuer(&self) -> Option<&Device> {
        self.devices.get(self.config.issuer)
    }
}

/// Strategy pairs compared after a run
const EQUIVALENCES: [(CaptureStrategy, CaptureStrategy); 2] = [
    (CaptureStrategy::DirectPointer, CaptureStrategy::WrappedPointer),
    (CaptureStrategy::WrappedPointer, CaptureStrategy::Mixed),
];

/// Run the full probe: discover, allocate, dispatch every strategy, validate
///
/// Buffers are cleared before the first strategy and after each one. They
/// are released before returning, whether or not the run succeeded.
#[instrument(skip(runtime, config), fields(runtime = runtime.name()))]
pub fn run_probe(runtime: &dyn DeviceRuntime, config: &ProbeConfig) -> ProbeResult<ProbeReport> {
    config.validate()?;

    let topology = Topology::probe(runtime, &config.selector)?;
    let issuer = topology.device(config.issuer)?.clone();
    info!(issuer = %issuer, element_count = config.element_count, "starting probe");

    let buffers = allocate_all(runtime, &topology.devices, config.element_count)?;
    let result = run_strategies(runtime, config, &topology, &issuer, &buffers);
    let released = buffers.release(runtime);
    let outcomes = result?;
    released?;

    let checks: Vec<EquivalenceCheck> = EQUIVALENCES
        .iter()
        .filter_map(|&(reference, candidate)| {
            let reference = outcomes.iter().find(|o| o.strategy == reference)?;
            let candidate = outcomes.iter().find(|o| o.strategy == candidate)?;
            Some(compare_outcomes(reference, candidate))
        })
        .collect();

    let verdict = if checks.iter().any(|check| !check.is_equivalent()) {
        Verdict::Divergent
    } else if outcomes.iter().any(|outcome| !outcome.all_match()) {
        Verdict::PatternMismatch
    } else {
        Verdict::Pass
    };

    for check in checks.iter().filter(|check| !check.is_equivalent()) {
        warn!(
            reference = %check.reference,
            candidate = %check.candidate,
            buffers = check.divergent.len(),
            "strategies diverge"
        );
    }
    info!(%verdict, "probe finished");

    Ok(ProbeReport {
        runtime: runtime.name().to_string(),
        config: config.clone(),
        devices: topology.devices,
        peers: topology.peers,
        outcomes,
        checks,
        verdict,
    })
}

fn run_strategies(
    runtime: &dyn DeviceRuntime,
    config: &ProbeConfig,
    topology: &Topology,
    issuer: &Device,
    buffers: &BufferSet,
) -> ProbeResult<Vec<StrategyOutcome>> {
    let dispatcher = Dispatcher::new(runtime, &topology.peers);
    clear_all(runtime, buffers)?;

    let mut outcomes = Vec::with_capacity(config.strategies.len());
    for &strategy in &config.strategies {
        let unreachable = dispatcher.dispatch(strategy, issuer, buffers, config.element_count)?;
        let outcome = StrategyOutcome::collect(
            runtime,
            strategy,
            issuer.id,
            buffers,
            config.element_count,
            unreachable,
        )?;
        if !outcome.all_match() {
            warn!(%strategy, "buffers do not hold the expected pattern");
        }
        outcomes.push(outcome);
        clear_all(runtime, buffers)?;
    }
    Ok(outcomes)
}
