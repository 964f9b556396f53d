//! Residency CLI structure
//!
//! Selector and simulated-backend flags are global so they can follow the
//! subcommand.

use clap::{Args, Parser, Subcommand, ValueEnum};
use residency_probe::harness::DEFAULT_ELEMENT_COUNT;
use residency_probe::simulated::DEFAULT_MEMORY_PER_DEVICE;
use residency_probe::{
    AggregateCapture, CaptureStrategy, DeviceSelector, DeviceType, Partitioning, PeerPolicy,
    ProbeConfig, SimulatedConfig,
};
use std::str::FromStr;

/// Residency - device-memory residency probe for offloaded kernels
///
/// Writes a known pattern into one buffer per device from a single issuing
/// device, capturing the buffer address as a raw pointer, as a
/// pointer-wrapping aggregate, and as both, then reads every buffer back.
#[derive(Parser, Debug)]
#[command(name = "residency")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Output format
    #[arg(short, long, default_value = "table", global = true, env = "RESIDENCY_FORMAT")]
    pub format: OutputFormat,

    #[command(flatten)]
    pub selector: SelectorArgs,

    #[command(flatten)]
    pub backend: BackendArgs,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Plain,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run every capture strategy and validate the buffers (default)
    Run(RunArgs),

    /// Discover devices and show the peer-access matrix
    Topology,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Elements per buffer
    #[arg(short = 'n', long, default_value_t = DEFAULT_ELEMENT_COUNT, env = "RESIDENCY_ELEMENT_COUNT")]
    pub element_count: usize,

    /// Discovery index of the device issuing every kernel
    #[arg(short, long, default_value_t = 0, env = "RESIDENCY_ISSUER")]
    pub issuer: usize,

    /// Strategy to run; repeat to run several (default: all, in order)
    #[arg(short, long = "strategy", value_enum)]
    pub strategies: Vec<StrategyArg>,
}

impl Default for RunArgs {
    fn default() -> Self {
        Self {
            element_count: DEFAULT_ELEMENT_COUNT,
            issuer: 0,
            strategies: Vec::new(),
        }
    }
}

impl RunArgs {
    /// Probe configuration for these arguments
    pub fn probe_config(&self, selector: DeviceSelector) -> ProbeConfig {
        let strategies = if self.strategies.is_empty() {
            CaptureStrategy::ALL.to_vec()
        } else {
            self.strategies.iter().map(|&s| s.into()).collect()
        };
        ProbeConfig {
            element_count: self.element_count,
            issuer: self.issuer,
            selector,
            strategies,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct SelectorArgs {
    /// Device class to probe
    #[arg(long, value_enum, default_value = "gpu", global = true, env = "RESIDENCY_DEVICE_TYPE")]
    pub device_type: DeviceTypeArg,

    /// Probe root devices or their NUMA sub-devices
    #[arg(long, value_enum, default_value = "root", global = true, env = "RESIDENCY_PARTITION")]
    pub partition: PartitionArg,
}

impl SelectorArgs {
    /// Device selection policy
    pub fn selector(&self) -> DeviceSelector {
        DeviceSelector {
            device_type: self.device_type.into(),
            partition: match self.partition {
                PartitionArg::Root => Partitioning::Root,
                PartitionArg::Numa => Partitioning::Numa,
            },
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct BackendArgs {
    /// Simulated root devices
    #[arg(long = "devices", default_value_t = 2, global = true, env = "RESIDENCY_DEVICES")]
    pub root_devices: u32,

    /// NUMA sub-devices per simulated root (0 = not partitionable)
    #[arg(long, default_value_t = 2, global = true, env = "RESIDENCY_NUMA_DOMAINS")]
    pub numa_domains: u32,

    /// Default peer relation between simulated devices
    #[arg(long, value_enum, default_value = "all", global = true, env = "RESIDENCY_PEER_POLICY")]
    pub peer_policy: PeerPolicyArg,

    /// Deny access from device I to memory on device J (repeatable)
    #[arg(long = "deny-peer", value_name = "I:J", global = true)]
    pub deny_peers: Vec<PeerPair>,

    /// How aggregate captures reach the executing device
    #[arg(
        long,
        value_enum,
        default_value = "faithful",
        global = true,
        env = "RESIDENCY_AGGREGATE_CAPTURE"
    )]
    pub aggregate_capture: AggregateCaptureArg,

    /// Memory per simulated device in bytes
    #[arg(long, default_value_t = DEFAULT_MEMORY_PER_DEVICE, global = true, env = "RESIDENCY_MEMORY_PER_DEVICE")]
    pub memory_per_device: usize,
}

impl BackendArgs {
    /// Simulated runtime configuration
    pub fn simulated_config(&self) -> SimulatedConfig {
        let mut config = SimulatedConfig::default()
            .with_root_devices(self.root_devices)
            .with_numa_domains(self.numa_domains)
            .with_device_type(DeviceType::GPU)
            .with_peer_policy(self.peer_policy.into())
            .with_aggregate_capture(match self.aggregate_capture {
                AggregateCaptureArg::Faithful => AggregateCapture::Faithful,
                AggregateCaptureArg::DevicePrivate => AggregateCapture::DevicePrivate,
            })
            .with_memory_per_device(self.memory_per_device);
        for pair in &self.deny_peers {
            config = config.with_peer_override(pair.from, pair.to, false);
        }
        config
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum DeviceTypeArg {
    Gpu,
    Cpu,
    Accelerator,
    Any,
}

impl From<DeviceTypeArg> for DeviceType {
    fn from(arg: DeviceTypeArg) -> Self {
        match arg {
            DeviceTypeArg::Gpu => DeviceType::GPU,
            DeviceTypeArg::Cpu => DeviceType::CPU,
            DeviceTypeArg::Accelerator => DeviceType::ACCELERATOR,
            DeviceTypeArg::Any => DeviceType::all(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum PartitionArg {
    Root,
    Numa,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum PeerPolicyArg {
    All,
    SameRoot,
    SelfOnly,
}

impl From<PeerPolicyArg> for PeerPolicy {
    fn from(arg: PeerPolicyArg) -> Self {
        match arg {
            PeerPolicyArg::All => PeerPolicy::All,
            PeerPolicyArg::SameRoot => PeerPolicy::SameRoot,
            PeerPolicyArg::SelfOnly => PeerPolicy::SelfOnly,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum AggregateCaptureArg {
    Faithful,
    DevicePrivate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum StrategyArg {
    Direct,
    Wrapped,
    Mixed,
}

impl From<StrategyArg> for CaptureStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Direct => CaptureStrategy::DirectPointer,
            StrategyArg::Wrapped => CaptureStrategy::WrappedPointer,
            StrategyArg::Mixed => CaptureStrategy::Mixed,
        }
    }
}

/// Ordered device pair given as `I:J`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerPair {
    pub from: u32,
    pub to: u32,
}

impl FromStr for PeerPair {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (from, to) = s
            .split_once(':')
            .ok_or_else(|| format!("expected I:J, got '{s}'"))?;
        let parse = |part: &str| {
            part.trim()
                .parse::<u32>()
                .map_err(|e| format!("invalid device id '{part}': {e}"))
        };
        Ok(Self {
            from: parse(from)?,
            to: parse(to)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_command_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["residency"]).unwrap();
        assert_eq!(cli.verbose, 0);
        assert_eq!(cli.format, OutputFormat::Table);
        assert!(cli.command.is_none());
        assert_eq!(cli.selector.selector(), DeviceSelector::gpus());

        let config = cli.backend.simulated_config();
        assert_eq!(config, SimulatedConfig::default());
    }

    #[test]
    fn test_run_arguments() {
        let cli = Cli::try_parse_from([
            "residency",
            "run",
            "-n",
            "12",
            "--issuer",
            "1",
            "--strategy",
            "wrapped",
            "--strategy",
            "direct",
            "-vv",
            "--format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.format, OutputFormat::Json);

        let Some(Commands::Run(run)) = cli.command else {
            panic!("Expected run subcommand");
        };
        let config = run.probe_config(DeviceSelector::gpus());
        assert_eq!(config.element_count, 12);
        assert_eq!(config.issuer, 1);
        assert_eq!(
            config.strategies,
            vec![CaptureStrategy::WrappedPointer, CaptureStrategy::DirectPointer]
        );
    }

    #[test]
    fn test_backend_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "residency",
            "topology",
            "--devices",
            "3",
            "--peer-policy",
            "self-only",
            "--deny-peer",
            "0:1",
            "--aggregate-capture",
            "device-private",
            "--partition",
            "numa",
        ])
        .unwrap();
        assert!(matches!(cli.command, Some(Commands::Topology)));

        let config = cli.backend.simulated_config();
        assert_eq!(config.root_devices, 3);
        assert_eq!(config.peer_policy, PeerPolicy::SelfOnly);
        assert_eq!(config.aggregate_capture, AggregateCapture::DevicePrivate);
        assert_eq!(config.peer_overrides.len(), 1);
        assert!(!config.peer_overrides[0].allowed);
        assert_eq!(cli.selector.selector(), DeviceSelector::gpu_numa_domains());
    }

    #[test]
    fn test_peer_pair_parsing() {
        assert_eq!("2:3".parse::<PeerPair>(), Ok(PeerPair { from: 2, to: 3 }));
        assert!("2".parse::<PeerPair>().is_err());
        assert!("a:1".parse::<PeerPair>().is_err());
        assert!(Cli::try_parse_from(["residency", "--deny-peer", "1-2"]).is_err());
    }

    #[test]
    fn test_any_device_type() {
        let cli = Cli::try_parse_from(["residency", "--device-type", "any"]).unwrap();
        assert!(cli.selector.selector().accepts(DeviceType::CPU));
    }
}
