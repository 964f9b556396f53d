//! Integration tests across topology, allocation, dispatch and validation

use crate::*;
use pretty_assertions::assert_eq;

fn pattern(n: usize) -> Vec<i32> {
    (0..n).map(pattern_value).collect()
}

#[test]
fn test_manual_probe_workflow() {
    let runtime = SimulatedRuntime::new(SimulatedConfig::default().with_root_devices(3));
    let topology = Topology::probe(&runtime, &DeviceSelector::gpus()).unwrap();
    let buffers = allocate_all(&runtime, &topology.devices, 32).unwrap();
    clear_all(&runtime, &buffers).unwrap();

    let issuer = &topology.devices[2];
    let dispatcher = Dispatcher::new(&runtime, &topology.peers);
    let unreachable = dispatcher
        .dispatch(CaptureStrategy::DirectPointer, issuer, &buffers, 32)
        .unwrap();
    let direct = StrategyOutcome::collect(
        &runtime,
        CaptureStrategy::DirectPointer,
        issuer.id,
        &buffers,
        32,
        unreachable,
    )
    .unwrap();
    assert!(direct.all_match());

    clear_all(&runtime, &buffers).unwrap();
    for buffer in buffers.iter() {
        assert_eq!(read_back(&runtime, buffer, 32).unwrap(), vec![0; 32]);
    }

    dispatcher
        .dispatch(CaptureStrategy::WrappedPointer, issuer, &buffers, 32)
        .unwrap();
    let wrapped = StrategyOutcome::collect(
        &runtime,
        CaptureStrategy::WrappedPointer,
        issuer.id,
        &buffers,
        32,
        Vec::new(),
    )
    .unwrap();

    assert!(compare_outcomes(&direct, &wrapped).is_equivalent());
    buffers.release(&runtime).unwrap();
}

#[test]
fn test_numa_partitioned_probe() {
    let runtime = SimulatedRuntime::new(
        SimulatedConfig::default()
            .with_numa_domains(2)
            .with_peer_policy(PeerPolicy::SameRoot),
    );
    let config = ProbeConfig {
        selector: DeviceSelector::gpu_numa_domains(),
        element_count: 12,
        ..ProbeConfig::default()
    };
    let report = run_probe(&runtime, &config).unwrap();

    assert_eq!(report.devices.len(), 4);
    assert!(report.devices.iter().all(Device::is_sub_device));
    assert_eq!(report.verdict, Verdict::Pass);

    // Sub-devices of root 1 are out of reach of the issuer on root 0
    for outcome in &report.outcomes {
        assert_eq!(outcome.unreachable, vec![DeviceId(4), DeviceId(5)]);
        assert_eq!(outcome.readouts.len(), 2);
        for readout in &outcome.readouts {
            assert_eq!(readout.values, pattern(12));
        }
    }
}

#[test]
fn test_report_serializes() {
    let runtime = SimulatedRuntime::new(SimulatedConfig::default());
    let config = ProbeConfig {
        element_count: 3,
        ..ProbeConfig::default()
    };
    let report = run_probe(&runtime, &config).unwrap();

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["runtime"], "simulated");
    assert_eq!(json["verdict"], "pass");
    assert_eq!(json["outcomes"][0]["strategy"], "direct_pointer");
    assert_eq!(json["outcomes"][1]["readouts"][1]["values"], serde_json::json!([0, 1, 2]));

    let back: ProbeReport = serde_json::from_value(json).unwrap();
    assert_eq!(back, report);
}

#[test]
fn test_rendered_readout() {
    let runtime = SimulatedRuntime::new(SimulatedConfig::default());
    let config = ProbeConfig {
        element_count: 12,
        strategies: vec![CaptureStrategy::Mixed],
        ..ProbeConfig::default()
    };
    let report = run_probe(&runtime, &config).unwrap();
    let readout = &report.outcomes[0].readouts[1];

    assert_eq!(
        render(&readout.values, None),
        "[0, 1, 2, 3, 4, 5, 6, 7, 8, 9,\n 10, 11]"
    );
}
