//! Report rendering for table, plain and JSON output

use anyhow::Result;
use console::style;
use residency_probe::{render, EquivalenceCheck, ProbeReport, StrategyOutcome, Topology, Verdict};
use std::fmt::Write;

use crate::cli::OutputFormat;

/// Print a finished probe run
pub fn print_report(report: &ProbeReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(report)?),
        OutputFormat::Plain => print!("{}", transcript(report)),
        OutputFormat::Table => {
            print!("{}", transcript(report));
            print_summary_table(report);
        }
    }
    Ok(())
}

/// Print discovered devices and their peer matrix
pub fn print_topology(topology: &Topology, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(topology)?),
        OutputFormat::Plain => print!("{}", topology.peers),
        OutputFormat::Table => {
            println!(
                "{:6} {:28} {:8} {:6}",
                style("ID").bold().underlined(),
                style("NAME").bold().underlined(),
                style("PARENT").bold().underlined(),
                style("NUMA").bold().underlined()
            );
            for device in &topology.devices {
                println!(
                    "{:6} {:28} {:8} {:6}",
                    device.id,
                    device.name,
                    device.parent.map_or_else(|| "-".to_string(), |p| p.to_string()),
                    device.numa_domain.map_or_else(|| "-".to_string(), |d| d.to_string()),
                );
            }
            println!();
            print!("{}", topology.peers);
        }
    }
    Ok(())
}

/// Step-by-step account of the run, one section per strategy
pub fn transcript(report: &ProbeReport) -> String {
    let mut out = String::new();
    let issuer = report.config.issuer;

    // Writing into a String cannot fail
    let _ = write!(out, "{}", report.peers);
    let _ = writeln!(out, "Allocate buffer on each device...");
    let _ = writeln!(out, "Clearing buffers...");
    for outcome in &report.outcomes {
        let _ = writeln!(
            out,
            "Write to buffers from device {issuer} using {}...",
            outcome.strategy.description()
        );
        write_readouts(&mut out, report, outcome);
        let _ = writeln!(out, "Clearing buffers...");
    }

    if !report.checks.is_empty() {
        let _ = writeln!(out, "Comparing strategies...");
        for check in &report.checks {
            let _ = writeln!(out, "{}", describe_check(report, check));
        }
    }
    let _ = writeln!(out, "Verdict: {}", report.verdict);
    out
}

fn write_readouts(out: &mut String, report: &ProbeReport, outcome: &StrategyOutcome) {
    let _ = writeln!(out, "Reading buffers...");
    for (index, device) in report.devices.iter().enumerate() {
        let _ = writeln!(out, "{index}'th buffer:");
        match outcome.readout(device.id) {
            Some(readout) => {
                let _ = writeln!(out, "{}", render(&readout.values, None));
            }
            None => {
                let _ = writeln!(
                    out,
                    "skipped: device {} cannot access device {}",
                    outcome.issuer, device.id
                );
            }
        }
    }
}

fn describe_check(report: &ProbeReport, check: &EquivalenceCheck) -> String {
    let pair = format!("{} vs {}", check.candidate, check.reference);
    if check.is_equivalent() {
        return format!("{pair}: equivalent");
    }
    let buffers: Vec<String> = check
        .divergent
        .iter()
        .map(|d| {
            let index = report.peers.index_of(d.device).unwrap_or(d.device.0 as usize);
            format!("{index}'th buffer from index {}", d.first_index)
        })
        .collect();
    format!("{pair}: diverges in {}", buffers.join(", "))
}

fn print_summary_table(report: &ProbeReport) {
    println!();
    println!(
        "{:18} {:8} {:10} {:10}",
        style("STRATEGY").bold().underlined(),
        style("DEVICE").bold().underlined(),
        style("PATTERN").bold().underlined(),
        style("MISMATCHES").bold().underlined()
    );
    for outcome in &report.outcomes {
        for readout in &outcome.readouts {
            let status = if readout.matches_pattern {
                style("ok".to_string()).green()
            } else {
                style("mismatch".to_string()).red()
            };
            println!(
                "{:18} {:8} {:10} {:10}",
                outcome.strategy.name(),
                readout.device,
                status,
                readout.mismatches
            );
        }
        for device in &outcome.unreachable {
            println!(
                "{:18} {:8} {:10} {:10}",
                outcome.strategy.name(),
                device,
                style("skipped".to_string()).dim(),
                "-"
            );
        }
    }

    println!();
    let verdict = match report.verdict {
        Verdict::Pass => style(report.verdict.to_string()).green().bold(),
        Verdict::PatternMismatch => style(report.verdict.to_string()).yellow().bold(),
        Verdict::Divergent => style(report.verdict.to_string()).red().bold(),
    };
    println!("Verdict: {verdict}");
}
