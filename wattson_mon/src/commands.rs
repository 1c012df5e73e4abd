use crate::args::MonitorArgs;
use anyhow::Result;
use std::fmt::Write;
use tracing::info;
use wattson_library::catalog::sensor_catalog;
use wattson_library::data::{DataNode, MetricType, NodeType};
use wattson_library::monitor::{exit_code, Monitor};
use wattson_library::monitor_config::WattsonConfig;
use wattson_library::transaction::TransactionId;
use wattson_library::units::{pretty, Magnitude};

/// The history key for a command: configured name first, then the executable's file name.
fn app_for(config: &WattsonConfig, args: &MonitorArgs) -> Option<String> {
    if args.app.is_some() {
        return args.app.clone();
    }
    if config.output.app_name.as_ref().is_some_and(|a| !a.trim().is_empty()) {
        return None;
    }
    args.command
        .first()
        .and_then(|exe| std::path::Path::new(exe).file_name())
        .map(|n| n.to_string_lossy().into_owned())
}

/// Measure the command and return the exit code to leave with.
pub async fn monitor(config: WattsonConfig, args: MonitorArgs, tid: &TransactionId) -> Result<i32> {
    let app = app_for(&config, &args);
    let mut mon = Monitor::new(&config, app.as_deref())?;
    info!(tid=tid, app=%mon.app(), command=?args.command, "Monitoring command");
    let status = mon.monitor_command(&args.command).await?;
    if let Some(mr) = mon.latest() {
        print!("{}", summary(mon.app(), mr));
    }
    Ok(exit_code(&status))
}

pub fn sensors(config: WattsonConfig, tid: &TransactionId) -> Result<()> {
    let catalog = sensor_catalog(&config);
    info!(tid=tid, devices=catalog.devices.len(), "Sensors listed");
    println!("{}", serde_json::to_string_pretty(&catalog)?);
    Ok(())
}

fn show(node: &DataNode, t: MetricType) -> String {
    pretty(node.value(t).unwrap_or(0.0), t.unit(), Magnitude::One)
}

/// Human readable totals of every run in a MULTI_RUN, with hosts and regions indented below.
pub fn summary(app: &str, multi_run: &DataNode) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{} / {}", app, multi_run.id);
    for run in multi_run.children_of_type(NodeType::Run) {
        let price_unit = run.metadata.get("price_unit").map(String::as_str).unwrap_or("");
        let _ = writeln!(
            out,
            "  run {}: {} in {}, {} average, {} CO2e, {:.4} {}",
            run.id,
            show(run, MetricType::Energy),
            show(run, MetricType::Runtime),
            show(run, MetricType::Power),
            show(run, MetricType::Co2),
            run.value(MetricType::Money).unwrap_or(0.0),
            price_unit,
        );
        for host in run.children_of_type(NodeType::Node) {
            let _ = writeln!(
                out,
                "    host {}: {} in {}, {} average",
                host.id,
                show(host, MetricType::Energy),
                show(host, MetricType::Runtime),
                show(host, MetricType::Power),
            );
        }
        for region in run.children_of_type(NodeType::Region) {
            let _ = writeln!(
                out,
                "    region {}: {} over {} calls",
                region.id,
                show(region, MetricType::Energy),
                region.value(MetricType::NCalls).unwrap_or(0.0) as u64,
            );
        }
        for key in ["lost_ranks", "disabled_backends"] {
            if let Some(v) = run.metadata.get(key) {
                let _ = writeln!(out, "    {}: {}", key, v);
            }
        }
    }
    out
}
