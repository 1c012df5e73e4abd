pub mod utils;

use std::time::Duration;
use utils::{host, test_config, watt_gauge, ScriptedBackend};
use wattson_library::comm::Comm;
use wattson_library::data::{DataNode, DeviceType, MetricType, NodeType};
use wattson_library::monitor::Monitor;
use wattson_library::monitor_config::WattsonConfig;
use wattson_library::session::Session;
use wattson_library::storage::{load_app, persist_runs, read_csv, read_partial, HistoryPaths, IoFormat};
use wattson_library::transaction::{TransactionId, TEST_TID};

fn one_run(cfg: &WattsonConfig) -> DataNode {
    let cpu = ScriptedBackend::new("fake_cpu", vec![(watt_gauge("cpu_0_pkg", "cpu_0", DeviceType::Cpu, "fake_cpu"), 35.5)]);
    let session = Session::begin_with(cfg, "hist", Comm::local(&TEST_TID), host("node-a", vec![cpu])).unwrap();
    std::thread::sleep(Duration::from_millis(60));
    session.end_measurement().unwrap().unwrap()
}

#[test]
fn json_and_csv_survive_a_reload() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path(), vec![("output.run_id", "nightly")]);
    let run = one_run(&cfg);
    assert_eq!(run.id, "nightly");
    let paths = HistoryPaths::new(dir.path(), "hist");

    let (saved, _) = persist_runs(&paths, vec![run.clone()], &[IoFormat::Json, IoFormat::Csv], &TEST_TID).unwrap();
    let loaded = load_app(&paths.file(IoFormat::Json), &TEST_TID).unwrap().unwrap();
    assert_eq!(loaded, saved);
    let reloaded_run = loaded.child("nightly").unwrap().child("nightly").unwrap();
    assert_eq!(reloaded_run, &run);

    let raw = run.sensors()[0].raw.clone().unwrap();
    let rows = read_csv(&paths.file(IoFormat::Csv)).unwrap();
    assert_eq!(rows.len(), raw.len());
    for (row, reading) in rows.iter().zip(raw.readings()) {
        assert_eq!(row.run_id, "nightly");
        assert_eq!(row.hostname, "node-a");
        assert_eq!(row.device_group, "cpu_0");
        assert_eq!(row.sensor, "cpu_0_pkg");
        assert_eq!(row.reading().unwrap(), reading);
    }
    assert!(!paths.lock().exists());
}

#[test]
fn repeated_run_ids_are_suffixed() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path(), vec![("output.run_id", "fixed")]);
    let paths = HistoryPaths::new(dir.path(), "hist");
    persist_runs(&paths, vec![one_run(&cfg)], &[IoFormat::Json], &TEST_TID).unwrap();
    let (app, mr) = persist_runs(&paths, vec![one_run(&cfg), one_run(&cfg)], &[IoFormat::Json], &TEST_TID).unwrap();
    assert_eq!(mr, "fixed_1");

    assert_eq!(app.children_of_type(NodeType::MultiRun).count(), 2);
    let second = app.child("fixed_1").unwrap();
    let ids = second.children.keys().cloned().collect::<Vec<_>>();
    assert_eq!(ids, vec!["fixed_1".to_string(), "fixed_2".to_string()]);
    assert_eq!(second.value(MetricType::NRuns), Some(2.0));
    assert_eq!(app.value(MetricType::NRuns), Some(3.0));
    let total = app
        .children
        .values()
        .flat_map(|mr| mr.children.values())
        .map(|r| r.value(MetricType::Energy).unwrap())
        .sum::<f64>();
    assert!(float_cmp::approx_eq!(f64, app.value(MetricType::Energy).unwrap(), total, epsilon = 1e-9));
}

#[test]
fn monitor_appends_one_multi_run_per_invocation() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = (*test_config(dir.path(), vec![("benchmarking.rounds", "2")])).clone();
    cfg.output.formats = vec!["json".to_string(), "csv".to_string()];
    let cfg: WattsonConfig = std::sync::Arc::new(cfg);
    let prepared = |_: &WattsonConfig, _: &TransactionId| {
        host(
            "node-a",
            vec![ScriptedBackend::new("fake_cpu", vec![(watt_gauge("cpu_0_pkg", "cpu_0", DeviceType::Cpu, "fake_cpu"), 10.0)])],
        )
    };
    for _ in 0..2 {
        let mut m = Monitor::with_comm(&cfg, Some("looped"), Comm::local(&TEST_TID)).with_host_source(Box::new(prepared));
        m.monitor_fn(|| std::thread::sleep(Duration::from_millis(30))).unwrap();
    }
    let paths = HistoryPaths::new(dir.path(), "looped");
    let app = load_app(&paths.file(IoFormat::Json), &TEST_TID).unwrap().unwrap();
    assert_eq!(app.children_of_type(NodeType::MultiRun).count(), 2);
    assert_eq!(app.value(MetricType::NRuns), Some(4.0));
    assert!(app.value(MetricType::Energy).unwrap() > 0.0);
    assert!(!read_csv(&paths.file(IoFormat::Csv)).unwrap().is_empty());
}

#[test]
fn dropped_session_leaves_partial_samples() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path(), vec![]);
    let cpu = ScriptedBackend::new("fake_cpu", vec![(watt_gauge("cpu_0_pkg", "cpu_0", DeviceType::Cpu, "fake_cpu"), 12.0)]);
    let session = Session::begin_with(&cfg, "abandoned", Comm::local(&TEST_TID), host("node-a", vec![cpu])).unwrap();
    {
        let _r = session.region("work");
        std::thread::sleep(Duration::from_millis(50));
    }
    drop(session);

    let paths = HistoryPaths::new(dir.path(), "abandoned");
    let partial = read_partial(&paths.partial(0)).unwrap();
    assert_eq!(partial.hostname, "node-a");
    assert!(partial.buffer.ticks >= 2);
    assert_eq!(partial.regions.len(), 1);
    assert!(!paths.file(IoFormat::Json).exists());
}

#[test]
fn ended_session_leaves_no_partial() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path(), vec![("output.run_id", "clean")]);
    one_run(&cfg);
    assert!(!HistoryPaths::new(dir.path(), "hist").partial(0).exists());
}

#[test]
fn next_invocation_recovers_an_abandoned_session() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path(), vec![]);
    let cpu = ScriptedBackend::new("fake_cpu", vec![(watt_gauge("cpu_0_pkg", "cpu_0", DeviceType::Cpu, "fake_cpu"), 12.0)]);
    let session = Session::begin_with(&cfg, "resumed", Comm::local(&TEST_TID), host("node-a", vec![cpu])).unwrap();
    std::thread::sleep(Duration::from_millis(40));
    drop(session);
    let paths = HistoryPaths::new(dir.path(), "resumed");
    assert!(paths.partial(0).exists());

    let prepared = |_: &WattsonConfig, _: &TransactionId| {
        host(
            "node-a",
            vec![ScriptedBackend::new("fake_cpu", vec![(watt_gauge("cpu_0_pkg", "cpu_0", DeviceType::Cpu, "fake_cpu"), 10.0)])],
        )
    };
    let mut m = Monitor::with_comm(&cfg, Some("resumed"), Comm::local(&TEST_TID)).with_host_source(Box::new(prepared));
    m.monitor_fn(|| std::thread::sleep(Duration::from_millis(30))).unwrap();

    assert!(!paths.partial(0).exists());
    let app = load_app(&paths.file(IoFormat::Json), &TEST_TID).unwrap().unwrap();
    assert_eq!(app.children_of_type(NodeType::MultiRun).count(), 2);
    let interrupted = app
        .children_of_type(NodeType::MultiRun)
        .flat_map(|mr| mr.children_of_type(NodeType::Run))
        .filter(|r| r.metadata.get("interrupted").map(|v| v == "true").unwrap_or(false))
        .count();
    assert_eq!(interrupted, 1);
}
