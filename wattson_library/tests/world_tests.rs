#[macro_use]
pub mod utils;

use std::sync::Arc;
use std::time::Duration;
use utils::{gpu_gauge, host, test_config, watt_gauge, ScriptedBackend};
use wattson_library::comm::Comm;
use wattson_library::data::{DataNode, DeviceType, MetricType, NodeType};
use wattson_library::monitor_config::WattsonConfig;
use wattson_library::session::Session;
use wattson_library::transaction::TEST_TID;

fn node_backends(gpus: u32) -> Vec<ScriptedBackend> {
    vec![
        ScriptedBackend::new("fake_cpu", vec![(watt_gauge("cpu_0_pkg", "cpu_0", DeviceType::Cpu, "fake_cpu"), 60.0)]),
        ScriptedBackend::new("fake_gpu", (0..gpus).map(|i| (gpu_gauge(i, "fake_gpu"), 100.0)).collect()),
    ]
}

/// Run one measurement on every rank of an in-process world; rank `r` runs on `hostnames[r]`.
fn run_world(configs: Vec<WattsonConfig>, hostnames: &[&str], gpus: u32) -> Vec<Option<DataNode>> {
    let world = Comm::in_process_world(configs.len(), &TEST_TID);
    let handles = world
        .into_iter()
        .zip(configs)
        .zip(hostnames.iter().map(|h| h.to_string()))
        .map(|((comm, cfg), hostname)| {
            std::thread::spawn(move || {
                let session = Session::begin_with(&cfg, "world", comm, host(&hostname, node_backends(gpus)))
                    .unwrap_or_else(|e| panic!("rank failed to begin: {}", e));
                {
                    let _g = session.region("step");
                    std::thread::sleep(Duration::from_millis(60));
                }
                std::thread::sleep(Duration::from_millis(20));
                session.end_measurement().unwrap_or_else(|e| panic!("rank failed to end: {}", e))
            })
        })
        .collect::<Vec<_>>();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

#[test]
fn shared_devices_sampled_once_per_host() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path(), vec![]);
    let mut results = run_world(vec![cfg.clone(); 4], &["h0", "h0", "h1", "h1"], 1);

    assert!(results[1..].iter().all(|r| r.is_none()));
    let run = results.remove(0).expect("rank 0 collects the run");
    assert_eq!(run.metadata["world_size"], "4");
    assert!(!run.metadata.contains_key("lost_ranks"));
    assert_eq!(run.children_of_type(NodeType::Node).count(), 2);

    for (hostname, owner) in [("h0", "0"), ("h1", "2")] {
        let node = run.child(hostname).unwrap();
        assert_eq!(node.metadata["ranks"], if owner == "0" { "0,1" } else { "2,3" });
        for dev in ["cpu_0", "CUDA:0"] {
            let d = node.child(dev).unwrap();
            assert_eq!(d.metadata["rank"], owner);
            assert_eq!(d.sensors().len(), 1);
        }
        assert!(float_cmp::approx_eq!(f64, node.value(MetricType::Power).unwrap(), 160.0, epsilon = 1e-9));
    }
    let both = run.child("h0").unwrap().value(MetricType::Energy).unwrap() + run.child("h1").unwrap().value(MetricType::Energy).unwrap();
    assert!(float_cmp::approx_eq!(f64, run.value(MetricType::Energy).unwrap(), both, epsilon = 1e-9));

    let step = run.child("step").unwrap();
    assert_eq!(step.value(MetricType::NCalls), Some(4.0));
    assert_eq!(step.metadata["ranks"], "0,1,2,3");
    assert!(!step.metadata.contains_key("unmatched_calls"));
}

#[test]
fn visibility_splits_gpus_between_ranks() {
    let dir = tempfile::tempdir().unwrap();
    let base = test_config(dir.path(), vec![]);
    let configs = ["0", "1"]
        .iter()
        .map(|v| {
            let mut c = (*base).clone();
            c.coordination.device_visibility = Some(vec![v.to_string()]);
            Arc::new(c)
        })
        .collect::<Vec<_>>();
    let mut results = run_world(configs, &["h0", "h0"], 2);
    let run = results.remove(0).unwrap();
    let node = run.child("h0").unwrap();
    assert_eq!(node.child("CUDA:0").unwrap().metadata["rank"], "0");
    assert_eq!(node.child("CUDA:1").unwrap().metadata["rank"], "1");
    assert_eq!(node.child("cpu_0").unwrap().metadata["rank"], "0");
    assert!(float_cmp::approx_eq!(f64, node.value(MetricType::GpuPower).unwrap(), 200.0, epsilon = 1e-9));
}
