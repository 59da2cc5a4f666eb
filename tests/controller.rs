mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use common::{ScriptedDevice, drain, job_config, recv_until};
use printcore::config::DiscoveryConfig;
use printcore::controller::{ATTACHED, DETACHED, DeviceController};
use printcore::device::sim::SimulatedProvider;
use printcore::job::{self, JobContext};
use printcore::message::{self, Kind, Message};
use printcore::registry::{Registry, RegistryHandle};
use tokio::sync::mpsc;

const LIMIT: Duration = Duration::from_secs(60);

fn controller(
    provider: Arc<SimulatedProvider>,
) -> (DeviceController, RegistryHandle, mpsc::Receiver<Message>) {
    let registry = Registry::new(1).spawn();
    let (device_in, rx) = mpsc::channel(256);
    let jobs = JobContext {
        registry: registry.clone(),
        device_in: device_in.clone(),
        config: job_config(),
    };
    let discovery = DiscoveryConfig::default();
    let controller = DeviceController::new(registry.clone(), provider, device_in, jobs, discovery);
    (controller, registry, rx)
}

fn names(ids: &[&str]) -> BTreeSet<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

fn job_report(msg: &Message, body: &str) -> bool {
    msg.is(Kind::Response, message::JOB) && msg.body == body
}

fn device_msg(action: &str, body: &str) -> Message {
    Message::new(Kind::Device, action, "p0", body)
}

#[tokio::test]
async fn registry_follows_each_discovery_snapshot() {
    let provider = Arc::new(SimulatedProvider::new(10.0));
    let (controller, registry, mut rx) = controller(provider.clone());

    assert!(controller.discover_once().await.unwrap().is_empty());
    assert!(drain(&mut rx).is_empty());

    provider.attach("a");
    provider.attach("b");
    let diff = controller.discover_once().await.unwrap();
    assert_eq!(diff.attached, ["a", "b"]);
    assert_eq!(registry.names().await.unwrap(), names(&["a", "b"]));
    let informs = drain(&mut rx);
    assert_eq!(informs, vec![Message::inform("a", ATTACHED), Message::inform("b", ATTACHED)]);

    assert!(controller.discover_once().await.unwrap().is_empty());
    assert_eq!(registry.snapshot().await.unwrap().len(), 2);

    provider.detach("a");
    let diff = controller.discover_once().await.unwrap();
    assert_eq!(diff.detached, ["a"]);
    assert_eq!(registry.names().await.unwrap(), names(&["b"]));
    assert_eq!(drain(&mut rx), vec![Message::inform("a", DETACHED)]);
}

#[tokio::test]
async fn unknown_device_is_reported_and_dropped() {
    let (controller, _registry, mut rx) = controller(Arc::new(SimulatedProvider::new(10.0)));
    controller.dispatch(device_msg(message::CMD, "G28")).await.unwrap();
    let msgs = drain(&mut rx);
    assert_eq!(msgs.len(), 1);
    assert!(msgs[0].is(Kind::Response, message::ERROR));
}

#[tokio::test]
async fn idle_device_runs_commands_directly() {
    let (controller, registry, mut rx) = controller(Arc::new(SimulatedProvider::new(10.0)));
    let device = Arc::new(ScriptedDevice::new("p0"));
    registry.insert(device.clone()).await.unwrap();

    controller.dispatch(device_msg(message::CMD, "G28")).await.unwrap();
    assert_eq!(device.sent(), vec!["G28\n"]);
    assert_eq!(drain(&mut rx), vec![Message::response("p0", message::CMD, "ok\n")]);

    controller.dispatch(device_msg("dance", "")).await.unwrap();
    assert!(drain(&mut rx)[0].is(Kind::Response, message::ERROR));
}

#[tokio::test(start_paused = true)]
async fn second_job_goes_to_the_running_job() {
    let (controller, registry, mut rx) = controller(Arc::new(SimulatedProvider::new(10.0)));
    let device = Arc::new(ScriptedDevice::new("p0"));
    registry.insert(device.clone()).await.unwrap();

    controller.dispatch(device_msg(message::JOB, "M109 S200\n")).await.unwrap();
    assert!(registry.snapshot().await.unwrap()[0].job_running);

    controller.dispatch(device_msg(message::JOB, "G1 X1\n")).await.unwrap();
    recv_until(&mut rx, LIMIT, |m| m.is(Kind::Response, message::ERROR)).await;

    // Commands for a busy device are executed by the job, not directly.
    controller.dispatch(device_msg(message::CMD, "G92 E0")).await.unwrap();
    recv_until(&mut rx, LIMIT, |m| job_report(m, "ok\n")).await;

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(device.count("M109"), 1);
    assert_eq!(device.count("G1"), 0);

    controller.dispatch(device_msg(message::STOP, "")).await.unwrap();
    recv_until(&mut rx, LIMIT, |m| job_report(m, job::STOPPED)).await;
    assert!(!registry.snapshot().await.unwrap()[0].job_running);
}

#[tokio::test(start_paused = true)]
async fn uploaded_program_runs_on_empty_job() {
    let (controller, registry, mut rx) = controller(Arc::new(SimulatedProvider::new(10.0)));
    let device = Arc::new(ScriptedDevice::new("p0"));
    registry.insert(device.clone()).await.unwrap();

    controller.dispatch(device_msg(message::JOB, "")).await.unwrap();
    assert!(drain(&mut rx)[0].is(Kind::Response, message::ERROR));

    controller.dispatch(device_msg(message::UPLOAD, "G28\nG1 X1\n")).await.unwrap();
    assert_eq!(drain(&mut rx), vec![Message::response("p0", message::UPLOAD, "ok")]);

    controller.dispatch(device_msg(message::JOB, "")).await.unwrap();
    recv_until(&mut rx, LIMIT, |m| job_report(m, job::COMPLETED)).await;
    assert_eq!(device.sent(), vec!["G28\n", "G1 X1\n"]);
    assert_eq!(
        registry.snapshot().await.unwrap()[0].program.as_deref(),
        Some("G28\nG1 X1\n")
    );
}
