// End-to-end: client queues -> switchboard -> controller -> simulated printer.
mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{drain, recv_until};
use printcore::config::Config;
use printcore::device::sim::SimulatedProvider;
use printcore::job;
use printcore::message::{self, Kind, Message};
use printcore::Daemon;

const LIMIT: Duration = Duration::from_secs(120);

fn discover() -> Message {
    Message::new(Kind::Core, message::DISCOVER, "", "")
}

#[tokio::test(start_paused = true)]
async fn discover_answers_only_with_a_device_attached() {
    let provider = Arc::new(SimulatedProvider::new(15.0));
    let (daemon, mut queues) = Daemon::start(&Config::default(), provider.clone());

    queues.inbound.send(discover()).await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(drain(&mut queues.outbound).is_empty());

    provider.attach("sim0");
    let seen = recv_until(&mut queues.outbound, LIMIT, |m| m.is(Kind::Core, message::INFORM)).await;
    assert_eq!(seen.last().unwrap().device, "sim0");

    queues.inbound.send(discover()).await.unwrap();
    let reply = recv_until(&mut queues.outbound, LIMIT, |m| m.is(Kind::Response, message::DISCOVER))
        .await
        .pop()
        .unwrap();
    assert_eq!(reply.device, "sim0");
    assert!(reply.body.contains("simulated firmware"));

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(
        drain(&mut queues.outbound)
            .iter()
            .all(|m| !m.is(Kind::Response, message::DISCOVER))
    );
    daemon.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn prints_a_program_on_a_simulated_printer() {
    let provider = Arc::new(SimulatedProvider::new(15.0));
    provider.attach("sim0");
    let (daemon, mut queues) = Daemon::start(&Config::default(), provider);
    recv_until(&mut queues.outbound, LIMIT, |m| m.is(Kind::Core, message::INFORM)).await;

    queues
        .inbound
        .send(Message::new(Kind::Device, message::CMD, "sim0", "M105"))
        .await
        .unwrap();
    let reply = recv_until(&mut queues.outbound, LIMIT, |m| m.is(Kind::Response, message::CMD))
        .await
        .pop()
        .unwrap();
    assert!(reply.body.starts_with("ok T:25.0"));

    queues
        .inbound
        .send(Message::new(Kind::Device, message::JOB, "sim0", "G28\nM109 S60\nG1 X1\n"))
        .await
        .unwrap();
    let seen = recv_until(&mut queues.outbound, LIMIT, |m| {
        m.is(Kind::Response, message::JOB) && m.body == job::COMPLETED
    })
    .await;
    let polls = seen.iter().filter(|m| m.body.starts_with("ok T:")).count();
    assert!(polls >= 3, "expected heat-up polls, saw {seen:?}");

    let devices = daemon.registry().snapshot().await.unwrap();
    assert!(!devices[0].job_running);
    daemon.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn commands_for_unknown_devices_come_back_as_errors() {
    let provider = Arc::new(SimulatedProvider::new(15.0));
    let (daemon, mut queues) = Daemon::start(&Config::default(), provider);

    queues
        .inbound
        .send(Message::new(Kind::Device, message::CMD, "ghost", "G28"))
        .await
        .unwrap();
    let reply = recv_until(&mut queues.outbound, LIMIT, |m| m.is(Kind::Response, message::ERROR))
        .await
        .pop()
        .unwrap();
    assert_eq!(reply.device, "ghost");
    daemon.shutdown().await;
}
