//! End-to-end coverage of the proxy path: the supervisor starts the real
//! `cfk-proxy` host, services fork inside it, and lifecycle/status/log
//! traffic crosses the three inherited pipes.

use controlfreak::cfk::command::dispatch;
use controlfreak::cfk::controller::{self, Controller, Ctrl};
use controlfreak::cfk::logger::LogSink;
use controlfreak::cfk::service::State;
use std::time::Duration;
use tokio::time::Instant;

fn proxy_host_exe() -> String {
    env!("CARGO_BIN_EXE_cfk-proxy").to_string()
}

fn test_ctrl(sink: &LogSink) -> Ctrl {
    Controller::new_shared(
        std::env::temp_dir().join(format!("cfk-e2e-{}", std::process::id())),
        sink.clone(),
    )
}

async fn wait_until<F: Fn() -> bool>(what: &str, timeout: Duration, f: F) {
    let deadline = Instant::now() + timeout;
    while !f() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn proxied_service_runs_and_auto_stops_the_proxy() {
    let sink = LogSink::start();
    let ctrl = test_ctrl(&sink);

    let host = proxy_host_exe();
    dispatch(
        &ctrl,
        &format!("proxy a cmd=[\"{host}\"]"),
        true,
        false,
    )
    .await
    .unwrap();
    dispatch(&ctrl, "proxy a service somesvc", true, false)
        .await
        .unwrap();
    dispatch(
        &ctrl,
        "service somesvc cmd=[\"/bin/sleep\", \"30\"]",
        true,
        false,
    )
    .await
    .unwrap();
    dispatch(&ctrl, "service somesvc startwait_secs=0.25", true, false)
        .await
        .unwrap();

    dispatch(&ctrl, "command start service somesvc", true, false)
        .await
        .unwrap();

    let svc = controller::service_handle(&ctrl, "somesvc").unwrap();
    let proxy = controller::proxy_handle(&ctrl, "a").unwrap();

    // auto=true: starting the first service starts the proxy host.
    wait_until("proxy host up", Duration::from_secs(5), || proxy.is_up()).await;
    wait_until("service running", Duration::from_secs(5), || {
        let v = svc.view();
        v.state == State::Running && v.pid.is_some()
    })
    .await;

    // The pid was learned from the proxy, and it is a real process.
    let pid = svc.view().pid.unwrap();
    assert!(pid > 0);

    // status surfaces the proxy column without the down marker.
    let lines = dispatch(&ctrl, "command status service somesvc", true, false)
        .await
        .unwrap();
    let cols: Vec<&str> = lines[0].split('\t').collect();
    assert_eq!(cols[1], "running");
    assert_eq!(cols[5], "a");

    dispatch(&ctrl, "command stop service somesvc", true, false)
        .await
        .unwrap();
    wait_until("service down", Duration::from_secs(5), || !svc.is_up()).await;

    // Last service down: the proxy shuts down on its own within the grace.
    wait_until("proxy auto-down", Duration::from_secs(6), || !proxy.is_up()).await;

    let lines = dispatch(&ctrl, "command proxystatus", true, false)
        .await
        .unwrap();
    assert!(lines[0].starts_with("a\tdown\t"), "{lines:?}");
}

#[tokio::test]
async fn proxied_service_output_reaches_the_sink() {
    let sink = LogSink::start();
    let mut tap = sink.tap();
    sink.flush().await;
    let ctrl = test_ctrl(&sink);

    let host = proxy_host_exe();
    dispatch(&ctrl, &format!("proxy b cmd=[\"{host}\"]"), true, false)
        .await
        .unwrap();
    dispatch(&ctrl, "proxy b service chatty", true, false)
        .await
        .unwrap();
    dispatch(
        &ctrl,
        "service chatty cmd=echo proxied hello; sleep 30",
        true,
        false,
    )
    .await
    .unwrap();
    dispatch(&ctrl, "command start service chatty", true, false)
        .await
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        tokio::select! {
            line = tap.recv() => {
                let line = line.expect("sink closed");
                if line.contains("chatty proxied hello") {
                    break;
                }
            }
            _ = tokio::time::sleep_until(deadline) => panic!("no proxied output seen"),
        }
    }

    dispatch(&ctrl, "command stop service chatty", true, false)
        .await
        .unwrap();
    let proxy = controller::proxy_handle(&ctrl, "b").unwrap();
    wait_until("proxy down", Duration::from_secs(6), || !proxy.is_up()).await;
}

#[tokio::test]
async fn proxy_with_auto_off_requires_explicit_proxyup() {
    let sink = LogSink::start();
    let ctrl = test_ctrl(&sink);

    let host = proxy_host_exe();
    dispatch(&ctrl, &format!("proxy c cmd=[\"{host}\"]"), true, false)
        .await
        .unwrap();
    dispatch(&ctrl, "proxy c auto=off", true, false).await.unwrap();
    dispatch(&ctrl, "proxy c service svc2", true, false)
        .await
        .unwrap();
    dispatch(&ctrl, "service svc2 cmd=[\"/bin/sleep\", \"30\"]", true, false)
        .await
        .unwrap();

    let err = dispatch(&ctrl, "command start service svc2", true, false)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("is not up"), "err: {err}");

    dispatch(&ctrl, "command proxyup c", true, false).await.unwrap();
    dispatch(&ctrl, "service svc2 startwait_secs=0.2", true, false)
        .await
        .unwrap();
    dispatch(&ctrl, "command start service svc2", true, false)
        .await
        .unwrap();

    let svc = controller::service_handle(&ctrl, "svc2").unwrap();
    wait_until("svc2 running", Duration::from_secs(5), || {
        svc.view().state == State::Running
    })
    .await;

    dispatch(&ctrl, "command stop service svc2", true, false)
        .await
        .unwrap();
    wait_until("svc2 down", Duration::from_secs(5), || !svc.is_up()).await;

    // auto=off: the proxy stays up until told otherwise.
    let proxy = controller::proxy_handle(&ctrl, "c").unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(proxy.is_up());
    dispatch(&ctrl, "command proxydown c", true, false)
        .await
        .unwrap();
    wait_until("proxy c down", Duration::from_secs(6), || !proxy.is_up()).await;
}
