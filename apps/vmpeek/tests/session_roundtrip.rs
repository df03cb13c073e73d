mod common;

use common::{FakePeer, Responder, event, expect_event, page_with, qemu_like};
use qmp_proto::CorrelationTag;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use vmpeek::memory::{ReadIntent, ReadOrigin, ReadRequest, ScrollPosition};
use vmpeek::session::{ClockPoller, RunState, Session, SessionConfig, SessionError, SessionEvent, Topic};

fn read(addr: u64, size: u64) -> ReadRequest {
    ReadRequest {
        addr,
        size,
        intent: ReadIntent {
            reset: true,
            scroll: ScrollPosition::default(),
            origin: ReadOrigin::User,
        },
    }
}

fn tag_of(command: &Value) -> CorrelationTag {
    CorrelationTag(command["arguments"]["hash"].as_u64().expect("hash"))
}

#[test_timeout::tokio_timeout_test(10)]
async fn handshake_leaves_the_session_ready() {
    let mut peer = FakePeer::qemu_like(true).await;
    let session = Session::default();
    session.connect(&peer.addr).await.expect("connect");

    peer.next_command("qmp_capabilities").await;
    peer.next_command("query-status").await;

    let state = session.state();
    assert!(state.connected);
    assert!(state.ready);
    assert_eq!(state.running, RunState::Running);
    let banner = session.banner().expect("greeting captured");
    assert_eq!(banner.capabilities, vec!["oob".to_string()]);
    assert_eq!(banner.version["qemu"]["major"], 8);
    assert_eq!(session.peer().as_deref(), Some(peer.addr.as_str()));

    session.disconnect().await;
    assert!(!session.state().connected);
    assert_eq!(session.run_state(), RunState::Disconnected);
}

#[test_timeout::tokio_timeout_test(10)]
async fn paused_guest_reports_paused_after_handshake() {
    let peer = FakePeer::qemu_like(false).await;
    let session = Session::default();
    session.connect(&peer.addr).await.expect("connect");
    assert_eq!(session.run_state(), RunState::Paused);
    assert!(session.is_ready());
}

#[test_timeout::tokio_timeout_test(10)]
async fn lifecycle_events_drive_the_run_state() {
    let mut peer = FakePeer::qemu_like(true).await;
    let session = Session::default();
    session.connect(&peer.addr).await.expect("connect");
    let mut states = session.subscribe(Topic::RunState);
    let mut events = session.subscribe(Topic::Generic);

    assert!(session.pause().await);
    peer.next_command("stop").await;
    let state = expect_event(&mut states, |event| match event {
        SessionEvent::RunState(state) => Some(state),
        _ => None,
    })
    .await;
    assert_eq!(state, RunState::Paused);
    let name = expect_event(&mut events, |event| match event {
        SessionEvent::Event(event) => Some(event.name.clone()),
        _ => None,
    })
    .await;
    assert_eq!(name, "STOP");

    assert!(session.resume().await);
    let state = expect_event(&mut states, |event| match event {
        SessionEvent::RunState(state) => Some(state),
        _ => None,
    })
    .await;
    assert_eq!(state, RunState::Running);
}

#[test_timeout::tokio_timeout_test(10)]
async fn monitor_commands_return_their_text() {
    let mut peer = FakePeer::qemu_like(true).await;
    let session = Session::default();
    session.connect(&peer.addr).await.expect("connect");

    let text = session.monitor_text("info registers").await;
    assert_eq!(text.as_deref(), Some("echo: info registers\r\n"));
    let sent = peer.next_command("human-monitor-command").await;
    assert_eq!(sent["arguments"]["command-line"], "info registers");
    assert!(!session.recent_replies().is_empty());
}

/// Like QEMU, except monitor commands get `monitor_reply` instead of an echo.
fn monitor_answers(monitor_reply: Option<Value>) -> Responder {
    let base = qemu_like(true, false);
    Arc::new(move |command: &Value| {
        if command["execute"] == "human-monitor-command" {
            return monitor_reply.iter().cloned().collect();
        }
        base(command)
    })
}

#[test_timeout::tokio_timeout_test(10)]
async fn monitor_error_reply_resolves_to_nothing() {
    let error = json!({ "error": { "class": "GenericError", "desc": "unknown command" } });
    let mut peer = FakePeer::start(monitor_answers(Some(error))).await;
    let session = Session::default();
    session.connect(&peer.addr).await.expect("connect");

    assert_eq!(session.monitor("info bogus").await, None);
    peer.next_command("human-monitor-command").await;

    // The failed command consumed only its own reply.
    assert!(session.state().connected);
    assert!(session.pause().await);
    peer.next_command("stop").await;
    assert_eq!(session.monitor("info registers").await, None);
    assert!(session.is_ready());
}

#[test_timeout::tokio_timeout_test(10)]
async fn unanswered_monitor_command_times_out() {
    let mut peer = FakePeer::start(monitor_answers(None)).await;
    let session =
        Session::new(SessionConfig::default().with_monitor_timeout(Duration::from_millis(100)));
    session.connect(&peer.addr).await.expect("connect");

    let started = tokio::time::Instant::now();
    assert_eq!(session.monitor_text("info registers").await, None);
    assert!(started.elapsed() >= Duration::from_millis(100));
    peer.next_command("human-monitor-command").await;
    assert!(session.state().connected);
}

#[test_timeout::tokio_timeout_test(10)]
async fn only_the_newest_page_is_delivered() {
    let mut peer = FakePeer::start(qemu_like(true, true)).await;
    let session = Session::default();
    session.connect(&peer.addr).await.expect("connect");
    let mut pages = session.subscribe(Topic::MemoryPage);

    let first = session.read_memory(read(0x1000, 16)).await.expect("first read");
    let second = session.read_memory(read(0x2000, 16)).await.expect("second read");
    assert_ne!(first, second);
    assert_eq!(session.current_tag(), Some(second));

    let first_cmd = peer.next_command("get-pmem").await;
    let second_cmd = peer.next_command("get-pmem").await;
    assert_eq!(tag_of(&first_cmd), first);
    assert_eq!(tag_of(&second_cmd), second);
    assert_eq!(second_cmd["arguments"]["addr"], 0x2000);

    // The superseded page arrives first and must be dropped.
    peer.push(page_with(&first_cmd, vec![0xaa; 16]));
    peer.push(page_with(&second_cmd, vec![0xbb; 16]));

    let arrival = expect_event(&mut pages, |event| match event {
        SessionEvent::MemoryPage(arrival) => Some(arrival),
        _ => None,
    })
    .await;
    assert_eq!(arrival.tag, second);
    assert_eq!(arrival.request.addr, 0x2000);
    assert_eq!(arrival.bytes, vec![0xbb; 16]);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(pages.try_recv().is_err());
}

#[test_timeout::tokio_timeout_test(10)]
async fn peer_close_disconnects_the_session() {
    let peer = FakePeer::qemu_like(true).await;
    let session = Session::default();
    session.connect(&peer.addr).await.expect("connect");
    let mut connectivity = session.subscribe(Topic::Connectivity);

    peer.close();
    let up = expect_event(&mut connectivity, |event| match event {
        SessionEvent::Connectivity(up) => Some(up),
        _ => None,
    })
    .await;
    assert!(!up);
    assert_eq!(session.run_state(), RunState::Disconnected);
    assert!(!session.is_ready());
    assert!(!session.command("query-status", None).await);
    assert_eq!(session.current_tag(), None);
}

#[test_timeout::tokio_timeout_test(10)]
async fn shutdown_event_ends_the_session() {
    let peer = FakePeer::qemu_like(true).await;
    let session = Session::default();
    session.connect(&peer.addr).await.expect("connect");
    let mut connectivity = session.subscribe(Topic::Connectivity);

    peer.push(event("SHUTDOWN"));
    let up = expect_event(&mut connectivity, |event| match event {
        SessionEvent::Connectivity(up) => Some(up),
        _ => None,
    })
    .await;
    assert!(!up);
    assert!(!session.state().connected);
}

#[test_timeout::tokio_timeout_test(10)]
async fn reconnect_restores_a_dropped_session() {
    let peer = FakePeer::qemu_like(true).await;
    let session = Session::default();
    session.connect(&peer.addr).await.expect("connect");
    let mut connectivity = session.subscribe(Topic::Connectivity);

    peer.close();
    expect_event(&mut connectivity, |event| match event {
        SessionEvent::Connectivity(false) => Some(()),
        _ => None,
    })
    .await;

    session.reconnect(&peer.addr).await.expect("reconnect");
    assert!(session.is_ready());
    assert_eq!(session.run_state(), RunState::Running);
    let up = expect_event(&mut connectivity, |event| match event {
        SessionEvent::Connectivity(up) => Some(up),
        _ => None,
    })
    .await;
    assert!(up);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn commands_racing_a_reconnect_keep_replies_in_step() {
    let peer = FakePeer::qemu_like(true).await;
    let session = Session::default();
    session.connect(&peer.addr).await.expect("connect");

    let noisy = session.clone();
    let chatter = tokio::spawn(async move {
        loop {
            noisy.command("query-status", None).await;
            tokio::task::yield_now().await;
        }
    });

    for round in 0..10 {
        session.reconnect(&peer.addr).await.expect("reconnect");
        let line = format!("info round {round}");
        let text = tokio::time::timeout(Duration::from_secs(3), session.monitor_text(&line))
            .await
            .expect("monitor reply in time");
        assert_eq!(text, Some(format!("echo: {line}\r\n")));
    }

    chatter.abort();
    assert_eq!(session.run_state(), RunState::Running);
}

#[test_timeout::tokio_timeout_test(10)]
async fn reconnect_gives_up_after_bounded_attempts() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();
    drop(listener);

    let session = Session::new(SessionConfig::default().with_reconnect(
        3,
        Duration::from_millis(10),
        Duration::from_millis(20),
    ));
    let err = session.reconnect(&addr).await.expect_err("nothing listening");
    let SessionError::ReconnectExhausted { attempts, .. } = err else {
        panic!("unexpected error: {err}");
    };
    assert_eq!(attempts, 3);
    assert!(!session.state().connected);
}

#[test_timeout::tokio_timeout_test(10)]
async fn clock_poller_publishes_ticks() {
    let mut peer = FakePeer::qemu_like(true).await;
    let session = Session::default();
    session.connect(&peer.addr).await.expect("connect");
    let mut ticks = session.subscribe(Topic::ClockTick);

    let poller = ClockPoller::spawn_with_interval(session.clone(), Duration::from_millis(20));
    let sent = peer.next_command("itc-sim-time").await;
    assert_eq!(sent["arguments"]["clock"], "virtual");
    let time_ns = expect_event(&mut ticks, |event| match event {
        SessionEvent::ClockTick(tick) => Some(tick.time_ns),
        _ => None,
    })
    .await;
    assert_eq!(time_ns, 1_234_567_890);

    poller.stop().await;
}
