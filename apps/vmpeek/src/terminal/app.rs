use crate::config::Config;
use crate::memory::{MAX_ADDR, MemoryWindow, WindowUpdate, format_address, parse_int};
use crate::session::{ClockPoller, RunState, Session, SessionEvent, Topic};
use crate::terminal::cli::{Cli, Command, DumpArgs, MonitorArgs, WatchArgs};
use crate::terminal::error::CliError;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info};

const STATE_CHANGE_TIMEOUT: Duration = Duration::from_secs(3);
const PAGE_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn run(cli: Cli) -> Result<(), CliError> {
    let mut config = Config::from_env();
    if let Some(addr) = cli.addr.as_deref() {
        config = config.with_addr(addr);
    }

    let session = Session::new(config.session_config());
    session.connect(&config.qmp_addr).await?;
    info!(target: "vmpeek::session", addr = %config.qmp_addr, "connected");

    let result = match cli.command {
        Command::Status => {
            print_status(&session);
            Ok(())
        }
        Command::Pause => change_run_state(&session, RunState::Paused).await,
        Command::Resume => change_run_state(&session, RunState::Running).await,
        Command::Monitor(args) => monitor(&session, &args).await,
        Command::Dump(args) => dump(&session, &args).await,
        Command::Watch(args) => watch(&session, &args).await,
    };

    session.disconnect().await;
    result
}

fn peer_of(session: &Session) -> String {
    session.peer().unwrap_or_else(|| "<unknown>".to_string())
}

fn print_status(session: &Session) {
    match session.banner() {
        Some(banner) => {
            let version = qemu_version(&banner.version).unwrap_or_else(|| "unknown".into());
            if banner.capabilities.is_empty() {
                println!("QEMU {version}");
            } else {
                println!(
                    "QEMU {version} (capabilities: {})",
                    banner.capabilities.join(", ")
                );
            }
        }
        None => println!("QEMU (no greeting)"),
    }
    println!("state: {}", session.run_state());
}

fn qemu_version(version: &Value) -> Option<String> {
    let qemu = version.get("qemu")?;
    let part = |key: &str| qemu.get(key).and_then(Value::as_u64);
    Some(format!("{}.{}.{}", part("major")?, part("minor")?, part("micro")?))
}

async fn change_run_state(session: &Session, target: RunState) -> Result<(), CliError> {
    if session.run_state() == target {
        println!("already {target}");
        return Ok(());
    }

    let mut states = session.subscribe(Topic::RunState);
    let sent = match target {
        RunState::Running => session.resume().await,
        _ => session.pause().await,
    };
    if !sent {
        return Err(CliError::Disconnected {
            addr: peer_of(session),
        });
    }

    let outcome = timeout(STATE_CHANGE_TIMEOUT, async {
        loop {
            match states.recv().await {
                Ok(SessionEvent::RunState(state)) if state == target => return Some(state),
                Ok(SessionEvent::RunState(RunState::Disconnected | RunState::Error))
                | Err(RecvError::Closed) => return None,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
            }
        }
    })
    .await;

    match outcome {
        Ok(Some(state)) => {
            println!("state: {state}");
            Ok(())
        }
        Ok(None) => Err(CliError::Disconnected {
            addr: peer_of(session),
        }),
        Err(_) => Err(CliError::Timeout(format!("the guest to become {target}"))),
    }
}

async fn monitor(session: &Session, args: &MonitorArgs) -> Result<(), CliError> {
    let command_line = args.command_line();
    debug!(target: "vmpeek::session", command = %command_line, "monitor passthrough");
    match session.monitor_text(&command_line).await {
        Some(text) => {
            let text = text.replace("\r\n", "\n");
            print!("{text}");
            if !text.ends_with('\n') {
                println!();
            }
            Ok(())
        }
        None if session.state().connected => {
            Err(CliError::Timeout(format!("a reply to `{command_line}`")))
        }
        None => Err(CliError::Disconnected {
            addr: peer_of(session),
        }),
    }
}

async fn dump(session: &Session, args: &DumpArgs) -> Result<(), CliError> {
    let address = parse_int(&args.address)
        .ok_or_else(|| CliError::InvalidArgument(format!("address '{}'", args.address)))?;
    let size = parse_int(&args.size)
        .ok_or_else(|| CliError::InvalidArgument(format!("size '{}'", args.size)))?;
    let find = args
        .find
        .as_deref()
        .map(|text| {
            parse_int(text)
                .map(|addr| addr.clamp(0, i128::from(MAX_ADDR - 1)) as u64)
                .ok_or_else(|| CliError::InvalidArgument(format!("find address '{text}'")))
        })
        .transpose()?;

    let (window, mut updates) = MemoryWindow::new(session.clone());
    let window = Arc::new(window);
    window.change_endianness(args.endian);
    let pump = window.spawn_page_pump(session.subscribe(Topic::MemoryPage));

    let fetched = async {
        if window.request(Some(address), Some(size), true).await.is_none() {
            return Err(CliError::Disconnected {
                addr: peer_of(session),
            });
        }
        wait_for_rows(&mut updates).await?;
        if let Some(target) = find {
            let span = window
                .find(target, u64::try_from(size).ok())
                .await;
            if span.is_none() {
                wait_for_rows(&mut updates).await?;
            }
        }
        Ok(())
    }
    .await;
    pump.abort();
    fetched?;

    print_window(&window);
    Ok(())
}

async fn wait_for_rows(updates: &mut mpsc::UnboundedReceiver<WindowUpdate>) -> Result<(), CliError> {
    let waited = timeout(PAGE_TIMEOUT, async {
        while let Some(update) = updates.recv().await {
            if let WindowUpdate::Rows { .. } = update {
                return true;
            }
        }
        false
    })
    .await;
    match waited {
        Ok(true) => Ok(()),
        Ok(false) | Err(_) => Err(CliError::Timeout("the memory page".into())),
    }
}

fn print_window(window: &MemoryWindow<Session>) {
    let span = window.highlight_span();
    for (index, row) in window.rows().iter().enumerate() {
        let address = format_address(row.address);
        println!("{address}  {}  {}", row.hex, row.chars);
        if let Some(span) = span.filter(|span| span.row == index) {
            let hex_start = address.len() + 2 + span.hex_offset;
            let char_start = address.len() + 2 + row.hex.len() + 2 + span.char_offset;
            let mut marker = " ".repeat(char_start + span.char_len);
            marker.replace_range(hex_start..hex_start + span.hex_len, &"^".repeat(span.hex_len));
            marker.replace_range(
                char_start..char_start + span.char_len,
                &"^".repeat(span.char_len),
            );
            println!("{}", marker.trim_end());
        }
    }
}

async fn watch(session: &Session, args: &WatchArgs) -> Result<(), CliError> {
    let addr = peer_of(session);
    let mut connectivity = session.subscribe(Topic::Connectivity);
    let mut states = session.subscribe(Topic::RunState);
    let mut ticks = session.subscribe(Topic::ClockTick);
    let mut events = session.subscribe(Topic::Generic);
    let mut raw = session.subscribe(Topic::Raw);
    let poller = args.clock.then(|| ClockPoller::spawn(session.clone()));

    println!("{addr}: {}", session.run_state());
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let outcome = loop {
        tokio::select! {
            _ = &mut ctrl_c => break Ok(()),
            event = connectivity.recv() => {
                if let Ok(SessionEvent::Connectivity(false)) | Err(RecvError::Closed) = event {
                    break Err(CliError::Disconnected { addr: addr.clone() });
                }
            }
            event = states.recv() => {
                if let Ok(SessionEvent::RunState(state)) = event {
                    println!("state: {state}");
                }
            }
            event = ticks.recv() => {
                if let Ok(SessionEvent::ClockTick(tick)) = event {
                    println!("clock: {}", format_clock(tick.time_ns));
                }
            }
            event = events.recv() => {
                if let Ok(SessionEvent::Event(event)) = event {
                    println!("event: {} {}", event.name, event.data);
                }
            }
            event = raw.recv(), if args.raw => {
                if let Ok(SessionEvent::Raw(frame)) = event {
                    println!("raw: {frame}");
                }
            }
        }
    };

    if let Some(poller) = poller {
        poller.stop().await;
    }
    outcome
}

fn format_clock(time_ns: u64) -> String {
    format!("{}.{:09}s", time_ns / 1_000_000_000, time_ns % 1_000_000_000)
}
