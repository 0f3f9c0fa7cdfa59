// CLI entry point: host a headless room through a relay.
//
// Opens a session, prints the room id, answers every relayed player with an
// echo of what they send, and keeps the relay's room listing fresh until the
// relay closes the room (or the process is killed). Useful for checking a
// relay deployment end to end without starting a game.
//
// Usage:
//   relay-host --relay <HOST:PORT> [OPTIONS]
//     --password <PASS>    Room password (optional)
//     --name <NAME>        Host name shown in the room listing (default: relay-host)
//     --map <MAP>          Map name shown in the room listing (default: lobby)
//     --config <FILE>      JSON file with `RelayConfig` overrides
//
// Logging goes through env_logger; set RUST_LOG=debug for per-connection
// detail.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use hostlink_protocol::{CloseReason, RoomStats};
use hostlink_relay::{
    Connection, ConnectionListener, MainQueue, RelayConfig, SessionCallbacks, SessionManager,
    StaticHostState, StatusBroadcaster,
};

/// How often the main loop drains the task queue.
const FRAME: Duration = Duration::from_millis(16);

struct Args {
    host: String,
    port: u16,
    password: Option<String>,
    name: String,
    map: String,
    config: Option<String>,
}

/// Sends every payload straight back to the player it came from.
struct EchoDispatcher;

impl ConnectionListener for EchoDispatcher {
    fn connected(&self, conn: &Arc<dyn Connection>) {
        log::info!("player {} joined", conn.id());
    }

    fn received(&self, conn: &Arc<dyn Connection>, payload: &[u8]) {
        if let Err(e) = conn.send_tcp(payload) {
            log::warn!("echo to {} failed: {e}", conn.id());
        }
    }

    fn disconnected(&self, conn: &Arc<dyn Connection>, reason: CloseReason) {
        log::info!("player {} left ({reason})", conn.id());
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = parse_args();
    let config = match &args.config {
        Some(path) => load_config(path),
        None => RelayConfig::default(),
    };

    let queue = Arc::new(MainQueue::new());
    let host = Arc::new(StaticHostState {
        stats: RoomStats {
            map_name: args.map.clone(),
            gamemode: "echo".into(),
            host_name: args.name.clone(),
            locale: "en".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            ..RoomStats::default()
        },
    });
    let session = SessionManager::new(config, Arc::new(EchoDispatcher), queue.clone(), host.clone());
    let session = match session {
        Ok(session) => Arc::new(session),
        Err(e) => {
            eprintln!("Failed to start session worker: {e}");
            std::process::exit(1);
        }
    };
    let broadcaster = StatusBroadcaster::new(session.clone(), host, queue.clone());

    // Set once the session is over; holds the process exit code.
    let exit_code = Arc::new(Mutex::new(None::<i32>));
    let on_fail_code = exit_code.clone();
    let on_closed_code = exit_code.clone();
    session.create(
        &args.host,
        args.port,
        args.password.clone(),
        SessionCallbacks::new(
            |link| match link.room_id() {
                Some(room_id) => println!("Hosting room {room_id}"),
                None => println!("Hosting room (id pending)"),
            },
            move |e| {
                eprintln!("Could not open a room: {e} [{}]", e.close_reason().message_key());
                set_exit(&on_fail_code, 1);
            },
            move |reason| {
                println!("Room closed: {reason} [{}]", reason.message_key());
                let code = if reason == CloseReason::Closed { 0 } else { 1 };
                set_exit(&on_closed_code, code);
            },
        ),
    );
    if let Err(e) = broadcaster.start() {
        log::warn!("stats schedule unavailable: {e}");
    }

    let code = loop {
        queue.run_pending();
        if let Some(code) = *exit_code.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) {
            break code;
        }
        std::thread::sleep(FRAME);
    };

    broadcaster.stop();
    session.dispose();
    std::process::exit(code);
}

fn set_exit(slot: &Mutex<Option<i32>>, code: i32) {
    *slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(code);
}

fn load_config(path: &str) -> RelayConfig {
    let text = std::fs::read_to_string(path).unwrap_or_else(|e| {
        eprintln!("Cannot read {path}: {e}");
        std::process::exit(1);
    });
    RelayConfig::from_json(&text).unwrap_or_else(|e| {
        eprintln!("Invalid config {path}: {e}");
        std::process::exit(1);
    })
}

/// Parse command-line arguments. Uses simple `std::env::args()` matching.
fn parse_args() -> Args {
    let mut relay = None;
    let mut password = None;
    let mut name = "relay-host".to_owned();
    let mut map = "lobby".to_owned();
    let mut config = None;
    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--relay" => {
                i += 1;
                relay = Some(args.get(i).and_then(|s| split_host_port(s)).unwrap_or_else(|| {
                    eprintln!("--relay requires HOST:PORT");
                    std::process::exit(1);
                }));
            }
            "--password" => {
                i += 1;
                password = Some(value(&args, i, "--password"));
            }
            "--name" => {
                i += 1;
                name = value(&args, i, "--name");
            }
            "--map" => {
                i += 1;
                map = value(&args, i, "--map");
            }
            "--config" => {
                i += 1;
                config = Some(value(&args, i, "--config"));
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                print_usage();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    let Some((host, port)) = relay else {
        eprintln!("--relay is required");
        print_usage();
        std::process::exit(1);
    };
    Args {
        host,
        port,
        password,
        name,
        map,
        config,
    }
}

fn value(args: &[String], i: usize, flag: &str) -> String {
    args.get(i).cloned().unwrap_or_else(|| {
        eprintln!("{flag} requires a value");
        std::process::exit(1);
    })
}

fn split_host_port(addr: &str) -> Option<(String, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    Some((host.to_owned(), port.parse().ok()?))
}

fn print_usage() {
    println!("Usage: relay-host --relay <HOST:PORT> [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --password <PASS>    Room password (optional)");
    println!("  --name <NAME>        Host name in the room listing (default: relay-host)");
    println!("  --map <MAP>          Map name in the room listing (default: lobby)");
    println!("  --config <FILE>      JSON file with relay config overrides");
    println!("  --help, -h           Show this help");
}
