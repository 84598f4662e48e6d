use bts_signal::clock::SystemClock;
use bts_signal::transport::DatagramTransport;
use bts_signal::workers::{WorkerMode, WorkerPool};
use bts_signal::{BtsConfig, Capabilities, DriverState, Engine, JsonCodec, LoggingCollaborator};
use clap::{App, Arg};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{error, info, warn};

const DEFAULT_SOCKET: &str = "/tmp/btsd.sock";
const DEFAULT_PEER: &str = "/tmp/bts-radio.sock";
const TICK_MS: u64 = 100;
const RECV_WAIT_MS: u64 = 200;
const STATS_INTERVAL_SECS: u64 = 60;
const WORKER_DRAIN_MS: u64 = 1000;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("btsd")
        .version("0.1.0")
        .about("GSM base station signalling daemon")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("socket")
                .short("s")
                .long("socket")
                .value_name("PATH")
                .help("Local signalling socket")
                .takes_value(true)
                .default_value(DEFAULT_SOCKET),
        )
        .arg(
            Arg::with_name("peer")
                .short("p")
                .long("peer")
                .value_name("PATH")
                .help("Radio peer signalling socket")
                .takes_value(true)
                .default_value(DEFAULT_PEER),
        )
        .get_matches();

    let config = match matches.value_of("config") {
        Some(path) => BtsConfig::load(Path::new(path))?,
        None => BtsConfig::default(),
    };
    let socket = matches.value_of("socket").unwrap_or(DEFAULT_SOCKET);
    let peer = matches.value_of("peer").unwrap_or(DEFAULT_PEER);

    let transport = DatagramTransport::connect(
        Path::new(socket),
        Path::new(peer),
        Duration::from_millis(RECV_WAIT_MS),
    )?;
    info!("Signalling socket {} -> {}", socket, peer);

    let engine = Engine::new(
        config,
        Capabilities {
            transport: Arc::new(transport),
            codec: Arc::new(JsonCodec::new()),
            collaborator: Arc::new(LoggingCollaborator::new()),
            clock: Arc::new(SystemClock),
            workers: WorkerPool::new(WorkerMode::Runtime(tokio::runtime::Handle::current())),
        },
    );
    engine.start();

    let running = Arc::new(AtomicBool::new(true));
    let rx_engine = Arc::clone(&engine);
    let rx_running = Arc::clone(&running);
    let receiver = tokio::task::spawn_blocking(move || {
        while rx_running.load(Ordering::SeqCst) {
            if let Err(e) = rx_engine.receive_once() {
                warn!("Receive error: {}", e);
                std::thread::sleep(Duration::from_millis(RECV_WAIT_MS));
            }
        }
    });

    let mut ticker = time::interval(Duration::from_millis(TICK_MS));
    let mut stats = time::interval(Duration::from_secs(STATS_INTERVAL_SECS));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                engine.tick();
                if engine.state() == DriverState::Stopped {
                    error!("Engine stopped for good, exiting");
                    break;
                }
            }
            _ = stats.tick() => {
                match serde_json::to_string(&engine.stats()) {
                    Ok(json) => info!("STATS: {}", json),
                    Err(e) => warn!("Failed to serialize stats: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    running.store(false, Ordering::SeqCst);
    engine.workers().cancel_all(WORKER_DRAIN_MS);
    engine.stop();
    if let Err(e) = receiver.await {
        warn!("Receiver task failed: {}", e);
    }
    info!("btsd stopped");
    Ok(())
}
