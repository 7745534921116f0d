use std::env;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use evermire_account::account_handler::{AccountService, ServiceConfig};
use evermire_account::storage::Storage;
use evermire_core::config::Settings;
use evermire_core::net::{NetEvent, NetworkServer};
use evermire_core::point::Point;

/// How often the maintenance sweep (ban expiry, handoff timeouts) runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

fn main() -> anyhow::Result<()> {
    let settings = Settings::load()?;

    evermire_core::initialize_logger(settings.log_level, Some("account-server.log"))
        .unwrap_or_else(|e| {
            eprintln!("Failed to initialize logger: {}. Exiting.", e);
            process::exit(1);
        });

    log::info!("Starting Evermire account service");
    log::info!("Process PID: {}", process::id());

    let quit_flag = Arc::new(AtomicBool::new(false));
    let quit_clone = quit_flag.clone();
    ctrlc::set_handler(move || {
        if quit_clone.swap(true, Ordering::SeqCst) {
            log::info!("Alright, alright, I'm already terminating!");
        } else {
            log::info!("Got signal to terminate. Shutdown initiated...");
        }
    })?;

    // A broken database at startup is fatal; everything after this point
    // degrades gracefully instead.
    let database_path = env::var("account_database").unwrap_or_else(|_| "evermire.db".to_string());
    let mut storage = Storage::open(&database_path).unwrap_or_else(|e| {
        log::error!("Failed to open database '{}': {}. Exiting.", database_path, e);
        process::exit(1);
    });
    storage.set_all_offline().unwrap_or_else(|e| {
        log::error!("Failed to reset online flags: {}. Exiting.", e);
        process::exit(1);
    });

    let config = ServiceConfig {
        chat_host: settings.chat_host.clone(),
        chat_port: settings.chat_port,
        net_password: env::var("net_password").unwrap_or_default(),
        default_map: settings.default_map,
        default_spawn: Point::new(2048, 2048),
        ..ServiceConfig::default()
    };
    let mut service = AccountService::new(storage, config);

    let net = NetworkServer::bind(
        &format!("0.0.0.0:{}", settings.account_port),
        settings.net_max_clients,
    )?;

    log::info!("Entering account service loop...");
    let mut last_sweep = Instant::now();

    while !quit_flag.load(Ordering::SeqCst) {
        let events = net.poll();
        let idle = events.is_empty();
        for event in events {
            match event {
                NetEvent::Connected(connection, _addr) => service.handle_connect(connection),
                NetEvent::Frame(connection, frame) => service.handle_frame(connection, &frame),
                NetEvent::Disconnected(connection) => service.handle_disconnect(connection),
            }
        }

        for (connection, msg) in service.take_outbox() {
            net.send(connection, &msg);
        }

        if last_sweep.elapsed() >= SWEEP_INTERVAL {
            service.sweep();
            last_sweep = Instant::now();
        }

        if idle {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    log::info!("Shutdown signal received.");
    service.storage.set_all_offline().unwrap_or_else(|e| {
        log::error!("Failed to reset online flags on shutdown: {}", e);
    });
    log::info!("Account service shutdown complete.");
    Ok(())
}
