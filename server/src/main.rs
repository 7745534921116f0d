use std::env;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use evermire_core::config::Settings;
use evermire_core::net::{NetEvent, NetworkServer};
use evermire_server::account_link::{AccountLink, LinkEvent};
use evermire_server::attributes::AttributeSchema;
use evermire_server::game_handler::GameServer;
use evermire_server::game_state::{GameSettings, GameState};
use evermire_server::map::Map;
use evermire_server::map_composite::MapComposite;
use evermire_server::script::NullScriptEngine;

/// Nominal simulation tick.
const TICK: Duration = Duration::from_millis(100);

/// Ticks between full character flushes to the account service.
const FLUSH_INTERVAL_TICKS: u32 = 600;

/// Ticks between simulation-invariant sweeps.
const INVARIANT_SWEEP_TICKS: u32 = 512;

fn main() -> anyhow::Result<()> {
    let settings = Settings::load()?;

    evermire_core::initialize_logger(settings.log_level, Some("game-server.log")).unwrap_or_else(
        |e| {
            eprintln!("Failed to initialize logger: {}. Exiting.", e);
            process::exit(1);
        },
    );

    log::info!("Starting Evermire game service");
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

    // The world: for now a single built-in map; the map data loaders hand
    // real geometry to this same entry point.
    let game_settings = GameSettings {
        default_map: settings.default_map,
        hp_regen_break_after_hit: settings.hp_regen_break_after_hit as i32,
    };
    let mut state = GameState::new(
        game_settings,
        AttributeSchema::game_default(),
        Box::new(NullScriptEngine),
    );
    state.add_map(MapComposite::new(
        settings.default_map,
        "main",
        Map::new(128, 128, 32, 32),
    ));
    let hosted_maps: Vec<u16> = state.maps().map(|m| m.id()).collect();
    let mut server = GameServer::new(state);

    let net = NetworkServer::bind(
        &format!("0.0.0.0:{}", settings.game_port),
        settings.net_max_clients,
    )?;

    let inter_server_password = env::var("net_password").unwrap_or_default();
    let mut link = AccountLink::connect(
        &settings.account_addr(),
        &settings.game_host,
        settings.game_port,
        &inter_server_password,
        &hosted_maps,
    )?;
    log::info!("Registered with the account service at {}", settings.account_addr());

    log::info!("Entering main game loop...");
    let mut next_tick = Instant::now();
    let mut tick_counter: u32 = 0;

    while !quit_flag.load(Ordering::SeqCst) {
        // Client traffic.
        for event in net.poll() {
            match event {
                NetEvent::Connected(connection, _addr) => server.handle_connect(connection),
                NetEvent::Frame(connection, frame) => server.handle_frame(connection, &frame),
                NetEvent::Disconnected(connection) => server.handle_disconnect(connection),
            }
        }

        // Account service traffic.
        match link.poll() {
            Ok(events) => {
                for event in events {
                    match event {
                        LinkEvent::Registered => {}
                        LinkEvent::PlayerEnter {
                            token,
                            character_id,
                            name,
                            data,
                        } => server.register_pending_connect(token, character_id, &name, data),
                        LinkEvent::RedirectResponse {
                            character_id,
                            token,
                            host,
                            port,
                        } => {
                            if let Some((id, blob)) =
                                server.complete_migration(character_id, token, &host, port)
                            {
                                if let Err(e) = link.sync_character(id, &blob) {
                                    log::error!("PLAYER_SYNC for character {id} failed: {e}");
                                }
                            }
                        }
                        LinkEvent::QuestVar {
                            character_id,
                            name,
                            value,
                        } => server.apply_quest_var(character_id, &name, &value),
                    }
                }
            }
            Err(e) => {
                log::error!("lost the account service link: {e}");
                break;
            }
        }

        server.pump();
        tick_counter = tick_counter.wrapping_add(1);

        for (character_id, token) in server.take_completed_connects() {
            if let Err(e) = link.confirm_reconnect(character_id, &token) {
                log::error!("reconnect confirmation for {character_id} failed: {e}");
            }
        }
        for character_id in server.take_migration_requests() {
            // Flush the record with its destination first so the account
            // service can pick the shard hosting the target map.
            if let Some((id, blob)) = server.migration_departure_record(character_id) {
                if let Err(e) = link.flush_character(id, &blob) {
                    log::error!("pre-redirect flush for {id} failed: {e}");
                }
            }
            if let Err(e) = link.request_redirect(character_id) {
                log::error!("redirect request for {character_id} failed: {e}");
            }
        }
        for (connection, msg) in server.take_outbox() {
            net.send(connection, &msg);
        }
        for connection in server.take_closing() {
            net.close(connection);
        }

        if tick_counter % FLUSH_INTERVAL_TICKS == 0 {
            for (character_id, entity_id) in server.playing_characters() {
                if let Some(data) = server.character_data(entity_id) {
                    if let Err(e) = link.flush_character(character_id, &data) {
                        log::error!("periodic flush for {character_id} failed: {e}");
                    }
                }
            }
        }
        if tick_counter % INVARIANT_SWEEP_TICKS == 0 {
            server.state.check_invariants_sweep();
        }

        // Pace the loop to the nominal tick, catching up when late.
        next_tick += TICK;
        let now = Instant::now();
        if now < next_tick {
            std::thread::sleep(next_tick - now);
        } else if now > next_tick + TICK * 10 {
            log::warn!("Server too slow");
            next_tick = now;
        }
    }

    log::info!("Shutdown signal received, exiting main loop...");

    // Final flush so the account service holds current records.
    for (character_id, entity_id) in server.playing_characters() {
        if let Some(data) = server.character_data(entity_id) {
            if let Err(e) = link.flush_character(character_id, &data) {
                log::error!("final flush for {character_id} failed: {e}");
            }
        }
    }

    log::info!("Server shutdown complete.");
    Ok(())
}
