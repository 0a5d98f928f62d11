mod clock;
mod config;
mod discipline;
mod gps_serial;
mod nmea;
mod packet;
mod sntp_client;
mod sntp_server;
mod status;

use anyhow::{Context, Result};
use clock::BootClock;
use config::Config;
use discipline::Discipline;
use gps_serial::GpsFrontend;
use sntp_client::SntpClient;
use sntp_server::SntpServer;
use status::StatusManager;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> Result<()> {
    init_logging()?;

    info!("Metronome v{}", env!("CARGO_PKG_VERSION"));
    info!("GPS/SNTP-disciplined time appliance");

    let config_path = get_config_path();
    let config = load_or_create_config(&config_path)?;

    info!("Configuration:");
    info!("  NTP server: {}", config.ntp.server);
    info!("  Poll interval: {}s", config.ntp.poll_interval_secs);
    info!("  GPS: {}", if config.gps.enabled { "enabled" } else { "disabled" });
    info!("  SNTP server: {}", if config.server.enabled { "enabled" } else { "disabled" });

    // L'horloge monotone et la discipline vivent aussi longtemps que le
    // processus ; tout le reste n'en détient que des références
    let clock = Arc::new(BootClock::new());
    let discipline = Arc::new(Discipline::new(clock.clone()));
    let status_manager = StatusManager::new();
    let shared_status = status_manager.clone_arc();

    // Frontal GPS : octets NMEA et impulsions PPS
    let _gps_thread = if config.gps.enabled {
        let frontend = GpsFrontend::new(
            config.gps.clone(),
            clock.clone(),
            discipline.clone(),
            Arc::clone(&shared_status),
        );
        Some(frontend.start())
    } else {
        warn!("GPS module disabled, relying on SNTP only");
        None
    };

    // Serveur SNTP local
    let server = if config.server.enabled {
        match SntpServer::bind(
            config.server.port,
            discipline.clone(),
            Arc::clone(&shared_status),
            config.logging.log_requests,
        ) {
            Ok(server) => Some(server),
            Err(e) => {
                error!("SNTP server disabled: {:#}", e);
                None
            }
        }
    } else {
        None
    };

    // Client SNTP amont
    let mut client = SntpClient::new(
        config.ntp.clone(),
        clock.clone(),
        discipline.clone(),
        Arc::clone(&shared_status),
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        info!("Ctrl+C received, shutting down...");
        shutdown_flag.store(true, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    info!("Entering main loop");
    run_main_loop(&shutdown, &mut client, server.as_ref(), &discipline, &status_manager);

    info!("Stopped");
    Ok(())
}

/// Boucle coopérative : client SNTP, tâches périodiques, puis sockets
/// serveur, et une courte sieste pour laisser respirer la machine
fn run_main_loop(
    shutdown: &AtomicBool,
    client: &mut SntpClient,
    server: Option<&SntpServer>,
    discipline: &Discipline,
    status_manager: &StatusManager,
) {
    let mut last_report = Instant::now();

    while !shutdown.load(Ordering::SeqCst) {
        client.run();

        if last_report.elapsed() >= Duration::from_secs(60) {
            last_report = Instant::now();
            report_status(discipline, status_manager);
        }

        if let Some(server) = server {
            server.poll();
        }

        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Pousse l'état de l'horloge dans l'instantané partagé et le journalise
fn report_status(discipline: &Discipline, status_manager: &StatusManager) {
    let shared = status_manager.clone_arc();
    let stratum = discipline.get_stratum();
    let reference = status::format_reference_id(discipline.get_reference_id(), stratum);
    status::update_clock(&shared, |clock_info| {
        clock_info.stratum = stratum;
        clock_info.reference_id = reference.clone();
        clock_info.utc_micros = discipline.get_utc_micros();
    });

    let snapshot = status_manager.get();
    info!(
        "Clock: stratum {} ref {} | GPS: {} sats, {} sentences, {} PPS | NTP: {} served, {} syncs, {} timeouts",
        snapshot.clock.stratum,
        snapshot.clock.reference_id,
        snapshot.gps.satellites,
        snapshot.gps.nmea_sentences,
        snapshot.gps.pps_count,
        snapshot.ntp.requests_served,
        snapshot.ntp.client_syncs,
        snapshot.ntp.client_timeouts,
    );
}

/// Initialise le système de logging
fn init_logging() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .context("Failed to create log filter")?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Chemin du fichier de configuration
fn get_config_path() -> PathBuf {
    let args: Vec<String> = std::env::args().collect();
    if args.len() > 1 {
        return PathBuf::from(&args[1]);
    }

    #[cfg(target_os = "linux")]
    return PathBuf::from("/etc/metronome/config.toml");

    #[cfg(not(target_os = "linux"))]
    return PathBuf::from("config.toml");
}

/// Charge la configuration, ou en crée une exemple si elle n'existe pas
fn load_or_create_config(path: &PathBuf) -> Result<Config> {
    if path.exists() {
        info!("Loading configuration from {}", path.display());
        Config::from_file(path)
    } else {
        warn!("Configuration file not found: {}", path.display());
        warn!("Creating example configuration...");

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).context("Failed to create config directory")?;
            }
        }

        Config::create_example_config(path).context("Failed to create example config")?;
        info!("Example configuration created at {}", path.display());

        Config::from_file(path)
    }
}
