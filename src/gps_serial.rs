/*!
Frontal série du récepteur GPS

Un thread dédié tient le port série ouvert, pousse chaque octet reçu dans
l'analyseur NMEA et surveille la ligne CTS sur laquelle l'impulsion PPS du
module est câblée. À chaque front qualifié, l'heure de l'analyseur est
proposée à la discipline d'horloge, qui la rejette si la dernière trame
d'heure est trop vieille.

Architecture robuste : reconnexion automatique avec recul exponentiel,
gestion d'erreurs sans panic, le reste de l'appareil ne bloque jamais sur
le GPS.
*/

use crate::clock::MonotonicSource;
use crate::config::{GpsConfig, PpsEdge};
use crate::discipline::Discipline;
use crate::nmea::GpsStatus;
use crate::status::{self, AppStatus};
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Qualifie une transition de la ligne CTS selon le front configuré
fn is_pps_edge(edge: PpsEdge, previous: bool, current: bool) -> bool {
    match edge {
        PpsEdge::Rising => !previous && current,
        PpsEdge::Falling => previous && !current,
    }
}

pub struct GpsFrontend {
    config: GpsConfig,
    clock: Arc<dyn MonotonicSource>,
    discipline: Arc<Discipline>,
    status: Arc<RwLock<AppStatus>>,
    running: Arc<AtomicBool>,
}

impl GpsFrontend {
    pub fn new(
        config: GpsConfig,
        clock: Arc<dyn MonotonicSource>,
        discipline: Arc<Discipline>,
        status: Arc<RwLock<AppStatus>>,
    ) -> Self {
        GpsFrontend {
            config,
            clock,
            discipline,
            status,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Démarre le thread de lecture ; il tourne jusqu'à `stop` avec
    /// reconnexion automatique
    pub fn start(self) -> std::thread::JoinHandle<()> {
        info!("Starting GPS frontend");
        info!("  Port: {}", self.config.serial_port);
        info!("  Baud rate: {}", self.config.baud_rate);
        info!("  PPS on CTS: {}", self.config.pps_enabled);

        std::thread::spawn(move || {
            let mut reconnect_delay = Duration::from_secs(5);
            let max_reconnect_delay = Duration::from_secs(60);

            while self.running.load(Ordering::Relaxed) {
                match self.run_reader() {
                    Ok(()) => {
                        info!("GPS frontend stopped");
                        break;
                    }
                    Err(e) => {
                        status::update_gps(&self.status, |gps| {
                            gps.connected = false;
                            gps.pps_active = false;
                        });
                        error!("GPS frontend error: {:#}", e);
                        error!("Reconnecting in {:?}...", reconnect_delay);
                        std::thread::sleep(reconnect_delay);
                        reconnect_delay = std::cmp::min(reconnect_delay * 2, max_reconnect_delay);
                    }
                }
            }
        })
    }

    /// Demande l'arrêt du thread
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// Boucle de lecture : octets NMEA et fronts PPS
    fn run_reader(&self) -> anyhow::Result<()> {
        info!("Opening GPS serial port: {}", self.config.serial_port);

        let mut port = serialport::new(&self.config.serial_port, self.config.baud_rate)
            .timeout(Duration::from_millis(100))
            .open()?;
        port.write_request_to_send(true)?;
        port.clear(serialport::ClearBuffer::All)?;

        info!("GPS serial port opened");
        status::update_gps(&self.status, |gps| gps.connected = true);

        let mut parser = GpsStatus::new(self.clock.clone());
        let mut read_buf = [0u8; 512];
        let mut last_cts = port.read_clear_to_send().unwrap_or(false);
        let mut last_pps = Instant::now();
        let mut nmea_count: u64 = 0;
        let mut pps_count: u64 = 0;
        let mut last_status_push = Instant::now();

        while self.running.load(Ordering::Relaxed) {
            match port.read(&mut read_buf) {
                Ok(n) if n > 0 => {
                    for &byte in &read_buf[..n] {
                        if parser.feed(byte) {
                            nmea_count += 1;
                        }
                    }
                }
                Ok(_) => {}
                Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    // Délai de lecture normal
                }
                Err(e) => return Err(e.into()),
            }

            if self.config.pps_enabled {
                match port.read_clear_to_send() {
                    Ok(cts) if cts != last_cts => {
                        let edge = is_pps_edge(self.config.pps_edge, last_cts, cts);
                        last_cts = cts;
                        if edge {
                            let interval = last_pps.elapsed();
                            last_pps = Instant::now();
                            debug!("PPS pulse, interval {:.6}s", interval.as_secs_f64());
                            if self
                                .discipline
                                .pps_sync(parser.get_time(), self.config.fix_staleness_micros)
                            {
                                pps_count += 1;
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Failed to read CTS state: {}", e);
                    }
                }
            }

            // Rafraîchit l'instantané partagé sans inonder le verrou
            if last_status_push.elapsed() > Duration::from_secs(2) {
                last_status_push = Instant::now();
                let position = parser.get_location().map(|(lat, lon, alt, _)| (lat, lon, alt));
                let satellites = parser.sat_count();
                let pps_active = last_pps.elapsed() < Duration::from_secs(60) && pps_count > 0;
                status::update_gps(&self.status, |gps| {
                    gps.satellites = satellites;
                    gps.nmea_sentences = nmea_count;
                    gps.pps_count = pps_count;
                    gps.pps_active = pps_active;
                    gps.position = position;
                });
            }
        }

        status::update_gps(&self.status, |gps| {
            gps.connected = false;
            gps.pps_active = false;
        });
        Ok(())
    }
}

impl Drop for GpsFrontend {
    fn drop(&mut self) {
        self.stop();
    }
}
