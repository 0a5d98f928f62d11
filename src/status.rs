use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

/// Instantané observable de l'appareil, partagé entre le lecteur GPS,
/// le serveur SNTP et la boucle principale qui le journalise
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppStatus {
    pub gps: GpsStats,
    pub ntp: NtpStats,
    pub clock: ClockInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GpsStats {
    /// Port série ouvert et trames reçues récemment
    pub connected: bool,

    /// Satellites utilisés dans le dernier fix
    pub satellites: u8,

    /// Nombre de trames NMEA acceptées
    pub nmea_sentences: u64,

    /// Impulsions PPS retenues
    pub pps_count: u64,

    /// Une impulsion PPS a été vue dans la dernière minute
    pub pps_active: bool,

    /// Dernière position validée (lat, lon, alt)
    pub position: Option<(f64, f64, f64)>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NtpStats {
    /// Requêtes servies aux clients du LAN
    pub requests_served: u64,

    /// Synchronisations amont réussies
    pub client_syncs: u64,

    /// Requêtes amont abandonnées sur délai
    pub client_timeouts: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClockInfo {
    pub stratum: u8,

    /// Identifiant de référence rendu lisible ("GPS", adresse IPv4, hex)
    pub reference_id: String,

    /// Heure UTC courante en microsecondes Unix
    pub utc_micros: u64,
}

/// Rend l'identifiant de référence lisible : étiquette ASCII pour les
/// strates primaires, quadruplet pointé sinon
pub fn format_reference_id(reference_id: u32, stratum: u8) -> String {
    if reference_id == 0 {
        return "----".to_string();
    }
    let bytes = reference_id.to_be_bytes();
    if stratum <= 1 {
        let text: String = bytes
            .iter()
            .take_while(|b| **b != 0)
            .map(|b| *b as char)
            .collect();
        if !text.is_empty() && text.chars().all(|c| c.is_ascii_graphic()) {
            return text;
        }
    }
    format!("{}.{}.{}.{}", bytes[0], bytes[1], bytes[2], bytes[3])
}

/// Gestionnaire du statut partagé via `Arc<RwLock>`
pub struct StatusManager {
    inner: Arc<RwLock<AppStatus>>,
}

impl StatusManager {
    pub fn new() -> Self {
        StatusManager {
            inner: Arc::new(RwLock::new(AppStatus::default())),
        }
    }

    /// Clone de l'`Arc` pour partage entre threads
    pub fn clone_arc(&self) -> Arc<RwLock<AppStatus>> {
        Arc::clone(&self.inner)
    }

    pub fn get(&self) -> AppStatus {
        self.inner.read().map(|s| s.clone()).unwrap_or_default()
    }
}

impl Default for StatusManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Applique une mise à jour à la section GPS du statut
pub fn update_gps<F>(status: &Arc<RwLock<AppStatus>>, f: F)
where
    F: FnOnce(&mut GpsStats),
{
    if let Ok(mut status) = status.write() {
        f(&mut status.gps);
    }
}

/// Applique une mise à jour à la section NTP du statut
pub fn update_ntp<F>(status: &Arc<RwLock<AppStatus>>, f: F)
where
    F: FnOnce(&mut NtpStats),
{
    if let Ok(mut status) = status.write() {
        f(&mut status.ntp);
    }
}

/// Applique une mise à jour à la section horloge du statut
pub fn update_clock<F>(status: &Arc<RwLock<AppStatus>>, f: F)
where
    F: FnOnce(&mut ClockInfo),
{
    if let Ok(mut status) = status.write() {
        f(&mut status.clock);
    }
}
