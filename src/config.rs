use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Configuration de l'appareil
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Client SNTP amont
    pub ntp: NtpConfig,

    /// Récepteur GPS et impulsion PPS
    pub gps: GpsConfig,

    /// Serveur SNTP local
    #[serde(default)]
    pub server: ServerConfig,

    /// Journalisation
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NtpConfig {
    /// Nom d'hôte du serveur amont ; un port explicite "hôte:port" est
    /// accepté, sinon le port 123 est implicite
    #[serde(default = "default_ntp_server")]
    pub server: String,

    /// Intervalle minimum entre deux synchronisations réussies (secondes)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Délai au-delà duquel une requête en vol est considérée perdue (secondes)
    #[serde(default = "default_udp_timeout")]
    pub udp_timeout_secs: u64,

    /// Version (S)NTP émise
    #[serde(default = "default_ntp_version")]
    pub version: u8,

    /// Version minimale acceptée dans une réponse
    #[serde(default = "default_ntp_min_version")]
    pub min_version: u8,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GpsConfig {
    /// Activer la lecture du module GPS
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Port série du module (ex : "COM9" sous Windows, "/dev/ttyUSB0" sous Linux)
    pub serial_port: String,

    /// Vitesse du port série
    #[serde(default = "default_gps_baud")]
    pub baud_rate: u32,

    /// Détection de l'impulsion PPS sur la ligne CTS du port série
    #[serde(default = "default_true")]
    pub pps_enabled: bool,

    /// Front de l'impulsion PPS retenu
    #[serde(default)]
    pub pps_edge: PpsEdge,

    /// Âge maximal de la dernière trame d'heure pour accepter un front PPS
    /// (microsecondes)
    #[serde(default = "default_fix_staleness")]
    pub fix_staleness_micros: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PpsEdge {
    Rising,
    Falling,
}

impl Default for PpsEdge {
    fn default() -> Self {
        PpsEdge::Rising
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    /// Activer le serveur SNTP local
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Port UDP d'écoute (123 exige en général des privilèges élevés)
    #[serde(default = "default_ntp_port")]
    pub port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Niveau de log : "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Journaliser chaque requête servie
    #[serde(default = "default_false")]
    pub log_requests: bool,
}

// Fonctions par défaut pour serde
fn default_ntp_server() -> String {
    "pool.ntp.org".to_string()
}
fn default_poll_interval() -> u64 {
    120
}
fn default_udp_timeout() -> u64 {
    5
}
fn default_ntp_version() -> u8 {
    4
}
fn default_ntp_min_version() -> u8 {
    3
}
fn default_gps_baud() -> u32 {
    115_200
}
fn default_fix_staleness() -> u64 {
    1_000_000
}
fn default_ntp_port() -> u16 {
    123
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            enabled: true,
            port: 123,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            log_requests: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ntp: NtpConfig {
                server: default_ntp_server(),
                poll_interval_secs: 120,
                udp_timeout_secs: 5,
                version: 4,
                min_version: 3,
            },
            gps: GpsConfig {
                enabled: true,
                serial_port: default_serial_port(),
                baud_rate: 115_200,
                pps_enabled: true,
                pps_edge: PpsEdge::Rising,
                fix_staleness_micros: 1_000_000,
            },
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_serial_port() -> String {
    #[cfg(target_os = "windows")]
    return "COM9".to_string();

    #[cfg(not(target_os = "windows"))]
    return "/dev/ttyUSB0".to_string();
}

impl Config {
    /// Charge la configuration depuis un fichier TOML
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;

        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    /// Sauvegarde la configuration dans un fichier TOML
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path.as_ref(), content).context("Failed to write config file")?;

        Ok(())
    }

    /// Valide la configuration
    fn validate(&self) -> Result<()> {
        if self.ntp.version < 3 || self.ntp.version > 4 {
            anyhow::bail!("Invalid NTP version: must be 3 or 4");
        }
        if self.ntp.min_version > self.ntp.version {
            anyhow::bail!("Invalid NTP minimum version: must not exceed the emitted version");
        }
        if self.ntp.poll_interval_secs == 0 {
            anyhow::bail!("Invalid poll interval: must be at least 1 second");
        }
        if self.ntp.udp_timeout_secs == 0 {
            anyhow::bail!("Invalid UDP timeout: must be at least 1 second");
        }
        if self.ntp.server.is_empty() {
            anyhow::bail!("NTP server hostname must not be empty");
        }
        if self.gps.enabled && self.gps.serial_port.is_empty() {
            anyhow::bail!("GPS is enabled but no serial port is configured");
        }
        Ok(())
    }

    /// Crée un fichier de configuration exemple
    pub fn create_example_config<P: AsRef<Path>>(path: P) -> Result<()> {
        Config::default().to_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ntp.poll_interval_secs, 120);
        assert_eq!(config.ntp.udp_timeout_secs, 5);
        assert_eq!(config.gps.baud_rate, 115_200);
        assert_eq!(config.gps.fix_staleness_micros, 1_000_000);
        assert_eq!(config.gps.pps_edge, PpsEdge::Rising);
        assert_eq!(config.server.port, 123);
    }

    #[test]
    fn test_version_validation() {
        let mut config = Config::default();
        config.ntp.version = 2;
        assert!(config.validate().is_err());

        config.ntp.version = 4;
        config.ntp.min_version = 5;
        assert!(config.validate().is_err());

        config.ntp.min_version = 3;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_intervals_rejected() {
        let mut config = Config::default();
        config.ntp.poll_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.ntp.udp_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.ntp.server, config.ntp.server);
        assert_eq!(parsed.gps.pps_edge, config.gps.pps_edge);
        assert_eq!(parsed.server.port, config.server.port);
    }

    #[test]
    fn test_minimal_toml_uses_defaults() {
        let parsed: Config = toml::from_str(
            "[ntp]\n[gps]\nserial_port = \"/dev/ttyACM0\"\npps_edge = \"falling\"\n",
        )
        .unwrap();
        assert_eq!(parsed.ntp.server, "pool.ntp.org");
        assert_eq!(parsed.gps.pps_edge, PpsEdge::Falling);
        assert!(parsed.server.enabled);
    }
}
