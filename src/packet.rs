use std::net::IpAddr;
use thiserror::Error;

/// Taille d'un message SNTP sur le réseau (48 octets)
pub const NTP_MSG_LEN: usize = 48;

/// Différence entre l'epoch NTP (1900-01-01) et l'epoch Unix (1970-01-01) en secondes
pub const NTP_DELTA: u64 = 2_208_988_800;

/// Version (S)NTP émise par ce code
pub const NTP_VERSION: u8 = 4;

/// Mode client (requête)
pub const MODE_CLIENT: u8 = 3;
/// Mode serveur (réponse)
pub const MODE_SERVER: u8 = 4;

/// "GPS\0" en ordre hôte, identifiant de référence d'une source GPS
pub const NTP_REF_GPS: u32 = 0x4750_5300;

/// Erreurs liées au décodage des messages SNTP
#[derive(Error, Debug)]
pub enum WireError {
    #[error("Invalid packet size: expected {expected}, got {actual}")]
    InvalidSize { expected: usize, actual: usize },
}

/// Convertit des microsecondes (< 1 s) en fraction NTP 32 bits
///
/// La fraction encode `f / 2^32` seconde ; le facteur exact est
/// 10^6 * 2^-32 = 5^6 * 2^-26, d'où le couple décalage/division
/// qui reste en arithmétique entière.
pub fn micros_to_fraction(micros: u64) -> u32 {
    ((micros << 26) / 15625) as u32
}

/// Convertit une fraction NTP 32 bits en microsecondes, arrondi au plus proche
pub fn fraction_to_micros(fraction: u32) -> u64 {
    ((fraction as u64) * 15625 + (1 << 25)) >> 26
}

/// Timestamp NTP : secondes depuis 1900 puis fraction de seconde
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NtpTimestamp {
    pub secs: u32,
    pub frac: u32,
}

impl NtpTimestamp {
    /// Construit un timestamp NTP depuis un temps UTC en microsecondes Unix
    pub fn from_utc_micros(utc_micros: u64) -> Self {
        let secs = utc_micros / 1_000_000;
        let micros = utc_micros % 1_000_000;
        NtpTimestamp {
            secs: (secs + NTP_DELTA) as u32,
            frac: micros_to_fraction(micros),
        }
    }

    /// Temps UTC en microsecondes Unix correspondant
    pub fn to_utc_micros(self) -> u64 {
        (self.secs as u64 - NTP_DELTA) * 1_000_000 + fraction_to_micros(self.frac)
    }

    #[allow(dead_code)]
    pub fn is_zero(self) -> bool {
        self.secs == 0 && self.frac == 0
    }
}

/// Message SNTP v4 (48 octets), champs en ordre hôte
///
/// Tous les entiers multi-octets sont en big-endian sur le réseau ;
/// le décodage et l'encodage font la conversion.
#[derive(Debug, Clone, Copy, Default)]
pub struct NtpMessage {
    /// LI (2 bits) | VN (3 bits) | Mode (3 bits)
    pub flags: u8,
    pub stratum: u8,
    pub poll: u8,
    pub precision: i8,
    pub root_delay: u32,
    pub root_dispersion: u32,
    pub ref_id: u32,
    pub ref_ts: NtpTimestamp,
    pub orig_ts: NtpTimestamp,
    pub rx_ts: NtpTimestamp,
    pub tx_ts: NtpTimestamp,
}

impl NtpMessage {
    /// Assemble l'octet de tête depuis le leap indicator, la version et le mode
    pub fn make_flags(li: u8, version: u8, mode: u8) -> u8 {
        ((li & 0x03) << 6) | ((version & 0x07) << 3) | (mode & 0x07)
    }

    pub fn version(&self) -> u8 {
        (self.flags >> 3) & 0x07
    }

    pub fn mode(&self) -> u8 {
        self.flags & 0x07
    }

    /// Décode un datagramme de 48 octets exactement
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() != NTP_MSG_LEN {
            return Err(WireError::InvalidSize {
                expected: NTP_MSG_LEN,
                actual: bytes.len(),
            });
        }

        let be32 = |offset: usize| {
            u32::from_be_bytes([
                bytes[offset],
                bytes[offset + 1],
                bytes[offset + 2],
                bytes[offset + 3],
            ])
        };
        let ts = |offset: usize| NtpTimestamp {
            secs: be32(offset),
            frac: be32(offset + 4),
        };

        Ok(NtpMessage {
            flags: bytes[0],
            stratum: bytes[1],
            poll: bytes[2],
            precision: bytes[3] as i8,
            root_delay: be32(4),
            root_dispersion: be32(8),
            ref_id: be32(12),
            ref_ts: ts(16),
            orig_ts: ts(24),
            rx_ts: ts(32),
            tx_ts: ts(40),
        })
    }

    /// Encode le message pour transmission (big-endian)
    pub fn to_bytes(&self) -> [u8; NTP_MSG_LEN] {
        let mut bytes = [0u8; NTP_MSG_LEN];

        bytes[0] = self.flags;
        bytes[1] = self.stratum;
        bytes[2] = self.poll;
        bytes[3] = self.precision as u8;
        bytes[4..8].copy_from_slice(&self.root_delay.to_be_bytes());
        bytes[8..12].copy_from_slice(&self.root_dispersion.to_be_bytes());
        bytes[12..16].copy_from_slice(&self.ref_id.to_be_bytes());

        let mut put_ts = |offset: usize, ts: &NtpTimestamp| {
            bytes[offset..offset + 4].copy_from_slice(&ts.secs.to_be_bytes());
            bytes[offset + 4..offset + 8].copy_from_slice(&ts.frac.to_be_bytes());
        };
        put_ts(16, &self.ref_ts);
        put_ts(24, &self.orig_ts);
        put_ts(32, &self.rx_ts);
        put_ts(40, &self.tx_ts);

        bytes
    }
}

/// Identifiant de référence NTP dérivé d'une adresse IP
///
/// IPv4 : l'adresse brute sur 32 bits. IPv6 : XOR des quatre mots de
/// 32 bits de l'adresse. C'est une approximation, pas le condensé MD5
/// de la RFC.
pub fn reference_id_for(addr: &IpAddr) -> u32 {
    match addr {
        IpAddr::V4(v4) => u32::from_be_bytes(v4.octets()),
        IpAddr::V6(v6) => {
            let o = v6.octets();
            let mut folded = 0u32;
            for chunk in o.chunks_exact(4) {
                folded ^= u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            }
            folded
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_fraction_round_trip() {
        // La paire décalage/division est inversible sur toute la plage utile
        for micros in [0u64, 1, 2, 499_999, 500_000, 500_001, 999_998, 999_999] {
            let frac = micros_to_fraction(micros);
            assert_eq!(fraction_to_micros(frac), micros, "micros={}", micros);
        }
        let mut micros = 0u64;
        while micros < 1_000_000 {
            assert_eq!(fraction_to_micros(micros_to_fraction(micros)), micros);
            micros += 977;
        }
    }

    #[test]
    fn test_fraction_half_second() {
        // 0,5 s correspond à 2^31
        let frac = micros_to_fraction(500_000);
        assert!((frac as i64 - (1i64 << 31)).abs() < 300, "frac={}", frac);
    }

    #[test]
    fn test_timestamp_epoch() {
        let ts = NtpTimestamp::from_utc_micros(0);
        assert_eq!(ts.secs as u64, NTP_DELTA);
        assert_eq!(ts.frac, 0);
        assert_eq!(ts.to_utc_micros(), 0);
    }

    #[test]
    fn test_timestamp_round_trip() {
        let utc = 1_674_951_193_250_000u64; // 2023-01-29 00:13:13.25 UTC
        let ts = NtpTimestamp::from_utc_micros(utc);
        assert_eq!(ts.to_utc_micros(), utc);
    }

    #[test]
    fn test_message_round_trip() {
        let msg = NtpMessage {
            flags: NtpMessage::make_flags(0, NTP_VERSION, MODE_SERVER),
            stratum: 1,
            poll: 3,
            precision: -6,
            root_delay: 0x0001_0002,
            root_dispersion: 0x0003_0004,
            ref_id: NTP_REF_GPS,
            ref_ts: NtpTimestamp { secs: 1, frac: 2 },
            orig_ts: NtpTimestamp { secs: 3, frac: 4 },
            rx_ts: NtpTimestamp { secs: 5, frac: 6 },
            tx_ts: NtpTimestamp {
                secs: 0xDEAD_BEEF,
                frac: 0xCAFE_F00D,
            },
        };
        let bytes = msg.to_bytes();
        let parsed = NtpMessage::from_bytes(&bytes).unwrap();

        assert_eq!(parsed.flags, msg.flags);
        assert_eq!(parsed.stratum, 1);
        assert_eq!(parsed.poll, 3);
        assert_eq!(parsed.precision, -6);
        assert_eq!(parsed.root_delay, msg.root_delay);
        assert_eq!(parsed.root_dispersion, msg.root_dispersion);
        assert_eq!(parsed.ref_id, NTP_REF_GPS);
        assert_eq!(parsed.ref_ts, msg.ref_ts);
        assert_eq!(parsed.orig_ts, msg.orig_ts);
        assert_eq!(parsed.rx_ts, msg.rx_ts);
        assert_eq!(parsed.tx_ts, msg.tx_ts);
    }

    #[test]
    fn test_message_size_is_strict() {
        assert!(NtpMessage::from_bytes(&[0u8; 47]).is_err());
        assert!(NtpMessage::from_bytes(&[0u8; 49]).is_err());
        assert!(NtpMessage::from_bytes(&[0u8; 48]).is_ok());
    }

    #[test]
    fn test_flags_fields() {
        let flags = NtpMessage::make_flags(0, 4, 3);
        assert_eq!(flags, 0x23);
        let msg = NtpMessage {
            flags,
            ..Default::default()
        };
        assert_eq!(msg.version(), 4);
        assert_eq!(msg.mode(), MODE_CLIENT);
    }

    #[test]
    fn test_reference_id_v4() {
        let addr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10));
        assert_eq!(reference_id_for(&addr), 0xC0A8_010A);
    }

    #[test]
    fn test_reference_id_v6_fold() {
        let addr = IpAddr::V6(Ipv6Addr::new(
            0x2001, 0x0db8, 0x0000, 0x0001, 0x0000, 0x0000, 0x0000, 0x0002,
        ));
        let expected = 0x2001_0db8u32 ^ 0x0000_0001 ^ 0x0000_0000 ^ 0x0000_0002;
        assert_eq!(reference_id_for(&addr), expected);
    }

    #[test]
    fn test_gps_reference_id() {
        assert_eq!(NTP_REF_GPS.to_be_bytes(), *b"GPS\0");
    }
}
