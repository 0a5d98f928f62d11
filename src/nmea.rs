/*!
Analyseur NMEA-0183 en flux pour modules GPS/GNSS

L'analyseur consomme le flux série octet par octet et reconnaît les trames
qui portent la position et l'heure UTC :

- **GGA** : qualité du fix, satellites, altitude, heure
- **GLL** : latitude/longitude, heure, validité
- **RMC** : position, heure, validité
- **ZDA** : date calendaire complète (la seule source de l'année)

Toute autre trame est consommée et sa somme de contrôle vérifiée, sans
extraction de champs. Une somme de contrôle fausse ou un champ malformé
rejette la trame entière : rien n'est écrit dans le registre d'état tant
que la validation n'a pas abouti.
*/

use crate::clock::MonotonicSource;
use chrono::NaiveDate;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Taille du tampon de trame : la plus longue trame utile plus de la marge.
/// Le '$' initial n'est jamais stocké ; le premier caractère est le premier
/// caractère de l'identifiant d'émetteur.
const BUFFER_LEN: usize = 128;

/// Table des puissances négatives de dix pour la partie fractionnaire
const NEGPOW_10: [f64; 8] = [1.0, 1e-1, 1e-2, 1e-3, 1e-4, 1e-5, 1e-6, 1e-7];

/// Table hexadécimale pour la vérification du '*hh' final
const HEX: &[u8; 16] = b"0123456789ABCDEF";

/// Erreurs de champ pendant l'analyse d'une trame
#[derive(Error, Debug, PartialEq, Eq)]
enum SentenceError {
    #[error("expected comma between fields")]
    ExpectedComma,
    #[error("invalid field value")]
    InvalidField,
}

/// Lecteur de champs : fait avancer un curseur dans la trame et entretient
/// la somme de contrôle XOR de chaque octet consommé
struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
    checksum: u8,
}

impl<'a> FieldReader<'a> {
    fn new(buf: &'a [u8], pos: usize, checksum: u8) -> Self {
        FieldReader { buf, pos, checksum }
    }

    fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    /// Consomme un octet et l'intègre à la somme de contrôle
    fn bump(&mut self) {
        self.checksum ^= self.buf[self.pos];
        self.pos += 1;
    }

    /// Exige une virgule de séparation
    fn comma(&mut self) -> Result<(), SentenceError> {
        match self.peek() {
            Some(b',') => {
                self.bump();
                Ok(())
            }
            _ => Err(SentenceError::ExpectedComma),
        }
    }

    /// Entier non signé glouton ; un champ vide vaut zéro
    fn integer(&mut self) -> u32 {
        self.integer_counted().0
    }

    fn integer_counted(&mut self) -> (u32, usize) {
        let mut value: u32 = 0;
        let mut digits = 0;
        while let Some(c) = self.peek() {
            if !c.is_ascii_digit() {
                break;
            }
            value = value.wrapping_mul(10).wrapping_add((c - b'0') as u32);
            self.bump();
            digits += 1;
        }
        (value, digits)
    }

    /// Partie fractionnaire à partir du point décimal ; rend aussi
    /// la présence du point. Les sept premières décimales sont conservées,
    /// les suivantes sont consommées sans contribuer à la valeur.
    fn decimal(&mut self) -> (f64, bool) {
        if self.peek() != Some(b'.') {
            return (0.0, false);
        }
        self.bump();
        let mut value: u64 = 0;
        let mut kept = 0usize;
        while let Some(c) = self.peek() {
            if !c.is_ascii_digit() {
                break;
            }
            if kept < NEGPOW_10.len() - 1 {
                value = value * 10 + (c - b'0') as u64;
                kept += 1;
            }
            self.bump();
        }
        (value as f64 * NEGPOW_10[kept], true)
    }

    /// Nombre à point fixe avec signe optionnel
    fn float(&mut self) -> Result<f64, SentenceError> {
        let negative = if self.peek() == Some(b'-') {
            self.bump();
            true
        } else {
            false
        };
        let (int_part, digits) = self.integer_counted();
        let (frac_part, had_point) = self.decimal();
        if negative && digits == 0 && !had_point {
            // Un '-' isolé n'est pas un nombre
            return Err(SentenceError::InvalidField);
        }
        let value = int_part as f64 + frac_part;
        Ok(if negative { -value } else { value })
    }

    /// Heure au format h?hmmss.?s* : découpage par arithmétique décimale
    fn hms(&mut self) -> (u8, u8, f64) {
        let mut hms = self.integer();
        let frac = self.decimal().0;
        let sec_int = hms % 100;
        hms /= 100;
        let min = (hms % 100) as u8;
        let hour = (hms / 100) as u8;
        (hour, min, sec_int as f64 + frac)
    }

    /// Coordonnée au format d?d?dmm.?m*, rendue en degrés décimaux
    fn degrees_minutes(&mut self) -> f64 {
        let dm = self.integer();
        let min_frac = self.decimal().0;
        let min_int = dm % 100;
        let deg = dm / 100;
        deg as f64 + (min_int as f64 + min_frac) / 60.0
    }

    /// Caractère littéral unique ; `None` sans avancer si le champ est vide
    /// (virgule ou astérisque en tête)
    fn single_char(&mut self) -> Option<u8> {
        match self.peek() {
            None | Some(b',') | Some(b'*') => None,
            Some(c) => {
                self.bump();
                Some(c)
            }
        }
    }

    /// Consomme le reste de la trame jusqu'à l'astérisque exclu
    fn skip_to_star(&mut self) {
        while let Some(c) = self.peek() {
            if c == b'*' {
                return;
            }
            self.bump();
        }
    }

    /// Vérifie le '*hh' final contre la somme accumulée
    fn verify_trailer(&self) -> bool {
        if self.pos + 3 > self.buf.len() {
            return false;
        }
        self.buf[self.pos] == b'*'
            && self.buf[self.pos + 1] == HEX[(self.checksum >> 4) as usize]
            && self.buf[self.pos + 2] == HEX[(self.checksum & 0x0F) as usize]
    }
}

/// Applique un indicateur d'hémisphère à une coordonnée.
/// Un champ vide laisse la valeur telle quelle.
fn apply_hemisphere(
    value: f64,
    c: Option<u8>,
    negative: u8,
    positive: u8,
) -> Result<f64, SentenceError> {
    match c {
        Some(c) if c == negative => Ok(-value),
        Some(c) if c == positive => Ok(value),
        None => Ok(value),
        Some(_) => Err(SentenceError::InvalidField),
    }
}

struct GgaFields {
    hour: u8,
    min: u8,
    sec: f64,
    lat: f64,
    lon: f64,
    fix_quality: u32,
    num_satellites: u8,
    altitude: f64,
}

fn parse_gga(r: &mut FieldReader) -> Result<GgaFields, SentenceError> {
    // hhmmss.sss,dddmm.mmmmm,[NS],dddmm.mmmmm,[EW],FIX,NSAT,HDOP,ALT,M,MSL,M,AGE,STID
    let (hour, min, sec) = r.hms();
    r.comma()?;
    let lat = r.degrees_minutes();
    r.comma()?;
    let lat = apply_hemisphere(lat, r.single_char(), b'S', b'N')?;
    r.comma()?;
    let lon = r.degrees_minutes();
    r.comma()?;
    let lon = apply_hemisphere(lon, r.single_char(), b'W', b'E')?;
    r.comma()?;
    let fix_quality = r.integer();
    r.comma()?;
    let num_satellites = r.integer() as u8;
    r.comma()?;
    let _hdop = r.float()?;
    r.comma()?;
    let altitude = r.float()?;
    r.comma()?;
    match r.single_char() {
        Some(b'M') | None => {}
        Some(_) => return Err(SentenceError::InvalidField),
    }
    r.comma()?;
    let _geoid_sep = r.float()?;
    // La suite ne nous intéresse pas
    r.skip_to_star();
    Ok(GgaFields {
        hour,
        min,
        sec,
        lat,
        lon,
        fix_quality,
        num_satellites,
        altitude,
    })
}

struct GllFields {
    hour: u8,
    min: u8,
    sec: f64,
    lat: f64,
    lon: f64,
    valid: bool,
}

fn parse_gll(r: &mut FieldReader) -> Result<GllFields, SentenceError> {
    // dddmm.mmmmm,[NS],dddmm.mmmmm,[EW],hhmmss.ss,[AV][,mode]
    let lat = r.degrees_minutes();
    r.comma()?;
    let lat = apply_hemisphere(lat, r.single_char(), b'S', b'N')?;
    r.comma()?;
    let lon = r.degrees_minutes();
    r.comma()?;
    let lon = apply_hemisphere(lon, r.single_char(), b'W', b'E')?;
    r.comma()?;
    let (hour, min, sec) = r.hms();
    r.comma()?;
    let valid = match r.single_char() {
        Some(b'A') => true,
        Some(b'V') | None => false,
        Some(_) => return Err(SentenceError::InvalidField),
    };
    // Le mode optionnel est inutilisé
    r.skip_to_star();
    Ok(GllFields {
        hour,
        min,
        sec,
        lat,
        lon,
        valid,
    })
}

struct RmcFields {
    hour: u8,
    min: u8,
    sec: f64,
    lat: f64,
    lon: f64,
    valid: bool,
}

fn parse_rmc(r: &mut FieldReader) -> Result<RmcFields, SentenceError> {
    // hhmmss.ss,[AV],ddmm.mmmmm,[NS],dddmm.mmmmm,[EW],sss.s,ddd.d,ddMMyy,[EW]
    let (hour, min, sec) = r.hms();
    r.comma()?;
    let valid = match r.single_char() {
        Some(b'A') => true,
        Some(b'V') | None => false,
        Some(_) => return Err(SentenceError::InvalidField),
    };
    r.comma()?;
    let lat = r.degrees_minutes();
    r.comma()?;
    let lat = apply_hemisphere(lat, r.single_char(), b'S', b'N')?;
    r.comma()?;
    let lon = r.degrees_minutes();
    r.comma()?;
    let lon = apply_hemisphere(lon, r.single_char(), b'W', b'E')?;
    // Vitesse, cap, date ddmmyy et variation magnétique inutilisés :
    // la date complète vient de ZDA
    r.skip_to_star();
    Ok(RmcFields {
        hour,
        min,
        sec,
        lat,
        lon,
        valid,
    })
}

struct ZdaFields {
    hour: u8,
    min: u8,
    sec: f64,
    year: u16,
    month: u8,
    day: u8,
}

fn parse_zda(r: &mut FieldReader) -> Result<ZdaFields, SentenceError> {
    // hhmmss.sss,dd,mm,yyyy,zh,zm
    let (hour, min, sec) = r.hms();
    r.comma()?;
    let day = r.integer() as u8;
    r.comma()?;
    let month = r.integer() as u8;
    r.comma()?;
    let year = r.integer() as u16;
    r.comma()?;
    // Le décalage de zone est accepté puis ignoré : on stocke l'UTC
    let _zone_hour = r.integer();
    r.comma()?;
    let _zone_min = r.integer();
    Ok(ZdaFields {
        hour,
        min,
        sec,
        year,
        month,
        day,
    })
}

/// Registre d'état du GPS, alimenté octet par octet via [`GpsStatus::feed`]
///
/// Les champs de position et les champs d'heure forment deux groupes
/// indépendants ; chaque trame ne met à jour que les groupes qu'elle porte,
/// et chaque groupe garde l'instant monotone de sa dernière mise à jour.
pub struct GpsStatus {
    position_valid: bool,
    time_valid: bool,
    lat: f64,
    lon: f64,
    alt: f64,
    sat_count: u8,
    utc_hour: u8,
    utc_min: u8,
    utc_sec: f64,
    utc_year: u16,
    utc_month: u8,
    utc_day: u8,
    buffer: [u8; BUFFER_LEN],
    cursor: usize,
    in_sentence: bool,
    last_position_update: u64,
    last_time_update: u64,
    clock: Arc<dyn MonotonicSource>,
}

impl GpsStatus {
    pub fn new(clock: Arc<dyn MonotonicSource>) -> Self {
        GpsStatus {
            position_valid: false,
            time_valid: false,
            lat: 0.0,
            lon: 0.0,
            alt: 0.0,
            sat_count: 0,
            utc_hour: 0,
            utc_min: 0,
            utc_sec: 0.0,
            utc_year: 0,
            utc_month: 0,
            utc_day: 0,
            buffer: [0; BUFFER_LEN],
            cursor: 0,
            in_sentence: false,
            last_position_update: 0,
            last_time_update: 0,
            clock,
        }
    }

    /// Donne un octet à l'analyseur ; rend `true` si cet octet termine une
    /// trame acceptée (somme de contrôle correcte, champs bien formés).
    /// L'entrée malformée est simplement abandonnée.
    pub fn feed(&mut self, byte: u8) -> bool {
        if byte == b'$' {
            // Début de trame, y compris au milieu d'une trame en cours
            self.in_sentence = true;
            self.cursor = 0;
            return false;
        }
        if !self.in_sentence {
            return false;
        }
        if byte == b'\r' || byte == b'\n' {
            self.in_sentence = false;
            if self.cursor > 0 {
                let accepted = self.parse_sentence();
                if !accepted {
                    debug!(
                        "Bad sentence: {}",
                        String::from_utf8_lossy(&self.buffer[..self.cursor])
                    );
                }
                return accepted;
            }
            return false;
        }
        if self.cursor < BUFFER_LEN - 1 {
            self.buffer[self.cursor] = byte;
            self.cursor += 1;
        } else {
            warn!("NMEA buffer overflow, sentence discarded");
            self.in_sentence = false;
        }
        false
    }

    /// Dernière position validée et âge du fix en microsecondes
    pub fn get_location(&self) -> Option<(f64, f64, f64, u64)> {
        if !self.position_valid {
            return None;
        }
        let age = self
            .clock
            .now_micros()
            .saturating_sub(self.last_position_update);
        Some((self.lat, self.lon, self.alt, age))
    }

    /// Heure UTC courante en secondes Unix et âge de la dernière trame
    /// d'heure en microsecondes. `None` tant qu'aucune date complète n'a
    /// été observée.
    pub fn get_time(&self) -> Option<(i64, u64)> {
        if !self.time_valid {
            return None;
        }
        let t = NaiveDate::from_ymd_opt(
            self.utc_year as i32,
            self.utc_month as u32,
            self.utc_day as u32,
        )?
        .and_hms_opt(
            self.utc_hour as u32,
            self.utc_min as u32,
            self.utc_sec as u32,
        )?
        .and_utc()
        .timestamp();
        let age = self
            .clock
            .now_micros()
            .saturating_sub(self.last_time_update);
        Some((t, age))
    }

    /// Nombre de satellites utilisés dans le dernier fix
    pub fn sat_count(&self) -> u8 {
        self.sat_count
    }

    #[allow(dead_code)]
    pub fn position_valid(&self) -> bool {
        self.position_valid
    }

    #[allow(dead_code)]
    pub fn time_valid(&self) -> bool {
        self.time_valid
    }

    /// La validité de l'heure se résume à : une date complète a été vue
    fn refresh_time_validity(&mut self) {
        self.time_valid = self.utc_year > 1000;
    }

    fn stamp_position(&mut self) {
        self.last_position_update = self.clock.now_micros();
    }

    fn stamp_time(&mut self) {
        self.last_time_update = self.clock.now_micros();
        self.refresh_time_validity();
    }

    /// Analyse la trame accumulée et valide tous ses champs avant tout
    /// commit dans le registre. Rend `true` si la trame est acceptée.
    fn parse_sentence(&mut self) -> bool {
        let len = self.cursor;
        // Au moins six caractères : émetteur, type, virgule
        if len < 6 {
            return false;
        }
        // Les cinq premiers caractères entrent toujours dans la somme de
        // contrôle ; seuls les trois derniers déterminent le type
        let mut checksum = 0u8;
        for &b in &self.buffer[..5] {
            checksum ^= b;
        }
        let kind = [self.buffer[2], self.buffer[3], self.buffer[4]];

        match &kind {
            b"GGA" => {
                let fields = {
                    let mut r = FieldReader::new(&self.buffer[..len], 5, checksum);
                    if r.comma().is_err() {
                        return false;
                    }
                    let fields = match parse_gga(&mut r) {
                        Ok(f) => f,
                        Err(_) => return false,
                    };
                    if !r.verify_trailer() {
                        return false;
                    }
                    fields
                };
                self.lat = fields.lat;
                self.lon = fields.lon;
                self.alt = fields.altitude;
                self.sat_count = fields.num_satellites;
                // GGA n'a pas d'indicateur A/V : la qualité du fix décide
                self.position_valid = fields.fix_quality > 0;
                self.utc_hour = fields.hour;
                self.utc_min = fields.min;
                self.utc_sec = fields.sec;
                self.stamp_position();
                self.stamp_time();
                true
            }
            b"GLL" => {
                let fields = {
                    let mut r = FieldReader::new(&self.buffer[..len], 5, checksum);
                    if r.comma().is_err() {
                        return false;
                    }
                    let fields = match parse_gll(&mut r) {
                        Ok(f) => f,
                        Err(_) => return false,
                    };
                    if !r.verify_trailer() {
                        return false;
                    }
                    fields
                };
                self.lat = fields.lat;
                self.lon = fields.lon;
                self.position_valid = fields.valid;
                self.utc_hour = fields.hour;
                self.utc_min = fields.min;
                self.utc_sec = fields.sec;
                self.stamp_position();
                self.stamp_time();
                true
            }
            b"RMC" => {
                let fields = {
                    let mut r = FieldReader::new(&self.buffer[..len], 5, checksum);
                    if r.comma().is_err() {
                        return false;
                    }
                    let fields = match parse_rmc(&mut r) {
                        Ok(f) => f,
                        Err(_) => return false,
                    };
                    if !r.verify_trailer() {
                        return false;
                    }
                    fields
                };
                self.lat = fields.lat;
                self.lon = fields.lon;
                self.position_valid = fields.valid;
                self.utc_hour = fields.hour;
                self.utc_min = fields.min;
                self.utc_sec = fields.sec;
                self.stamp_position();
                self.stamp_time();
                true
            }
            b"ZDA" => {
                let fields = {
                    let mut r = FieldReader::new(&self.buffer[..len], 5, checksum);
                    if r.comma().is_err() {
                        return false;
                    }
                    let fields = match parse_zda(&mut r) {
                        Ok(f) => f,
                        Err(_) => return false,
                    };
                    if !r.verify_trailer() {
                        return false;
                    }
                    fields
                };
                self.utc_hour = fields.hour;
                self.utc_min = fields.min;
                self.utc_sec = fields.sec;
                self.utc_year = fields.year;
                self.utc_month = fields.month;
                self.utc_day = fields.day;
                self.stamp_time();
                true
            }
            _ => {
                // Type toléré : on consomme et on vérifie quand même la
                // somme de contrôle, sans rien committer
                let mut r = FieldReader::new(&self.buffer[..len], 5, checksum);
                r.skip_to_star();
                r.verify_trailer()
            }
        }
    }
}
