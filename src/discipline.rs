/*!
Discipline de l'horloge UTC de l'appareil

Le moteur ne détient pas l'heure directement : il mémorise l'écart entre le
compteur monotone et l'UTC (`boot_to_utc_micros`). Lire l'heure revient à
ajouter cet écart au compteur courant, corriger l'heure revient à déplacer
l'écart. Deux sources écrivent ici : l'impulsion PPS du GPS et le client
SNTP. Aucune n'a priorité, la dernière écriture gagne.

Chaque champ est de taille mot et écrit indépendamment ; un lecteur peut
observer un triplet (heure, stratum, référence) momentanément mélangé.
*/

use crate::clock::MonotonicSource;
use crate::packet::NTP_REF_GPS;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Stratum affiché tant qu'aucune synchronisation n'a eu lieu
pub const STRATUM_UNSYNCHRONIZED: u8 = 16;

pub struct Discipline {
    clock: Arc<dyn MonotonicSource>,
    /// Compteur monotone + cette valeur = microsecondes depuis l'epoch Unix.
    /// Arithmétique en complément à deux pour accepter des offsets négatifs.
    boot_to_utc_micros: AtomicU64,
    stratum: AtomicU8,
    reference_id: AtomicU32,
    /// Instant monotone de la dernière correction acceptée
    last_sync: AtomicU64,
}

impl Discipline {
    pub fn new(clock: Arc<dyn MonotonicSource>) -> Self {
        Discipline {
            clock,
            boot_to_utc_micros: AtomicU64::new(0),
            stratum: AtomicU8::new(STRATUM_UNSYNCHRONIZED),
            reference_id: AtomicU32::new(0),
            last_sync: AtomicU64::new(0),
        }
    }

    /// Heure UTC courante en microsecondes depuis l'epoch Unix
    pub fn get_utc_micros(&self) -> u64 {
        self.clock
            .now_micros()
            .wrapping_add(self.boot_to_utc_micros.load(Ordering::Relaxed))
    }

    pub fn get_stratum(&self) -> u8 {
        self.stratum.load(Ordering::Relaxed)
    }

    pub fn get_reference_id(&self) -> u32 {
        self.reference_id.load(Ordering::Relaxed)
    }

    pub fn get_last_sync_monotonic(&self) -> u64 {
        self.last_sync.load(Ordering::Relaxed)
    }

    /// `true` dès qu'une correction a été acceptée depuis le démarrage
    pub fn is_synchronized(&self) -> bool {
        self.get_stratum() != STRATUM_UNSYNCHRONIZED
    }

    /// Mise à jour absolue de l'heure UTC
    pub fn set_utc(&self, utc_micros: u64, stratum: u8, reference_id: u32) {
        let now = self.clock.now_micros();
        self.boot_to_utc_micros
            .store(utc_micros.wrapping_sub(now), Ordering::Relaxed);
        self.stratum.store(stratum, Ordering::Relaxed);
        self.reference_id.store(reference_id, Ordering::Relaxed);
        self.last_sync.store(now, Ordering::Relaxed);
        debug!(
            "Clock set: utc={}us stratum={} ref={:#010x}",
            utc_micros, stratum, reference_id
        );
    }

    /// Correction additive de l'heure UTC
    pub fn apply_offset(&self, delta_micros: i64, stratum: u8, reference_id: u32) {
        self.boot_to_utc_micros
            .fetch_add(delta_micros as u64, Ordering::Relaxed);
        self.stratum.store(stratum, Ordering::Relaxed);
        self.reference_id.store(reference_id, Ordering::Relaxed);
        self.last_sync
            .store(self.clock.now_micros(), Ordering::Relaxed);
        debug!(
            "Clock slewed: offset={}us stratum={} ref={:#010x}",
            delta_micros, stratum, reference_id
        );
    }

    /// Point d'entrée étroit pour le front PPS.
    ///
    /// `fix` est la sortie de l'analyseur NMEA : heure Unix et âge de la
    /// dernière trame d'heure. L'impulsion n'est retenue que si l'analyseur
    /// détient une heure valide et que cette heure date de moins de
    /// `staleness_limit_micros`. Rend `true` si l'horloge a été corrigée.
    pub fn pps_sync(&self, fix: Option<(i64, u64)>, staleness_limit_micros: u64) -> bool {
        let (unix_time, fix_age) = match fix {
            Some(fix) => fix,
            None => return false,
        };
        if fix_age > staleness_limit_micros {
            debug!("PPS rejected: time sentence is {}us old", fix_age);
            return false;
        }
        let was_unsynchronized = !self.is_synchronized();
        self.set_utc((unix_time as u64) * 1_000_000, 1, NTP_REF_GPS);
        if was_unsynchronized {
            info!("Clock now disciplined by GPS (stratum 1)");
        }
        true
    }
}
