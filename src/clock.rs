use std::time::Instant;

/// Source de temps monotone en microsecondes
///
/// Toute la discipline d'horloge est exprimée par rapport à ce compteur :
/// il démarre près de zéro au boot, ne recule jamais et ne subit aucun saut
/// quand l'heure UTC est corrigée.
pub trait MonotonicSource: Send + Sync {
    /// Microsecondes écoulées depuis le démarrage
    fn now_micros(&self) -> u64;
}

/// Horloge monotone ancrée au lancement du processus
pub struct BootClock {
    origin: Instant,
}

impl BootClock {
    pub fn new() -> Self {
        BootClock {
            origin: Instant::now(),
        }
    }
}

impl Default for BootClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicSource for BootClock {
    fn now_micros(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

/// Horloge factice pour les tests : n'avance que sur demande
#[cfg(test)]
pub struct FakeClock(std::sync::atomic::AtomicU64);

#[cfg(test)]
impl FakeClock {
    pub fn new(start_micros: u64) -> Self {
        FakeClock(std::sync::atomic::AtomicU64::new(start_micros))
    }

    pub fn advance(&self, micros: u64) {
        self.0.fetch_add(micros, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn set(&self, micros: u64) {
        self.0.store(micros, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
impl MonotonicSource for FakeClock {
    fn now_micros(&self) -> u64 {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boot_clock_monotonic() {
        let clock = BootClock::new();
        let t1 = clock.now_micros();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let t2 = clock.now_micros();

        // Le compteur ne recule jamais
        assert!(t2 > t1);
    }

    #[test]
    fn test_fake_clock() {
        let clock = FakeClock::new(1_000);
        assert_eq!(clock.now_micros(), 1_000);
        clock.advance(500);
        assert_eq!(clock.now_micros(), 1_500);
        clock.set(10);
        assert_eq!(clock.now_micros(), 10);
    }
}
