/*!
Client SNTP v4 amont

Une transaction à la fois, cadencée par la boucle principale. Le cycle de
vie complet d'une requête se lit dans [`SntpClient::handle_event`] : chaque
transition est déclenchée par un évènement (tick périodique, résultat DNS,
datagramme reçu) livré sur une file à consommateur unique, au lieu d'une
chaîne de rappels imbriqués.

Toutes les voies d'échec ramènent la machine à l'état repos ; le tick
suivant est libre de retenter.
*/

use crate::clock::MonotonicSource;
use crate::config::NtpConfig;
use crate::discipline::Discipline;
use crate::packet::{
    self, NtpMessage, NtpTimestamp, MODE_CLIENT, MODE_SERVER,
};
use crate::status::{self, AppStatus};
use anyhow::{Context, Result};
use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, RwLock};
use std::thread;
use tracing::{debug, error, info, warn};

/// Seuil en double-secondes au-delà duquel l'offset est trop grand pour un
/// rattrapage progressif : on bascule en resynchronisation absolue
const OFFSET_EPSILON2: i64 = 2;

/// Évènements qui font avancer la machine à états
enum ClientEvent {
    /// Passage de la boucle principale
    Tick,
    /// Le résolveur a rendu son verdict pour la transaction `generation`
    DnsDone {
        generation: u64,
        result: Result<SocketAddr, String>,
    },
    /// Un datagramme est arrivé sur le socket de la transaction en cours.
    /// `destination` est l'heure UTC échantillonnée au plus près de la
    /// réception (le « destination timestamp » de la RFC 5905).
    Datagram {
        from: SocketAddr,
        bytes: Vec<u8>,
        destination: NtpTimestamp,
    },
}

enum Phase {
    Idle,
    Resolving,
    AwaitingReply { socket: UdpSocket, server: SocketAddr },
}

pub struct SntpClient {
    config: NtpConfig,
    clock: Arc<dyn MonotonicSource>,
    discipline: Arc<Discipline>,
    status: Arc<RwLock<AppStatus>>,
    phase: Phase,
    /// Instant monotone au-delà duquel la requête en vol est perdue
    deadline: u64,
    /// Numéro de transaction, pour écarter les résultats DNS tardifs
    generation: u64,
    events_tx: Sender<ClientEvent>,
    events_rx: Receiver<ClientEvent>,
}

/// Ajoute le port NTP implicite si l'hôte configuré n'en porte pas
fn server_endpoint(server: &str) -> String {
    if server.contains(':') {
        server.to_string()
    } else {
        format!("{}:123", server)
    }
}

/// Contrôles de cohérence d'une réponse décodée
fn response_sanity(incoming: &NtpMessage, min_version: u8) -> bool {
    incoming.stratum != 0 && incoming.mode() == MODE_SERVER && incoming.version() >= min_version
}

/// Calcul d'offset RFC 5905 et application à la discipline.
///
/// `incoming` doit être en ordre hôte, son `ref_ts` remplacé par l'heure de
/// réception locale. Tout reste en arithmétique entière : les sommes sont
/// deux fois l'offset, la division est différée.
fn apply_correction(discipline: &Discipline, incoming: &NtpMessage, reference_id: u32) {
    let t1 = incoming.orig_ts;
    let t2 = incoming.rx_ts;
    let t3 = incoming.tx_ts;
    let t4 = incoming.ref_ts;

    let soffset2 = (t2.secs as i64 - t1.secs as i64) + (t3.secs as i64 - t4.secs as i64);
    if soffset2.abs() > OFFSET_EPSILON2 {
        // Écart supérieur à la seconde : on adopte l'heure du serveur
        info!("Large offset, assuming initial synchronization");
        discipline.set_utc(t3.to_utc_micros(), incoming.stratum, reference_id);
    } else {
        let foffset2 = (t2.frac as i64 - t1.frac as i64) + (t3.frac as i64 - t4.frac as i64);
        // Facteur 10^6·2^-32 = 5^6·2^-26 ; le décalage supplémentaire
        // replie le facteur deux des sommes
        let mut offset_micros = (foffset2 * 15625) >> 27;
        offset_micros += soffset2 * 500_000;
        discipline.apply_offset(offset_micros, incoming.stratum, reference_id);
    }
}

impl SntpClient {
    pub fn new(
        config: NtpConfig,
        clock: Arc<dyn MonotonicSource>,
        discipline: Arc<Discipline>,
        status: Arc<RwLock<AppStatus>>,
    ) -> Self {
        let (events_tx, events_rx) = channel();
        SntpClient {
            config,
            clock,
            discipline,
            status,
            phase: Phase::Idle,
            deadline: 0,
            generation: 0,
            events_tx,
            events_rx,
        }
    }

    /// Un passage de la boucle principale : collecte les évènements en
    /// attente puis les fait traverser la machine à états
    pub fn run(&mut self) {
        let mut events = vec![ClientEvent::Tick];
        while let Ok(event) = self.events_rx.try_recv() {
            events.push(event);
        }
        if let Phase::AwaitingReply { socket, .. } = &self.phase {
            let mut buf = [0u8; 128];
            match socket.recv_from(&mut buf) {
                Ok((len, from)) => {
                    let destination =
                        NtpTimestamp::from_utc_micros(self.discipline.get_utc_micros());
                    events.push(ClientEvent::Datagram {
                        from,
                        bytes: buf[..len].to_vec(),
                        destination,
                    });
                }
                Err(ref e)
                    if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {}
                Err(e) => {
                    warn!("NTP socket recv error: {}", e);
                }
            }
        }
        for event in events {
            self.handle_event(event);
        }
    }

    fn handle_event(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::Tick => self.on_tick(),
            ClientEvent::DnsDone { generation, result } => self.on_dns_done(generation, result),
            ClientEvent::Datagram {
                from,
                bytes,
                destination,
            } => self.on_datagram(from, bytes, destination),
        }
    }

    fn on_tick(&mut self) {
        let now = self.clock.now_micros();

        // Requête en vol périmée ?
        if !matches!(self.phase, Phase::Idle) && now > self.deadline {
            warn!("NTP request timed out");
            status::update_ntp(&self.status, |ntp| ntp.client_timeouts += 1);
            self.close();
        }

        // Pas encore l'heure de resynchroniser : les corrections GPS
        // renouvellent aussi `last_sync`, donc un PPS récent repousse la
        // prochaine requête SNTP
        if self.discipline.is_synchronized() {
            let since_sync = now.saturating_sub(self.discipline.get_last_sync_monotonic());
            if since_sync < self.config.poll_interval_secs * 1_000_000 {
                return;
            }
        }

        if !matches!(self.phase, Phase::Idle) {
            // Le dépassement de délai est déjà traité plus haut
            return;
        }

        // Lancement d'une transaction : délai armé avant toute E/S
        self.deadline = now + self.config.udp_timeout_secs * 1_000_000;
        self.generation += 1;
        self.phase = Phase::Resolving;

        let endpoint = server_endpoint(&self.config.server);
        let generation = self.generation;
        let events_tx = self.events_tx.clone();
        thread::spawn(move || {
            let result = match endpoint.to_socket_addrs() {
                Ok(mut addrs) => addrs
                    .next()
                    .ok_or_else(|| format!("no address for {}", endpoint)),
                Err(e) => Err(e.to_string()),
            };
            // La boucle principale peut être partie entre-temps
            let _ = events_tx.send(ClientEvent::DnsDone { generation, result });
        });
    }

    fn on_dns_done(&mut self, generation: u64, result: Result<SocketAddr, String>) {
        if generation != self.generation || !matches!(self.phase, Phase::Resolving) {
            debug!("Ignoring stale DNS result");
            return;
        }
        match result {
            Err(e) => {
                error!("NTP DNS request failed: {}", e);
                self.close();
            }
            Ok(server) => {
                debug!("NTP server address: {}", server);
                match self.open_and_send(server) {
                    Ok(socket) => {
                        self.phase = Phase::AwaitingReply { socket, server };
                    }
                    Err(e) => {
                        error!("Failed to send NTP request: {:#}", e);
                        self.close();
                    }
                }
            }
        }
    }

    /// Ouvre un socket neuf pour cette transaction et émet la requête
    fn open_and_send(&self, server: SocketAddr) -> Result<UdpSocket> {
        let bind_addr = if server.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        let socket = UdpSocket::bind(bind_addr).context("Failed to open UDP endpoint")?;
        socket
            .set_nonblocking(true)
            .context("Failed to set socket non-blocking")?;

        let mut request = NtpMessage {
            flags: NtpMessage::make_flags(0, self.config.version, MODE_CLIENT),
            ..Default::default()
        };
        // tx_ts rempli au plus près de l'émission ; laissé à zéro tant que
        // l'horloge n'a jamais été disciplinée
        if self.discipline.is_synchronized() {
            request.tx_ts = NtpTimestamp::from_utc_micros(self.discipline.get_utc_micros());
        }
        socket
            .send_to(&request.to_bytes(), server)
            .context("Failed to send NTP request")?;
        Ok(socket)
    }

    fn on_datagram(&mut self, from: SocketAddr, bytes: Vec<u8>, destination: NtpTimestamp) {
        let server = match &self.phase {
            Phase::AwaitingReply { server, .. } => *server,
            _ => return,
        };
        // Quelle que soit l'issue, la transaction se termine ici
        let accepted = self.process_response(server, from, &bytes, destination);
        if accepted {
            status::update_ntp(&self.status, |ntp| ntp.client_syncs += 1);
        }
        self.close();
    }

    fn process_response(
        &self,
        server: SocketAddr,
        from: SocketAddr,
        bytes: &[u8],
        destination: NtpTimestamp,
    ) -> bool {
        if from != server {
            warn!("NTP response from unexpected source {}", from);
            return false;
        }
        let mut incoming = match NtpMessage::from_bytes(bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!("Malformed NTP response: {}", e);
                return false;
            }
        };
        // ref_ts ne sert à rien dans une réponse : il reçoit l'heure de
        // réception locale pour le calcul d'offset
        incoming.ref_ts = destination;
        if !response_sanity(&incoming, self.config.min_version) {
            warn!("Invalid or unsupported NTP response");
            return false;
        }
        let reference_id = packet::reference_id_for(&from.ip());
        apply_correction(&self.discipline, &incoming, reference_id);
        true
    }

    /// Ramène la machine à l'état repos ; le socket en vol est fermé par
    /// abandon et les résultats DNS tardifs seront écartés
    fn close(&mut self) {
        self.phase = Phase::Idle;
        self.generation += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::packet::{micros_to_fraction, NTP_DELTA};
    use crate::status::StatusManager;
    use std::time::Duration;

    fn test_config(server: &str) -> NtpConfig {
        NtpConfig {
            server: server.to_string(),
            poll_interval_secs: 120,
            udp_timeout_secs: 5,
            version: 4,
            min_version: 3,
        }
    }

    fn synced_discipline() -> (Arc<Discipline>, Arc<FakeClock>) {
        let clock = Arc::new(FakeClock::new(0));
        let discipline = Arc::new(Discipline::new(clock.clone()));
        (discipline, clock)
    }

    #[test]
    fn test_server_endpoint_default_port() {
        assert_eq!(server_endpoint("pool.ntp.org"), "pool.ntp.org:123");
        assert_eq!(server_endpoint("127.0.0.1:1234"), "127.0.0.1:1234");
    }

    #[test]
    fn test_response_sanity() {
        let mut msg = NtpMessage {
            flags: NtpMessage::make_flags(0, 4, MODE_SERVER),
            stratum: 2,
            ..Default::default()
        };
        assert!(response_sanity(&msg, 3));

        // Kiss-o'-death
        msg.stratum = 0;
        assert!(!response_sanity(&msg, 3));
        msg.stratum = 2;

        // Mauvais mode
        msg.flags = NtpMessage::make_flags(0, 4, MODE_CLIENT);
        assert!(!response_sanity(&msg, 3));

        // Version trop vieille, puis juste assez récente
        msg.flags = NtpMessage::make_flags(0, 2, MODE_SERVER);
        assert!(!response_sanity(&msg, 3));
        msg.flags = NtpMessage::make_flags(0, 3, MODE_SERVER);
        assert!(response_sanity(&msg, 3));
    }

    #[test]
    fn test_correction_initial_sync_branch() {
        let (discipline, clock) = synced_discipline();
        clock.set(1_000_000);

        // Le serveur est deux secondes en avance : soffset2 = 4
        let base = NTP_DELTA as u32 + 1_700_000_000;
        let incoming = NtpMessage {
            flags: NtpMessage::make_flags(0, 4, MODE_SERVER),
            stratum: 2,
            orig_ts: NtpTimestamp { secs: base, frac: 0 },
            rx_ts: NtpTimestamp {
                secs: base + 2,
                frac: 0,
            },
            tx_ts: NtpTimestamp {
                secs: base + 2,
                frac: 0,
            },
            ref_ts: NtpTimestamp { secs: base, frac: 0 },
            ..Default::default()
        };
        apply_correction(&discipline, &incoming, 0x7F00_0001);

        // L'heure du serveur est adoptée telle quelle
        assert_eq!(
            discipline.get_utc_micros(),
            (1_700_000_000u64 + 2) * 1_000_000
        );
        assert_eq!(discipline.get_stratum(), 2);
        assert_eq!(discipline.get_reference_id(), 0x7F00_0001);
    }

    #[test]
    fn test_correction_slew_branch() {
        let (discipline, clock) = synced_discipline();
        clock.set(1_000_000);
        discipline.set_utc(1_700_000_000_000_000, 2, 0x7F00_0001);
        let before = discipline.get_utc_micros();

        // Secondes alignées, fractions décalées de +37 ms des deux côtés
        let base = NTP_DELTA as u32 + 1_700_000_000;
        let frac = micros_to_fraction(37_000);
        let incoming = NtpMessage {
            flags: NtpMessage::make_flags(0, 4, MODE_SERVER),
            stratum: 3,
            orig_ts: NtpTimestamp { secs: base, frac: 0 },
            rx_ts: NtpTimestamp { secs: base, frac },
            tx_ts: NtpTimestamp { secs: base, frac },
            ref_ts: NtpTimestamp { secs: base, frac: 0 },
            ..Default::default()
        };
        apply_correction(&discipline, &incoming, 0x7F00_0001);

        let advanced = discipline.get_utc_micros() as i64 - before as i64;
        assert!((advanced - 37_000).abs() <= 2, "advanced {}us", advanced);
        assert_eq!(discipline.get_stratum(), 3);
    }

    #[test]
    fn test_correction_slew_negative_half_second() {
        let (discipline, clock) = synced_discipline();
        clock.set(1_000_000);
        discipline.set_utc(1_700_000_000_000_000, 2, 1);
        let before = discipline.get_utc_micros();

        // Le serveur est une seconde en retard : soffset2 = -2, fractions nulles
        let base = NTP_DELTA as u32 + 1_700_000_000;
        let incoming = NtpMessage {
            flags: NtpMessage::make_flags(0, 4, MODE_SERVER),
            stratum: 2,
            orig_ts: NtpTimestamp { secs: base, frac: 0 },
            rx_ts: NtpTimestamp {
                secs: base - 1,
                frac: 0,
            },
            tx_ts: NtpTimestamp {
                secs: base - 1,
                frac: 0,
            },
            ref_ts: NtpTimestamp { secs: base, frac: 0 },
            ..Default::default()
        };
        apply_correction(&discipline, &incoming, 1);

        let moved = discipline.get_utc_micros() as i64 - before as i64;
        assert_eq!(moved, -1_000_000);
    }

    #[test]
    fn test_timeout_clears_in_flight_request() {
        let (discipline, clock) = synced_discipline();
        let status = StatusManager::new();
        let mut client = SntpClient::new(
            test_config("127.0.0.1:1"),
            clock.clone(),
            discipline,
            status.clone_arc(),
        );

        // Premier passage : la transaction démarre (résolution)
        client.run();
        assert!(!matches!(client.phase, Phase::Idle));

        // Le délai expire, la machine revient au repos
        clock.advance(6_000_000);
        client.run();
        assert_eq!(status.get().ntp.client_timeouts, 1);
    }

    #[test]
    fn test_poll_interval_suppressed_by_recent_sync() {
        let (discipline, clock) = synced_discipline();
        clock.set(1_000_000);
        // Une synchronisation GPS vient d'avoir lieu
        discipline.set_utc(1_700_000_000_000_000, 1, crate::packet::NTP_REF_GPS);

        let status = StatusManager::new();
        let mut client = SntpClient::new(
            test_config("127.0.0.1:1"),
            clock.clone(),
            discipline,
            status.clone_arc(),
        );
        client.run();
        // Pas de transaction lancée : la dernière synchro est trop récente
        assert!(matches!(client.phase, Phase::Idle));
    }

    #[test]
    fn test_full_transaction_against_loopback_server() {
        // Faux serveur SNTP sur l'hôte local
        let server_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let server_addr = server_socket.local_addr().unwrap();
        server_socket
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let server_thread = std::thread::spawn(move || {
            let mut buf = [0u8; 128];
            let (len, from) = server_socket.recv_from(&mut buf).unwrap();
            let request = NtpMessage::from_bytes(&buf[..len]).unwrap();
            assert_eq!(request.mode(), MODE_CLIENT);
            assert_eq!(request.version(), 4);

            let when = NtpTimestamp::from_utc_micros(1_700_000_000_000_000);
            let reply = NtpMessage {
                flags: NtpMessage::make_flags(0, 4, MODE_SERVER),
                stratum: 2,
                orig_ts: request.tx_ts,
                rx_ts: when,
                tx_ts: when,
                ..Default::default()
            };
            server_socket.send_to(&reply.to_bytes(), from).unwrap();
        });

        let (discipline, clock) = synced_discipline();
        let status = StatusManager::new();
        let config = test_config(&format!("127.0.0.1:{}", server_addr.port()));
        let mut client = SntpClient::new(config, clock, discipline.clone(), status.clone_arc());

        // La boucle principale en accéléré : résolution, émission, réception
        for _ in 0..500 {
            client.run();
            if discipline.is_synchronized() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        server_thread.join().unwrap();

        // Écart énorme par rapport à une horloge jamais disciplinée :
        // l'heure du serveur est adoptée telle quelle
        assert!(discipline.is_synchronized());
        assert_eq!(discipline.get_utc_micros(), 1_700_000_000_000_000);
        assert_eq!(discipline.get_stratum(), 2);
        assert_eq!(discipline.get_reference_id(), 0x7F00_0001);
        assert_eq!(status.get().ntp.client_syncs, 1);
        assert!(matches!(client.phase, Phase::Idle));
    }
}
