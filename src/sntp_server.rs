/*!
Serveur SNTP v4 pour les clients du LAN

Un socket UDP par famille d'adresses disponible, drainés sans blocage par
la boucle principale. Chaque requête de 48 octets reçoit une réponse dont
les quatre timestamps sont tirés de la discipline d'horloge : T2 est
échantillonné dès la réception, T3 juste avant l'émission.

Ni limitation de débit ni authentification : le serveur est pensé pour un
petit réseau local qui lui fait confiance.
*/

use crate::discipline::Discipline;
use crate::packet::{NtpMessage, NtpTimestamp, MODE_SERVER, NTP_VERSION};
use crate::status::{self, AppStatus};
use anyhow::Result;
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, RwLock};
use tracing::{debug, error, info, warn};

pub struct SntpServer {
    sockets: Vec<UdpSocket>,
    discipline: Arc<Discipline>,
    status: Arc<RwLock<AppStatus>>,
    log_requests: bool,
}

/// Construit la réponse pour une requête, T3 excepté : le timestamp
/// d'émission est rempli par l'appelant au plus près de l'envoi
fn build_reply(request: &NtpMessage, rx_utc_micros: u64, discipline: &Discipline) -> NtpMessage {
    NtpMessage {
        flags: NtpMessage::make_flags(0, NTP_VERSION, MODE_SERVER),
        stratum: discipline.get_stratum(),
        poll: 3,
        // 2^-6 s, à la hauteur d'une horloge logicielle disciplinée
        precision: -6,
        root_delay: 0,
        root_dispersion: 0,
        ref_id: discipline.get_reference_id(),
        // Approximation assumée : l'instant de la dernière synchronisation
        // amont n'est pas restitué
        ref_ts: NtpTimestamp::default(),
        // T1 : le timestamp d'émission du client, rendu tel quel
        orig_ts: request.tx_ts,
        rx_ts: NtpTimestamp::from_utc_micros(rx_utc_micros),
        tx_ts: NtpTimestamp::default(),
    }
}

impl SntpServer {
    /// Ouvre les sockets d'écoute, un par famille d'adresses.
    /// Échoue seulement si aucune famille n'est disponible.
    pub fn bind(
        port: u16,
        discipline: Arc<Discipline>,
        status: Arc<RwLock<AppStatus>>,
        log_requests: bool,
    ) -> Result<Self> {
        let mut sockets = Vec::new();
        for bind_addr in [format!("0.0.0.0:{}", port), format!("[::]:{}", port)] {
            match UdpSocket::bind(&bind_addr) {
                Ok(socket) => {
                    socket.set_nonblocking(true)?;
                    info!("SNTP server listening on {}", bind_addr);
                    sockets.push(socket);
                }
                Err(e) => {
                    warn!("Failed to bind SNTP server on {}: {}", bind_addr, e);
                }
            }
        }
        if sockets.is_empty() {
            anyhow::bail!(
                "No SNTP server socket could be opened (hint: port {} may require elevated privileges)",
                port
            );
        }
        Ok(SntpServer {
            sockets,
            discipline,
            status,
            log_requests,
        })
    }

    /// Adresses locales effectivement liées
    #[allow(dead_code)]
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.sockets
            .iter()
            .filter_map(|s| s.local_addr().ok())
            .collect()
    }

    /// Un passage de la boucle principale : draine les requêtes en attente
    pub fn poll(&self) {
        for socket in &self.sockets {
            loop {
                let mut buf = [0u8; 128];
                match socket.recv_from(&mut buf) {
                    Ok((len, from)) => self.handle_request(socket, &buf[..len], from),
                    Err(ref e)
                        if e.kind() == ErrorKind::WouldBlock
                            || e.kind() == ErrorKind::TimedOut =>
                    {
                        break;
                    }
                    Err(e) => {
                        error!("SNTP server socket error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    fn handle_request(&self, socket: &UdpSocket, bytes: &[u8], from: SocketAddr) {
        // T2 : échantillonné dès la réception, avant tout décodage
        let rx_utc_micros = self.discipline.get_utc_micros();

        let request = match NtpMessage::from_bytes(bytes) {
            Ok(message) => message,
            Err(e) => {
                debug!("Ignoring malformed request from {}: {}", from, e);
                return;
            }
        };
        if self.log_requests {
            debug!(
                "NTP request from {} (v{}, mode {})",
                from,
                request.version(),
                request.mode()
            );
        }

        let mut reply = build_reply(&request, rx_utc_micros, &self.discipline);
        // T3 : au plus tard possible avant l'émission
        reply.tx_ts = NtpTimestamp::from_utc_micros(self.discipline.get_utc_micros());

        if let Err(e) = socket.send_to(&reply.to_bytes(), from) {
            warn!("Failed to send NTP reply to {}: {}", from, e);
            return;
        }
        status::update_ntp(&self.status, |ntp| ntp.requests_served += 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::packet::{MODE_CLIENT, NTP_REF_GPS};
    use crate::status::StatusManager;
    use std::time::Duration;

    fn gps_discipline() -> (Arc<Discipline>, Arc<FakeClock>) {
        let clock = Arc::new(FakeClock::new(0));
        let discipline = Arc::new(Discipline::new(clock.clone()));
        discipline.set_utc(1_700_000_000_000_000, 1, NTP_REF_GPS);
        (discipline, clock)
    }

    #[test]
    fn test_build_reply_fields() {
        let (discipline, _) = gps_discipline();
        let request = NtpMessage {
            flags: NtpMessage::make_flags(0, 4, MODE_CLIENT),
            tx_ts: NtpTimestamp {
                secs: 0x1234_5678,
                frac: 0x9ABC_DEF0,
            },
            ..Default::default()
        };

        let reply = build_reply(&request, 1_700_000_000_250_000, &discipline);

        assert_eq!(reply.mode(), MODE_SERVER);
        assert_eq!(reply.version(), NTP_VERSION);
        assert_eq!(reply.stratum, 1);
        assert_eq!(reply.poll, 3);
        assert_eq!(reply.precision, -6);
        assert_eq!(reply.root_delay, 0);
        assert_eq!(reply.root_dispersion, 0);
        assert_eq!(reply.ref_id, NTP_REF_GPS);
        // ref_ts volontairement nul
        assert!(reply.ref_ts.is_zero());
        // T1 rendu tel quel
        assert_eq!(reply.orig_ts, request.tx_ts);
        assert_eq!(reply.rx_ts.to_utc_micros(), 1_700_000_000_250_000);
    }

    #[test]
    fn test_serves_request_over_loopback() {
        let (discipline, clock) = gps_discipline();
        let status = StatusManager::new();
        let server = SntpServer::bind(0, discipline, status.clone_arc(), false).unwrap();

        let v4_addr = server
            .local_addrs()
            .into_iter()
            .find(|a| a.is_ipv4())
            .expect("no IPv4 listener");

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let request = NtpMessage {
            flags: NtpMessage::make_flags(0, 4, MODE_CLIENT),
            tx_ts: NtpTimestamp { secs: 42, frac: 7 },
            ..Default::default()
        };
        client
            .send_to(
                &request.to_bytes(),
                ("127.0.0.1", v4_addr.port()),
            )
            .unwrap();

        // Laisse le datagramme arriver puis draine
        std::thread::sleep(Duration::from_millis(50));
        clock.advance(1_000);
        server.poll();

        let mut buf = [0u8; 128];
        let (len, _) = client.recv_from(&mut buf).unwrap();
        let reply = NtpMessage::from_bytes(&buf[..len]).unwrap();

        assert_eq!(reply.mode(), MODE_SERVER);
        assert_eq!(reply.stratum, 1);
        assert_eq!(reply.ref_id, NTP_REF_GPS);
        assert_eq!(reply.orig_ts, request.tx_ts);
        // T2 puis T3 suivent l'horloge disciplinée
        assert!(reply.rx_ts.to_utc_micros() >= 1_700_000_000_001_000);
        assert!(reply.tx_ts.to_utc_micros() >= reply.rx_ts.to_utc_micros());
        assert_eq!(status.get().ntp.requests_served, 1);
    }

    #[test]
    fn test_short_datagram_gets_no_reply() {
        let (discipline, _) = gps_discipline();
        let status = StatusManager::new();
        let server = SntpServer::bind(0, discipline, status.clone_arc(), false).unwrap();
        let v4_addr = server
            .local_addrs()
            .into_iter()
            .find(|a| a.is_ipv4())
            .unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        client
            .send_to(&[0u8; 12], ("127.0.0.1", v4_addr.port()))
            .unwrap();

        std::thread::sleep(Duration::from_millis(50));
        server.poll();

        let mut buf = [0u8; 128];
        assert!(client.recv_from(&mut buf).is_err());
        assert_eq!(status.get().ntp.requests_served, 0);
    }
}
