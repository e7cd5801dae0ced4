//! UDP Voice-Endpunkt – Sockets, Ping-Echo und Absender-Zuordnung
//!
//! Pro konfigurierter Adresse wird ein UDP-Socket gebunden. Alle Sockets
//! werden von einem einzigen Voice-Lese-Worker ueber eine `StreamMap`
//! abgefragt.
//!
//! ## Architektur
//!
//! ```text
//! UDP Sockets (UdpFramed, StreamMap)
//!     |
//!     v
//! VoicePeerResolver                   <- Voice-Peer, sonst Remote-IP
//!     |
//!     +--> unbekannt, <= Ping-Groesse --> Echo
//!     +--> unbekannt, groesser        --> ablehnen
//!     +--> Voice deaktiviert          --> Ping: Echo, sonst ablehnen
//!     |
//!     v
//! Peer-Adresse neu binden
//!     |
//!     v
//! VoiceMixer::mischen()
//! ```

use skyrelay_core::ConnectionId;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_stream::StreamMap;
use tokio_util::codec::BytesCodec;
use tokio_util::udp::UdpFramed;

use crate::mixer::{MixOutcome, VoiceMixer};

/// Datagramme bis zu dieser Groesse gelten als Ping
pub const STANDARD_PING_GROESSE: usize = skyrelay_protocol::voice::MAX_PING_GROESSE;

/// Empfangs-Stream eines Voice-Sockets
pub type VoiceStream = UdpFramed<BytesCodec, Arc<UdpSocket>>;

// ---------------------------------------------------------------------------
// Adressauswahl
// ---------------------------------------------------------------------------

/// Filtert die Adressen, auf denen Voice-Sockets gebunden werden
///
/// Loopback-Adressen werden nur verwendet, wenn sie die einzigen sind.
/// Doppelte Eintraege werden entfernt.
pub fn bindbare_adressen(adressen: &[IpAddr]) -> Vec<IpAddr> {
    let mut ergebnis: Vec<IpAddr> = Vec::with_capacity(adressen.len());
    for addr in adressen.iter().filter(|a| !a.is_loopback()) {
        if !ergebnis.contains(addr) {
            ergebnis.push(*addr);
        }
    }
    if ergebnis.is_empty() {
        for addr in adressen {
            if !ergebnis.contains(addr) {
                ergebnis.push(*addr);
            }
        }
    }
    ergebnis
}

// ---------------------------------------------------------------------------
// VoiceSockets
// ---------------------------------------------------------------------------

/// Alle gebundenen Voice-Sockets
#[derive(Debug)]
pub struct VoiceSockets {
    sockets: Vec<Arc<UdpSocket>>,
}

impl VoiceSockets {
    /// Bindet je einen Socket pro bindbarer Adresse
    ///
    /// Schlaegt fehl, wenn keine einzige Adresse gebunden werden konnte.
    pub async fn binden(adressen: &[IpAddr], port: u16) -> io::Result<Self> {
        let mut sockets = Vec::new();
        for ip in bindbare_adressen(adressen) {
            let ziel = SocketAddr::new(ip, port);
            match UdpSocket::bind(ziel).await {
                Ok(socket) => {
                    tracing::info!(addr = %socket.local_addr()?, "UDP Voice-Socket gebunden");
                    sockets.push(Arc::new(socket));
                }
                Err(e) => {
                    tracing::warn!(addr = %ziel, fehler = %e, "Voice-Socket konnte nicht gebunden werden");
                }
            }
        }

        if sockets.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "keine Voice-Adresse bindbar",
            ));
        }
        Ok(Self { sockets })
    }

    pub fn sockets(&self) -> &[Arc<UdpSocket>] {
        &self.sockets
    }

    /// Lokale Adressen aller Sockets
    pub fn lokale_adressen(&self) -> io::Result<Vec<SocketAddr>> {
        self.sockets.iter().map(|s| s.local_addr()).collect()
    }

    /// Erstellt die Empfangs-Streams, indiziert nach Socket-Index
    pub fn empfangs_streams(&self) -> StreamMap<usize, VoiceStream> {
        let mut map = StreamMap::with_capacity(self.sockets.len());
        for (index, socket) in self.sockets.iter().enumerate() {
            map.insert(index, UdpFramed::new(Arc::clone(socket), BytesCodec::new()));
        }
        map
    }
}

// ---------------------------------------------------------------------------
// Absender-Zuordnung
// ---------------------------------------------------------------------------

/// Verbindung, der ein Datagramm zugeordnet wurde
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoicePeer {
    pub id: ConnectionId,
    pub voice_aktiv: bool,
}

/// Ordnet UDP-Absender den Control-Verbindungen zu
///
/// Wird von der Verbindungs-Registry implementiert.
pub trait VoicePeerResolver: Send + Sync {
    /// Verbindung mit exakt dieser gebundenen Voice-Adresse
    fn nach_voice_peer(&self, addr: SocketAddr) -> Option<VoicePeer>;

    /// Verbindung, deren Control-Verbindung von dieser IP kommt
    fn nach_remote_ip(&self, ip: IpAddr) -> Option<VoicePeer>;

    /// Bindet (oder aktualisiert) die Voice-Adresse einer Verbindung
    fn peer_binden(&self, id: ConnectionId, addr: SocketAddr, socket: &Arc<UdpSocket>);
}

/// Einordnung eines eingehenden Datagramms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatagramKlasse {
    /// Unveraendert an den Absender zurueckschicken
    Ping,
    /// Verwerfen
    Abgelehnt,
    /// Voice-Paket einer zugeordneten Verbindung
    Voice(ConnectionId),
}

/// Ordnet ein Datagramm ein (ohne Seiteneffekte)
pub fn klassifizieren(
    resolver: &dyn VoicePeerResolver,
    laenge: usize,
    absender: SocketAddr,
    ping_groesse: usize,
) -> DatagramKlasse {
    let ist_ping = laenge <= ping_groesse;
    let peer = resolver
        .nach_voice_peer(absender)
        .or_else(|| resolver.nach_remote_ip(absender.ip()));

    match peer {
        None if ist_ping => DatagramKlasse::Ping,
        None => DatagramKlasse::Abgelehnt,
        Some(p) if !p.voice_aktiv && ist_ping => DatagramKlasse::Ping,
        Some(p) if !p.voice_aktiv => DatagramKlasse::Abgelehnt,
        Some(p) => DatagramKlasse::Voice(p.id),
    }
}

// ---------------------------------------------------------------------------
// VoiceEndpoint
// ---------------------------------------------------------------------------

/// Ergebnis der Verarbeitung eines Datagramms
#[derive(Debug, Clone, PartialEq)]
pub enum DatagramErgebnis {
    PingBeantwortet,
    Abgelehnt,
    Gemischt(MixOutcome),
}

/// Verbindet Sockets, Absender-Zuordnung und Mixer
pub struct VoiceEndpoint {
    sockets: VoiceSockets,
    resolver: Arc<dyn VoicePeerResolver>,
    mixer: Arc<VoiceMixer>,
    ping_groesse: usize,
    abgelehnt: AtomicU64,
}

impl VoiceEndpoint {
    pub fn neu(
        sockets: VoiceSockets,
        resolver: Arc<dyn VoicePeerResolver>,
        mixer: Arc<VoiceMixer>,
        ping_groesse: usize,
    ) -> Self {
        Self {
            sockets,
            resolver,
            mixer,
            ping_groesse,
            abgelehnt: AtomicU64::new(0),
        }
    }

    pub fn sockets(&self) -> &VoiceSockets {
        &self.sockets
    }

    pub fn mixer(&self) -> &Arc<VoiceMixer> {
        &self.mixer
    }

    /// Anzahl abgelehnter Datagramme seit dem Start
    pub fn abgelehnte_datagramme(&self) -> u64 {
        self.abgelehnt.load(Ordering::Relaxed)
    }

    /// Verarbeitet ein Datagramm, das auf Socket `socket_index` ankam
    pub async fn datagramm_verarbeiten(
        &self,
        socket_index: usize,
        daten: &[u8],
        absender: SocketAddr,
    ) -> DatagramErgebnis {
        let Some(socket) = self.sockets.sockets.get(socket_index) else {
            tracing::error!(socket_index, "Unbekannter Voice-Socket");
            return DatagramErgebnis::Abgelehnt;
        };

        match klassifizieren(self.resolver.as_ref(), daten.len(), absender, self.ping_groesse) {
            DatagramKlasse::Ping => {
                if let Err(e) = socket.send_to(daten, absender).await {
                    tracing::debug!(absender = %absender, fehler = %e, "Ping-Echo fehlgeschlagen");
                }
                DatagramErgebnis::PingBeantwortet
            }
            DatagramKlasse::Abgelehnt => {
                self.abgelehnt.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(absender = %absender, bytes = daten.len(), "Datagramm abgelehnt");
                DatagramErgebnis::Abgelehnt
            }
            DatagramKlasse::Voice(id) => {
                self.resolver.peer_binden(id, absender, socket);
                DatagramErgebnis::Gemischt(self.mixer.mischen(id, daten))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mixer::{VoiceParticipant, VoiceParticipants};
    use crate::roster::{InMemoryRoster, RosterChannel, VoiceRoster};
    use bytes::Bytes;
    use parking_lot::Mutex;
    use skyrelay_core::Stats;
    use skyrelay_protocol::voice::VoicePacket;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn localhost(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    /// Eine einzige Verbindung (ID 1) mit fester Remote-IP
    struct EinPeer {
        remote_ip: IpAddr,
        voice_aktiv: bool,
        gebunden: Mutex<Option<SocketAddr>>,
        stats: Arc<Stats>,
    }

    impl EinPeer {
        fn neu(remote_ip: IpAddr, voice_aktiv: bool) -> Arc<Self> {
            Arc::new(Self {
                remote_ip,
                voice_aktiv,
                gebunden: Mutex::new(None),
                stats: Arc::new(Stats::neu()),
            })
        }

        fn peer(&self) -> VoicePeer {
            VoicePeer {
                id: ConnectionId(1),
                voice_aktiv: self.voice_aktiv,
            }
        }
    }

    impl VoicePeerResolver for EinPeer {
        fn nach_voice_peer(&self, addr: SocketAddr) -> Option<VoicePeer> {
            (*self.gebunden.lock() == Some(addr)).then(|| self.peer())
        }

        fn nach_remote_ip(&self, ip: IpAddr) -> Option<VoicePeer> {
            (self.remote_ip == ip).then(|| self.peer())
        }

        fn peer_binden(&self, _id: ConnectionId, addr: SocketAddr, _socket: &Arc<UdpSocket>) {
            *self.gebunden.lock() = Some(addr);
        }
    }

    impl VoiceParticipants for EinPeer {
        fn teilnehmer(&self, id: ConnectionId) -> Option<VoiceParticipant> {
            (id == ConnectionId(1)).then(|| VoiceParticipant {
                id,
                stumm: false,
                voice_aktiv: self.voice_aktiv,
                position: None,
                rollen: ["atc".to_string()].into_iter().collect(),
                stats: Arc::clone(&self.stats),
            })
        }

        fn zustellen(&self, _ziel: ConnectionId, _daten: Bytes) -> bool {
            true
        }
    }

    async fn endpunkt(peer: Arc<EinPeer>) -> VoiceEndpoint {
        let roster = Arc::new(InMemoryRoster::neu());
        roster.kanal_anlegen(RosterChannel::neu("TWR").mit_sprech_rolle("atc"));
        roster.beitreten(ConnectionId(1), "TWR");

        let mixer = Arc::new(VoiceMixer::neu(
            roster as Arc<dyn VoiceRoster>,
            Arc::clone(&peer) as Arc<dyn VoiceParticipants>,
            true,
        ));
        let sockets = VoiceSockets::binden(&[IpAddr::V4(Ipv4Addr::LOCALHOST)], 0)
            .await
            .expect("Loopback muss bindbar sein");
        VoiceEndpoint::neu(sockets, peer, mixer, STANDARD_PING_GROESSE)
    }

    #[test]
    fn loopback_nur_wenn_einzige_adresse() {
        let lo = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let lan = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10));
        let wan = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5));

        assert_eq!(bindbare_adressen(&[lo, lan, wan, lan]), vec![lan, wan]);
        assert_eq!(bindbare_adressen(&[lo, lo]), vec![lo]);
        assert!(bindbare_adressen(&[]).is_empty());
    }

    #[test]
    fn klassifizierung() {
        let peer = EinPeer::neu(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), true);
        let fremd = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 5000);
        let bekannt = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 5000);

        assert_eq!(klassifizieren(peer.as_ref(), 16, fremd, 47), DatagramKlasse::Ping);
        assert_eq!(klassifizieren(peer.as_ref(), 48, fremd, 47), DatagramKlasse::Abgelehnt);
        assert_eq!(
            klassifizieren(peer.as_ref(), 200, bekannt, 47),
            DatagramKlasse::Voice(ConnectionId(1))
        );

        let stumm = EinPeer::neu(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), false);
        assert_eq!(klassifizieren(stumm.as_ref(), 16, bekannt, 47), DatagramKlasse::Ping);
        assert_eq!(klassifizieren(stumm.as_ref(), 200, bekannt, 47), DatagramKlasse::Abgelehnt);
    }

    #[tokio::test]
    async fn ping_wird_unveraendert_zurueckgeschickt() {
        // Remote-IP passt nicht zu Loopback: Absender ist unbekannt
        let peer = EinPeer::neu(IpAddr::V4(Ipv4Addr::new(10, 9, 9, 9)), true);
        let ep = endpunkt(peer).await;
        let server_addr = ep.sockets().lokale_adressen().unwrap()[0];

        let client = UdpSocket::bind(localhost(0)).await.unwrap();
        let client_addr = client.local_addr().unwrap();
        let ping = [0x42u8; 16];

        let ergebnis = ep.datagramm_verarbeiten(0, &ping, client_addr).await;
        assert_eq!(ergebnis, DatagramErgebnis::PingBeantwortet);

        let mut buf = [0u8; 64];
        let (n, von) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .expect("Echo muss ankommen")
            .unwrap();
        assert_eq!(&buf[..n], &ping);
        assert_eq!(von, server_addr);
    }

    #[tokio::test]
    async fn unbekannter_grosser_absender_wird_abgelehnt() {
        let peer = EinPeer::neu(IpAddr::V4(Ipv4Addr::new(10, 9, 9, 9)), true);
        let ep = endpunkt(peer).await;
        let ergebnis = ep
            .datagramm_verarbeiten(0, &[0u8; 200], localhost(40000))
            .await;
        assert_eq!(ergebnis, DatagramErgebnis::Abgelehnt);
        assert_eq!(ep.abgelehnte_datagramme(), 1);
    }

    #[tokio::test]
    async fn voice_paket_bindet_peer_und_wird_gemischt() {
        let peer = EinPeer::neu(IpAddr::V4(Ipv4Addr::LOCALHOST), true);
        let ep = endpunkt(Arc::clone(&peer)).await;

        let bytes = VoicePacket::neu(ConnectionId(1), "TWR", 1, None, vec![9; 32]).encode();
        let ergebnis = ep.datagramm_verarbeiten(0, &bytes, localhost(41000)).await;

        assert!(matches!(ergebnis, DatagramErgebnis::Gemischt(ref m) if m.ist_verteilt()));
        assert_eq!(*peer.gebunden.lock(), Some(localhost(41000)));

        // Neuer Absender-Port: Peer wird neu gebunden
        let bytes = VoicePacket::neu(ConnectionId(1), "TWR", 2, None, vec![9; 32]).encode();
        ep.datagramm_verarbeiten(0, &bytes, localhost(41001)).await;
        assert_eq!(*peer.gebunden.lock(), Some(localhost(41001)));
    }

    #[tokio::test]
    async fn empfangs_streams_liefern_datagramme() {
        use tokio_stream::StreamExt;

        let sockets = VoiceSockets::binden(&[IpAddr::V4(Ipv4Addr::LOCALHOST)], 0)
            .await
            .unwrap();
        let ziel = sockets.lokale_adressen().unwrap()[0];
        let mut streams = sockets.empfangs_streams();

        let client = UdpSocket::bind(localhost(0)).await.unwrap();
        client.send_to(b"hallo", ziel).await.unwrap();

        let (index, ergebnis) = tokio::time::timeout(Duration::from_secs(2), streams.next())
            .await
            .unwrap()
            .unwrap();
        let (daten, von) = ergebnis.unwrap();
        assert_eq!(index, 0);
        assert_eq!(&daten[..], b"hallo");
        assert_eq!(von, client.local_addr().unwrap());
    }
}
