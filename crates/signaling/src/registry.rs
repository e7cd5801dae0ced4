//! Verbindungs-Registry – alle aktiven Verbindungen eines Servers
//!
//! Die Registry besitzt die `Arc<Connection>`-Eintraege (DashMap nach ID),
//! meldet Lesehaelften beim Multiplexer an und ab und raeumt untaetige
//! Verbindungen auf. Suchen nach Adresse oder Identitaet sind lineare Scans.
//!
//! Sie implementiert ausserdem die Sicht des Voice-Pfads auf Verbindungen
//! ([`VoicePeerResolver`], [`VoiceParticipants`]).

use bytes::Bytes;
use dashmap::DashMap;
use skyrelay_core::{ConnectionId, ConnectionIdGenerator};
use skyrelay_voice::{VoiceParticipant, VoiceParticipants, VoicePeer, VoicePeerResolver};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::UdpSocket;
use tokio::time::Instant;

use crate::connection::Connection;
use crate::error::{SignalingError, SignalingResult};
use crate::multiplexer::MultiplexerHandle;

// ---------------------------------------------------------------------------
// Konfiguration
// ---------------------------------------------------------------------------

/// Grenzen und Zeitlimits der Registry
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub max_verbindungen: usize,
    /// Idle-Zeitlimit fuer nicht authentifizierte Verbindungen
    pub anonym_timeout: Duration,
    /// Idle-Zeitlimit fuer authentifizierte Verbindungen
    pub authentifiziert_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_verbindungen: 1024,
            anonym_timeout: Duration::from_secs(45),
            authentifiziert_timeout: Duration::from_secs(1800),
        }
    }
}

// ---------------------------------------------------------------------------
// ConnectionRegistry
// ---------------------------------------------------------------------------

/// Registry aller aktiven Verbindungen (thread-safe, Arc-geteilt)
pub struct ConnectionRegistry<R = OwnedReadHalf> {
    verbindungen: DashMap<ConnectionId, Arc<Connection>>,
    ids: ConnectionIdGenerator,
    mux: MultiplexerHandle<R>,
    config: RegistryConfig,
}

impl<R: Send + 'static> ConnectionRegistry<R> {
    pub fn neu(config: RegistryConfig, mux: MultiplexerHandle<R>) -> Self {
        Self {
            verbindungen: DashMap::new(),
            ids: ConnectionIdGenerator::neu(),
            mux,
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Vergibt die naechste eindeutige Verbindungs-ID
    pub fn naechste_id(&self) -> ConnectionId {
        self.ids.naechste()
    }

    /// Nimmt eine Verbindung auf und meldet ihre Lesehaelfte an
    ///
    /// # Fehler
    /// - [`SignalingError::Kapazitaet`] wenn die Maximalzahl erreicht ist
    /// - [`SignalingError::Doppelt`] wenn die ID bereits vergeben ist
    /// - [`SignalingError::Shutdown`] wenn der Multiplexer nicht mehr laeuft
    pub fn add(&self, verbindung: Arc<Connection>, reader: R) -> SignalingResult<()> {
        let id = verbindung.id();
        if self.verbindungen.len() >= self.config.max_verbindungen {
            return Err(SignalingError::Kapazitaet(self.config.max_verbindungen));
        }

        match self.verbindungen.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => return Err(SignalingError::Doppelt(id)),
            dashmap::mapref::entry::Entry::Vacant(eintrag) => {
                eintrag.insert(Arc::clone(&verbindung));
            }
        }

        if !self.mux.registrieren(id, reader, Arc::clone(verbindung.stats())) {
            self.verbindungen.remove(&id);
            return Err(SignalingError::Shutdown);
        }

        tracing::debug!(conn = %id, peer = %verbindung.remote_addr(), "Verbindung registriert");
        Ok(())
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.verbindungen.get(&id).map(|v| Arc::clone(v.value()))
    }

    /// Sucht nach exakter Remote-Adresse der Control-Verbindung
    pub fn get_by_address(&self, addr: SocketAddr) -> Option<Arc<Connection>> {
        self.verbindungen
            .iter()
            .find(|v| v.remote_addr() == addr)
            .map(|v| Arc::clone(v.value()))
    }

    /// Sucht nach authentifiziertem Benutzernamen
    pub fn get_by_identity(&self, benutzer: &str) -> Option<Arc<Connection>> {
        self.verbindungen
            .iter()
            .find(|v| v.ist_benutzer(benutzer))
            .map(|v| Arc::clone(v.value()))
    }

    /// Entfernt eine Verbindung und meldet ihre Lesehaelfte ab
    ///
    /// Schliesst die Verbindung nicht; das ist Sache des Aufrufers.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let (_, verbindung) = self.verbindungen.remove(&id)?;
        self.mux.abmelden(id);
        tracing::debug!(conn = %id, "Verbindung entfernt");
        Some(verbindung)
    }

    pub fn len(&self) -> usize {
        self.verbindungen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.verbindungen.is_empty()
    }

    /// Momentaufnahme aller Verbindungen
    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.verbindungen
            .iter()
            .map(|v| Arc::clone(v.value()))
            .collect()
    }

    /// Sendet eine Textnachricht an eine Verbindung
    pub fn senden(&self, id: ConnectionId, text: &str, kritisch: bool) -> SignalingResult<()> {
        let verbindung = self.get(id).ok_or(SignalingError::NichtGefunden(id))?;
        verbindung.senden(text, kritisch)
    }

    /// Schliesst und entfernt alle Verbindungen, die zu lange untaetig waren
    ///
    /// Gibt die entfernten Verbindungen zurueck.
    pub fn check_idle(&self, jetzt: Instant) -> Vec<Arc<Connection>> {
        let abgelaufen: Vec<ConnectionId> = self
            .verbindungen
            .iter()
            .filter(|v| {
                let limit = if v.ist_authentifiziert() {
                    self.config.authentifiziert_timeout
                } else {
                    self.config.anonym_timeout
                };
                v.idle_seit(jetzt) > limit
            })
            .map(|v| *v.key())
            .collect();

        let mut entfernt = Vec::with_capacity(abgelaufen.len());
        for id in abgelaufen {
            if let Some(verbindung) = self.remove(id) {
                tracing::info!(
                    conn = %id,
                    peer = %verbindung.remote_addr(),
                    authentifiziert = verbindung.ist_authentifiziert(),
                    "Untaetige Verbindung getrennt"
                );
                verbindung.schliessen();
                entfernt.push(verbindung);
            }
        }
        entfernt
    }

    /// Schliesst und entfernt alle Verbindungen (Shutdown)
    pub fn alle_schliessen(&self) -> usize {
        let ids: Vec<ConnectionId> = self.verbindungen.iter().map(|v| *v.key()).collect();
        let anzahl = ids.len();
        for id in ids {
            if let Some(verbindung) = self.remove(id) {
                verbindung.schliessen();
            }
        }
        anzahl
    }
}

// ---------------------------------------------------------------------------
// Voice-Sicht
// ---------------------------------------------------------------------------

fn voice_peer(verbindung: &Connection) -> VoicePeer {
    VoicePeer {
        id: verbindung.id(),
        voice_aktiv: verbindung.voice_aktiv(),
    }
}

impl<R: Send + 'static> VoicePeerResolver for ConnectionRegistry<R> {
    fn nach_voice_peer(&self, addr: SocketAddr) -> Option<VoicePeer> {
        self.verbindungen
            .iter()
            .find(|v| v.voice_peer() == Some(addr))
            .map(|v| voice_peer(&v))
    }

    fn nach_remote_ip(&self, ip: IpAddr) -> Option<VoicePeer> {
        self.verbindungen
            .iter()
            .find(|v| v.remote_addr().ip() == ip)
            .map(|v| voice_peer(&v))
    }

    fn peer_binden(&self, id: ConnectionId, addr: SocketAddr, socket: &Arc<UdpSocket>) {
        if let Some(verbindung) = self.get(id) {
            verbindung.voice_binden(addr, socket);
        }
    }
}

impl<R: Send + 'static> VoiceParticipants for ConnectionRegistry<R> {
    fn teilnehmer(&self, id: ConnectionId) -> Option<VoiceParticipant> {
        self.get(id).map(|v| v.voice_teilnehmer())
    }

    fn zustellen(&self, ziel: ConnectionId, daten: Bytes) -> bool {
        self.get(ziel).is_some_and(|v| v.voice_senden(daten))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::test_verbindung;
    use crate::connection::Identity;
    use crate::multiplexer::ReadinessMultiplexer;
    use tokio::io::DuplexStream;

    type TestRegistry = ConnectionRegistry<DuplexStream>;

    fn registry(config: RegistryConfig) -> (TestRegistry, ReadinessMultiplexer<DuplexStream>) {
        let (mux, handle) = ReadinessMultiplexer::neu(0);
        (ConnectionRegistry::neu(config, handle), mux)
    }

    fn lesehaelfte() -> DuplexStream {
        tokio::io::duplex(64).0
    }

    #[tokio::test]
    async fn hinzufuegen_und_suchen() {
        let (reg, _mux) = registry(RegistryConfig::default());
        let (a, _ca) = test_verbindung(1, "10.0.0.1:5000");
        let (b, _cb) = test_verbindung(2, "10.0.0.2:5000");

        reg.add(Arc::clone(&a), lesehaelfte()).unwrap();
        reg.add(Arc::clone(&b), lesehaelfte()).unwrap();
        b.authentifizieren(Identity::neu("EDDF_TWR", ["atc".to_string()]));

        assert_eq!(reg.len(), 2);
        assert_eq!(reg.get(ConnectionId(1)).unwrap().id(), ConnectionId(1));
        assert_eq!(
            reg.get_by_address("10.0.0.2:5000".parse().unwrap()).unwrap().id(),
            ConnectionId(2)
        );
        assert_eq!(reg.get_by_identity("EDDF_TWR").unwrap().id(), ConnectionId(2));
        assert!(reg.get_by_identity("unbekannt").is_none());
        assert_eq!(reg.all().len(), 2);

        assert!(reg.remove(ConnectionId(1)).is_some());
        assert!(reg.remove(ConnectionId(1)).is_none());
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn doppelte_id_wird_abgelehnt() {
        let (reg, _mux) = registry(RegistryConfig::default());
        let (a, _ca) = test_verbindung(1, "10.0.0.1:5000");
        let (a2, _ca2) = test_verbindung(1, "10.0.0.9:5000");

        reg.add(a, lesehaelfte()).unwrap();
        assert!(matches!(
            reg.add(a2, lesehaelfte()),
            Err(SignalingError::Doppelt(ConnectionId(1)))
        ));
    }

    #[tokio::test]
    async fn kapazitaet_wird_eingehalten() {
        let (reg, _mux) = registry(RegistryConfig {
            max_verbindungen: 1,
            ..RegistryConfig::default()
        });
        let (a, _ca) = test_verbindung(1, "10.0.0.1:5000");
        let (b, _cb) = test_verbindung(2, "10.0.0.2:5000");

        reg.add(a, lesehaelfte()).unwrap();
        assert!(matches!(
            reg.add(b, lesehaelfte()),
            Err(SignalingError::Kapazitaet(1))
        ));
    }

    #[tokio::test]
    async fn ohne_multiplexer_kein_hinzufuegen() {
        let (reg, mux) = registry(RegistryConfig::default());
        drop(mux);
        let (a, _ca) = test_verbindung(1, "10.0.0.1:5000");
        assert!(matches!(
            reg.add(a, lesehaelfte()),
            Err(SignalingError::Shutdown)
        ));
        assert!(reg.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_verbindungen_werden_getrennt() {
        let (reg, _mux) = registry(RegistryConfig::default());
        let (anonym, _c1) = test_verbindung(1, "10.0.0.1:5000");
        let (auth, _c2) = test_verbindung(2, "10.0.0.2:5000");
        auth.authentifizieren(Identity::neu("DLH4AB", ["pilot".to_string()]));
        reg.add(Arc::clone(&anonym), lesehaelfte()).unwrap();
        reg.add(Arc::clone(&auth), lesehaelfte()).unwrap();

        tokio::time::advance(Duration::from_secs(44)).await;
        assert!(reg.check_idle(Instant::now()).is_empty());

        tokio::time::advance(Duration::from_secs(2)).await;
        let entfernt = reg.check_idle(Instant::now());
        assert_eq!(entfernt.len(), 1);
        assert_eq!(entfernt[0].id(), ConnectionId(1));
        assert!(anonym.ist_geschlossen());
        assert_eq!(reg.len(), 1);

        // Aktivitaet verschiebt das Limit
        tokio::time::advance(Duration::from_secs(1000)).await;
        auth.aktivitaet_melden(Instant::now());
        tokio::time::advance(Duration::from_secs(1000)).await;
        assert!(reg.check_idle(Instant::now()).is_empty());

        tokio::time::advance(Duration::from_secs(801)).await;
        let entfernt = reg.check_idle(Instant::now());
        assert_eq!(entfernt.len(), 1);
        assert!(auth.ist_geschlossen());
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn voice_aufloesung() {
        let (reg, _mux) = registry(RegistryConfig::default());
        let (a, _ca) = test_verbindung(1, "127.0.0.1:5000");
        a.voice_aktiv_setzen(true);
        reg.add(Arc::clone(&a), lesehaelfte()).unwrap();

        let udp_peer: SocketAddr = "127.0.0.1:6000".parse().unwrap();
        assert!(reg.nach_voice_peer(udp_peer).is_none());
        assert_eq!(
            reg.nach_remote_ip(udp_peer.ip()),
            Some(VoicePeer {
                id: ConnectionId(1),
                voice_aktiv: true
            })
        );

        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        reg.peer_binden(ConnectionId(1), udp_peer, &socket);
        assert_eq!(reg.nach_voice_peer(udp_peer).map(|p| p.id), Some(ConnectionId(1)));
        assert!(reg.zustellen(ConnectionId(1), Bytes::from_static(b"x")));
        assert!(!reg.zustellen(ConnectionId(9), Bytes::from_static(b"x")));
        assert!(reg.teilnehmer(ConnectionId(1)).unwrap().voice_aktiv);
    }

    #[tokio::test]
    async fn senden_an_unbekannte_verbindung() {
        let (reg, _mux) = registry(RegistryConfig::default());
        assert!(matches!(
            reg.senden(ConnectionId(5), "<msg/>", false),
            Err(SignalingError::NichtGefunden(_))
        ));
    }
}
