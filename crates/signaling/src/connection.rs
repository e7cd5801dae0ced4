//! Verbindung – Zustand einer Client-Session
//!
//! Eine `Connection` entsteht beim Accept, gehoert der Registry (als `Arc`)
//! und wird von Workern und der Befehlsschicht ueber innere Mutabilitaet
//! veraendert.
//!
//! ## Lebenszyklus
//! ```text
//! Accept -> anonym -> authentifiziert
//!    |         |             |
//!    +---------+-------------+--> Schliessen (Client, Fehler, Idle, Shutdown)
//! ```

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use skyrelay_core::{ConnectionId, CoreError, GeoPosition, Stats};
use skyrelay_voice::VoiceParticipant;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;

use crate::channel::{ChannelConfig, ChannelHandle, DatagramPeer, DatagramSink};
use crate::control::ControlChannel;

/// Hoechste unterstuetzte Protokollversion
pub const MAX_PROTOKOLL_VERSION: u8 = 2;

// ---------------------------------------------------------------------------
// Identitaet
// ---------------------------------------------------------------------------

/// Authentifizierte Identitaet einer Verbindung
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub benutzer: String,
    pub rollen: HashSet<String>,
}

impl Identity {
    pub fn neu(benutzer: impl Into<String>, rollen: impl IntoIterator<Item = String>) -> Self {
        Self {
            benutzer: benutzer.into(),
            rollen: rollen.into_iter().collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// Eine Client-Verbindung mit Control- und optionalem Voice-Kanal
pub struct Connection {
    id: ConnectionId,
    remote: SocketAddr,
    stats: Arc<Stats>,
    control: ControlChannel,
    identitaet: RwLock<Option<Identity>>,
    protokoll_version: AtomicU8,
    voice_aktiv: AtomicBool,
    stumm: AtomicBool,
    position: Mutex<Option<GeoPosition>>,
    letzte_aktivitaet: Mutex<Instant>,
    voice_peer: DatagramPeer,
    voice_kanal: Mutex<Option<ChannelHandle>>,
    voice_config: ChannelConfig,
    reihenfolge: Mutex<()>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("authentifiziert", &self.ist_authentifiziert())
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn neu(
        id: ConnectionId,
        remote: SocketAddr,
        control: ControlChannel,
        stats: Arc<Stats>,
        voice_config: ChannelConfig,
    ) -> Self {
        Self {
            id,
            remote,
            stats,
            control,
            identitaet: RwLock::new(None),
            protokoll_version: AtomicU8::new(1),
            voice_aktiv: AtomicBool::new(false),
            stumm: AtomicBool::new(false),
            position: Mutex::new(None),
            letzte_aktivitaet: Mutex::new(Instant::now()),
            voice_peer: Arc::new(Mutex::new(None)),
            voice_kanal: Mutex::new(None),
            voice_config,
            reihenfolge: Mutex::new(()),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    pub fn control(&self) -> &ControlChannel {
        &self.control
    }

    /// Sendet eine Textnachricht ueber den Control-Kanal
    pub fn senden(&self, text: &str, kritisch: bool) -> crate::error::SignalingResult<()> {
        self.control.senden(text, kritisch)
    }

    /// Sperre fuer die Sendereihenfolge
    ///
    /// Schreib-Worker nehmen sie, solange sie noch die Ausgangs-Queue halten,
    /// und geben sie erst nach `senden` frei. So bleibt die Reihenfolge der
    /// Queue pro Verbindung erhalten, obwohl mehrere Worker kodieren.
    pub fn reihenfolge_sperren(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.reihenfolge.lock()
    }

    // --- Authentifizierung ---

    pub fn authentifizieren(&self, identitaet: Identity) {
        tracing::info!(conn = %self.id, benutzer = %identitaet.benutzer, "Verbindung authentifiziert");
        *self.identitaet.write() = Some(identitaet);
    }

    pub fn abmelden(&self) {
        *self.identitaet.write() = None;
    }

    pub fn identitaet(&self) -> Option<Identity> {
        self.identitaet.read().clone()
    }

    pub fn ist_authentifiziert(&self) -> bool {
        self.identitaet.read().is_some()
    }

    /// Gehoert die Verbindung zu diesem Benutzer?
    pub fn ist_benutzer(&self, benutzer: &str) -> bool {
        self.identitaet
            .read()
            .as_ref()
            .is_some_and(|i| i.benutzer == benutzer)
    }

    // --- Protokoll-Flags ---

    pub fn protokoll_version(&self) -> u8 {
        self.protokoll_version.load(Ordering::Relaxed)
    }

    /// Setzt die vom Client gemeldete Protokollversion
    pub fn protokoll_version_setzen(&self, version: u8) -> Result<(), CoreError> {
        if version == 0 || version > MAX_PROTOKOLL_VERSION {
            return Err(CoreError::ProtokollVersion {
                erwartet: MAX_PROTOKOLL_VERSION,
                erhalten: version,
            });
        }
        self.protokoll_version.store(version, Ordering::Relaxed);
        Ok(())
    }

    pub fn kompression_setzen(&self, aktiv: bool) {
        self.control.kompression_setzen(aktiv);
    }

    pub fn voice_aktiv(&self) -> bool {
        self.voice_aktiv.load(Ordering::Relaxed)
    }

    pub fn voice_aktiv_setzen(&self, aktiv: bool) {
        self.voice_aktiv.store(aktiv, Ordering::Relaxed);
    }

    pub fn stumm(&self) -> bool {
        self.stumm.load(Ordering::Relaxed)
    }

    pub fn stumm_setzen(&self, stumm: bool) {
        self.stumm.store(stumm, Ordering::Relaxed);
    }

    pub fn position(&self) -> Option<GeoPosition> {
        *self.position.lock()
    }

    pub fn position_setzen(&self, position: Option<GeoPosition>) {
        *self.position.lock() = position;
    }

    // --- Aktivitaet ---

    pub fn aktivitaet_melden(&self, jetzt: Instant) {
        *self.letzte_aktivitaet.lock() = jetzt;
    }

    pub fn letzte_aktivitaet(&self) -> Instant {
        *self.letzte_aktivitaet.lock()
    }

    /// Zeit seit der letzten Aktivitaet
    pub fn idle_seit(&self, jetzt: Instant) -> Duration {
        jetzt.saturating_duration_since(self.letzte_aktivitaet())
    }

    // --- Voice ---

    pub fn voice_peer(&self) -> Option<SocketAddr> {
        *self.voice_peer.lock()
    }

    /// Bindet die Voice-Adresse
    ///
    /// Der Voice-Kanal entsteht beim ersten Aufruf und wird ersetzt, falls
    /// er inzwischen geschlossen wurde. Auf einer geschlossenen Verbindung
    /// entsteht kein neuer Kanal.
    pub fn voice_binden(&self, addr: SocketAddr, socket: &Arc<UdpSocket>) {
        let alt = self.voice_peer.lock().replace(addr);
        if alt != Some(addr) {
            tracing::debug!(conn = %self.id, peer = %addr, "Voice-Peer gebunden");
        }

        if self.ist_geschlossen() {
            return;
        }
        let mut kanal = self.voice_kanal.lock();
        if kanal.as_ref().map_or(true, ChannelHandle::ist_geschlossen) {
            if kanal.is_some() {
                tracing::debug!(conn = %self.id, "Geschlossener Voice-Kanal wird ersetzt");
            }
            *kanal = Some(ChannelHandle::starten(
                self.id,
                DatagramSink::neu(Arc::clone(socket), Arc::clone(&self.voice_peer)),
                self.voice_config.clone(),
                Arc::clone(&self.stats),
                None,
            ));
        }
    }

    /// Reiht ein Voice-Paket ein; `false` ohne gebundenen Voice-Kanal
    pub fn voice_senden(&self, daten: Bytes) -> bool {
        match self.voice_kanal.lock().as_ref() {
            Some(kanal) => kanal.enqueue(daten, false).is_ok(),
            None => false,
        }
    }

    /// Sicht des Voice-Mixers auf diese Verbindung
    pub fn voice_teilnehmer(&self) -> VoiceParticipant {
        VoiceParticipant {
            id: self.id,
            stumm: self.stumm(),
            voice_aktiv: self.voice_aktiv(),
            position: self.position(),
            rollen: self
                .identitaet
                .read()
                .as_ref()
                .map(|i| i.rollen.clone())
                .unwrap_or_default(),
            stats: Arc::clone(&self.stats),
        }
    }

    // --- Schliessen ---

    /// Schliesst Control- und Voice-Kanal (idempotent)
    pub fn schliessen(&self) {
        self.control.close();
        if let Some(kanal) = self.voice_kanal.lock().as_ref() {
            kanal.close();
        }
    }

    pub fn ist_geschlossen(&self) -> bool {
        self.control.kanal().ist_geschlossen()
    }

    /// Control-Kanal nach erschoepften Schreib-Retries geschlossen?
    pub fn ist_fatal(&self) -> bool {
        self.control.kanal().ist_fatal()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
