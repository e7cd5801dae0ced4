//! Voice-Mixer – Zugriffskontrolle und Verteilung von Voice-Paketen
//!
//! Der Mixer mischt kein Audio, er entscheidet nur, wer ein Paket bekommt.
//!
//! ## Ablauf pro Paket
//!
//! ```text
//! Absender stumm?                      -> verwerfen
//! Roster: Kanal des Absenders          -> kein Kanal: verwerfen
//! VoicePacket::decode(id, kanal)       -> Fehler: verwerfen
//! Sequenz pruefen                      -> Anomalie nur loggen
//! Sprechberechtigung                   -> keine: verwerfen
//! Fan-out an Mitglieder (Voice aktiv, Reichweite, Self-Echo)
//! ```

use bytes::Bytes;
use dashmap::DashMap;
use skyrelay_core::{ConnectionId, GeoPosition, Stats};
use skyrelay_protocol::voice::{VoiceDecodeError, VoicePacket};
use std::collections::HashSet;
use std::sync::Arc;

use crate::roster::{RosterChannel, VoiceRoster};

// ---------------------------------------------------------------------------
// Teilnehmer-Sicht
// ---------------------------------------------------------------------------

/// Momentaufnahme einer Verbindung aus Sicht des Mixers
#[derive(Debug, Clone)]
pub struct VoiceParticipant {
    pub id: ConnectionId,
    pub stumm: bool,
    pub voice_aktiv: bool,
    pub position: Option<GeoPosition>,
    /// Rollen der authentifizierten Identitaet (leer fuer anonyme Verbindungen)
    pub rollen: HashSet<String>,
    pub stats: Arc<Stats>,
}

/// Zugriff auf Verbindungen und deren Voice-Kanaele
///
/// Wird von der Verbindungs-Registry implementiert.
pub trait VoiceParticipants: Send + Sync {
    fn teilnehmer(&self, id: ConnectionId) -> Option<VoiceParticipant>;

    /// Reiht ein kodiertes Paket in den Voice-Kanal des Ziels ein
    ///
    /// `false`, wenn das Ziel keinen gebundenen Voice-Kanal hat.
    fn zustellen(&self, ziel: ConnectionId, daten: Bytes) -> bool;
}

// ---------------------------------------------------------------------------
// MixOutcome
// ---------------------------------------------------------------------------

/// Ergebnis der Verarbeitung eines Pakets
#[derive(Debug, Clone, PartialEq)]
pub enum MixOutcome {
    /// Absender ist keine bekannte Verbindung
    UnbekannterAbsender,
    /// Absender ist stummgeschaltet
    Stumm,
    /// Absender ist in keinem Voice-Kanal
    KeinKanal,
    /// Dekodierung, Identitaet oder Pruefsumme fehlgeschlagen
    Ungueltig(VoiceDecodeError),
    /// Absender darf in diesem Kanal nicht sprechen
    KeineSprechberechtigung,
    /// Paket wurde verteilt
    Verteilt {
        sequenz: u64,
        sequenz_anomalie: bool,
        empfaenger: Vec<ConnectionId>,
    },
}

impl MixOutcome {
    pub fn ist_verteilt(&self) -> bool {
        matches!(self, Self::Verteilt { .. })
    }
}

// ---------------------------------------------------------------------------
// VoiceMixer
// ---------------------------------------------------------------------------

/// Verteilt dekodierte Voice-Pakete an berechtigte Empfaenger
pub struct VoiceMixer {
    roster: Arc<dyn VoiceRoster>,
    teilnehmer: Arc<dyn VoiceParticipants>,
    /// Hoechste gesehene Sequenz-ID pro Absender
    sequenzen: DashMap<ConnectionId, u64>,
    self_echo: bool,
}

impl VoiceMixer {
    pub fn neu(
        roster: Arc<dyn VoiceRoster>,
        teilnehmer: Arc<dyn VoiceParticipants>,
        self_echo: bool,
    ) -> Self {
        Self {
            roster,
            teilnehmer,
            sequenzen: DashMap::new(),
            self_echo,
        }
    }

    /// Verarbeitet ein Voice-Datagramm einer bereits zugeordneten Verbindung
    pub fn mischen(&self, absender_id: ConnectionId, daten: &[u8]) -> MixOutcome {
        let Some(absender) = self.teilnehmer.teilnehmer(absender_id) else {
            return MixOutcome::UnbekannterAbsender;
        };
        absender.stats.voice_empfangen();

        let ergebnis = self.mischen_intern(&absender, daten);
        if !ergebnis.ist_verteilt() {
            absender.stats.voice_verworfen();
        }
        ergebnis
    }

    fn mischen_intern(&self, absender: &VoiceParticipant, daten: &[u8]) -> MixOutcome {
        if absender.stumm {
            tracing::trace!(conn = %absender.id, "Absender stumm, Paket verworfen");
            return MixOutcome::Stumm;
        }

        let Some(kanal) = self.roster.kanal_von(absender.id) else {
            tracing::trace!(conn = %absender.id, "Absender in keinem Voice-Kanal");
            return MixOutcome::KeinKanal;
        };

        let paket = match VoicePacket::decode(daten, absender.id, &kanal.name) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(conn = %absender.id, kanal = %kanal.name, fehler = %e, "Voice-Paket verworfen");
                return MixOutcome::Ungueltig(e);
            }
        };

        let sequenz_anomalie = self.sequenz_pruefen(absender.id, paket.sequenz);

        if !self.darf_sprechen(absender, &kanal) {
            tracing::debug!(conn = %absender.id, kanal = %kanal.name, "Keine Sprechberechtigung");
            return MixOutcome::KeineSprechberechtigung;
        }

        let kodiert = Bytes::from(paket.encode());
        let empfaenger = self.verteilen(absender, &paket, &kanal, kodiert);

        tracing::trace!(
            conn = %absender.id,
            kanal = %kanal.name,
            sequenz = paket.sequenz,
            empfaenger = empfaenger.len(),
            "Voice-Paket verteilt"
        );

        MixOutcome::Verteilt {
            sequenz: paket.sequenz,
            sequenz_anomalie,
            empfaenger,
        }
    }

    /// Aktualisiert die hoechste Sequenz-ID und meldet Anomalien
    ///
    /// Anomalie: weder direkter Nachfolger noch hoechstens ein Paket zurueck.
    /// Das Paket wird trotzdem weitergeleitet.
    fn sequenz_pruefen(&self, id: ConnectionId, sequenz: u64) -> bool {
        let mut hoechste = self.sequenzen.entry(id).or_insert(sequenz);
        let bisher = *hoechste;

        let vorwaerts_luecke = sequenz > bisher.saturating_add(1);
        let weit_zurueck = sequenz.saturating_add(1) < bisher;
        *hoechste = bisher.max(sequenz);
        drop(hoechste);

        if vorwaerts_luecke || weit_zurueck {
            tracing::warn!(
                conn = %id,
                erwartet = bisher.saturating_add(1),
                erhalten = sequenz,
                "Voice-Sequenz ausser der Reihe"
            );
            return true;
        }
        false
    }

    fn darf_sprechen(&self, absender: &VoiceParticipant, kanal: &RosterChannel) -> bool {
        if !absender.rollen.is_disjoint(&kanal.sprech_rollen) {
            return true;
        }
        if kanal.dynamische_sprech_rollen.is_empty() {
            return false;
        }
        kanal.mitglieder.iter().any(|m| {
            self.teilnehmer
                .teilnehmer(*m)
                .is_some_and(|t| !t.rollen.is_disjoint(&kanal.dynamische_sprech_rollen))
        })
    }

    fn verteilen(
        &self,
        absender: &VoiceParticipant,
        paket: &VoicePacket,
        kanal: &RosterChannel,
        kodiert: Bytes,
    ) -> Vec<ConnectionId> {
        let mut empfaenger = Vec::with_capacity(kanal.mitglieder.len());

        for &ziel_id in &kanal.mitglieder {
            if ziel_id == absender.id && !self.self_echo {
                continue;
            }
            let Some(ziel) = self.teilnehmer.teilnehmer(ziel_id) else {
                continue;
            };
            if !ziel.voice_aktiv {
                continue;
            }
            // Ohne Position im Paket zaehlt die Position der Verbindung
            if let (Some(reichweite), Some(von), Some(nach)) = (
                kanal.reichweite_nm,
                paket.position.or(absender.position),
                ziel.position,
            )
            {
                if von.distanz_nm(&nach) > reichweite {
                    continue;
                }
            }
            if self.teilnehmer.zustellen(ziel_id, kodiert.clone()) {
                ziel.stats.voice_gesendet();
                empfaenger.push(ziel_id);
            }
        }
        empfaenger
    }

    /// Vergisst den Sequenz-Stand einer getrennten Verbindung
    pub fn absender_vergessen(&self, id: ConnectionId) {
        self.sequenzen.remove(&id);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
