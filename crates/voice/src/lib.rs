//! skyrelay-voice – Voice-Verteilung
//!
//! Nimmt Voice-Datagramme entgegen, ordnet sie Verbindungen zu und verteilt
//! sie an die berechtigten Mitglieder eines Kanals.
//!
//! ## Module
//! - [`udp`] – UDP-Sockets, Ping-Echo, Absender-Zuordnung
//! - [`roster`] – Lesezugriff auf Kanaele und Rollen, In-Memory-Roster
//! - [`mixer`] – Sequenzpruefung, Sprechberechtigung, Reichweite, Fan-out

pub mod mixer;
pub mod roster;
pub mod udp;

pub use mixer::{MixOutcome, VoiceMixer, VoiceParticipant, VoiceParticipants};
pub use roster::{InMemoryRoster, RosterChannel, VoiceRoster};
pub use udp::{DatagramErgebnis, VoiceEndpoint, VoicePeer, VoicePeerResolver, VoiceSockets};
