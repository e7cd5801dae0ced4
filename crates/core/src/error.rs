//! Fehlertypen fuer SkyRelay
//!
//! Gemeinsamer Fehler-Enum fuer Zustaende, die mehrere Crates betreffen.
//! Untermodule definieren eigene Fehler und konvertieren bei Bedarf via `#[from]`.

use thiserror::Error;

/// Crate-uebergreifende Fehler
#[derive(Debug, Error)]
pub enum CoreError {
    // --- Protokoll ---
    #[error("Protokollversion nicht unterstuetzt: erwartet={erwartet}, erhalten={erhalten}")]
    ProtokollVersion { erwartet: u8, erhalten: u8 },

    // --- Konfiguration ---
    #[error("Konfigurationsfehler: {0}")]
    Konfiguration(String),
}

impl CoreError {
    /// Gibt true zurueck wenn der Fehler nur die betroffene Verbindung beendet
    pub fn ist_verbindungslokal(&self) -> bool {
        matches!(self, Self::ProtokollVersion { .. })
    }
}
