//! Gemeinsame Identifikations- und Positionstypen fuer SkyRelay
//!
//! Verbindungs-IDs verwenden das Newtype-Pattern um Verwechslungen mit
//! anderen Zahlen zur Compilezeit auszuschliessen.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Mittlerer Erdradius in Seemeilen (fuer Grosskreis-Distanzen)
pub const ERDRADIUS_NM: f64 = 3440.065;

// ---------------------------------------------------------------------------
// ConnectionId
// ---------------------------------------------------------------------------

/// Eindeutige, monoton vergebene Verbindungs-ID
///
/// Dient gleichzeitig als Absender-ID im Voice-Paket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Gibt den inneren Zahlenwert zurueck
    pub fn inner(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn:{}", self.0)
    }
}

/// Vergibt fortlaufende Verbindungs-IDs (beginnend bei 1)
#[derive(Debug)]
pub struct ConnectionIdGenerator {
    naechste: AtomicU64,
}

impl ConnectionIdGenerator {
    /// Erstellt einen neuen Generator
    pub fn neu() -> Self {
        Self {
            naechste: AtomicU64::new(1),
        }
    }

    /// Gibt die naechste freie ID zurueck
    pub fn naechste(&self) -> ConnectionId {
        ConnectionId(self.naechste.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConnectionIdGenerator {
    fn default() -> Self {
        Self::neu()
    }
}

// ---------------------------------------------------------------------------
// GeoPosition
// ---------------------------------------------------------------------------

/// Geografische Position in Dezimalgrad
///
/// Auf dem Draht gilt 0°/0° als "keine Position". Das ist fuer echte
/// Positionen am Aequator/Nullmeridian mehrdeutig, wird aber beibehalten.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPosition {
    /// Breitengrad (-90..=90)
    pub lat: f64,
    /// Laengengrad (-180..=180)
    pub lon: f64,
}

impl GeoPosition {
    /// Erstellt eine neue Position
    pub fn neu(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Liest eine Position aus den Draht-Koordinaten (0/0 = unbekannt)
    pub fn aus_draht(lat: f64, lon: f64) -> Option<Self> {
        if lat == 0.0 && lon == 0.0 {
            None
        } else {
            Some(Self { lat, lon })
        }
    }

    /// Grosskreis-Distanz in Seemeilen (Haversine)
    pub fn distanz_nm(&self, andere: &GeoPosition) -> f64 {
        let lat1 = self.lat.to_radians();
        let lat2 = andere.lat.to_radians();
        let dlat = (andere.lat - self.lat).to_radians();
        let dlon = (andere.lon - self.lon).to_radians();

        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
        ERDRADIUS_NM * c
    }
}
