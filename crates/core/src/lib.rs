//! skyrelay-core – Gemeinsame Typen, Statistiken und Fehlertypen
//!
//! Dieses Crate stellt die fundamentalen Bausteine bereit, die von allen
//! anderen SkyRelay-Crates gemeinsam genutzt werden.

pub mod error;
pub mod stats;
pub mod types;

// Re-Exporte fuer bequemen Zugriff
pub use error::CoreError;
pub use stats::{Stats, StatsSnapshot};
pub use types::{ConnectionId, ConnectionIdGenerator, GeoPosition};
