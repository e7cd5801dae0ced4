//! Fehlertypen fuer Verbindungen, Kanaele und Registry

use skyrelay_core::{ConnectionId, CoreError};
use skyrelay_protocol::CompressionError;
use thiserror::Error;

/// Fehler eines Verbindungskanals
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// Kanal wurde geschlossen (regulaer oder nach fatalem Schreibfehler)
    #[error("Kanal geschlossen")]
    Geschlossen,
}

/// Fehlertyp fuer den Signaling-Service
#[derive(Debug, Error)]
pub enum SignalingError {
    /// IO-Fehler (TCP, Socket)
    #[error("IO-Fehler: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Kanal(#[from] ChannelError),

    #[error("Kompressionsfehler: {0}")]
    Kompression(#[from] CompressionError),

    #[error(transparent)]
    Core(#[from] CoreError),

    /// Maximale Verbindungsanzahl erreicht
    #[error("Server ist voll ({0} Verbindungen)")]
    Kapazitaet(usize),

    /// Verbindungs-ID ist bereits registriert
    #[error("Verbindung {0} ist bereits registriert")]
    Doppelt(ConnectionId),

    /// Verbindung nicht (mehr) registriert
    #[error("Verbindung {0} nicht gefunden")]
    NichtGefunden(ConnectionId),

    /// Shutdown laeuft, keine neuen Verbindungen
    #[error("Server wird heruntergefahren")]
    Shutdown,
}

impl SignalingError {
    /// Betrifft der Fehler nur die eine Verbindung (statt den ganzen Worker)?
    pub fn ist_verbindungslokal(&self) -> bool {
        match self {
            Self::Io(_) | Self::Kanal(_) | Self::Kompression(_) | Self::NichtGefunden(_) => true,
            Self::Core(e) => e.ist_verbindungslokal(),
            Self::Kapazitaet(_) | Self::Doppelt(_) | Self::Shutdown => false,
        }
    }
}

/// Result-Typ fuer den Signaling-Service
pub type SignalingResult<T> = Result<T, SignalingError>;
