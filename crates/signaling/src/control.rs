//! Control-Kanal – Textnachrichten auf der TCP-Verbindung
//!
//! Kodiert ausgehende Nachrichten (Latin-1, optional komprimiert), verbucht
//! die Kompressions-Ersparnis und reiht sie in den Verbindungskanal ein.

use bytes::Bytes;
use skyrelay_core::{ConnectionId, Stats};
use skyrelay_protocol::wire::{self, RESET_FRAME};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;

use crate::channel::{ChannelConfig, ChannelHandle, StreamSink};
use crate::error::SignalingResult;

/// Sendeseite einer Control-Verbindung
#[derive(Debug)]
pub struct ControlChannel {
    kanal: ChannelHandle,
    stats: Arc<Stats>,
    kompression: AtomicBool,
}

impl ControlChannel {
    /// Startet den Kanal auf der Schreibhaelfte einer Verbindung
    ///
    /// Nach erschoepften Schreib-Retries wird einmalig der Reset-Frame
    /// versucht.
    pub fn starten<W>(
        id: ConnectionId,
        writer: W,
        mut config: ChannelConfig,
        stats: Arc<Stats>,
        fatal_tx: Option<mpsc::UnboundedSender<ConnectionId>>,
    ) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        config.abschieds_frame = Some(Bytes::from(wire::latin1_kodieren(RESET_FRAME)));
        let kanal = ChannelHandle::starten(
            id,
            StreamSink::neu(writer),
            config,
            Arc::clone(&stats),
            fatal_tx,
        );
        Self {
            kanal,
            stats,
            kompression: AtomicBool::new(false),
        }
    }

    /// Sendet eine Textnachricht
    pub fn senden(&self, text: &str, kritisch: bool) -> SignalingResult<()> {
        let komprimieren = self.kompression.load(Ordering::Relaxed);
        let (daten, gespart) = wire::frame_kodieren(text, komprimieren)?;
        if komprimieren {
            self.stats.kompression_verbuchen(gespart);
        }
        self.kanal.enqueue(daten, kritisch)?;
        self.stats.frame_gesendet();
        Ok(())
    }

    /// Schaltet die Kompression ausgehender Nachrichten um
    pub fn kompression_setzen(&self, aktiv: bool) {
        self.kompression.store(aktiv, Ordering::Relaxed);
    }

    pub fn kompression_aktiv(&self) -> bool {
        self.kompression.load(Ordering::Relaxed)
    }

    pub fn kanal(&self) -> &ChannelHandle {
        &self.kanal
    }

    pub fn close(&self) {
        self.kanal.close();
    }
}
