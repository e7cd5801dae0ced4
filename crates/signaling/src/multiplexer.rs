//! Readiness-Multiplexer – ein Warte-Punkt fuer alle Control-Verbindungen
//!
//! Die Lesehaelften aller Verbindungen liegen als `FramedRead` mit
//! [`ControlDecoder`] in einer `StreamMap`. Der Lese-Worker wartet hier
//! (begrenzt durch ein Zeitlimit) und holt danach alle bereiten Frames ab.
//!
//! An- und Abmeldungen kommen ueber einen Kanal vom [`MultiplexerHandle`],
//! damit die Registry den Multiplexer nie direkt sperren muss.
//!
//! Nach einer konfigurierbaren Anzahl Zyklen wird die `StreamMap` neu
//! aufgebaut (Recycling), damit ihr Speicher nicht dauerhaft auf dem
//! Hoechststand bleibt.

use futures_util::FutureExt;
use skyrelay_core::{ConnectionId, Stats};
use skyrelay_protocol::ControlDecoder;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;
use tokio_stream::{Stream, StreamExt, StreamMap};
use tokio_util::codec::FramedRead;

/// Obergrenze abgeholter Ereignisse pro Zyklus
const MAX_EREIGNISSE_PRO_ZYKLUS: usize = 512;

// ---------------------------------------------------------------------------
// Ereignisse
// ---------------------------------------------------------------------------

/// Was der Multiplexer fuer eine Verbindung meldet
#[derive(Debug)]
pub enum MuxEreignis {
    /// Vollstaendiger Frame (mit XML-Header)
    Frame(ConnectionId, String),
    /// Gegenseite hat geschlossen oder Lesefehler
    Getrennt(ConnectionId, Option<io::Error>),
}

enum Lesen {
    Frame(String),
    Fehler(io::Error),
    Ende,
}

type LeseStream = Pin<Box<dyn Stream<Item = Lesen> + Send>>;

enum Befehl<R> {
    Registrieren(ConnectionId, R, Arc<Stats>),
    Abmelden(ConnectionId),
}

// ---------------------------------------------------------------------------
// MultiplexerHandle
// ---------------------------------------------------------------------------

/// Sendeseite fuer An- und Abmeldungen
pub struct MultiplexerHandle<R = OwnedReadHalf> {
    tx: mpsc::UnboundedSender<Befehl<R>>,
}

impl<R> Clone for MultiplexerHandle<R> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<R> MultiplexerHandle<R> {
    /// Meldet eine Lesehaelfte an; `false`, wenn der Multiplexer beendet ist
    pub fn registrieren(&self, id: ConnectionId, reader: R, stats: Arc<Stats>) -> bool {
        self.tx.send(Befehl::Registrieren(id, reader, stats)).is_ok()
    }

    pub fn abmelden(&self, id: ConnectionId) {
        let _ = self.tx.send(Befehl::Abmelden(id));
    }
}

// ---------------------------------------------------------------------------
// ReadinessMultiplexer
// ---------------------------------------------------------------------------

/// Wartet gemeinsam auf alle registrierten Control-Verbindungen
pub struct ReadinessMultiplexer<R = OwnedReadHalf> {
    streams: StreamMap<ConnectionId, LeseStream>,
    befehle: mpsc::UnboundedReceiver<Befehl<R>>,
    befehle_offen: bool,
    zyklen: u64,
    recycle_schwelle: u64,
}

impl<R> ReadinessMultiplexer<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    /// Erstellt Multiplexer und zugehoeriges Handle
    pub fn neu(recycle_schwelle: u64) -> (Self, MultiplexerHandle<R>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mux = Self {
            streams: StreamMap::new(),
            befehle: rx,
            befehle_offen: true,
            zyklen: 0,
            recycle_schwelle,
        };
        (mux, MultiplexerHandle { tx })
    }

    /// Anzahl registrierter Verbindungen
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn zyklen(&self) -> u64 {
        self.zyklen
    }

    pub fn should_recycle(&self) -> bool {
        self.recycle_schwelle > 0 && self.zyklen >= self.recycle_schwelle
    }

    /// Baut die `StreamMap` neu auf und setzt den Zykluszaehler zurueck
    pub fn recycle(&mut self) {
        let ids: Vec<ConnectionId> = self.streams.keys().copied().collect();
        let mut neu = StreamMap::with_capacity(ids.len());
        for id in ids {
            if let Some(stream) = self.streams.remove(&id) {
                neu.insert(id, stream);
            }
        }
        self.streams = neu;
        self.zyklen = 0;
        tracing::debug!(verbindungen = self.streams.len(), "Multiplexer recycelt");
    }

    /// Wartet hoechstens `wartezeit` und liefert alle bereiten Ereignisse
    pub async fn warten(&mut self, wartezeit: Duration) -> Vec<MuxEreignis> {
        self.zyklen += 1;
        self.befehle_abholen();

        let mut ereignisse = Vec::new();
        let schlaf = tokio::time::sleep(wartezeit);
        tokio::pin!(schlaf);

        loop {
            if self.streams.is_empty() {
                tokio::select! {
                    befehl = self.befehle.recv(), if self.befehle_offen => {
                        self.befehl_anwenden(befehl);
                        continue;
                    }
                    _ = &mut schlaf => return ereignisse,
                }
            }

            tokio::select! {
                eintrag = self.streams.next() => {
                    if let Some((id, lesen)) = eintrag {
                        self.uebernehmen(id, lesen, &mut ereignisse);
                    }
                    break;
                }
                befehl = self.befehle.recv(), if self.befehle_offen => {
                    self.befehl_anwenden(befehl);
                }
                _ = &mut schlaf => return ereignisse,
            }
        }

        // Alles abholen, was ohne weiteres Warten bereit ist
        while ereignisse.len() < MAX_EREIGNISSE_PRO_ZYKLUS {
            match self.streams.next().now_or_never() {
                Some(Some((id, lesen))) => self.uebernehmen(id, lesen, &mut ereignisse),
                _ => break,
            }
        }
        ereignisse
    }

    fn uebernehmen(&mut self, id: ConnectionId, lesen: Lesen, ereignisse: &mut Vec<MuxEreignis>) {
        match lesen {
            Lesen::Frame(text) => ereignisse.push(MuxEreignis::Frame(id, text)),
            Lesen::Fehler(e) => {
                self.streams.remove(&id);
                ereignisse.push(MuxEreignis::Getrennt(id, Some(e)));
            }
            Lesen::Ende => {
                self.streams.remove(&id);
                ereignisse.push(MuxEreignis::Getrennt(id, None));
            }
        }
    }

    fn befehle_abholen(&mut self) {
        while let Ok(befehl) = self.befehle.try_recv() {
            self.befehl_anwenden(Some(befehl));
        }
    }

    fn befehl_anwenden(&mut self, befehl: Option<Befehl<R>>) {
        match befehl {
            Some(Befehl::Registrieren(id, reader, stats)) => {
                let framed = FramedRead::new(reader, ControlDecoder::mit_stats(stats));
                let stream = framed
                    .map(|ergebnis| match ergebnis {
                        Ok(text) => Lesen::Frame(text),
                        Err(e) => Lesen::Fehler(e),
                    })
                    .chain(tokio_stream::once(Lesen::Ende));
                self.streams.insert(id, Box::pin(stream));
                tracing::trace!(conn = %id, "Lesehaelfte registriert");
            }
            Some(Befehl::Abmelden(id)) => {
                self.streams.remove(&id);
                tracing::trace!(conn = %id, "Lesehaelfte abgemeldet");
            }
            None => self.befehle_offen = false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
