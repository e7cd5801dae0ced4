//! Wire-Format fuer das Control-Protokoll (TCP)
//!
//! Textbasiertes Protokoll: Nachrichten sind Latin-1-Text zwischen einem
//! Start- und einem End-Marker. Dazwischen koennen komprimierte Pakete
//! (siehe [`crate::compression`]) im Bytestrom liegen.
//!
//! ## Frame-Format
//!
//! ```text
//! ...Muell...<msg type="...">...</msg><msg ...>...</msg>
//!            ^ Start-Marker          ^ End-Marker
//! ```
//!
//! Jede extrahierte Nachricht wird mit [`FRAME_HEADER`] versehen an den
//! Aufrufer uebergeben. Ein Lesevorgang kann null, eine oder mehrere
//! Nachrichten liefern; das Ergebnis haengt nicht davon ab, wie der Bytestrom
//! auf Lesevorgaenge verteilt ist.

use bytes::BytesMut;
use skyrelay_core::Stats;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use tokio_util::codec::Decoder;

use crate::compression::{self, CompressionEnvelope};

// ---------------------------------------------------------------------------
// Konstanten
// ---------------------------------------------------------------------------

/// Beginn einer Nachricht
pub const START_MARKER: &str = "<msg";

/// Ende einer Nachricht
pub const END_MARKER: &str = "</msg>";

/// Fester Header vor jeder extrahierten Nachricht
pub const FRAME_HEADER: &str = "<?xml version=\"1.0\" encoding=\"ISO-8859-1\"?>\n";

/// Ohne Start-Marker wird der Puffer ab dieser Groesse verworfen
pub const MAX_MUELL_GROESSE: usize = 128;

/// Maximale Groesse einer einzelnen Nachricht
pub const MAX_FRAME_GROESSE: usize = 64 * 1024;

/// Ab so viel ungenutzter Kapazitaet wird der Textpuffer verkleinert
pub const SCHRUMPF_SCHWELLE: usize = 2048;

/// Mindestkapazitaet nach dem Verkleinern
pub const PUFFER_MINIMUM: usize = 512;

/// Abschiedsframe, bevor eine Verbindung wegen Schreibstau getrennt wird
pub const RESET_FRAME: &str = "<msg type=\"reset\"/></msg>";

// ---------------------------------------------------------------------------
// Latin-1
// ---------------------------------------------------------------------------

/// Dekodiert Bytes als Latin-1 (jedes Byte ist genau ein Zeichen)
pub fn latin1_dekodieren(daten: &[u8]) -> String {
    daten.iter().map(|&b| char::from(b)).collect()
}

/// Kodiert Text als Latin-1; nicht darstellbare Zeichen werden zu `?`
pub fn latin1_kodieren(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
        .collect()
}

// ---------------------------------------------------------------------------
// ControlDecoder
// ---------------------------------------------------------------------------

/// Zerlegt den Control-Bytestrom in Nachrichten
///
/// Haelt den Textpuffer, den Kompressions-Akkumulator und zurueckgehaltene
/// Bytes eines moeglicherweise geteilten Kompressions-Markers.
#[derive(Debug, Default)]
pub struct ControlDecoder {
    /// Latin-1-dekodierter Text, der noch nicht zu Nachrichten wurde
    text: String,
    /// Akkumulator fuer komprimierte Pakete
    envelope: CompressionEnvelope,
    /// Zurueckgehaltene Bytes (moeglicher Marker-Anfang)
    rest: Vec<u8>,
    /// Bereits extrahierte, noch nicht abgeholte Nachrichten (fuer `Decoder`)
    bereit: VecDeque<String>,
    stats: Option<Arc<Stats>>,
}

impl ControlDecoder {
    /// Erstellt einen neuen Decoder ohne Statistik-Anbindung
    pub fn neu() -> Self {
        Self::default()
    }

    /// Erstellt einen Decoder, der in die Zaehler der Verbindung schreibt
    pub fn mit_stats(stats: Arc<Stats>) -> Self {
        Self {
            stats: Some(stats),
            ..Self::default()
        }
    }

    /// Haelt der Kompressions-Akkumulator ein unvollstaendiges Paket?
    pub fn hat_teilpaket(&self) -> bool {
        self.envelope.hat_daten()
    }

    /// Anzahl noch nicht zu Nachrichten verarbeiteter Textzeichen
    pub fn gepufferter_text(&self) -> usize {
        self.text.len()
    }

    /// Kapazitaet des Textpuffers (fuer Tests der Schrumpf-Logik)
    pub fn puffer_kapazitaet(&self) -> usize {
        self.text.capacity()
    }

    /// Verarbeitet einen Lesevorgang und liefert alle fertigen Nachrichten
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        if let Some(stats) = &self.stats {
            stats.bytes_empfangen(chunk.len());
        }

        let daten: Vec<u8> = if self.rest.is_empty() {
            chunk.to_vec()
        } else {
            let mut d = std::mem::take(&mut self.rest);
            d.extend_from_slice(chunk);
            d
        };

        let mut pos = 0;
        while pos < daten.len() {
            let offen = &daten[pos..];

            if self.envelope.hat_daten() {
                // Innerhalb der deklarierten Laenge ist alles Nutzlast, auch
                // Bytes, die wie ein Marker aussehen. Eine unplausible Laenge
                // verwirft den Header schon in `anhaengen`.
                pos += self.envelope.anhaengen(offen);
            } else {
                match compression::marker_finden(offen) {
                    Some(p) => {
                        self.text_anhaengen(&offen[..p]);
                        pos += p + self.envelope.anhaengen(&offen[p..]);
                    }
                    None => {
                        let halten = compression::marker_praefix_am_ende(offen);
                        self.text_anhaengen(&offen[..offen.len() - halten]);
                        self.rest = offen[offen.len() - halten..].to_vec();
                        pos = daten.len();
                    }
                }
            }

            self.pakete_entpacken();
        }

        let mut nachrichten = Vec::new();
        self.extrahieren(&mut nachrichten);
        nachrichten
    }

    /// Entpackt alle fertigen Pakete und haengt den Text an
    fn pakete_entpacken(&mut self) {
        let vorher = self.envelope.ungueltige_pakete();
        while let Some(paket) = self.envelope.naechstes_paket() {
            match compression::dekomprimieren(&paket) {
                Ok(klartext) => self.text_anhaengen(&klartext),
                Err(e) => {
                    tracing::warn!(fehler = %e, bytes = paket.len(), "Komprimiertes Paket nicht entpackbar");
                    self.puffer_reset_zaehlen();
                }
            }
        }
        for _ in vorher..self.envelope.ungueltige_pakete() {
            self.puffer_reset_zaehlen();
        }
    }

    fn text_anhaengen(&mut self, daten: &[u8]) {
        self.text.extend(daten.iter().map(|&b| char::from(b)));
    }

    fn puffer_reset_zaehlen(&self) {
        if let Some(stats) = &self.stats {
            stats.puffer_reset();
        }
    }

    /// Extrahiert alle vollstaendigen Nachrichten aus dem Textpuffer
    fn extrahieren(&mut self, ausgabe: &mut Vec<String>) {
        loop {
            let start = match self.text.find(START_MARKER) {
                Some(s) => s,
                None => {
                    if self.text.len() > MAX_MUELL_GROESSE {
                        self.muell_verwerfen();
                    }
                    break;
                }
            };

            // Alles vor dem Start-Marker ist Muell
            if start > 0 {
                self.text.drain(..start);
            }

            let ende = match self.text[START_MARKER.len()..].find(END_MARKER) {
                Some(e) => START_MARKER.len() + e + END_MARKER.len(),
                None => {
                    if self.text.len() > MAX_FRAME_GROESSE {
                        tracing::warn!(bytes = self.text.len(), "Nachricht ohne Ende zu gross – Puffer verworfen");
                        self.text.clear();
                        self.puffer_reset_zaehlen();
                    }
                    break;
                }
            };

            if ende > MAX_FRAME_GROESSE {
                tracing::warn!(bytes = ende, "Nachricht zu gross – verworfen");
                self.text.drain(..ende);
                self.puffer_reset_zaehlen();
                continue;
            }

            let mut nachricht = String::with_capacity(FRAME_HEADER.len() + ende);
            nachricht.push_str(FRAME_HEADER);
            nachricht.push_str(&self.text[..ende]);
            self.text.drain(..ende);

            if let Some(stats) = &self.stats {
                stats.frame_empfangen();
            }
            ausgabe.push(nachricht);
        }

        if self.text.capacity() - self.text.len() > SCHRUMPF_SCHWELLE {
            self.text.shrink_to_fit();
            self.text.reserve(PUFFER_MINIMUM);
        }
    }

    /// Verwirft Muell ohne Start-Marker, behaelt aber einen moeglichen
    /// Marker-Anfang am Ende
    fn muell_verwerfen(&mut self) {
        let behalten = (1..START_MARKER.len())
            .rev()
            .find(|&n| self.text.ends_with(&START_MARKER[..n]))
            .unwrap_or(0);
        let verworfen = self.text.len() - behalten;

        tracing::debug!(bytes = verworfen, "Kein Start-Marker gefunden – Puffer verworfen");
        self.text.drain(..verworfen);
        self.puffer_reset_zaehlen();
    }
}

impl Decoder for ControlDecoder {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if !src.is_empty() {
            let chunk = src.split();
            let nachrichten = self.feed(&chunk);
            self.bereit.extend(nachrichten);
        }
        Ok(self.bereit.pop_front())
    }
}

// ---------------------------------------------------------------------------
// Ausgehende Frames
// ---------------------------------------------------------------------------

/// Bereitet einen ausgehenden Frame fuer den Draht vor
///
/// Gibt die Drahtbytes und die Kompressions-Ersparnis (original − gesendet,
/// kann negativ sein) zurueck.
pub fn frame_kodieren(
    text: &str,
    komprimieren: bool,
) -> Result<(Vec<u8>, i64), compression::CompressionError> {
    let roh = latin1_kodieren(text);
    if !komprimieren {
        return Ok((roh, 0));
    }
    let paket = compression::komprimieren(&roh)?;
    let gespart = roh.len() as i64 - paket.len() as i64;
    Ok((paket, gespart))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
