//! In-Band-Kompression fuer das Control-Protokoll
//!
//! Ein komprimiertes Paket kann mitten im Textstrom auftauchen und sich ueber
//! mehrere Lesevorgaenge erstrecken.
//!
//! ## Paketformat
//!
//! ```text
//! Offset  Len  Beschreibung
//! ------  ---  -----------
//!  0       4   Marker FF C0 DE 5A
//!  4       4   Laenge der zlib-Daten (big-endian)
//!  8       N   zlib-Daten
//! ```

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::collections::VecDeque;
use std::io::{Read, Write};
use thiserror::Error;

/// Marker, der den Beginn eines komprimierten Pakets kennzeichnet
pub const KOMPRESSIONS_MARKER: [u8; 4] = [0xFF, 0xC0, 0xDE, 0x5A];

/// Groesse des Paket-Headers (Marker + Laenge)
pub const HEADER_GROESSE: usize = 8;

/// Maximale Groesse der zlib-Daten eines Pakets (und des entpackten Texts)
pub const MAX_PAKET_GROESSE: usize = 1024 * 1024;

/// Fehler beim Komprimieren oder Entpacken
#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("zlib-Fehler: {0}")]
    Zlib(#[from] std::io::Error),

    #[error("Paket zu gross: {0} Bytes (Maximum {MAX_PAKET_GROESSE})")]
    ZuGross(usize),
}

/// Komprimiert `daten` und verpackt sie mit Marker und Laengenfeld
pub fn komprimieren(daten: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(daten)?;
    let komprimiert = encoder.finish()?;

    if komprimiert.len() > MAX_PAKET_GROESSE {
        return Err(CompressionError::ZuGross(komprimiert.len()));
    }

    let mut paket = Vec::with_capacity(HEADER_GROESSE + komprimiert.len());
    paket.extend_from_slice(&KOMPRESSIONS_MARKER);
    paket.extend_from_slice(&(komprimiert.len() as u32).to_be_bytes());
    paket.extend_from_slice(&komprimiert);
    Ok(paket)
}

/// Entpackt die zlib-Daten eines Pakets (ohne Header)
pub fn dekomprimieren(zlib: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let mut ausgabe = Vec::with_capacity(zlib.len() * 4);
    ZlibDecoder::new(zlib)
        .take(MAX_PAKET_GROESSE as u64 + 1)
        .read_to_end(&mut ausgabe)?;

    if ausgabe.len() > MAX_PAKET_GROESSE {
        return Err(CompressionError::ZuGross(ausgabe.len()));
    }
    Ok(ausgabe)
}

/// Liefert die Position des ersten Markers in `daten`
pub fn marker_finden(daten: &[u8]) -> Option<usize> {
    daten
        .windows(KOMPRESSIONS_MARKER.len())
        .position(|w| w == KOMPRESSIONS_MARKER)
}

/// Laenge des laengsten Endstuecks von `daten`, das ein echter Marker-Anfang ist
///
/// Diese Bytes muessen bis zum naechsten Lesevorgang zurueckgehalten werden,
/// sonst wird ein ueber die Lesegrenze geteilter Marker uebersehen.
pub fn marker_praefix_am_ende(daten: &[u8]) -> usize {
    let max = (KOMPRESSIONS_MARKER.len() - 1).min(daten.len());
    (1..=max)
        .rev()
        .find(|&n| daten[daten.len() - n..] == KOMPRESSIONS_MARKER[..n])
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// CompressionEnvelope
// ---------------------------------------------------------------------------

/// Sammelt die Bytes komprimierter Pakete ueber Lesegrenzen hinweg
///
/// Es ist hoechstens ein unvollstaendiges Paket in Arbeit. Fertige Pakete
/// landen in einer Queue und werden mit [`naechstes_paket`](Self::naechstes_paket)
/// in Eingangsreihenfolge abgeholt.
#[derive(Debug, Default)]
pub struct CompressionEnvelope {
    /// Bytes des aktuellen Pakets ab dem Marker
    puffer: Vec<u8>,
    /// Gesamtlaenge des aktuellen Pakets, sobald der Header gelesen ist
    erwartet: Option<usize>,
    /// Fertige Pakete (nur zlib-Daten)
    fertig: VecDeque<Vec<u8>>,
    /// Anzahl wegen ungueltiger Laenge verworfener Pakete
    ungueltig: u64,
}

impl CompressionEnvelope {
    /// Erstellt einen leeren Akkumulator
    pub fn neu() -> Self {
        Self::default()
    }

    /// Haelt der Akkumulator ein unvollstaendiges Paket?
    pub fn hat_daten(&self) -> bool {
        !self.puffer.is_empty()
    }

    /// Liegt mindestens ein vollstaendiges Paket bereit?
    pub fn ist_vollstaendig(&self) -> bool {
        !self.fertig.is_empty()
    }

    /// Ist der Header des aktuellen Pakets bereits vollstaendig?
    pub fn header_gelesen(&self) -> bool {
        self.erwartet.is_some()
    }

    /// Anzahl Bytes, die dem aktuellen Paket noch fehlen
    ///
    /// Solange der Header unvollstaendig ist, nur die fehlenden Header-Bytes.
    pub fn fehlend(&self) -> usize {
        match self.erwartet {
            Some(gesamt) => gesamt - self.puffer.len(),
            None => HEADER_GROESSE - self.puffer.len(),
        }
    }

    /// Anzahl der seit Erstellung verworfenen Pakete mit ungueltiger Laenge
    pub fn ungueltige_pakete(&self) -> u64 {
        self.ungueltig
    }

    /// Verwirft ein unvollstaendiges Paket
    pub fn reset(&mut self) {
        self.puffer.clear();
        self.erwartet = None;
    }

    /// Haengt Bytes an das aktuelle Paket an (oder beginnt ein neues)
    ///
    /// Ein neues Paket muss mit dem Marker beginnen. Es werden nur so viele
    /// Bytes verbraucht, wie das Paket laut Laengenfeld braucht; der
    /// Rueckgabewert ist die Anzahl verbrauchter Bytes.
    pub fn anhaengen(&mut self, daten: &[u8]) -> usize {
        let mut verbraucht = 0;

        if self.erwartet.is_none() {
            let n = (HEADER_GROESSE - self.puffer.len()).min(daten.len());
            self.puffer.extend_from_slice(&daten[..n]);
            verbraucht += n;

            if self.puffer.len() < HEADER_GROESSE {
                return verbraucht;
            }

            let laenge = u32::from_be_bytes([
                self.puffer[4],
                self.puffer[5],
                self.puffer[6],
                self.puffer[7],
            ]) as usize;

            if laenge > MAX_PAKET_GROESSE {
                tracing::warn!(laenge, "Komprimiertes Paket mit ungueltiger Laenge verworfen");
                self.ungueltig += 1;
                self.reset();
                return verbraucht;
            }
            self.erwartet = Some(HEADER_GROESSE + laenge);
        }

        let gesamt = self.erwartet.unwrap_or(HEADER_GROESSE);
        let n = (gesamt - self.puffer.len()).min(daten.len() - verbraucht);
        self.puffer
            .extend_from_slice(&daten[verbraucht..verbraucht + n]);
        verbraucht += n;

        if self.puffer.len() == gesamt {
            let paket = self.puffer.split_off(HEADER_GROESSE);
            self.fertig.push_back(paket);
            self.reset();
        }

        verbraucht
    }

    /// Entnimmt das naechste vollstaendige Paket
    pub fn naechstes_paket(&mut self) -> Option<Vec<u8>> {
        self.fertig.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn komprimieren_und_entpacken() {
        let text = b"<msg type=\"position\"><lat>50.03</lat></msg>".repeat(20);
        let paket = komprimieren(&text).unwrap();
        assert_eq!(&paket[..4], &KOMPRESSIONS_MARKER);
        assert!(paket.len() < text.len(), "Wiederholter Text muss schrumpfen");

        let laenge = u32::from_be_bytes([paket[4], paket[5], paket[6], paket[7]]) as usize;
        assert_eq!(laenge, paket.len() - HEADER_GROESSE);
        assert_eq!(dekomprimieren(&paket[HEADER_GROESSE..]).unwrap(), text);
    }

    #[test]
    fn entpacken_von_muell_schlaegt_fehl() {
        assert!(dekomprimieren(&[1, 2, 3, 4, 5]).is_err());
    }

    #[test]
    fn paket_ueber_mehrere_teile() {
        let paket = komprimieren(b"hallo welt").unwrap();
        let mut env = CompressionEnvelope::neu();

        let (a, b) = paket.split_at(5);
        assert_eq!(env.anhaengen(a), 5);
        assert!(env.hat_daten());
        assert!(!env.header_gelesen());
        assert!(!env.ist_vollstaendig());

        assert_eq!(env.anhaengen(b), b.len());
        assert!(!env.hat_daten());
        assert!(env.ist_vollstaendig());

        let zlib = env.naechstes_paket().unwrap();
        assert_eq!(dekomprimieren(&zlib).unwrap(), b"hallo welt");
        assert!(env.naechstes_paket().is_none());
    }

    #[test]
    fn nur_benoetigte_bytes_werden_verbraucht() {
        let mut daten = komprimieren(b"eins").unwrap();
        let laenge = daten.len();
        daten.extend_from_slice(b"<msg>rest</msg>");

        let mut env = CompressionEnvelope::neu();
        assert_eq!(env.anhaengen(&daten), laenge);
        assert!(env.ist_vollstaendig());
    }

    #[test]
    fn reset_verwirft_unvollstaendiges_paket() {
        let paket = komprimieren(b"abgebrochen").unwrap();
        let mut env = CompressionEnvelope::neu();
        env.anhaengen(&paket[..10]);
        assert!(env.hat_daten());
        env.reset();
        assert!(!env.hat_daten());
        assert_eq!(env.fehlend(), HEADER_GROESSE);
    }

    #[test]
    fn ungueltige_laenge_wird_verworfen() {
        let mut kopf = KOMPRESSIONS_MARKER.to_vec();
        kopf.extend_from_slice(&u32::MAX.to_be_bytes());
        let mut env = CompressionEnvelope::neu();
        assert_eq!(env.anhaengen(&kopf), HEADER_GROESSE);
        assert!(!env.hat_daten());
        assert_eq!(env.ungueltige_pakete(), 1);
    }

    #[test]
    fn marker_suche() {
        let mut daten = b"abc".to_vec();
        daten.extend_from_slice(&KOMPRESSIONS_MARKER);
        assert_eq!(marker_finden(&daten), Some(3));
        assert_eq!(marker_finden(b"kein marker"), None);
    }

    #[test]
    fn geteilter_marker_am_ende() {
        assert_eq!(marker_praefix_am_ende(b"text\xFF"), 1);
        assert_eq!(marker_praefix_am_ende(b"text\xFF\xC0\xDE"), 3);
        assert_eq!(marker_praefix_am_ende(b"text\xC0"), 0);
        assert_eq!(marker_praefix_am_ende(b""), 0);
    }
}
