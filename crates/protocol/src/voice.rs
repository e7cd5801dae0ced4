//! Voice-Protokoll (UDP)
//!
//! Definiert die binaere Paketstruktur fuer die Sprachuebertragung via UDP.
//! Der Server dekodiert jedes Paket, prueft Identitaet und Integritaet und
//! leitet es unveraendert (Nutzdaten + Pruefsumme) an die Empfaenger weiter.
//!
//! ## Paketformat (big-endian, kein serde)
//!
//! ```text
//! Offset  Len  Beschreibung
//! ------  ---  -----------
//!  0       4   Magic "SRVX"
//!  4       1   Version
//!  5       8   Absender-ID (Verbindungs-ID)
//! 13       1   Laenge des Kanalnamens (K)
//! 14       K   Kanalname (UTF-8)
//!  +       1   Kompression (0 = PCM, 1 = Opus, 2 = Speex)
//!  +       8   Sequenz-ID
//!  +       1   Abtastraten-Code
//!  +       8   Breitengrad (f64)
//!  +       8   Laengengrad (f64)
//!  +       4   CRC-32 der Nutzdaten
//!  +       2   Nutzdaten-Laenge (N)
//!  +       N   Nutzdaten
//! ```
//!
//! Breiten- und Laengengrad 0/0 bedeuten "keine Position".

use flate2::Crc;
use skyrelay_core::{ConnectionId, GeoPosition};
use thiserror::Error;

/// Magic-Header jedes Voice-Pakets
pub const MAGIC: [u8; 4] = *b"SRVX";

/// Aktuelle Protokollversion
pub const PROTOKOLL_VERSION: u8 = 1;

/// Maximale Nutzdaten-Laenge (1280 Bytes, typisches Opus-MTU-Limit)
pub const MAX_NUTZDATEN_LAENGE: usize = 1280;

/// Maximale Laenge des Kanalnamens
pub const MAX_KANALNAME_LAENGE: usize = 64;

/// Feste Header-Groesse ohne Kanalname und Nutzdaten
pub const FESTER_HEADER: usize = 4 + 1 + 8 + 1 + 1 + 8 + 1 + 8 + 8 + 4 + 2;

/// Datagramme bis zu dieser Groesse sind Pings (kleiner als jedes Voice-Paket
/// mit Kanalname und Nutzdaten)
pub const MAX_PING_GROESSE: usize = 47;

// ---------------------------------------------------------------------------
// Fehler
// ---------------------------------------------------------------------------

/// Einziger Fehlertyp beim Dekodieren – der Aufrufer verwirft nur das Paket
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Ungueltiges Voice-Paket: {grund}")]
pub struct VoiceDecodeError {
    pub grund: String,
}

impl VoiceDecodeError {
    fn neu(grund: impl Into<String>) -> Self {
        Self {
            grund: grund.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Kompression und Abtastrate
// ---------------------------------------------------------------------------

/// Audio-Kompression der Nutzdaten
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VoiceCompression {
    /// Unkomprimiertes PCM
    Pcm = 0,
    /// Opus
    Opus = 1,
    /// Speex (aeltere Clients)
    Speex = 2,
}

impl VoiceCompression {
    /// Konvertiert ein Byte in eine `VoiceCompression`.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Pcm),
            1 => Some(Self::Opus),
            2 => Some(Self::Speex),
            _ => None,
        }
    }
}

/// Abtastrate als Code auf dem Draht
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SampleRate {
    Hz8000 = 0,
    Hz16000 = 1,
    Hz32000 = 2,
    Hz48000 = 3,
}

impl SampleRate {
    /// Konvertiert ein Byte in eine `SampleRate`.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Hz8000),
            1 => Some(Self::Hz16000),
            2 => Some(Self::Hz32000),
            3 => Some(Self::Hz48000),
            _ => None,
        }
    }

    /// Abtastrate in Hertz
    pub fn hertz(&self) -> u32 {
        match self {
            Self::Hz8000 => 8000,
            Self::Hz16000 => 16000,
            Self::Hz32000 => 32000,
            Self::Hz48000 => 48000,
        }
    }
}

/// CRC-32 (IEEE) ueber die Nutzdaten
pub fn crc32(daten: &[u8]) -> u32 {
    let mut crc = Crc::new();
    crc.update(daten);
    crc.sum()
}

// ---------------------------------------------------------------------------
// Leser
// ---------------------------------------------------------------------------

/// Sequentieller Leser ueber ein Byte-Slice
struct Leser<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Leser<'a> {
    fn neu(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn bytes(&mut self, n: usize, feld: &str) -> Result<&'a [u8], VoiceDecodeError> {
        if self.buf.len() - self.pos < n {
            return Err(VoiceDecodeError::neu(format!(
                "zu kurz fuer {feld}: {} Bytes uebrig, {n} benoetigt",
                self.buf.len() - self.pos
            )));
        }
        let teil = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(teil)
    }

    fn u8(&mut self, feld: &str) -> Result<u8, VoiceDecodeError> {
        Ok(self.bytes(1, feld)?[0])
    }

    fn u16(&mut self, feld: &str) -> Result<u16, VoiceDecodeError> {
        let b = self.bytes(2, feld)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self, feld: &str) -> Result<u32, VoiceDecodeError> {
        let b = self.bytes(4, feld)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self, feld: &str) -> Result<u64, VoiceDecodeError> {
        let b = self.bytes(8, feld)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    fn f64(&mut self, feld: &str) -> Result<f64, VoiceDecodeError> {
        Ok(f64::from_bits(self.u64(feld)?))
    }
}

// ---------------------------------------------------------------------------
// VoicePacket
// ---------------------------------------------------------------------------

/// Vollstaendiges, dekodiertes Voice-Paket
///
/// Unveraenderlich nach dem Dekodieren. `encode` schreibt Nutzdaten und
/// Pruefsumme byte-identisch zurueck.
#[derive(Debug, Clone, PartialEq)]
pub struct VoicePacket {
    pub version: u8,
    pub absender: ConnectionId,
    pub kanal: String,
    pub kompression: VoiceCompression,
    pub sequenz: u64,
    pub abtastrate: SampleRate,
    pub position: Option<GeoPosition>,
    pub crc: u32,
    pub payload: Vec<u8>,
}

impl VoicePacket {
    /// Erstellt ein Paket und berechnet die Pruefsumme der Nutzdaten
    pub fn neu(
        absender: ConnectionId,
        kanal: impl Into<String>,
        sequenz: u64,
        position: Option<GeoPosition>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            version: PROTOKOLL_VERSION,
            absender,
            kanal: kanal.into(),
            kompression: VoiceCompression::Opus,
            sequenz,
            abtastrate: SampleRate::Hz16000,
            position,
            crc: crc32(&payload),
            payload,
        }
    }

    /// Serialisiert das gesamte Paket in einen Byte-Vec
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.groesse());
        buf.extend_from_slice(&MAGIC);
        buf.push(self.version);
        buf.extend_from_slice(&self.absender.inner().to_be_bytes());
        buf.push(self.kanal.len() as u8);
        buf.extend_from_slice(self.kanal.as_bytes());
        buf.push(self.kompression as u8);
        buf.extend_from_slice(&self.sequenz.to_be_bytes());
        buf.push(self.abtastrate as u8);
        let (lat, lon) = self.position.map(|p| (p.lat, p.lon)).unwrap_or((0.0, 0.0));
        buf.extend_from_slice(&lat.to_bits().to_be_bytes());
        buf.extend_from_slice(&lon.to_bits().to_be_bytes());
        buf.extend_from_slice(&self.crc.to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Deserialisiert und validiert ein Paket gegen die Identitaet der Session
    ///
    /// # Fehler
    /// - falscher Magic-Header oder unbekannte Version
    /// - Absender oder Kanal weichen von der Session ab (Identitaetsfaelschung)
    /// - unbekannte Kompression oder Abtastrate
    /// - Nutzdaten kuerzer als angegeben oder zu lang
    /// - CRC-32 stimmt nicht mit den Nutzdaten ueberein
    pub fn decode(
        buf: &[u8],
        erwarteter_absender: ConnectionId,
        erwarteter_kanal: &str,
    ) -> Result<Self, VoiceDecodeError> {
        let mut r = Leser::neu(buf);

        if r.bytes(MAGIC.len(), "Magic")? != MAGIC {
            return Err(VoiceDecodeError::neu("falscher Magic-Header"));
        }
        let version = r.u8("Version")?;
        if version != PROTOKOLL_VERSION {
            return Err(VoiceDecodeError::neu(format!(
                "Version {version} nicht unterstuetzt (erwartet {PROTOKOLL_VERSION})"
            )));
        }

        let absender = ConnectionId(r.u64("Absender")?);
        if absender != erwarteter_absender {
            return Err(VoiceDecodeError::neu(format!(
                "Absender {absender} passt nicht zur Session {erwarteter_absender}"
            )));
        }

        let kanal_laenge = r.u8("Kanal-Laenge")? as usize;
        let kanal = std::str::from_utf8(r.bytes(kanal_laenge, "Kanal")?)
            .map_err(|_| VoiceDecodeError::neu("Kanalname ist kein UTF-8"))?;
        if kanal != erwarteter_kanal {
            return Err(VoiceDecodeError::neu(format!(
                "Kanal '{kanal}' passt nicht zur Session ('{erwarteter_kanal}')"
            )));
        }

        let kompression_code = r.u8("Kompression")?;
        let kompression = VoiceCompression::from_u8(kompression_code).ok_or_else(|| {
            VoiceDecodeError::neu(format!("unbekannte Kompression {kompression_code}"))
        })?;
        let sequenz = r.u64("Sequenz")?;
        let rate_code = r.u8("Abtastrate")?;
        let abtastrate = SampleRate::from_u8(rate_code)
            .ok_or_else(|| VoiceDecodeError::neu(format!("unbekannte Abtastrate {rate_code}")))?;
        let lat = r.f64("Breitengrad")?;
        let lon = r.f64("Laengengrad")?;
        let crc = r.u32("CRC")?;

        let laenge = r.u16("Nutzdaten-Laenge")? as usize;
        if laenge > MAX_NUTZDATEN_LAENGE {
            return Err(VoiceDecodeError::neu(format!(
                "Nutzdaten zu lang: {laenge} Bytes (Maximum {MAX_NUTZDATEN_LAENGE})"
            )));
        }
        let payload = r.bytes(laenge, "Nutzdaten")?.to_vec();

        let berechnet = crc32(&payload);
        if berechnet != crc {
            return Err(VoiceDecodeError::neu(format!(
                "CRC-32 falsch: erwartet {crc:08x}, berechnet {berechnet:08x}"
            )));
        }

        Ok(Self {
            version,
            absender,
            kanal: kanal.to_string(),
            kompression,
            sequenz,
            abtastrate,
            position: GeoPosition::aus_draht(lat, lon),
            crc,
            payload,
        })
    }

    /// Gesamtgroesse des Paketes in Bytes
    pub fn groesse(&self) -> usize {
        FESTER_HEADER + self.kanal.len() + self.payload.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const ABSENDER: ConnectionId = ConnectionId(7);

    fn test_paket() -> VoicePacket {
        VoicePacket::neu(
            ABSENDER,
            "EDDF Approach",
            100,
            Some(GeoPosition::neu(50.03, 8.57)),
            vec![0xAB; 120],
        )
    }

    #[test]
    fn encode_decode_erhaelt_nutzdaten_und_pruefsumme() {
        let paket = test_paket();
        let bytes = paket.encode();
        assert_eq!(bytes.len(), paket.groesse());

        let decoded = VoicePacket::decode(&bytes, ABSENDER, "EDDF Approach").unwrap();
        assert_eq!(decoded, paket);

        let erneut = decoded.encode();
        assert_eq!(erneut, bytes, "Re-Encode muss byte-identisch sein");
    }

    #[test]
    fn gekipptes_nutzdaten_bit_ist_integritaetsfehler() {
        let mut bytes = test_paket().encode();
        let letztes = bytes.len() - 1;
        bytes[letztes] ^= 0x01;

        let err = VoicePacket::decode(&bytes, ABSENDER, "EDDF Approach").unwrap_err();
        assert!(err.grund.contains("CRC"), "{err}");
    }

    #[test]
    fn falscher_absender_wird_abgelehnt() {
        let bytes = test_paket().encode();
        let err = VoicePacket::decode(&bytes, ConnectionId(8), "EDDF Approach").unwrap_err();
        assert!(err.grund.contains("Absender"));
    }

    #[test]
    fn falscher_kanal_wird_abgelehnt() {
        let bytes = test_paket().encode();
        let err = VoicePacket::decode(&bytes, ABSENDER, "EGLL Tower").unwrap_err();
        assert!(err.grund.contains("Kanal"));
    }

    #[test]
    fn falscher_magic_und_version() {
        let mut bytes = test_paket().encode();
        bytes[0] = b'X';
        assert!(VoicePacket::decode(&bytes, ABSENDER, "EDDF Approach").is_err());

        let mut bytes = test_paket().encode();
        bytes[4] = 9;
        let err = VoicePacket::decode(&bytes, ABSENDER, "EDDF Approach").unwrap_err();
        assert!(err.grund.contains("Version"));
    }

    #[test]
    fn abgeschnittene_nutzdaten() {
        let bytes = test_paket().encode();
        let err = VoicePacket::decode(&bytes[..bytes.len() - 10], ABSENDER, "EDDF Approach")
            .unwrap_err();
        assert!(err.grund.contains("Nutzdaten"));
    }

    #[test]
    fn position_null_null_ist_unbekannt() {
        let mut paket = test_paket();
        paket.position = None;
        let bytes = paket.encode();
        let decoded = VoicePacket::decode(&bytes, ABSENDER, "EDDF Approach").unwrap();
        assert!(decoded.position.is_none());

        paket.position = Some(GeoPosition::neu(0.0, 10.0));
        let decoded = VoicePacket::decode(&paket.encode(), ABSENDER, "EDDF Approach").unwrap();
        assert_eq!(decoded.position, Some(GeoPosition::neu(0.0, 10.0)));
    }

    #[test]
    fn unbekannte_kompression() {
        let mut bytes = test_paket().encode();
        let offset = 14 + "EDDF Approach".len();
        bytes[offset] = 77;
        let err = VoicePacket::decode(&bytes, ABSENDER, "EDDF Approach").unwrap_err();
        assert!(err.grund.contains("Kompression"));
    }

    #[test]
    fn kleinstes_paket_ist_groesser_als_ping() {
        let paket = VoicePacket::neu(ABSENDER, "A", 0, None, vec![0]);
        assert!(paket.groesse() > MAX_PING_GROESSE);
    }

    #[test]
    fn crc32_bekannter_wert() {
        // Standard-Pruefwert fuer CRC-32/IEEE
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }
}
