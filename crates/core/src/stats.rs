//! Verbindungs-Statistiken
//!
//! Pro Verbindung werden Zaehler atomar hochgezaehlt. Fuer die periodische
//! Aggregation wird ein unveraenderlicher `StatsSnapshot` gezogen; die
//! Differenz zweier Snapshots ergibt die Aktivitaet im Intervall.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Atomare Zaehler einer Verbindung
#[derive(Debug)]
pub struct Stats {
    gestartet: Instant,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    /// Durch Kompression eingesparte Bytes (kann negativ werden)
    bytes_gespart: AtomicI64,
    write_retries: AtomicU64,
    puffer_resets: AtomicU64,
    voice_in: AtomicU64,
    voice_out: AtomicU64,
    voice_verworfen: AtomicU64,
}

impl Stats {
    /// Erstellt leere Zaehler, Startzeitpunkt = jetzt
    pub fn neu() -> Self {
        Self {
            gestartet: Instant::now(),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            frames_in: AtomicU64::new(0),
            frames_out: AtomicU64::new(0),
            bytes_gespart: AtomicI64::new(0),
            write_retries: AtomicU64::new(0),
            puffer_resets: AtomicU64::new(0),
            voice_in: AtomicU64::new(0),
            voice_out: AtomicU64::new(0),
            voice_verworfen: AtomicU64::new(0),
        }
    }

    pub fn bytes_empfangen(&self, n: usize) {
        self.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn bytes_gesendet(&self, n: usize) {
        self.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn frame_empfangen(&self) {
        self.frames_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_gesendet(&self) {
        self.frames_out.fetch_add(1, Ordering::Relaxed);
    }

    /// Verbucht die Kompressions-Ersparnis (original - komprimiert, wie gemessen)
    pub fn kompression_verbuchen(&self, gespart: i64) {
        self.bytes_gespart.fetch_add(gespart, Ordering::Relaxed);
    }

    pub fn write_retry(&self) {
        self.write_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn puffer_reset(&self) {
        self.puffer_resets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn voice_empfangen(&self) {
        self.voice_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn voice_gesendet(&self) {
        self.voice_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn voice_verworfen(&self) {
        self.voice_verworfen.fetch_add(1, Ordering::Relaxed);
    }

    /// Zeit seit Erstellung der Zaehler
    pub fn uptime(&self) -> Duration {
        self.gestartet.elapsed()
    }

    /// Zieht einen unveraenderlichen Snapshot aller Zaehler
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            zeitpunkt: Instant::now(),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_out: self.frames_out.load(Ordering::Relaxed),
            bytes_gespart: self.bytes_gespart.load(Ordering::Relaxed),
            write_retries: self.write_retries.load(Ordering::Relaxed),
            puffer_resets: self.puffer_resets.load(Ordering::Relaxed),
            voice_in: self.voice_in.load(Ordering::Relaxed),
            voice_out: self.voice_out.load(Ordering::Relaxed),
            voice_verworfen: self.voice_verworfen.load(Ordering::Relaxed),
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::neu()
    }
}

// ---------------------------------------------------------------------------
// StatsSnapshot
// ---------------------------------------------------------------------------

/// Punktuelle Kopie der Zaehler einer Verbindung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub zeitpunkt: Instant,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub frames_in: u64,
    pub frames_out: u64,
    pub bytes_gespart: i64,
    pub write_retries: u64,
    pub puffer_resets: u64,
    pub voice_in: u64,
    pub voice_out: u64,
    pub voice_verworfen: u64,
}

impl StatsSnapshot {
    /// Leerer Snapshot (Ausgangspunkt fuer Summen und erste Deltas)
    pub fn leer() -> Self {
        Self {
            zeitpunkt: Instant::now(),
            bytes_in: 0,
            bytes_out: 0,
            frames_in: 0,
            frames_out: 0,
            bytes_gespart: 0,
            write_retries: 0,
            puffer_resets: 0,
            voice_in: 0,
            voice_out: 0,
            voice_verworfen: 0,
        }
    }

    /// Differenz zu einem aelteren Snapshot derselben Verbindung
    ///
    /// Zaehler sind monoton; sollte `aelter` dennoch groesser sein, wird auf 0
    /// begrenzt. Die Kompressions-Ersparnis wird vorzeichenbehaftet subtrahiert.
    pub fn delta(&self, aelter: &StatsSnapshot) -> StatsSnapshot {
        StatsSnapshot {
            zeitpunkt: self.zeitpunkt,
            bytes_in: self.bytes_in.saturating_sub(aelter.bytes_in),
            bytes_out: self.bytes_out.saturating_sub(aelter.bytes_out),
            frames_in: self.frames_in.saturating_sub(aelter.frames_in),
            frames_out: self.frames_out.saturating_sub(aelter.frames_out),
            bytes_gespart: self.bytes_gespart - aelter.bytes_gespart,
            write_retries: self.write_retries.saturating_sub(aelter.write_retries),
            puffer_resets: self.puffer_resets.saturating_sub(aelter.puffer_resets),
            voice_in: self.voice_in.saturating_sub(aelter.voice_in),
            voice_out: self.voice_out.saturating_sub(aelter.voice_out),
            voice_verworfen: self.voice_verworfen.saturating_sub(aelter.voice_verworfen),
        }
    }

    /// Addiert einen weiteren Snapshot (fuer Server-weite Summen)
    pub fn merge(&mut self, anderer: &StatsSnapshot) {
        self.bytes_in += anderer.bytes_in;
        self.bytes_out += anderer.bytes_out;
        self.frames_in += anderer.frames_in;
        self.frames_out += anderer.frames_out;
        self.bytes_gespart += anderer.bytes_gespart;
        self.write_retries += anderer.write_retries;
        self.puffer_resets += anderer.puffer_resets;
        self.voice_in += anderer.voice_in;
        self.voice_out += anderer.voice_out;
        self.voice_verworfen += anderer.voice_verworfen;
    }
}
