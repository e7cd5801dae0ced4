//! Worker-Status – Zustand und Fortschritt jedes Workers
//!
//! Jeder Worker meldet sich beim [`WorkerBoard`] an und aktualisiert pro
//! Iteration seinen [`WorkerStatus`]. Das Board liefert Momentaufnahmen fuer
//! Logging und Tests.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Zustand eines Workers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerZustand {
    Startet,
    /// Wartet auf Bereitschaft (Multiplexer, Queue, Accept)
    Wartet,
    /// Verarbeitet bereite Arbeit
    Arbeitet,
    Gestoppt,
}

impl std::fmt::Display for WorkerZustand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Startet => "startet",
            Self::Wartet => "wartet",
            Self::Arbeitet => "arbeitet",
            Self::Gestoppt => "gestoppt",
        };
        f.write_str(s)
    }
}

/// Laufender Status eines einzelnen Workers
#[derive(Debug)]
pub struct WorkerStatus {
    name: String,
    zustand: Mutex<WorkerZustand>,
    iterationen: AtomicU64,
    letzte_aktivitaet: Mutex<Instant>,
}

impl WorkerStatus {
    fn neu(name: String) -> Self {
        Self {
            name,
            zustand: Mutex::new(WorkerZustand::Startet),
            iterationen: AtomicU64::new(0),
            letzte_aktivitaet: Mutex::new(Instant::now()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn setzen(&self, zustand: WorkerZustand) {
        *self.zustand.lock() = zustand;
        if zustand == WorkerZustand::Arbeitet {
            *self.letzte_aktivitaet.lock() = Instant::now();
        }
    }

    pub fn zustand(&self) -> WorkerZustand {
        *self.zustand.lock()
    }

    /// Zaehlt eine abgeschlossene Schleifen-Iteration
    pub fn iteration(&self) {
        self.iterationen.fetch_add(1, Ordering::Relaxed);
    }

    pub fn iterationen(&self) -> u64 {
        self.iterationen.load(Ordering::Relaxed)
    }

    pub fn letzte_aktivitaet(&self) -> Instant {
        *self.letzte_aktivitaet.lock()
    }
}

/// Momentaufnahme eines Workers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub name: String,
    pub zustand: WorkerZustand,
    pub iterationen: u64,
    pub untaetig: Duration,
}

/// Sammelstelle aller Worker-Status
#[derive(Debug, Default)]
pub struct WorkerBoard {
    worker: DashMap<String, Arc<WorkerStatus>>,
}

impl WorkerBoard {
    pub fn neu() -> Self {
        Self::default()
    }

    /// Meldet einen Worker an (ersetzt einen gleichnamigen Eintrag)
    pub fn anmelden(&self, name: impl Into<String>) -> Arc<WorkerStatus> {
        let status = Arc::new(WorkerStatus::neu(name.into()));
        self.worker
            .insert(status.name.clone(), Arc::clone(&status));
        status
    }

    pub fn abmelden(&self, name: &str) {
        self.worker.remove(name);
    }

    pub fn get(&self, name: &str) -> Option<Arc<WorkerStatus>> {
        self.worker.get(name).map(|s| Arc::clone(s.value()))
    }

    /// Anzahl Worker, die noch nicht gestoppt sind
    pub fn aktive(&self) -> usize {
        self.worker
            .iter()
            .filter(|s| s.zustand() != WorkerZustand::Gestoppt)
            .count()
    }

    /// Momentaufnahme aller Worker, sortiert nach Name
    pub fn snapshot(&self) -> Vec<WorkerInfo> {
        let jetzt = Instant::now();
        let mut infos: Vec<WorkerInfo> = self
            .worker
            .iter()
            .map(|s| WorkerInfo {
                name: s.name.clone(),
                zustand: s.zustand(),
                iterationen: s.iterationen(),
                untaetig: jetzt.saturating_duration_since(s.letzte_aktivitaet()),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anmelden_und_zustaende() {
        let board = WorkerBoard::neu();
        let lesen = board.anmelden("lesen");
        let accept = board.anmelden("accept");

        lesen.setzen(WorkerZustand::Wartet);
        lesen.iteration();
        lesen.iteration();
        accept.setzen(WorkerZustand::Gestoppt);

        assert_eq!(board.aktive(), 1);
        let snap = board.snapshot();
        assert_eq!(snap[0].name, "accept");
        assert_eq!(snap[0].zustand, WorkerZustand::Gestoppt);
        assert_eq!(snap[1].iterationen, 2);
        assert_eq!(snap[1].zustand.to_string(), "wartet");

        board.abmelden("accept");
        assert!(board.get("accept").is_none());
        assert_eq!(board.snapshot().len(), 1);
    }
}
