//! Statistik-Worker – aggregiert die Zaehler aller Verbindungen periodisch

use parking_lot::Mutex;
use skyrelay_core::{ConnectionId, StatsSnapshot};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

use super::{shutdown_geaendert, Kontext, WorkerZustand};
use crate::connection::Connection;

/// Merkt sich pro Verbindung den Snapshot des letzten Intervalls
#[derive(Debug, Default)]
pub(crate) struct Aggregator {
    vorher: HashMap<ConnectionId, StatsSnapshot>,
}

impl Aggregator {
    /// Summiert die Aktivitaet seit dem letzten Aufruf
    ///
    /// Neue Verbindungen zaehlen ab ihrem Start, verschwundene werden
    /// vergessen.
    pub fn intervall(&mut self, verbindungen: &[Arc<Connection>]) -> StatsSnapshot {
        let mut summe = StatsSnapshot::leer();
        let mut aktuell = HashMap::with_capacity(verbindungen.len());

        for verbindung in verbindungen {
            let snap = verbindung.stats().snapshot();
            let delta = match self.vorher.get(&verbindung.id()) {
                Some(alt) => snap.delta(alt),
                None => snap.delta(&StatsSnapshot::leer()),
            };
            summe.merge(&delta);
            aktuell.insert(verbindung.id(), snap);
        }

        self.vorher = aktuell;
        summe
    }
}

pub(crate) async fn laufen(
    kontext: Arc<Kontext>,
    summen: Arc<Mutex<StatsSnapshot>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let status = kontext.board.anmelden("statistik");
    let mut aggregator = Aggregator::default();

    loop {
        if *shutdown.borrow() {
            break;
        }
        status.setzen(WorkerZustand::Wartet);

        tokio::select! {
            _ = tokio::time::sleep(kontext.config.stats_intervall) => {}
            beenden = shutdown_geaendert(&mut shutdown) => {
                if beenden {
                    break;
                }
                continue;
            }
        }

        status.setzen(WorkerZustand::Arbeitet);
        let verbindungen = kontext.registry.all();
        let delta = aggregator.intervall(&verbindungen);
        summen.lock().merge(&delta);

        let abgelehnt = kontext
            .voice
            .as_ref()
            .map(|v| v.abgelehnte_datagramme())
            .unwrap_or(0);

        tracing::info!(
            verbindungen = verbindungen.len(),
            worker = kontext.board.aktive(),
            bytes_in = delta.bytes_in,
            bytes_out = delta.bytes_out,
            frames_in = delta.frames_in,
            frames_out = delta.frames_out,
            bytes_gespart = delta.bytes_gespart,
            write_retries = delta.write_retries,
            puffer_resets = delta.puffer_resets,
            voice_in = delta.voice_in,
            voice_out = delta.voice_out,
            voice_verworfen = delta.voice_verworfen,
            udp_abgelehnt = abgelehnt,
            "Statistik-Intervall"
        );
        status.iteration();
    }

    // Letztes Teilintervall, solange die Verbindungen noch registriert sind
    let rest = aggregator.intervall(&kontext.registry.all());
    summen.lock().merge(&rest);

    status.setzen(WorkerZustand::Gestoppt);
    tracing::info!(bytes_in = rest.bytes_in, bytes_out = rest.bytes_out, "Statistik-Worker beendet");
}
