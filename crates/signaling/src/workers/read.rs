//! Lese-Worker – Frames aus dem Multiplexer, Trennungen und Idle-Pruefung

use skyrelay_core::ConnectionId;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use super::{shutdown_geaendert, InboundEvent, Kontext, TrennGrund, WorkerZustand};
use crate::multiplexer::{MuxEreignis, ReadinessMultiplexer};

pub(crate) async fn laufen(
    mut mux: ReadinessMultiplexer,
    mut fatal_rx: mpsc::UnboundedReceiver<ConnectionId>,
    kontext: Arc<Kontext>,
    mut shutdown: watch::Receiver<bool>,
) {
    let status = kontext.board.anmelden("lesen");
    let mut naechste_idle_pruefung = Instant::now() + kontext.config.idle_pruef_intervall;

    loop {
        if *shutdown.borrow() {
            break;
        }
        status.setzen(WorkerZustand::Wartet);

        let ereignisse = tokio::select! {
            ereignisse = mux.warten(kontext.config.poll_timeout) => ereignisse,
            beenden = shutdown_geaendert(&mut shutdown) => {
                if beenden {
                    break;
                }
                continue;
            }
        };

        status.setzen(WorkerZustand::Arbeitet);
        for ereignis in ereignisse {
            match ereignis {
                MuxEreignis::Frame(id, text) => {
                    if let Some(verbindung) = kontext.registry.get(id) {
                        verbindung.aktivitaet_melden(Instant::now());
                    }
                    kontext.melden(InboundEvent::Frame { id, text }).await;
                }
                MuxEreignis::Getrennt(id, None) => {
                    kontext.trennen(id, TrennGrund::Gegenseite).await;
                }
                MuxEreignis::Getrennt(id, Some(e)) => {
                    kontext
                        .trennen(id, TrennGrund::Lesefehler(e.to_string()))
                        .await;
                }
            }
        }

        while let Ok(id) = fatal_rx.try_recv() {
            kontext.trennen(id, TrennGrund::Schreibfehler).await;
        }

        let jetzt = Instant::now();
        if jetzt >= naechste_idle_pruefung {
            for verbindung in kontext.registry.check_idle(jetzt) {
                if let Some(voice) = &kontext.voice {
                    voice.mixer().absender_vergessen(verbindung.id());
                }
                kontext
                    .melden(InboundEvent::Getrennt {
                        id: verbindung.id(),
                        grund: TrennGrund::Idle,
                    })
                    .await;
            }
            naechste_idle_pruefung = jetzt + kontext.config.idle_pruef_intervall;
        }

        if mux.should_recycle() {
            mux.recycle();
        }
        status.iteration();
    }

    status.setzen(WorkerZustand::Gestoppt);
    tracing::info!("Lese-Worker beendet");
}
