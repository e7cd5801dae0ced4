//! Voice-Worker – empfaengt Datagramme auf allen Voice-Sockets

use futures_util::FutureExt;
use skyrelay_voice::{DatagramErgebnis, MixOutcome, VoiceEndpoint};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_stream::StreamExt;

use super::{shutdown_geaendert, Kontext, WorkerZustand};

/// Obergrenze fuer Datagramme pro Durchlauf
const MAX_PRO_DURCHLAUF: usize = 512;

pub(crate) async fn laufen(
    endpunkt: Arc<VoiceEndpoint>,
    kontext: Arc<Kontext>,
    mut shutdown: watch::Receiver<bool>,
) {
    let status = kontext.board.anmelden("voice");
    let mut streams = endpunkt.sockets().empfangs_streams();

    loop {
        if *shutdown.borrow() {
            break;
        }
        status.setzen(WorkerZustand::Wartet);

        let erstes = tokio::select! {
            eintrag = streams.next() => match eintrag {
                Some(e) => Some(e),
                None => {
                    tracing::error!("Alle Voice-Sockets geschlossen");
                    break;
                }
            },
            _ = tokio::time::sleep(kontext.config.poll_timeout) => None,
            beenden = shutdown_geaendert(&mut shutdown) => {
                if beenden {
                    break;
                }
                None
            }
        };

        status.setzen(WorkerZustand::Arbeitet);
        let mut naechstes = erstes;
        let mut verarbeitet = 0;
        while let Some((index, ergebnis)) = naechstes.take() {
            match ergebnis {
                Ok((daten, absender)) => {
                    let ergebnis = endpunkt.datagramm_verarbeiten(index, &daten, absender).await;
                    protokollieren(&ergebnis);
                }
                Err(e) => tracing::debug!(socket_index = index, fehler = %e, "Voice-Empfangsfehler"),
            }

            verarbeitet += 1;
            if verarbeitet >= MAX_PRO_DURCHLAUF {
                break;
            }
            naechstes = streams.next().now_or_never().flatten();
        }
        status.iteration();
    }

    status.setzen(WorkerZustand::Gestoppt);
    tracing::info!("Voice-Worker beendet");
}

fn protokollieren(ergebnis: &DatagramErgebnis) {
    match ergebnis {
        DatagramErgebnis::Gemischt(MixOutcome::Verteilt {
            sequenz,
            sequenz_anomalie: true,
            ..
        }) => tracing::debug!(sequenz, "Sequenz-Anomalie"),
        DatagramErgebnis::Gemischt(MixOutcome::Ungueltig(e)) => {
            tracing::debug!(grund = %e.grund, "Ungueltiges Voice-Paket")
        }
        _ => {}
    }
}
