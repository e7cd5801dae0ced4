//! Accept-Worker – nimmt TCP-Verbindungen an und registriert sie

use skyrelay_core::Stats;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use super::{shutdown_geaendert, InboundEvent, Kontext, WorkerZustand};
use crate::connection::Connection;
use crate::control::ControlChannel;

pub(crate) async fn laufen(
    listener: TcpListener,
    kontext: Arc<Kontext>,
    mut shutdown: watch::Receiver<bool>,
) {
    let status = kontext.board.anmelden("accept");

    loop {
        if *shutdown.borrow() {
            break;
        }
        status.setzen(WorkerZustand::Wartet);

        tokio::select! {
            ergebnis = listener.accept() => {
                status.setzen(WorkerZustand::Arbeitet);
                match ergebnis {
                    Ok((stream, peer)) => annehmen(&kontext, stream, peer).await,
                    Err(e) => {
                        tracing::error!(fehler = %e, "TCP-Accept-Fehler");
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    }
                }
            }
            _ = tokio::time::sleep(kontext.config.poll_timeout) => {}
            beenden = shutdown_geaendert(&mut shutdown) => {
                if beenden {
                    break;
                }
            }
        }
        status.iteration();
    }

    status.setzen(WorkerZustand::Gestoppt);
    tracing::info!("Accept-Worker beendet");
}

async fn annehmen(kontext: &Kontext, stream: TcpStream, peer: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(peer = %peer, fehler = %e, "TCP_NODELAY nicht gesetzt");
    }

    let id = kontext.registry.naechste_id();
    let (reader, writer) = stream.into_split();
    let stats = Arc::new(Stats::neu());
    let control = ControlChannel::starten(
        id,
        writer,
        kontext.config.control_kanal.clone(),
        Arc::clone(&stats),
        Some(kontext.fatal_tx.clone()),
    );
    let verbindung = Arc::new(Connection::neu(
        id,
        peer,
        control,
        stats,
        kontext.config.voice_kanal.clone(),
    ));

    match kontext.registry.add(Arc::clone(&verbindung), reader) {
        Ok(()) => {
            tracing::info!(conn = %id, peer = %peer, "Neue Verbindung");
            kontext
                .melden(InboundEvent::Verbunden { id, remote: peer })
                .await;
        }
        Err(e) => {
            tracing::warn!(peer = %peer, fehler = %e, "Verbindung abgelehnt");
            verbindung.schliessen();
        }
    }
}
