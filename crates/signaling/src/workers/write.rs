//! Schreib-Pool – verteilt ausgehende Nachrichten auf die Verbindungskanaele
//!
//! Zwischen `write_pool_min` und `write_pool_max` Worker teilen sich die
//! Ausgangs-Queue. Der Pool waechst, wenn der Rueckstand die Anzahl aktiver
//! Worker uebersteigt; ueberzaehlige Worker beenden sich nach einer
//! Leerlaufzeit.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;

use super::{shutdown_geaendert, Kontext, OutboundMessage, WorkerZustand};

struct WritePool {
    queue: Mutex<mpsc::Receiver<OutboundMessage>>,
    aktive: AtomicUsize,
    naechste_nr: AtomicUsize,
    kontext: Arc<Kontext>,
}

/// Startet die Mindestanzahl Worker und ueberwacht den Rueckstand
pub(crate) async fn pool_laufen(
    outbound_rx: mpsc::Receiver<OutboundMessage>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    kontext: Arc<Kontext>,
    mut shutdown: watch::Receiver<bool>,
) {
    let min = kontext.config.write_pool_min.max(1);
    let max = kontext.config.write_pool_max.max(min);
    let status = kontext.board.anmelden("schreiben-pool");

    let pool = Arc::new(WritePool {
        queue: Mutex::new(outbound_rx),
        aktive: AtomicUsize::new(0),
        naechste_nr: AtomicUsize::new(0),
        kontext: Arc::clone(&kontext),
    });

    let mut worker = Vec::new();
    for _ in 0..min {
        worker.push(worker_starten(&pool, shutdown.clone()));
    }

    loop {
        if *shutdown.borrow() {
            break;
        }
        status.setzen(WorkerZustand::Wartet);

        tokio::select! {
            _ = tokio::time::sleep(kontext.config.poll_timeout) => {}
            beenden = shutdown_geaendert(&mut shutdown) => {
                if beenden {
                    break;
                }
            }
        }

        status.setzen(WorkerZustand::Arbeitet);
        let rueckstand = outbound_tx.max_capacity() - outbound_tx.capacity();
        let aktive = pool.aktive.load(Ordering::Acquire);
        if rueckstand > aktive && aktive < max {
            tracing::debug!(rueckstand, aktive, "Schreib-Pool waechst");
            worker.push(worker_starten(&pool, shutdown.clone()));
        }
        worker.retain(|w| !w.is_finished());
        status.iteration();
    }

    for w in worker {
        let _ = w.await;
    }
    status.setzen(WorkerZustand::Gestoppt);
    tracing::info!("Schreib-Pool beendet");
}

fn worker_starten(
    pool: &Arc<WritePool>,
    shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    pool.aktive.fetch_add(1, Ordering::AcqRel);
    let nr = pool.naechste_nr.fetch_add(1, Ordering::Relaxed);
    tokio::spawn(worker_laufen(Arc::clone(pool), nr, shutdown))
}

async fn worker_laufen(pool: Arc<WritePool>, nr: usize, shutdown: watch::Receiver<bool>) {
    let name = format!("schreiben-{nr}");
    let kontext = &pool.kontext;
    let status = kontext.board.anmelden(name.clone());
    let min = kontext.config.write_pool_min.max(1);
    let mut letzte_arbeit = Instant::now();

    loop {
        if *shutdown.borrow() {
            pool.aktive.fetch_sub(1, Ordering::AcqRel);
            break;
        }
        status.setzen(WorkerZustand::Wartet);

        let mut queue = pool.queue.lock().await;
        let nachricht = match tokio::time::timeout(kontext.config.poll_timeout, queue.recv()).await {
            Ok(Some(n)) => n,
            Ok(None) => {
                pool.aktive.fetch_sub(1, Ordering::AcqRel);
                break;
            }
            Err(_) => {
                drop(queue);
                status.iteration();
                let untaetig = letzte_arbeit.elapsed() >= kontext.config.write_pool_leerlauf;
                if untaetig
                    && pool
                        .aktive
                        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                            (n > min).then(|| n - 1)
                        })
                        .is_ok()
                {
                    tracing::debug!(worker = %name, "Ueberzaehliger Schreib-Worker beendet");
                    break;
                }
                continue;
            }
        };

        status.setzen(WorkerZustand::Arbeitet);
        letzte_arbeit = Instant::now();
        zustellen(kontext, queue, nachricht);
        status.iteration();
    }

    status.setzen(WorkerZustand::Gestoppt);
    kontext.board.abmelden(&name);
}

/// Kodiert und reiht eine Nachricht ein
///
/// Die Reihenfolge-Sperre der Verbindung wird genommen, bevor die Queue
/// freigegeben wird.
fn zustellen(
    kontext: &Kontext,
    queue: tokio::sync::MutexGuard<'_, mpsc::Receiver<OutboundMessage>>,
    nachricht: OutboundMessage,
) {
    let id = nachricht.connection_id;
    let Some(verbindung) = kontext.registry.get(id) else {
        drop(queue);
        tracing::debug!(conn = %id, "Nachricht an unbekannte Verbindung verworfen");
        return;
    };

    let _reihenfolge = verbindung.reihenfolge_sperren();
    drop(queue);

    match verbindung.senden(&nachricht.text, nachricht.kritisch) {
        Ok(()) => {}
        Err(e) if e.ist_verbindungslokal() => {
            tracing::debug!(conn = %id, fehler = %e, kritisch = nachricht.kritisch, "Senden fehlgeschlagen");
        }
        Err(e) => tracing::warn!(conn = %id, fehler = %e, "Senden fehlgeschlagen"),
    }
}
