//! Worker-Pipeline – Accept, Lesen, Schreiben, Voice und Statistik
//!
//! Jeder Worker ist ein tokio-Task mit derselben Schleife:
//!
//! ```text
//! warten (Multiplexer / Queue / Accept, begrenzt durch poll_timeout)
//!     |
//!     v
//! alles Bereite abarbeiten
//!     |
//!     v
//! Status melden, Shutdown pruefen, von vorn
//! ```
//!
//! Die Befehlsschicht sieht nur zwei Queues: eingehende Ereignisse
//! ([`InboundEvent`]) und ausgehende Nachrichten ([`OutboundMessage`]).

mod accept;
mod read;
mod stats;
pub mod status;
mod voice;
mod write;

pub use status::{WorkerBoard, WorkerInfo, WorkerStatus, WorkerZustand};

use parking_lot::Mutex;
use skyrelay_core::{ConnectionId, StatsSnapshot};
use skyrelay_voice::VoiceEndpoint;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::channel::ChannelConfig;
use crate::multiplexer::ReadinessMultiplexer;
use crate::registry::ConnectionRegistry;

// ---------------------------------------------------------------------------
// Ereignisse und Nachrichten
// ---------------------------------------------------------------------------

/// Grund fuer das Ende einer Verbindung
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrennGrund {
    /// Gegenseite hat geschlossen
    Gegenseite,
    Lesefehler(String),
    /// Schreib-Retries erschoepft oder Schreibfehler
    Schreibfehler,
    /// Idle-Zeitlimit ueberschritten
    Idle,
}

/// Ereignis fuer die Befehlsschicht
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Verbunden {
        id: ConnectionId,
        remote: SocketAddr,
    },
    /// Vollstaendiger Frame inklusive XML-Header
    Frame { id: ConnectionId, text: String },
    Getrennt { id: ConnectionId, grund: TrennGrund },
}

/// Ausgehende Textnachricht an eine Verbindung
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub connection_id: ConnectionId,
    pub text: String,
    pub kritisch: bool,
}

impl OutboundMessage {
    pub fn neu(connection_id: ConnectionId, text: impl Into<String>) -> Self {
        Self {
            connection_id,
            text: text.into(),
            kritisch: false,
        }
    }

    pub fn kritisch(mut self) -> Self {
        self.kritisch = true;
        self
    }
}

// ---------------------------------------------------------------------------
// Konfiguration
// ---------------------------------------------------------------------------

/// Parameter der Worker-Pipeline
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Obergrenze fuer jedes Warten auf Bereitschaft
    pub poll_timeout: Duration,
    pub inbound_queue: usize,
    pub outbound_queue: usize,
    pub write_pool_min: usize,
    pub write_pool_max: usize,
    /// Ueberzaehlige Schreib-Worker beenden sich nach dieser Leerlaufzeit
    pub write_pool_leerlauf: Duration,
    pub idle_pruef_intervall: Duration,
    pub stats_intervall: Duration,
    pub control_kanal: ChannelConfig,
    pub voice_kanal: ChannelConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(100),
            inbound_queue: 4096,
            outbound_queue: 4096,
            write_pool_min: 1,
            write_pool_max: 4,
            write_pool_leerlauf: Duration::from_secs(30),
            idle_pruef_intervall: Duration::from_secs(1),
            stats_intervall: Duration::from_secs(60),
            control_kanal: ChannelConfig::default(),
            voice_kanal: ChannelConfig::default(),
        }
    }
}

/// Gemeinsamer Kontext aller Worker
pub(crate) struct Kontext {
    pub registry: Arc<ConnectionRegistry>,
    pub board: Arc<WorkerBoard>,
    pub config: PipelineConfig,
    pub inbound_tx: mpsc::Sender<InboundEvent>,
    pub fatal_tx: mpsc::UnboundedSender<ConnectionId>,
    pub voice: Option<Arc<VoiceEndpoint>>,
}

impl Kontext {
    /// Leitet ein Ereignis an die Befehlsschicht weiter
    ///
    /// Wartet bei voller Queue; ohne Empfaenger wird verworfen.
    pub async fn melden(&self, ereignis: InboundEvent) {
        if self.inbound_tx.send(ereignis).await.is_err() {
            tracing::trace!("Kein Empfaenger fuer eingehende Ereignisse");
        }
    }

    /// Entfernt, schliesst und meldet eine getrennte Verbindung
    pub async fn trennen(&self, id: ConnectionId, grund: TrennGrund) {
        let Some(verbindung) = self.registry.remove(id) else {
            return;
        };
        verbindung.schliessen();
        if let Some(voice) = &self.voice {
            voice.mixer().absender_vergessen(id);
        }
        tracing::info!(conn = %id, peer = %verbindung.remote_addr(), grund = ?grund, "Verbindung getrennt");
        self.melden(InboundEvent::Getrennt { id, grund }).await;
    }
}

/// Wartet auf eine Aenderung des Shutdown-Signals
///
/// Liefert `true`, wenn beendet werden soll (Signal gesetzt oder Sender weg).
pub(crate) async fn shutdown_geaendert(shutdown: &mut watch::Receiver<bool>) -> bool {
    match shutdown.changed().await {
        Ok(()) => *shutdown.borrow(),
        Err(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Laufende Worker-Pipeline eines Servers
pub struct Pipeline {
    registry: Arc<ConnectionRegistry>,
    board: Arc<WorkerBoard>,
    summen: Arc<Mutex<StatsSnapshot>>,
    inbound_rx: Option<mpsc::Receiver<InboundEvent>>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    lokale_adresse: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Startet alle Worker
    ///
    /// Der Multiplexer muss zum Handle der `registry` gehoeren.
    pub fn starten(
        listener: TcpListener,
        registry: Arc<ConnectionRegistry>,
        mux: ReadinessMultiplexer,
        voice: Option<Arc<VoiceEndpoint>>,
        config: PipelineConfig,
        shutdown: watch::Receiver<bool>,
    ) -> std::io::Result<Self> {
        let lokale_adresse = listener.local_addr()?;
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue.max(1));
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_queue.max(1));
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let board = Arc::new(WorkerBoard::neu());
        let summen = Arc::new(Mutex::new(StatsSnapshot::leer()));

        let kontext = Arc::new(Kontext {
            registry: Arc::clone(&registry),
            board: Arc::clone(&board),
            config,
            inbound_tx,
            fatal_tx,
            voice: voice.clone(),
        });

        let mut tasks = vec![
            tokio::spawn(accept::laufen(listener, Arc::clone(&kontext), shutdown.clone())),
            tokio::spawn(read::laufen(mux, fatal_rx, Arc::clone(&kontext), shutdown.clone())),
            tokio::spawn(write::pool_laufen(
                outbound_rx,
                outbound_tx.clone(),
                Arc::clone(&kontext),
                shutdown.clone(),
            )),
            tokio::spawn(stats::laufen(
                Arc::clone(&kontext),
                Arc::clone(&summen),
                shutdown.clone(),
            )),
        ];
        if let Some(endpunkt) = voice {
            tasks.push(tokio::spawn(voice::laufen(
                endpunkt,
                Arc::clone(&kontext),
                shutdown,
            )));
        }

        tracing::info!(adresse = %lokale_adresse, "Worker-Pipeline gestartet");

        Ok(Self {
            registry,
            board,
            summen,
            inbound_rx: Some(inbound_rx),
            outbound_tx,
            lokale_adresse,
            tasks,
        })
    }

    /// Uebernimmt die Queue eingehender Ereignisse (nur einmal moeglich)
    pub fn inbound(&mut self) -> Option<mpsc::Receiver<InboundEvent>> {
        self.inbound_rx.take()
    }

    pub fn outbound(&self) -> mpsc::Sender<OutboundMessage> {
        self.outbound_tx.clone()
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn board(&self) -> &Arc<WorkerBoard> {
        &self.board
    }

    /// Server-weite Summe aller bisher aggregierten Statistik-Intervalle
    pub fn summen(&self) -> StatsSnapshot {
        *self.summen.lock()
    }

    pub fn lokale_adresse(&self) -> SocketAddr {
        self.lokale_adresse
    }

    /// Wartet auf alle Worker und schliesst verbleibende Verbindungen
    ///
    /// Das Shutdown-Signal muss vorher gesetzt sein. Liefert die
    /// Gesamtsummen einschliesslich des letzten Teilintervalls.
    pub async fn beenden(self) -> StatsSnapshot {
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(fehler = %e, "Worker-Task abgebrochen");
            }
        }
        let geschlossen = self.registry.alle_schliessen();
        tracing::info!(verbindungen = geschlossen, "Worker-Pipeline beendet");
        let summen = *self.summen.lock();
        summen
    }
}
