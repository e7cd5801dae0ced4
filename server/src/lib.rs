//! skyrelay-server – Bibliotheks-Root
//!
//! Verdrahtet Sockets, Registry, Voice-Endpunkt und Worker-Pipeline und
//! stellt den oeffentlichen Einstiegspunkt fuer Integrationstests bereit.

pub mod config;

use anyhow::{Context, Result};
use config::ServerConfig;
use skyrelay_core::StatsSnapshot;
use skyrelay_signaling::{
    ConnectionRegistry, InboundEvent, OutboundMessage, Pipeline, ReadinessMultiplexer,
};
use skyrelay_voice::{
    InMemoryRoster, VoiceEndpoint, VoiceMixer, VoiceParticipants, VoicePeerResolver, VoiceRoster,
    VoiceSockets,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::{mpsc, watch};

/// Haelt den laufenden Server-Zustand zusammen
pub struct Server {
    pub config: ServerConfig,
}

/// Gebundener, laufender Server
pub struct LaufenderServer {
    pipeline: Pipeline,
    roster: Arc<InMemoryRoster>,
    voice_adressen: Vec<SocketAddr>,
    shutdown: watch::Sender<bool>,
}

impl Server {
    /// Erstellt einen neuen Server aus der gegebenen Konfiguration
    pub fn neu(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Bindet alle Sockets und startet die Worker
    ///
    /// Reihenfolge:
    /// 1. TCP-Listener (Control-Protokoll)
    /// 2. Multiplexer und Registry
    /// 3. UDP-Sockets und Mixer (Voice, falls aktiviert)
    /// 4. Worker-Pipeline
    pub async fn binden(self) -> Result<LaufenderServer> {
        let config = self.config;
        config.validieren()?;

        let listener = tcp_listener(&config)?;
        let (mux, handle) = ReadinessMultiplexer::neu(config.verbindung.recycle_schwelle);
        let registry = Arc::new(ConnectionRegistry::neu(config.registry_config(), handle));
        let roster = Arc::new(InMemoryRoster::neu());

        let (voice, voice_adressen) = if config.voice.aktiviert {
            let adressen = config.voice_adressen()?;
            let sockets = VoiceSockets::binden(&adressen, config.netzwerk.voice_port)
                .await
                .context("Voice-Sockets konnten nicht gebunden werden")?;
            let lokal = sockets.lokale_adressen()?;

            let mixer = Arc::new(VoiceMixer::neu(
                Arc::clone(&roster) as Arc<dyn VoiceRoster>,
                Arc::clone(&registry) as Arc<dyn VoiceParticipants>,
                config.voice.self_echo,
            ));
            let endpunkt = VoiceEndpoint::neu(
                sockets,
                Arc::clone(&registry) as Arc<dyn VoicePeerResolver>,
                mixer,
                config.voice.ping_groesse,
            );
            (Some(Arc::new(endpunkt)), lokal)
        } else {
            tracing::info!("Voice deaktiviert");
            (None, Vec::new())
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let pipeline = Pipeline::starten(
            listener,
            registry,
            mux,
            voice,
            config.pipeline_config(),
            shutdown_rx,
        )?;

        tracing::info!(
            server_name = %config.server.name,
            tcp = %pipeline.lokale_adresse(),
            voice = ?voice_adressen,
            "Server gebunden"
        );

        Ok(LaufenderServer {
            pipeline,
            roster,
            voice_adressen,
            shutdown,
        })
    }

    /// Startet alle Server-Subsysteme und laeuft bis zum Shutdown-Signal
    pub async fn starten(self) -> Result<()> {
        let mut server = self.binden().await?;
        let ereignisse = server.inbound();

        tracing::info!("Server laeuft. Warte auf Shutdown-Signal (Ctrl-C)...");
        tokio::select! {
            signal = tokio::signal::ctrl_c() => signal?,
            _ = ereignisse_protokollieren(ereignisse) => {}
        }
        tracing::info!("Shutdown-Signal empfangen, Server wird beendet");

        server.beenden().await;
        Ok(())
    }
}

impl LaufenderServer {
    pub fn tcp_adresse(&self) -> SocketAddr {
        self.pipeline.lokale_adresse()
    }

    pub fn voice_adressen(&self) -> &[SocketAddr] {
        &self.voice_adressen
    }

    /// Kanaele und Mitgliedschaften fuer den Voice-Mixer
    pub fn roster(&self) -> &Arc<InMemoryRoster> {
        &self.roster
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.pipeline.registry()
    }

    /// Eingehende Ereignisse fuer die Befehlsschicht (nur einmal abholbar)
    pub fn inbound(&mut self) -> Option<mpsc::Receiver<InboundEvent>> {
        self.pipeline.inbound()
    }

    pub fn outbound(&self) -> mpsc::Sender<OutboundMessage> {
        self.pipeline.outbound()
    }

    /// Setzt das Shutdown-Signal, wartet auf alle Worker und liefert die Gesamtsummen
    pub async fn beenden(self) -> StatsSnapshot {
        let _ = self.shutdown.send(true);
        let summen = self.pipeline.beenden().await;
        tracing::info!(
            bytes_in = summen.bytes_in,
            bytes_out = summen.bytes_out,
            voice_in = summen.voice_in,
            "Server beendet"
        );
        summen
    }
}

/// Erstellt den TCP-Listener mit konfigurierten Puffergroessen
fn tcp_listener(config: &ServerConfig) -> Result<TcpListener> {
    let adresse = config.tcp_bind_adresse()?;
    let socket = match adresse {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    if config.netzwerk.socket_puffer > 0 {
        socket.set_send_buffer_size(config.netzwerk.socket_puffer)?;
        socket.set_recv_buffer_size(config.netzwerk.socket_puffer)?;
    }
    socket
        .bind(adresse)
        .with_context(|| format!("TCP-Adresse {adresse} nicht bindbar"))?;
    Ok(socket.listen(config.netzwerk.backlog)?)
}

/// Ohne Befehlsschicht werden eingehende Ereignisse nur protokolliert
async fn ereignisse_protokollieren(ereignisse: Option<mpsc::Receiver<InboundEvent>>) {
    let Some(mut ereignisse) = ereignisse else {
        return std::future::pending().await;
    };
    while let Some(ereignis) = ereignisse.recv().await {
        match ereignis {
            InboundEvent::Frame { id, text } => {
                tracing::debug!(conn = %id, bytes = text.len(), "Frame ohne Befehlsschicht")
            }
            anderes => tracing::debug!(ereignis = ?anderes, "Verbindungsereignis"),
        }
    }
    std::future::pending::<()>().await
}
