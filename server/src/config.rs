//! Server-Konfiguration
//!
//! Wird beim Start aus einer TOML-Datei geladen. Alle Felder haben
//! sinnvolle Standardwerte, sodass der Server ohne Konfigurationsdatei
//! lauffaehig ist.

use serde::{Deserialize, Serialize};
use skyrelay_core::CoreError;
use skyrelay_signaling::{ChannelConfig, PipelineConfig, RegistryConfig};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Vollstaendige Server-Konfiguration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Allgemeine Server-Einstellungen
    pub server: ServerEinstellungen,
    /// Sockets und Ports
    pub netzwerk: NetzwerkEinstellungen,
    /// Grenzen, Zeitlimits und Schreib-Retries pro Verbindung
    pub verbindung: VerbindungsEinstellungen,
    /// Voice-Verteilung
    pub voice: VoiceEinstellungen,
    /// Worker-Pipeline
    pub worker: WorkerEinstellungen,
    /// Logging-Einstellungen
    pub logging: LoggingEinstellungen,
}

/// Allgemeine Server-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerEinstellungen {
    /// Anzeigename des Servers
    pub name: String,
}

impl Default for ServerEinstellungen {
    fn default() -> Self {
        Self {
            name: "SkyRelay".into(),
        }
    }
}

/// Netzwerk-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetzwerkEinstellungen {
    /// Bind-Adresse fuer die Control-Verbindungen (TCP)
    pub bind_adresse: String,
    pub tcp_port: u16,
    /// Lokale Adressen fuer Voice-Sockets (leer = nur `bind_adresse`)
    pub voice_adressen: Vec<String>,
    pub voice_port: u16,
    /// Sende- und Empfangspuffer der TCP-Sockets in Bytes (0 = Systemwert)
    pub socket_puffer: u32,
    /// Backlog des TCP-Listeners
    pub backlog: u32,
}

impl Default for NetzwerkEinstellungen {
    fn default() -> Self {
        Self {
            bind_adresse: "0.0.0.0".into(),
            tcp_port: 6809,
            voice_adressen: vec![],
            voice_port: 3290,
            socket_puffer: 64 * 1024,
            backlog: 1024,
        }
    }
}

/// Einstellungen pro Verbindung
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerbindungsEinstellungen {
    pub max_verbindungen: usize,
    /// Idle-Zeitlimit vor der Anmeldung in Sekunden
    pub anonym_timeout_sek: u64,
    /// Idle-Zeitlimit nach der Anmeldung in Sekunden
    pub authentifiziert_timeout_sek: u64,
    /// Wartezeit pro Schreibversuch in Millisekunden
    pub write_timeout_ms: u64,
    /// Schreibversuche ohne Fortschritt bis zur Trennung
    pub max_write_retries: u32,
    pub close_timeout_ms: u64,
    /// Multiplexer-Zyklen bis zum Neuaufbau der Warte-Struktur (0 = nie)
    pub recycle_schwelle: u64,
}

impl Default for VerbindungsEinstellungen {
    fn default() -> Self {
        Self {
            max_verbindungen: 1024,
            anonym_timeout_sek: 45,
            authentifiziert_timeout_sek: 1800,
            write_timeout_ms: 225,
            max_write_retries: 24,
            close_timeout_ms: 750,
            recycle_schwelle: 10_000,
        }
    }
}

/// Voice-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceEinstellungen {
    pub aktiviert: bool,
    /// Datagramme bis zu dieser Groesse gelten als Ping
    pub ping_groesse: usize,
    /// Sprecher hoert sich selbst
    pub self_echo: bool,
}

impl Default for VoiceEinstellungen {
    fn default() -> Self {
        Self {
            aktiviert: true,
            ping_groesse: skyrelay_voice::udp::STANDARD_PING_GROESSE,
            self_echo: false,
        }
    }
}

/// Worker-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerEinstellungen {
    /// Obergrenze fuer jedes Warten in Millisekunden (bestimmt die Shutdown-Latenz)
    pub poll_timeout_ms: u64,
    pub inbound_queue: usize,
    pub outbound_queue: usize,
    pub write_pool_min: usize,
    pub write_pool_max: usize,
    pub write_pool_leerlauf_sek: u64,
    pub idle_pruef_intervall_ms: u64,
    pub stats_intervall_sek: u64,
}

impl Default for WorkerEinstellungen {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 100,
            inbound_queue: 4096,
            outbound_queue: 4096,
            write_pool_min: 1,
            write_pool_max: 4,
            write_pool_leerlauf_sek: 30,
            idle_pruef_intervall_ms: 1000,
            stats_intervall_sek: 60,
        }
    }
}

/// Logging-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingEinstellungen {
    /// Log-Level oder EnvFilter-Direktiven, z.B. "info,skyrelay_voice=debug"
    pub level: String,
    /// Format: "json" oder "text"
    pub format: String,
}

impl Default for LoggingEinstellungen {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl ServerConfig {
    /// Laedt die Konfiguration aus einer TOML-Datei.
    /// Gibt die Standardkonfiguration zurueck wenn die Datei nicht existiert.
    pub fn laden(pfad: &str) -> anyhow::Result<Self> {
        match std::fs::read_to_string(pfad) {
            Ok(inhalt) => {
                let config: Self = toml::from_str(&inhalt)
                    .map_err(|e| anyhow::anyhow!("Konfigurationsfehler in '{pfad}': {e}"))?;
                config.validieren()?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    pfad = pfad,
                    "Konfigurationsdatei nicht gefunden, verwende Standardwerte"
                );
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "Konfigurationsdatei '{pfad}' nicht lesbar: {e}"
            )),
        }
    }

    /// Prueft Wertebereiche, die `serde` nicht abdeckt
    pub fn validieren(&self) -> Result<(), CoreError> {
        let fehler = |text: &str| Err(CoreError::Konfiguration(text.into()));

        if self.verbindung.max_verbindungen == 0 {
            return fehler("verbindung.max_verbindungen muss groesser 0 sein");
        }
        if self.verbindung.max_write_retries == 0 {
            return fehler("verbindung.max_write_retries muss groesser 0 sein");
        }
        if self.worker.poll_timeout_ms == 0 {
            return fehler("worker.poll_timeout_ms muss groesser 0 sein");
        }
        if self.worker.write_pool_min == 0 || self.worker.write_pool_min > self.worker.write_pool_max {
            return fehler("worker.write_pool_min muss zwischen 1 und write_pool_max liegen");
        }
        if self.worker.stats_intervall_sek == 0 {
            return fehler("worker.stats_intervall_sek muss groesser 0 sein");
        }
        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return fehler("logging.format muss \"text\" oder \"json\" sein");
        }
        self.tcp_bind_adresse()?;
        self.voice_adressen()?;
        Ok(())
    }

    /// Gibt die vollstaendige Bind-Adresse fuer TCP zurueck
    pub fn tcp_bind_adresse(&self) -> Result<SocketAddr, CoreError> {
        let ip = ip_parsen(&self.netzwerk.bind_adresse)?;
        Ok(SocketAddr::new(ip, self.netzwerk.tcp_port))
    }

    /// Adressen fuer die Voice-Sockets
    pub fn voice_adressen(&self) -> Result<Vec<IpAddr>, CoreError> {
        if self.netzwerk.voice_adressen.is_empty() {
            return Ok(vec![ip_parsen(&self.netzwerk.bind_adresse)?]);
        }
        self.netzwerk
            .voice_adressen
            .iter()
            .map(|a| ip_parsen(a))
            .collect()
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            max_verbindungen: self.verbindung.max_verbindungen,
            anonym_timeout: Duration::from_secs(self.verbindung.anonym_timeout_sek),
            authentifiziert_timeout: Duration::from_secs(
                self.verbindung.authentifiziert_timeout_sek,
            ),
        }
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            write_timeout: Duration::from_millis(self.verbindung.write_timeout_ms),
            max_write_retries: self.verbindung.max_write_retries,
            close_timeout: Duration::from_millis(self.verbindung.close_timeout_ms),
            abschieds_frame: None,
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        let kanal = self.channel_config();
        PipelineConfig {
            poll_timeout: Duration::from_millis(self.worker.poll_timeout_ms),
            inbound_queue: self.worker.inbound_queue,
            outbound_queue: self.worker.outbound_queue,
            write_pool_min: self.worker.write_pool_min,
            write_pool_max: self.worker.write_pool_max,
            write_pool_leerlauf: Duration::from_secs(self.worker.write_pool_leerlauf_sek),
            idle_pruef_intervall: Duration::from_millis(self.worker.idle_pruef_intervall_ms),
            stats_intervall: Duration::from_secs(self.worker.stats_intervall_sek),
            control_kanal: kanal.clone(),
            voice_kanal: kanal,
        }
    }
}

fn ip_parsen(adresse: &str) -> Result<IpAddr, CoreError> {
    adresse
        .trim()
        .parse()
        .map_err(|_| CoreError::Konfiguration(format!("ungueltige IP-Adresse: '{adresse}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_config_ist_valide() {
        let cfg = ServerConfig::default();
        assert!(cfg.validieren().is_ok());
        assert_eq!(cfg.netzwerk.tcp_port, 6809);
        assert_eq!(cfg.verbindung.max_write_retries, 24);
        assert_eq!(cfg.verbindung.recycle_schwelle, 10_000);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn bind_adressen() {
        let cfg = ServerConfig::default();
        assert_eq!(
            cfg.tcp_bind_adresse().unwrap(),
            "0.0.0.0:6809".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            cfg.voice_adressen().unwrap(),
            vec!["0.0.0.0".parse::<IpAddr>().unwrap()]
        );
    }

    #[test]
    fn config_aus_toml_string() {
        let toml = r#"
            [server]
            name = "Langen Radar"

            [netzwerk]
            tcp_port = 7000
            voice_adressen = ["10.0.0.5", "192.168.1.5"]

            [verbindung]
            max_write_retries = 10
            recycle_schwelle = 0
        "#;
        let cfg: ServerConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.server.name, "Langen Radar");
        assert_eq!(cfg.netzwerk.tcp_port, 7000);
        assert_eq!(cfg.voice_adressen().unwrap().len(), 2);
        // Nicht angegebene Felder behalten Standardwerte
        assert_eq!(cfg.netzwerk.voice_port, 3290);
        assert_eq!(cfg.verbindung.anonym_timeout_sek, 45);
        assert_eq!(cfg.verbindung.recycle_schwelle, 0);

        let kanal = cfg.channel_config();
        assert_eq!(kanal.max_write_retries, 10);
        assert_eq!(kanal.write_timeout, Duration::from_millis(225));
    }

    #[test]
    fn ungueltige_werte_werden_erkannt() {
        let mut cfg = ServerConfig::default();
        cfg.worker.write_pool_min = 5;
        cfg.worker.write_pool_max = 2;
        assert!(matches!(cfg.validieren(), Err(CoreError::Konfiguration(_))));

        let mut cfg = ServerConfig::default();
        cfg.netzwerk.voice_adressen = vec!["kein-ip".into()];
        assert!(cfg.validieren().is_err());

        let mut cfg = ServerConfig::default();
        cfg.logging.format = "xml".into();
        assert!(cfg.validieren().is_err());
    }

    #[test]
    fn umrechnung_in_bibliotheks_configs() {
        let cfg = ServerConfig::default();
        let registry = cfg.registry_config();
        assert_eq!(registry.anonym_timeout, Duration::from_secs(45));
        assert_eq!(registry.authentifiziert_timeout, Duration::from_secs(1800));

        let pipeline = cfg.pipeline_config();
        assert_eq!(pipeline.poll_timeout, Duration::from_millis(100));
        assert_eq!(pipeline.write_pool_max, 4);
        assert_eq!(pipeline.voice_kanal.max_write_retries, 24);
    }

    #[test]
    fn fehlende_datei_liefert_standardwerte() {
        let cfg = ServerConfig::laden("/nicht/vorhanden/skyrelay.toml").unwrap();
        assert_eq!(cfg.netzwerk.tcp_port, 6809);
    }
}
