//! Verbindungskanal – Ausgangs-Queue mit genau einem Drainer
//!
//! Jeder Kanal besitzt eine unbegrenzte Queue und einen Drainer-Task, der als
//! einziger auf die Senke schreibt. `enqueue` blockiert nie.
//!
//! ## Schreib-Retry
//!
//! ```text
//! Scratch-Puffer fuellen (Stream: zusammenfassen, Datagramm: ein Eintrag)
//!     |
//!     v
//! Schreibversuch (max. write_timeout) --Fortschritt--> Retry-Zaehler = 0
//!     |
//!     +--Zeitlimit--> Retry-Zaehler + 1
//!                       |
//!                       +--> max_write_retries erreicht:
//!                            Abschieds-Frame, fatal, schliessen, melden
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use skyrelay_core::{ConnectionId, Stats};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ChannelError;

/// Obergrenze fuer zusammengefasste Stream-Schreibvorgaenge
const MAX_SCRATCH_GROESSE: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Konfiguration
// ---------------------------------------------------------------------------

/// Schreib-Parameter eines Kanals
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Wartezeit pro Schreibversuch
    pub write_timeout: Duration,
    /// Aufeinanderfolgende Zeitlimits bis zum fatalen Abbruch
    pub max_write_retries: u32,
    /// Obergrenze fuer das Schliessen der Senke
    pub close_timeout: Duration,
    /// Wird nach fatalem Abbruch einmalig versucht zu senden
    pub abschieds_frame: Option<Bytes>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_millis(225),
            max_write_retries: 24,
            close_timeout: Duration::from_millis(750),
            abschieds_frame: None,
        }
    }
}

// ---------------------------------------------------------------------------
// WireSink
// ---------------------------------------------------------------------------

/// Ziel eines Kanals
#[async_trait]
pub trait WireSink: Send + 'static {
    /// Duerfen mehrere Eintraege in einem Schreibvorgang landen?
    fn zusammenfassen(&self) -> bool;

    /// Ein Schreibversuch; liefert die Anzahl angenommener Bytes
    async fn schreiben(&mut self, daten: &[u8]) -> io::Result<usize>;

    async fn schliessen(&mut self) -> io::Result<()>;
}

/// Byte-Strom als Senke (Control-Verbindung)
pub struct StreamSink<W> {
    writer: W,
}

impl<W> StreamSink<W> {
    pub fn neu(writer: W) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl<W> WireSink for StreamSink<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn zusammenfassen(&self) -> bool {
        true
    }

    async fn schreiben(&mut self, daten: &[u8]) -> io::Result<usize> {
        let n = self.writer.write(daten).await?;
        if n > 0 {
            self.writer.flush().await?;
        }
        Ok(n)
    }

    async fn schliessen(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}

/// Gemeinsam genutzte, neu bindbare Peer-Adresse eines Voice-Kanals
pub type DatagramPeer = Arc<Mutex<Option<SocketAddr>>>;

/// UDP-Socket als Senke (Voice); ein Eintrag pro Datagramm
pub struct DatagramSink {
    socket: Arc<UdpSocket>,
    peer: DatagramPeer,
}

impl DatagramSink {
    pub fn neu(socket: Arc<UdpSocket>, peer: DatagramPeer) -> Self {
        Self { socket, peer }
    }
}

#[async_trait]
impl WireSink for DatagramSink {
    fn zusammenfassen(&self) -> bool {
        false
    }

    async fn schreiben(&mut self, daten: &[u8]) -> io::Result<usize> {
        let peer = *self.peer.lock();
        match peer {
            Some(ziel) => {
                self.socket.send_to(daten, ziel).await?;
                // Ein Datagramm wird ganz oder gar nicht gesendet
                Ok(daten.len())
            }
            None => {
                tracing::trace!(bytes = daten.len(), "Kein Voice-Peer gebunden, Datagramm verworfen");
                Ok(daten.len())
            }
        }
    }

    async fn schliessen(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ChannelHandle
// ---------------------------------------------------------------------------

struct Ausgehend {
    daten: Bytes,
    kritisch: bool,
}

struct ChannelInner {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Ausgehend>,
    schliessen: CancellationToken,
    beendet: CancellationToken,
    geschlossen: AtomicBool,
    fatal: AtomicBool,
}

/// Handle auf einen Verbindungskanal (guenstig klonbar)
#[derive(Clone)]
pub struct ChannelHandle {
    inner: Arc<ChannelInner>,
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("id", &self.inner.id)
            .field("geschlossen", &self.ist_geschlossen())
            .field("fatal", &self.ist_fatal())
            .finish()
    }
}

impl ChannelHandle {
    /// Startet den Drainer-Task fuer `sink`
    ///
    /// Nach einem fatalen Abbruch wird die ID ueber `fatal_tx` gemeldet.
    pub fn starten<S: WireSink>(
        id: ConnectionId,
        sink: S,
        config: ChannelConfig,
        stats: Arc<Stats>,
        fatal_tx: Option<mpsc::UnboundedSender<ConnectionId>>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ChannelInner {
            id,
            tx,
            schliessen: CancellationToken::new(),
            beendet: CancellationToken::new(),
            geschlossen: AtomicBool::new(false),
            fatal: AtomicBool::new(false),
        });

        let drainer = Drainer {
            sink,
            rx,
            inner: Arc::clone(&inner),
            config,
            stats,
            fatal_tx,
        };
        tokio::spawn(drainer.laufen());

        Self { inner }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Reiht Bytes zum Senden ein (blockiert nie)
    ///
    /// `kritisch` ist nur eine Markierung fuers Logging; die Reihenfolge
    /// bleibt die Einfuegereihenfolge.
    pub fn enqueue(&self, daten: impl Into<Bytes>, kritisch: bool) -> Result<(), ChannelError> {
        if self.ist_geschlossen() {
            if kritisch {
                tracing::warn!(conn = %self.inner.id, "Kritische Nachricht auf geschlossenem Kanal verworfen");
            }
            return Err(ChannelError::Geschlossen);
        }
        self.inner
            .tx
            .send(Ausgehend {
                daten: daten.into(),
                kritisch,
            })
            .map_err(|_| ChannelError::Geschlossen)
    }

    /// Schliesst den Kanal; mehrfacher Aufruf ist wirkungslos
    pub fn close(&self) {
        if !self.inner.geschlossen.swap(true, Ordering::AcqRel) {
            tracing::debug!(conn = %self.inner.id, "Kanal wird geschlossen");
        }
        self.inner.schliessen.cancel();
    }

    pub fn ist_geschlossen(&self) -> bool {
        self.inner.geschlossen.load(Ordering::Acquire)
    }

    /// Wurde der Kanal wegen erschoepfter Schreib-Retries geschlossen?
    pub fn ist_fatal(&self) -> bool {
        self.inner.fatal.load(Ordering::Acquire)
    }

    /// Wartet, bis der Drainer die Senke geschlossen hat
    pub async fn beendet(&self) {
        self.inner.beendet.cancelled().await;
    }
}

// ---------------------------------------------------------------------------
// Drainer
// ---------------------------------------------------------------------------

enum SchreibEnde {
    Geschlossen,
    Fatal,
    Io(io::Error),
}

struct Drainer<S> {
    sink: S,
    rx: mpsc::UnboundedReceiver<Ausgehend>,
    inner: Arc<ChannelInner>,
    config: ChannelConfig,
    stats: Arc<Stats>,
    fatal_tx: Option<mpsc::UnboundedSender<ConnectionId>>,
}

impl<S: WireSink> Drainer<S> {
    async fn laufen(mut self) {
        let id = self.inner.id;
        let mut scratch: Vec<u8> = Vec::new();

        loop {
            let erstes = tokio::select! {
                biased;
                _ = self.inner.schliessen.cancelled() => break,
                eintrag = self.rx.recv() => match eintrag {
                    Some(e) => e,
                    None => break,
                },
            };

            scratch.clear();
            scratch.extend_from_slice(&erstes.daten);
            let mut kritisch = erstes.kritisch;
            if self.sink.zusammenfassen() {
                while scratch.len() < MAX_SCRATCH_GROESSE {
                    match self.rx.try_recv() {
                        Ok(weiterer) => {
                            scratch.extend_from_slice(&weiterer.daten);
                            kritisch |= weiterer.kritisch;
                        }
                        Err(_) => break,
                    }
                }
            }

            match self.schreiben_mit_retry(&scratch).await {
                Ok(()) => {}
                Err(SchreibEnde::Geschlossen) => {
                    if kritisch {
                        tracing::warn!(conn = %id, "Kanal geschlossen, kritische Nachricht nicht zugestellt");
                    }
                    break;
                }
                Err(SchreibEnde::Fatal) => {
                    tracing::warn!(
                        conn = %id,
                        retries = self.config.max_write_retries,
                        "Schreib-Retries erschoepft, Verbindung wird geschlossen"
                    );
                    self.abschied_senden().await;
                    self.inner.fatal.store(true, Ordering::Release);
                    self.inner.geschlossen.store(true, Ordering::Release);
                    if let Some(tx) = &self.fatal_tx {
                        let _ = tx.send(id);
                    }
                    break;
                }
                Err(SchreibEnde::Io(e)) => {
                    tracing::debug!(conn = %id, fehler = %e, "Schreibfehler, Kanal wird geschlossen");
                    self.inner.geschlossen.store(true, Ordering::Release);
                    if let Some(tx) = &self.fatal_tx {
                        let _ = tx.send(id);
                    }
                    break;
                }
            }
        }

        self.aufraeumen().await;
    }

    async fn schreiben_mit_retry(&mut self, daten: &[u8]) -> Result<(), SchreibEnde> {
        let mut offset = 0;
        let mut retries = 0u32;

        while offset < daten.len() {
            if self.inner.schliessen.is_cancelled() {
                return Err(SchreibEnde::Geschlossen);
            }

            match tokio::time::timeout(self.config.write_timeout, self.sink.schreiben(&daten[offset..]))
                .await
            {
                Ok(Ok(0)) => {
                    return Err(SchreibEnde::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "Senke nimmt keine Bytes mehr an",
                    )))
                }
                Ok(Ok(n)) => {
                    offset += n;
                    retries = 0;
                    self.stats.bytes_gesendet(n);
                }
                Ok(Err(e)) => return Err(SchreibEnde::Io(e)),
                Err(_) => {
                    retries += 1;
                    self.stats.write_retry();
                    tracing::trace!(conn = %self.inner.id, retries, "Schreibversuch ohne Fortschritt");
                    if retries >= self.config.max_write_retries {
                        return Err(SchreibEnde::Fatal);
                    }
                }
            }
        }
        Ok(())
    }

    async fn abschied_senden(&mut self) {
        let Some(frame) = self.config.abschieds_frame.clone() else {
            return;
        };
        if let Ok(Ok(n)) = tokio::time::timeout(self.config.write_timeout, self.sink.schreiben(&frame)).await {
            self.stats.bytes_gesendet(n);
        }
    }

    async fn aufraeumen(&mut self) {
        let id = self.inner.id;
        self.inner.geschlossen.store(true, Ordering::Release);
        self.rx.close();

        let mut verworfen = 0usize;
        while self.rx.try_recv().is_ok() {
            verworfen += 1;
        }

        match tokio::time::timeout(self.config.close_timeout, self.sink.schliessen()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(conn = %id, fehler = %e, "Senke nicht sauber geschlossen"),
            Err(_) => tracing::debug!(conn = %id, "Zeitlimit beim Schliessen der Senke"),
        }

        tracing::debug!(conn = %id, verworfen, "Drainer beendet");
        self.inner.beendet.cancel();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn kanal_auf_duplex(
        puffer: usize,
        config: ChannelConfig,
    ) -> (
        ChannelHandle,
        tokio::io::DuplexStream,
        Arc<Stats>,
        mpsc::UnboundedReceiver<ConnectionId>,
    ) {
        let (server, client) = tokio::io::duplex(puffer);
        let stats = Arc::new(Stats::neu());
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let handle = ChannelHandle::starten(
            ConnectionId(1),
            StreamSink::neu(server),
            config,
            Arc::clone(&stats),
            Some(fatal_tx),
        );
        (handle, client, stats, fatal_rx)
    }

    #[tokio::test]
    async fn reihenfolge_bleibt_erhalten() {
        let (handle, mut client, stats, _fatal) = kanal_auf_duplex(4096, ChannelConfig::default());

        handle.enqueue(&b"eins,"[..], false).unwrap();
        handle.enqueue(&b"zwei,"[..], true).unwrap();
        handle.enqueue(&b"drei"[..], false).unwrap();

        let mut buf = vec![0u8; 14];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"eins,zwei,drei");
        assert_eq!(stats.snapshot().bytes_out, 14);
    }

    #[tokio::test]
    async fn viele_produzenten_ein_drainer() {
        let (handle, mut client, _stats, _fatal) = kanal_auf_duplex(1 << 16, ChannelConfig::default());

        let mut tasks = Vec::new();
        for p in 0..8u8 {
            let h = handle.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..100u8 {
                    h.enqueue(vec![p, i], false).unwrap();
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        let mut buf = vec![0u8; 8 * 100 * 2];
        client.read_exact(&mut buf).await.unwrap();

        // Pro Produzent muss die Einfuegereihenfolge erhalten bleiben
        let mut naechstes = [0u8; 8];
        for paar in buf.chunks(2) {
            let (p, i) = (paar[0] as usize, paar[1]);
            assert_eq!(i, naechstes[p], "Produzent {p} ausser der Reihe");
            naechstes[p] += 1;
        }
        assert!(naechstes.iter().all(|&n| n == 100));
    }

    #[tokio::test]
    async fn close_ist_idempotent() {
        let (handle, _client, _stats, _fatal) = kanal_auf_duplex(64, ChannelConfig::default());
        handle.close();
        handle.close();
        handle.beendet().await;
        handle.close();

        assert!(handle.ist_geschlossen());
        assert!(!handle.ist_fatal());
        assert_eq!(handle.enqueue(&b"x"[..], false), Err(ChannelError::Geschlossen));
    }

    #[tokio::test(start_paused = true)]
    async fn nie_schreibbare_senke_wird_nach_retry_grenze_fatal() {
        let config = ChannelConfig {
            abschieds_frame: Some(Bytes::from_static(b"<msg type=\"reset\"/></msg>")),
            ..ChannelConfig::default()
        };
        // Gegenseite liest nie: nach 64 Bytes nimmt die Senke nichts mehr an
        let (handle, _client, stats, mut fatal_rx) = kanal_auf_duplex(64, config);

        handle.enqueue(vec![b'a'; 200], true).unwrap();

        let gemeldet = fatal_rx.recv().await;
        assert_eq!(gemeldet, Some(ConnectionId(1)));
        handle.beendet().await;

        let snap = stats.snapshot();
        assert_eq!(snap.write_retries, 24);
        assert_eq!(snap.bytes_out, 64);
        assert!(handle.ist_fatal());
        assert!(handle.ist_geschlossen());
        assert!(handle.enqueue(&b"spaet"[..], false).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn fortschritt_setzt_retry_zaehler_zurueck() {
        let config = ChannelConfig {
            max_write_retries: 3,
            ..ChannelConfig::default()
        };
        let (handle, mut client, stats, mut fatal_rx) = kanal_auf_duplex(16, config);
        handle.enqueue(vec![b'z'; 64], false).unwrap();

        // Alle 2 Zeitlimits 16 Bytes lesen: Retry-Zaehler erreicht nie 3
        let mut gelesen = 0;
        let mut buf = [0u8; 16];
        while gelesen < 64 {
            tokio::time::sleep(Duration::from_millis(450)).await;
            gelesen += client.read(&mut buf).await.unwrap();
        }

        assert!(fatal_rx.try_recv().is_err());
        assert!(!handle.ist_fatal());
        assert!(stats.snapshot().write_retries >= 2);
    }

    #[tokio::test]
    async fn datagramm_senke_sendet_einzeln_an_neu_gebundenen_peer() {
        let server = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let peer: DatagramPeer = Arc::new(Mutex::new(Some(a.local_addr().unwrap())));
        let handle = ChannelHandle::starten(
            ConnectionId(2),
            DatagramSink::neu(server, Arc::clone(&peer)),
            ChannelConfig::default(),
            Arc::new(Stats::neu()),
            None,
        );

        handle.enqueue(&b"erstes"[..], false).unwrap();
        handle.enqueue(&b"zweites"[..], false).unwrap();

        let mut buf = [0u8; 32];
        let n = a.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"erstes");
        let n = a.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"zweites");

        *peer.lock() = Some(b.local_addr().unwrap());
        handle.enqueue(&b"drittes"[..], false).unwrap();
        let n = b.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"drittes");
    }
}
