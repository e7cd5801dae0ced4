//! Integration-Tests fuer die Worker-Pipeline (Loopback-TCP)

use skyrelay_protocol::wire::{ControlDecoder, FRAME_HEADER};
use skyrelay_signaling::{
    ChannelConfig, ConnectionRegistry, InboundEvent, OutboundMessage, Pipeline, PipelineConfig,
    ReadinessMultiplexer, RegistryConfig, TrennGrund,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{mpsc, watch};

const WARTEZEIT: Duration = Duration::from_secs(5);

struct TestServer {
    pipeline: Pipeline,
    inbound: mpsc::Receiver<InboundEvent>,
    shutdown: watch::Sender<bool>,
}

fn test_pipeline_config() -> PipelineConfig {
    PipelineConfig {
        poll_timeout: Duration::from_millis(20),
        idle_pruef_intervall: Duration::from_millis(50),
        ..PipelineConfig::default()
    }
}

async fn server(registry_config: RegistryConfig) -> TestServer {
    server_mit(registry_config, test_pipeline_config()).await
}

async fn server_mit(registry_config: RegistryConfig, config: PipelineConfig) -> TestServer {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (mux, handle) = ReadinessMultiplexer::neu(0);
    let registry = Arc::new(ConnectionRegistry::neu(registry_config, handle));
    let (shutdown, shutdown_rx) = watch::channel(false);

    let mut pipeline =
        Pipeline::starten(listener, registry, mux, None, config, shutdown_rx).unwrap();
    let inbound = pipeline.inbound().unwrap();
    assert!(pipeline.inbound().is_none());

    TestServer {
        pipeline,
        inbound,
        shutdown,
    }
}

async fn naechstes(server: &mut TestServer) -> InboundEvent {
    tokio::time::timeout(WARTEZEIT, server.inbound.recv())
        .await
        .expect("Zeitlimit fuer Ereignis")
        .expect("Ereignis-Queue geschlossen")
}

#[tokio::test]
async fn frame_hin_und_zurueck() {
    let mut server = server(RegistryConfig::default()).await;
    let mut client = TcpStream::connect(server.pipeline.lokale_adresse())
        .await
        .unwrap();

    let id = match naechstes(&mut server).await {
        InboundEvent::Verbunden { id, remote } => {
            assert_eq!(remote, client.local_addr().unwrap());
            id
        }
        anderes => panic!("Verbunden erwartet, erhalten: {anderes:?}"),
    };
    assert_eq!(server.pipeline.registry().len(), 1);

    // Nachricht in zwei Teilen, davor etwas Muell
    client.write_all(b"xx<msg type=\"login\">").await.unwrap();
    client.write_all(b"DLH4AB</msg>").await.unwrap();
    match naechstes(&mut server).await {
        InboundEvent::Frame { id: von, text } => {
            assert_eq!(von, id);
            assert_eq!(text, format!("{FRAME_HEADER}<msg type=\"login\">DLH4AB</msg>"));
        }
        anderes => panic!("Frame erwartet, erhalten: {anderes:?}"),
    }

    server
        .pipeline
        .outbound()
        .send(OutboundMessage::neu(id, "<msg type=\"ok\"/></msg>"))
        .await
        .unwrap();

    let mut decoder = ControlDecoder::neu();
    let mut puffer = [0u8; 256];
    let nachrichten = tokio::time::timeout(WARTEZEIT, async {
        loop {
            let n = client.read(&mut puffer).await.unwrap();
            assert!(n > 0, "Server hat unerwartet geschlossen");
            let nachrichten = decoder.feed(&puffer[..n]);
            if !nachrichten.is_empty() {
                break nachrichten;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(
        nachrichten,
        vec![format!("{FRAME_HEADER}<msg type=\"ok\"/></msg>")]
    );

    drop(client);
    assert_eq!(
        naechstes(&mut server).await,
        InboundEvent::Getrennt {
            id,
            grund: TrennGrund::Gegenseite
        }
    );
    assert!(server.pipeline.registry().is_empty());

    server.shutdown.send(true).unwrap();
    server.pipeline.beenden().await;
}

#[tokio::test]
async fn reihenfolge_pro_verbindung_bleibt_erhalten() {
    let mut server = server(RegistryConfig::default()).await;
    let mut client = TcpStream::connect(server.pipeline.lokale_adresse())
        .await
        .unwrap();
    let InboundEvent::Verbunden { id, .. } = naechstes(&mut server).await else {
        panic!("Verbunden erwartet");
    };

    let outbound = server.pipeline.outbound();
    for i in 0..200 {
        outbound
            .send(OutboundMessage::neu(id, format!("<msg n=\"{i}\"/></msg>")))
            .await
            .unwrap();
    }

    let mut decoder = ControlDecoder::neu();
    let mut empfangen = Vec::new();
    let mut puffer = [0u8; 4096];
    tokio::time::timeout(WARTEZEIT, async {
        while empfangen.len() < 200 {
            let n = client.read(&mut puffer).await.unwrap();
            assert!(n > 0);
            empfangen.extend(decoder.feed(&puffer[..n]));
        }
    })
    .await
    .unwrap();

    for (i, text) in empfangen.iter().enumerate() {
        assert_eq!(*text, format!("{FRAME_HEADER}<msg n=\"{i}\"/></msg>"));
    }

    server.shutdown.send(true).unwrap();
    server.pipeline.beenden().await;
}

#[tokio::test]
async fn untaetige_verbindung_wird_getrennt() {
    let mut server = server(RegistryConfig {
        anonym_timeout: Duration::from_millis(100),
        ..RegistryConfig::default()
    })
    .await;
    let mut client = TcpStream::connect(server.pipeline.lokale_adresse())
        .await
        .unwrap();
    let InboundEvent::Verbunden { id, .. } = naechstes(&mut server).await else {
        panic!("Verbunden erwartet");
    };

    assert_eq!(
        naechstes(&mut server).await,
        InboundEvent::Getrennt {
            id,
            grund: TrennGrund::Idle
        }
    );

    // Der Server schliesst; der Client liest EOF
    let mut puffer = [0u8; 64];
    let n = tokio::time::timeout(WARTEZEIT, client.read(&mut puffer))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);

    server.shutdown.send(true).unwrap();
    server.pipeline.beenden().await;
}

#[tokio::test]
async fn nie_lesender_client_wird_nach_schreibfehler_getrennt() {
    let mut server = server_mit(
        RegistryConfig::default(),
        PipelineConfig {
            control_kanal: ChannelConfig {
                write_timeout: Duration::from_millis(20),
                max_write_retries: 3,
                close_timeout: Duration::from_millis(100),
                abschieds_frame: None,
            },
            ..test_pipeline_config()
        },
    )
    .await;

    // Kleiner Empfangspuffer, der Client liest nie
    let socket = TcpSocket::new_v4().unwrap();
    socket.set_recv_buffer_size(4096).unwrap();
    let _client = socket
        .connect(server.pipeline.lokale_adresse())
        .await
        .unwrap();
    let InboundEvent::Verbunden { id, .. } = naechstes(&mut server).await else {
        panic!("Verbunden erwartet");
    };

    let block = format!("<msg>{}</msg>", "z".repeat(64 * 1024));
    let outbound = server.pipeline.outbound();
    for _ in 0..400 {
        outbound
            .send(OutboundMessage::neu(id, block.clone()))
            .await
            .unwrap();
    }

    assert_eq!(
        naechstes(&mut server).await,
        InboundEvent::Getrennt {
            id,
            grund: TrennGrund::Schreibfehler
        }
    );
    assert!(server.pipeline.registry().get(id).is_none());
    assert!(server.pipeline.registry().is_empty());

    server.shutdown.send(true).unwrap();
    server.pipeline.beenden().await;
}

#[tokio::test]
async fn summen_enthalten_letztes_teilintervall() {
    let mut server = server(RegistryConfig::default()).await;
    let mut client = TcpStream::connect(server.pipeline.lokale_adresse())
        .await
        .unwrap();
    assert!(matches!(
        naechstes(&mut server).await,
        InboundEvent::Verbunden { .. }
    ));

    let nachricht = b"<msg type=\"pos\">50.03</msg>";
    client.write_all(nachricht).await.unwrap();
    assert!(matches!(
        naechstes(&mut server).await,
        InboundEvent::Frame { .. }
    ));

    // Statistik-Intervall (60 s) ist noch nicht abgelaufen
    assert_eq!(server.pipeline.summen().frames_in, 0);

    server.shutdown.send(true).unwrap();
    let summen = server.pipeline.beenden().await;
    assert_eq!(summen.frames_in, 1);
    assert_eq!(summen.bytes_in, nachricht.len() as u64);
}

#[tokio::test]
async fn kapazitaetsgrenze_lehnt_ab() {
    let mut server = server(RegistryConfig {
        max_verbindungen: 1,
        ..RegistryConfig::default()
    })
    .await;
    let _erster = TcpStream::connect(server.pipeline.lokale_adresse())
        .await
        .unwrap();
    assert!(matches!(
        naechstes(&mut server).await,
        InboundEvent::Verbunden { .. }
    ));

    let mut zweiter = TcpStream::connect(server.pipeline.lokale_adresse())
        .await
        .unwrap();
    let mut puffer = [0u8; 64];
    let n = tokio::time::timeout(WARTEZEIT, zweiter.read(&mut puffer))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);
    assert_eq!(server.pipeline.registry().len(), 1);

    server.shutdown.send(true).unwrap();
    server.pipeline.beenden().await;
}

#[tokio::test]
async fn shutdown_stoppt_alle_worker() {
    let server = server(RegistryConfig::default()).await;
    let board = Arc::clone(server.pipeline.board());

    tokio::time::sleep(Duration::from_millis(50)).await;
    let namen: Vec<String> = board.snapshot().into_iter().map(|w| w.name).collect();
    for erwartet in ["accept", "lesen", "schreiben-0", "schreiben-pool", "statistik"] {
        assert!(namen.iter().any(|n| n == erwartet), "{erwartet} fehlt in {namen:?}");
    }

    server.shutdown.send(true).unwrap();
    tokio::time::timeout(WARTEZEIT, server.pipeline.beenden())
        .await
        .unwrap();
}
