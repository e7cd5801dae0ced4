//! skyrelay-signaling – TCP-Control-Layer
//!
//! Verwaltet die Control-Verbindungen der Clients und die Worker, die sie
//! bedienen. Die Befehlsschicht darueber sieht nur Ereignisse und
//! ausgehende Textnachrichten.
//!
//! ## Architektur
//!
//! ```text
//! Accept-Worker --> ConnectionRegistry --> ReadinessMultiplexer
//!                        |                        |
//!                        |                  Lese-Worker --> InboundEvent
//!                        |
//! OutboundMessage --> Schreib-Pool --> ControlChannel --> ChannelHandle (Drainer)
//!
//! Voice-Worker --> VoiceEndpoint --> VoiceMixer --> ChannelHandle (UDP)
//! ```

pub mod channel;
pub mod connection;
pub mod control;
pub mod error;
pub mod multiplexer;
pub mod registry;
pub mod workers;

// Bequeme Re-Exporte
pub use channel::{ChannelConfig, ChannelHandle, WireSink};
pub use connection::{Connection, Identity};
pub use control::ControlChannel;
pub use error::{ChannelError, SignalingError, SignalingResult};
pub use multiplexer::{MultiplexerHandle, MuxEreignis, ReadinessMultiplexer};
pub use registry::{ConnectionRegistry, RegistryConfig};
pub use workers::{InboundEvent, OutboundMessage, Pipeline, PipelineConfig, TrennGrund};
