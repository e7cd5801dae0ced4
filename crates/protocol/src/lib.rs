//! skyrelay-protocol – Netzwerkprotokoll-Definitionen
//!
//! Dieses Crate definiert das Draht-Format beider Transporte:
//! - [`wire`] – Textnachrichten mit Start-/End-Marker (TCP)
//! - [`compression`] – komprimierte Pakete im Textstrom
//! - [`voice`] – binaere Voice-Pakete mit CRC-32 (UDP)

pub mod compression;
pub mod voice;
pub mod wire;

pub use compression::{CompressionEnvelope, CompressionError};
pub use voice::{VoiceDecodeError, VoicePacket};
pub use wire::ControlDecoder;
