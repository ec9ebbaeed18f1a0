//! # ndib — point-to-point bridge for broadcast video/audio
//!
//! Carries one stream from a local media fabric across a UDP link to a
//! peer machine, where it is republished under a local name. Video is
//! compressed to H.264 for the hop; audio crosses as uncompressed planar
//! f32 PCM. Both endpoints speak the same 38-byte datagram protocol and
//! run on different operating systems.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────── host ───────────────────────────┐
//! │ SourceCapture ─▶ VideoEncoder ─▶ Fragmenter ─▶ UDP socket  │
//! │        └── audio (PCM) ────────────▶┘                      │
//! └────────────────────────────────────────────────────────────┘
//!                              │ datagrams, 38-byte header
//! ┌─────────────────────────── join ───────────────────────────┐
//! │ UDP socket ─▶ Reassembler ×2 ─▶ VideoDecoder ─┐            │
//! │                     └── audio ────────────────┤            │
//! │                                  (DelayBuffer)┴▶ SourceOutput
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Crate layout
//!
//! - [`protocol`] — wire header codec, [`Fragmenter`](protocol::Fragmenter),
//!   [`Reassembler`](protocol::Reassembler).
//! - [`codec`] — Annex-B handling, encoder/decoder adapters, backend
//!   capability traits, optional OpenH264 backend.
//! - [`buffer`] — fixed-delay presentation buffer with deep-copy semantics.
//! - [`source`] — capture/output capability traits and the in-process
//!   loopback fabric.
//! - [`sender`] — the [`Host`] orchestrator.
//! - [`receiver`] — the [`Join`] orchestrator.
//! - [`error`] — [`BridgeError`] and the [`Result`] alias.

pub mod buffer;
pub mod codec;
pub mod error;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod source;

pub use error::{BridgeError, Result};
pub use receiver::{Join, JoinConfig};
pub use sender::{Host, HostConfig};
