//! Version handshake
//!
//! The outbound [`Initiator`] sends `version` and expects the responder's
//! `version` and `verack` together in one read. The inbound [`Responder`]
//! produces that pair as a [`HandshakeBundle`]. Completed handshakes are
//! remembered for a while in the shared [`ConnectionCache`].

pub mod cache;
pub mod initiator;
pub mod responder;

pub use cache::{ConnectionCache, DEFAULT_HANDSHAKE_TTL};
pub use initiator::{HandshakeState, Initiator};
pub use responder::{HandshakeBundle, Responder, BUNDLE_SENTINEL};
