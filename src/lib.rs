//! Flowersec — secure realtime connectivity over untrusted transports.
//!
//! Takes a pre-shared key and a channel id negotiated out of band and turns
//! a raw binary-message transport (typically a WebSocket, optionally via a
//! relay tunnel) into mutually authenticated, confidential, multiplexed,
//! framed streams ready for application RPC.
//!
//! The stack, bottom up:
//!
//! ```text
//! Application RPC handlers
//!         │
//!   RPC session            rpc::            (JSON envelopes, typed routing)
//!         │
//!   Stream multiplexer     mux::            (yamux + StreamHello dispatch)
//!         │
//!   E2EE record stream     e2ee::           (PSK handshake, AEAD records)
//!         │
//!   Binary transport       transport::/ws:: (WebSocket adapter)
//! ```
//!
//! `endpoint::Endpoint` wires the layers together from a control-plane
//! grant or direct connect info; `token::` implements the FST2 capability
//! tokens those grants carry.

pub mod b64;
pub mod channel;
pub mod e2ee;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod grant;
pub mod keyset;
pub mod mux;
pub mod observer;
pub mod rpc;
pub mod suite;
pub mod timeops;
pub mod token;
pub mod transport;
pub mod ws;

pub use channel::{ChannelId, Psk, Role};
pub use endpoint::{Connection, Endpoint, EndpointConfig};
pub use error::{ErrorCode, ErrorPath, FsError, FsResult, Stage};
pub use observer::{Observer, ObserverCell};
pub use suite::CipherSuite;
