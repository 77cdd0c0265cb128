//! Reconnecting client for the DERP packet relay protocol over HTTP(S).
//!
//! The relay protocol rides on an HTTP connection upgrade, so on the wire a
//! relay session looks like any long-lived WebSocket-style HTTPS stream; a
//! TLS-intercepting middlebox that does not know the protocol cannot tell
//! the difference.
//!
//! This crate is the connection engine between a caller's send/receive API
//! and the relay wire codec: multi-stage dialing (DNS, racing IPv4/IPv6 TCP,
//! optional HTTP CONNECT proxy, TLS, HTTP upgrade), a fast-start shortcut
//! when the server key is visible in the certificate chain, lazy
//! connect-on-use with transparent reconnection, and caller-visible
//! connection generations. The codec itself is supplied through the
//! [`RelayConnector`] and [`RelayConn`] traits.

/// Protocol name carried in the `Upgrade` header.
pub const UPGRADE_PROTOCOL: &str = "DERP";

/// Header that tells the server to skip its HTTP response because the
/// client already knows the server key from the certificate chain.
pub const FAST_START_HEADER: &str = "Derp-Fast-Start";

/// Subject CN prefix marking the server's meta certificate; the rest of the
/// CN is the hex server public key.
pub const TLS_META_CERT_PREFIX: &str = "derpkey";

mod client;
mod dial;
mod error;
mod key;
mod parse;
mod proxy;
mod region;
mod relay;
mod stream;
mod tls;

pub use client::{Client, ClientBuilder};
pub use dial::{Dialer, DnsResolver, DynDialer, DynDnsResolver, NetDialer};
pub use error::ClientError;
pub use key::{KEY_LEN, PublicKey, SecretKey};
pub use parse::HandshakeReader;
pub use region::{RelayNode, RelayRegion};
pub use relay::{
    ArcRelayConn, DynRelayConn, DynRelayConnector, HandshakeOpts, ReceivedMessage, RelayConn,
    RelayConnector, RelayIo,
};
pub use stream::{AsyncStream, GuardedIo, MaybeTlsStream, TcpTransport};
