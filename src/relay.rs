//! The seam to the relay framing library.
//!
//! The wire codec — frame encoding, payload encryption, server
//! authentication once the key is known — lives outside this crate. The
//! engine hands it an upgraded transport and a set of handshake options,
//! and drives the resulting connection through [`RelayConn`].

use std::sync::Arc;

use bytes::Bytes;
use dynosaur::dynosaur;
use n0_error::Result;
use tokio::io::{BufWriter, ReadHalf, WriteHalf};

use crate::{
    key::{PublicKey, SecretKey},
    parse::HandshakeReader,
    stream::MaybeTlsStream,
};

/// A shared handle to a live relay connection.
pub type ArcRelayConn = Arc<DynRelayConn<'static>>;

/// The upgraded transport handed to the codec.
///
/// `reader` may already hold bytes that arrived behind the HTTP response;
/// `writer` may still hold the buffered fast-start upgrade request, so the
/// codec's first flush pushes both its handshake frame and the request out
/// together.
pub struct RelayIo {
    /// Buffered read half.
    pub reader: HandshakeReader<ReadHalf<MaybeTlsStream>>,
    /// Buffered write half.
    pub writer: BufWriter<WriteHalf<MaybeTlsStream>>,
}

/// Options the codec needs for its authentication handshake.
#[derive(Debug)]
#[non_exhaustive]
pub struct HandshakeOpts {
    /// The caller's identity key.
    pub secret_key: SecretKey,
    /// Mesh-operator key; unlocks the privileged operations.
    pub mesh_key: Option<String>,
    /// Server key learned out-of-band from the certificate chain, if any.
    pub server_public_key: Option<PublicKey>,
    /// Whether this client replies to server pings.
    pub can_ack_pings: bool,
    /// Whether to declare this client as a prober.
    pub is_prober: bool,
}

/// A message delivered by [`RelayConn::recv`].
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum ReceivedMessage {
    /// A packet from another peer.
    ReceivedPacket {
        /// The sending peer.
        source: PublicKey,
        /// Packet payload. May alias codec buffers; use before the next call.
        data: Bytes,
    },
    /// Server liveness probe carrying challenge data to echo back.
    Ping([u8; 8]),
    /// Reply to an earlier ping of ours.
    Pong([u8; 8]),
    /// Server keep-alive with no content.
    KeepAlive,
    /// A peer disconnected from the server (presence subscription).
    PeerGone(PublicKey),
    /// A peer connected to the server (presence subscription).
    PeerPresent(PublicKey),
    /// Server health report; `problem` is `None` when healthy again.
    Health {
        /// Human-readable description of what is wrong.
        problem: Option<String>,
    },
}

#[dynosaur(pub DynRelayConn = dyn(box) RelayConn)]
/// One authenticated relay connection.
///
/// Implementations do their own internal locking; the engine calls these
/// from concurrent senders and a receiver. Any returned error makes the
/// engine discard the connection.
pub trait RelayConn: Send + Sync {
    /// Sends a packet to `dst`.
    fn send<'a>(
        &'a self,
        dst: PublicKey,
        packet: &'a [u8],
    ) -> impl Future<Output = Result<()>> + Send + 'a;

    /// Forwards a packet on behalf of `src`. Mesh operators only.
    fn forward_packet<'a>(
        &'a self,
        src: PublicKey,
        dst: PublicKey,
        packet: &'a [u8],
    ) -> impl Future<Output = Result<()>> + Send + 'a;

    /// Replies to a server ping with its challenge data.
    fn send_pong(&self, data: [u8; 8]) -> impl Future<Output = Result<()>> + Send + '_;

    /// Tells the server whether it is this client's preferred home.
    fn note_preferred(&self, preferred: bool) -> impl Future<Output = Result<()>> + Send + '_;

    /// Subscribes to peer presence events. Mesh operators only.
    fn watch_connection_changes(&self) -> impl Future<Output = Result<()>> + Send + '_;

    /// Asks the server to drop `target`'s connection. Mesh operators only.
    fn close_peer(&self, target: PublicKey) -> impl Future<Output = Result<()>> + Send + '_;

    /// Receives the next message.
    fn recv(&self) -> impl Future<Output = Result<ReceivedMessage>> + Send + '_;

    /// The server key this connection authenticated against.
    fn server_public_key(&self) -> PublicKey;
}

#[dynosaur(pub DynRelayConnector = dyn(box) RelayConnector)]
/// Runs the relay protocol handshake over an upgraded transport.
///
/// Implementations must flush `io.writer` after writing their handshake
/// frames; on the fast-start path that flush also sends the HTTP upgrade
/// request still sitting in the buffer.
pub trait RelayConnector: Send + Sync {
    /// Authenticates and returns a live connection.
    fn handshake(
        &self,
        io: RelayIo,
        opts: HandshakeOpts,
    ) -> impl Future<Output = Result<ArcRelayConn>> + Send + '_;
}
