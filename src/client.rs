//! The reconnecting relay client: lazy connect, HTTP upgrade negotiation,
//! and the one-live-connection state machine.

use std::{fmt, sync::Arc, time::Duration};

use http::StatusCode;
use n0_error::{AnyError, StackResultExt, StdResultExt, anyerr, e};
use rustls::pki_types::CertificateDer;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use tokio_util::future::FutureExt as _;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    FAST_START_HEADER, TLS_META_CERT_PREFIX, UPGRADE_PROTOCOL,
    dial::{self, Dialer, DnsResolver, DynDialer, DynDnsResolver, NetDialer},
    error::ClientError,
    key::{PublicKey, SecretKey},
    parse::{HEADER_SECTION_MAX_LENGTH, HandshakeReader, HttpResponse},
    region::{RelayNode, RelayRegion, UrlTarget},
    relay::{
        ArcRelayConn, DynRelayConnector, HandshakeOpts, ReceivedMessage, RelayConn, RelayConnector,
        RelayIo,
    },
    stream::{GuardedIo, IoCloser, MaybeTlsStream, TcpTransport},
    tls,
};

/// Fallback budget for one whole connect attempt: DNS + TCP + TLS + HTTP
/// upgrade + relay handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Where this client connects: a fixed URL, or a directory callback naming
/// a region. Exactly one, fixed at construction.
enum Target {
    Url(UrlTarget),
    Region(Box<dyn Fn() -> Option<RelayRegion> + Send + Sync>),
}

impl Target {
    fn describe(&self, region: Option<&RelayRegion>) -> String {
        match (self, region) {
            (Target::Url(url), _) => url.url.clone(),
            (Target::Region(_), Some(region)) => {
                format!("region {} ({})", region.region_id, region.region_code)
            }
            (Target::Region(_), None) => "relay region".to_string(),
        }
    }
}

/// Configures and builds a [`Client`].
///
/// Everything here is fixed once the client is built; the runtime-settable
/// flags live on [`Client`] itself.
pub struct ClientBuilder {
    secret_key: SecretKey,
    connector: Arc<DynRelayConnector<'static>>,
    dialer: Arc<DynDialer<'static>>,
    dns_resolver: Option<Arc<DynDnsResolver<'static>>>,
    tls_config: Option<rustls::ClientConfig>,
    mesh_key: Option<String>,
    is_prober: bool,
}

impl ClientBuilder {
    /// Starts a builder from the caller identity and the relay codec.
    pub fn new(secret_key: SecretKey, connector: impl RelayConnector + 'static) -> Self {
        Self {
            secret_key,
            connector: DynRelayConnector::new_arc(connector),
            dialer: DynDialer::new_arc(NetDialer),
            dns_resolver: None,
            tls_config: None,
            mesh_key: None,
            is_prober: false,
        }
    }

    /// Overrides the TLS client configuration.
    pub fn tls_config(mut self, config: rustls::ClientConfig) -> Self {
        self.tls_config = Some(config);
        self
    }

    /// Installs a DNS cache consulted before fixed-URL dials.
    pub fn dns_resolver(mut self, resolver: impl DnsResolver + 'static) -> Self {
        self.dns_resolver = Some(DynDnsResolver::new_arc(resolver));
        self
    }

    /// Replaces the default network dialer.
    pub fn dialer(mut self, dialer: impl Dialer + 'static) -> Self {
        self.dialer = DynDialer::new_arc(dialer);
        self
    }

    /// Sets the mesh-operator key enabling the privileged operations.
    pub fn mesh_key(mut self, key: impl Into<String>) -> Self {
        self.mesh_key = Some(key.into());
        self
    }

    /// Declares this client as a prober to the server.
    pub fn is_prober(mut self, is_prober: bool) -> Self {
        self.is_prober = is_prober;
        self
    }

    /// Builds a client for a fixed relay URL. Connects lazily.
    pub fn for_url(self, url: &str) -> Result<Client, ClientError> {
        let target = Target::Url(UrlTarget::parse(url)?);
        Ok(self.build(target))
    }

    /// Builds a client that asks `get_region` for its dial targets on every
    /// connect attempt. `None` means the directory is unavailable right now.
    pub fn for_region(
        self,
        get_region: impl Fn() -> Option<RelayRegion> + Send + Sync + 'static,
    ) -> Client {
        self.build(Target::Region(Box::new(get_region)))
    }

    fn build(self, target: Target) -> Client {
        let public_key = self.secret_key.public();
        Client {
            inner: Arc::new(ClientInner {
                secret_key: self.secret_key,
                public_key,
                target,
                connector: self.connector,
                dialer: self.dialer,
                dns_resolver: self.dns_resolver,
                tls_config: self.tls_config,
                mesh_key: self.mesh_key,
                is_prober: self.is_prober,
                cancel: CancellationToken::new(),
                state: Mutex::new(ConnState::default()),
            }),
        }
    }
}

/// A relay client that connects on first use and transparently reconnects
/// after failures.
///
/// A failed `send` or `recv` reports its error without retrying; the next
/// call re-establishes the connection (unless [`Client::close`] was called).
/// Cloning shares the same connection state.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    secret_key: SecretKey,
    public_key: PublicKey,
    target: Target,
    connector: Arc<DynRelayConnector<'static>>,
    dialer: Arc<DynDialer<'static>>,
    dns_resolver: Option<Arc<DynDnsResolver<'static>>>,
    tls_config: Option<rustls::ClientConfig>,
    mesh_key: Option<String>,
    is_prober: bool,
    /// Tripped exactly by `close`; aborts an in-flight connect that holds
    /// the state mutex.
    cancel: CancellationToken,
    state: Mutex<ConnState>,
}

#[derive(Default)]
struct ConnState {
    closed: bool,
    preferred: bool,
    can_ack_pings: bool,
    conn: Option<ActiveConn>,
    /// Incremented once per successful connect; valid generations are > 0.
    conn_gen: u64,
    server_public_key: Option<PublicKey>,
}

struct ActiveConn {
    conn: ArcRelayConn,
    closer: IoCloser,
    conn_gen: u64,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Client({})", self.inner.public_key.fmt_short())
    }
}

impl Client {
    /// Builds a client for a fixed relay URL. Connects lazily; use
    /// [`Client::connect`] to connect eagerly.
    pub fn for_url(
        secret_key: SecretKey,
        url: &str,
        connector: impl RelayConnector + 'static,
    ) -> Result<Self, ClientError> {
        ClientBuilder::new(secret_key, connector).for_url(url)
    }

    /// Builds a client for a directory-provided region. Connects lazily.
    pub fn for_region(
        secret_key: SecretKey,
        connector: impl RelayConnector + 'static,
        get_region: impl Fn() -> Option<RelayRegion> + Send + Sync + 'static,
    ) -> Self {
        ClientBuilder::new(secret_key, connector).for_region(get_region)
    }

    /// Connects or reconnects, unless already connected.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.connect_impl("connect").await.map(|_| ())
    }

    /// The caller's public key.
    pub fn public_key(&self) -> PublicKey {
        self.inner.public_key
    }

    /// The server's public key, learned on the last successful connect.
    pub async fn server_public_key(&self) -> Option<PublicKey> {
        self.inner.state.lock().await.server_public_key
    }

    /// Whether [`Client::close`] has been called.
    pub async fn is_closed(&self) -> bool {
        self.inner.state.lock().await.closed
    }

    /// Sends a packet to `dst`, connecting first if needed.
    pub async fn send(&self, dst: PublicKey, packet: &[u8]) -> Result<(), ClientError> {
        let (conn, _) = self.connect_impl("send").await?;
        if let Err(err) = conn.send(dst, packet).await {
            self.close_for_reconnect(&conn).await;
            return Err(e!(ClientError::Relay, err));
        }
        Ok(())
    }

    /// Forwards a packet from `src` to `dst` on behalf of a mesh peer.
    pub async fn forward_packet(
        &self,
        src: PublicKey,
        dst: PublicKey,
        packet: &[u8],
    ) -> Result<(), ClientError> {
        let (conn, _) = self.connect_impl("forward-packet").await?;
        if let Err(err) = conn.forward_packet(src, dst, packet).await {
            self.close_for_reconnect(&conn).await;
            return Err(e!(ClientError::Relay, err));
        }
        Ok(())
    }

    /// Replies to a server ping. Best effort: never connects or reconnects,
    /// since the server hangs up on its own when pongs go missing.
    pub async fn send_pong(&self, data: [u8; 8]) -> Result<(), ClientError> {
        let conn = {
            let state = self.inner.state.lock().await;
            if state.closed {
                return Err(e!(ClientError::Closed));
            }
            let Some(active) = &state.conn else {
                return Err(e!(ClientError::NotConnected));
            };
            active.conn.clone()
        };
        conn.send_pong(data)
            .await
            .map_err(|err| e!(ClientError::Relay, err))
    }

    /// Notes whether this client considers the relay its preferred home.
    /// Pushed to the live connection when the value changes; also applied
    /// to every future connection.
    pub async fn note_preferred(&self, preferred: bool) {
        let conn = {
            let mut state = self.inner.state.lock().await;
            if state.preferred == preferred {
                return;
            }
            state.preferred = preferred;
            state.conn.as_ref().map(|active| active.conn.clone())
        };
        if let Some(conn) = conn
            && let Err(err) = conn.note_preferred(preferred).await
        {
            warn!("failed to note preferred={preferred}: {err:#}");
            self.close_for_reconnect(&conn).await;
        }
    }

    /// Sets whether future connections will reply to server pings.
    pub async fn set_can_ack_pings(&self, can_ack_pings: bool) {
        self.inner.state.lock().await.can_ack_pings = can_ack_pings;
    }

    /// Subscribes to peer connect/disconnect events. Requires a mesh key.
    pub async fn watch_connection_changes(&self) -> Result<(), ClientError> {
        let (conn, _) = self.connect_impl("watch-connection-changes").await?;
        if let Err(err) = conn.watch_connection_changes().await {
            self.close_for_reconnect(&conn).await;
            return Err(e!(ClientError::Relay, err));
        }
        Ok(())
    }

    /// Asks the server to close `target`'s connection. Requires a mesh key.
    pub async fn close_peer(&self, target: PublicKey) -> Result<(), ClientError> {
        let (conn, _) = self.connect_impl("close-peer").await?;
        if let Err(err) = conn.close_peer(target).await {
            self.close_for_reconnect(&conn).await;
            return Err(e!(ClientError::Relay, err));
        }
        Ok(())
    }

    /// Receives one message, connecting first if needed.
    pub async fn recv(&self) -> Result<ReceivedMessage, ClientError> {
        self.recv_detail().await.map(|(msg, _)| msg)
    }

    /// Like [`Client::recv`], but also returns the connection generation.
    /// The generation increments on every reconnect, so callers can detect
    /// that earlier messages belonged to a different connection.
    pub async fn recv_detail(&self) -> Result<(ReceivedMessage, u64), ClientError> {
        let (conn, conn_gen) = self.connect_impl("recv").await?;
        match conn.recv().await {
            Ok(msg) => Ok((msg, conn_gen)),
            Err(err) => {
                self.close_for_reconnect(&conn).await;
                if self.is_closed().await {
                    return Err(e!(ClientError::Closed));
                }
                Err(e!(ClientError::Relay, err))
            }
        }
    }

    /// Closes the client. No reconnects happen afterwards; every later
    /// operation returns [`ClientError::Closed`], as does every `close`
    /// call after the first.
    pub async fn close(&self) -> Result<(), ClientError> {
        // Tripped outside the lock so it can abort an in-flight connect,
        // which holds the lock.
        self.inner.cancel.cancel();

        let mut state = self.inner.state.lock().await;
        if state.closed {
            return Err(e!(ClientError::Closed));
        }
        state.closed = true;
        if let Some(active) = state.conn.take() {
            active.closer.close();
        }
        Ok(())
    }

    /// Returns the live connection, establishing one first when the slot is
    /// empty. Serializes concurrent callers on the state mutex: relay
    /// connects take seconds at worst, and one-at-a-time attempts avoid a
    /// thundering herd on reconnect.
    async fn connect_impl(
        &self,
        caller: &'static str,
    ) -> Result<(ArcRelayConn, u64), ClientError> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        if state.closed {
            return Err(e!(ClientError::Closed));
        }
        if let Some(active) = &state.conn {
            return Ok((active.conn.clone(), active.conn_gen));
        }

        match inner
            .establish(&mut state, caller)
            .timeout(CONNECT_TIMEOUT)
            .with_cancellation_token(&inner.cancel)
            .await
        {
            // close() tripped the lifecycle token mid-attempt; dropping the
            // attempt future closed whatever sockets it had opened.
            None => Err(e!(ClientError::Closed)),
            Some(Err(_elapsed)) => Err(e!(ClientError::Connect {
                caller,
                target: inner.target.describe(None),
                source: anyerr!("timed out after {CONNECT_TIMEOUT:?}"),
            })),
            Some(Ok(res)) => res,
        }
    }

    /// Forgets and closes the connection, but only if `broken` is still the
    /// one in the slot. A sender and the receiver failing at the same time
    /// both call this; the loser sees a rotated slot and does nothing, so
    /// the pair cannot keep tearing down each other's fresh connections.
    async fn close_for_reconnect(&self, broken: &ArcRelayConn) {
        let mut state = self.inner.state.lock().await;
        let Some(active) = &state.conn else {
            return;
        };
        if !Arc::ptr_eq(&active.conn, broken) {
            return;
        }
        active.closer.close();
        state.conn = None;
    }
}

impl ClientInner {
    async fn establish(
        &self,
        state: &mut ConnState,
        caller: &'static str,
    ) -> Result<(ArcRelayConn, u64), ClientError> {
        let region = match &self.target {
            Target::Region(get_region) => match get_region() {
                Some(region) => Some(region),
                None => return Err(e!(ClientError::RegionUnavailable)),
            },
            Target::Url(_) => None,
        };
        let target = self.target.describe(region.as_ref());
        debug!(caller, %target, "connecting");

        match self.dial_and_upgrade(state, region.as_ref()).await {
            Ok(ok) => Ok(ok),
            Err(source) => {
                debug!(caller, %target, "connect failed: {source:#}");
                Err(e!(ClientError::Connect {
                    caller,
                    target,
                    source,
                }))
            }
        }
    }

    async fn dial_and_upgrade(
        &self,
        state: &mut ConnState,
        region: Option<&RelayRegion>,
    ) -> Result<(ArcRelayConn, u64), AnyError> {
        struct Upgrade<'a> {
            server_name: &'a str,
            host_header: &'a str,
            path: &'a str,
            use_tls: bool,
            node: Option<&'a RelayNode>,
        }

        let (transport, up): (TcpTransport, Upgrade<'_>) = match (&self.target, region) {
            (Target::Url(url), _) => (
                self.dial_url(url).await?,
                Upgrade {
                    server_name: &url.host,
                    host_header: &url.host_header,
                    path: &url.path,
                    use_tls: url.use_tls,
                    node: None,
                },
            ),
            (_, Some(region)) => {
                let (transport, node) = dial::dial_region(&self.dialer, region).await?;
                (
                    transport,
                    Upgrade {
                        server_name: &node.host_name,
                        host_header: &node.host_name,
                        path: node.relay_path(),
                        use_tls: true,
                        node: Some(node),
                    },
                )
            }
            (Target::Region(_), None) => return Err(anyerr!("relay region not available")),
        };

        let (guarded, closer) = GuardedIo::new(transport);

        // Server identity learned out-of-band from the certificate chain.
        let mut server_key: Option<PublicKey> = None;
        let mut server_proto_version: u8 = 0;

        let http_stream = if up.use_tls {
            let config = tls::client_config(self.tls_config.as_ref(), up.node)?;
            let tls_stream = tls::connect(config, up.server_name, guarded).await?;
            {
                let (_, session) = tls_stream.get_ref();
                // Certificates travel encrypted only from TLS 1.3 on; under
                // older versions the chain is not a usable side channel.
                if session.protocol_version() == Some(rustls::ProtocolVersion::TLSv1_3)
                    && let Some(certs) = session.peer_certificates()
                    && let Some((key, version)) = parse_meta_cert(certs)
                {
                    server_key = Some(key);
                    server_proto_version = version;
                }
            }
            MaybeTlsStream::Tls(tls_stream)
        } else {
            MaybeTlsStream::Plain(guarded)
        };

        let fast_start = server_key.is_some() && server_proto_version != 0;
        let (read_half, write_half) = tokio::io::split(http_stream);
        let mut reader = HandshakeReader::new(read_half, HEADER_SECTION_MAX_LENGTH);
        let mut writer = BufWriter::new(write_half);

        let mut request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nUpgrade: {UPGRADE_PROTOCOL}\r\nConnection: Upgrade\r\n",
            up.path, up.host_header,
        );
        if fast_start {
            request.push_str(&format!("{FAST_START_HEADER}: 1\r\n"));
        }
        request.push_str("\r\n");
        writer
            .write_all(request.as_bytes())
            .await
            .std_context("failed to write upgrade request")?;

        if fast_start {
            // The server sends no HTTP response in fast-start mode; the
            // request is not even flushed here, the codec's first handshake
            // frame takes it along.
            debug!("fast-start upgrade, skipping HTTP response");
        } else {
            writer
                .flush()
                .await
                .std_context("failed to flush upgrade request")?;
            let response = HttpResponse::read(&mut reader).await?;
            if response.status != StatusCode::SWITCHING_PROTOCOLS {
                let snippet = body_snippet(&mut reader).await;
                return Err(anyerr!(
                    "upgrade failed: {}: {snippet}",
                    response.status_line()
                ));
            }
        }

        let opts = HandshakeOpts {
            secret_key: self.secret_key.clone(),
            mesh_key: self.mesh_key.clone(),
            server_public_key: server_key,
            can_ack_pings: state.can_ack_pings,
            is_prober: self.is_prober,
        };
        let conn = self
            .connector
            .handshake(RelayIo { reader, writer }, opts)
            .await
            .context("relay handshake failed")?;

        if state.preferred
            && let Err(err) = conn.note_preferred(true).await
        {
            closer.close();
            return Err(err).context("failed to note preferred on new connection");
        }

        state.conn_gen += 1;
        state.server_public_key = Some(conn.server_public_key());
        state.conn = Some(ActiveConn {
            conn: conn.clone(),
            closer,
            conn_gen: state.conn_gen,
        });
        debug!(conn_gen = state.conn_gen, "relay connection established");
        Ok((conn, state.conn_gen))
    }

    /// Dials a fixed-URL target through the node dialer, resolving the host
    /// through the DNS cache first when one is configured.
    async fn dial_url(&self, url: &UrlTarget) -> Result<TcpTransport, AnyError> {
        let mut node = RelayNode {
            host_name: url.host.clone(),
            port: Some(url.port),
            ..Default::default()
        };
        if let Some(dns) = &self.dns_resolver {
            match dns.lookup_ip(&url.host).await {
                Ok(ip) => {
                    // Pin the dial to the resolved address. Setting both
                    // literals to the same value enables exactly the
                    // matching family.
                    let literal = ip.to_string();
                    node.ipv4 = Some(literal.clone());
                    node.ipv6 = Some(literal);
                }
                Err(err) if self.dialer.is_socks() => {
                    // A SOCKS dialer resolves names itself.
                    debug!(
                        "DNS lookup of {} failed, deferring to SOCKS dialer: {err}",
                        url.host
                    );
                }
                Err(err) => {
                    return Err(err).std_context(format!("DNS lookup of {} failed", url.host));
                }
            }
        }
        dial::dial_node(&self.dialer, &node).await
    }
}

/// Grabs up to 256 bytes of response body for the error message on a
/// failed upgrade. Takes what is already queued plus one short read; the
/// server may keep the connection open, so no draining to EOF.
async fn body_snippet(reader: &mut HandshakeReader<impl tokio::io::AsyncRead + Unpin>) -> String {
    if reader.peeked().is_empty() {
        let _ = reader.fill().timeout(Duration::from_millis(500)).await;
    }
    let buf = reader.peeked();
    String::from_utf8_lossy(&buf[..buf.len().min(256)]).into_owned()
}

/// Looks for the server's "meta cert" in the peer chain: a certificate
/// whose subject CN is the hex server key behind the well-known prefix,
/// with the protocol version in the serial number. The serial must fit in
/// one byte.
fn parse_meta_cert(certs: &[CertificateDer<'_>]) -> Option<(PublicKey, u8)> {
    for der in certs {
        let Ok((_, cert)) = x509_parser::parse_x509_certificate(der.as_ref()) else {
            continue;
        };
        let Some(cn) = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|attr| attr.as_str().ok())
        else {
            continue;
        };
        let Some(hex_key) = cn.strip_prefix(TLS_META_CERT_PREFIX) else {
            continue;
        };
        let Ok(key) = hex_key.parse::<PublicKey>() else {
            continue;
        };
        let serial = cert.raw_serial();
        let first_nonzero = serial.iter().position(|b| *b != 0).unwrap_or(serial.len());
        let serial = &serial[first_nonzero..];
        if serial.len() <= 1 {
            return Some((key, serial.first().copied().unwrap_or(0)));
        }
    }
    None
}
