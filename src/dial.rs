//! TCP establishment: per-node IPv4/IPv6 racing, region walking, and
//! CONNECT tunneling through an HTTP proxy.

use std::{io, net::IpAddr, sync::Arc, time::Duration};

use dynosaur::dynosaur;
use http::StatusCode;
use n0_error::{AnyError, Result, StdResultExt, anyerr};
use tokio::{io::AsyncWriteExt, net::TcpStream, task::JoinSet};
use tokio_util::time::FutureExt;
use tracing::{debug, warn};

use crate::{
    parse::{HEADER_SECTION_MAX_LENGTH, HandshakeReader, HttpResponse},
    proxy::{self, ProxyScheme, ProxyUrl},
    region::{RelayNode, RelayRegion},
    stream::{AsyncStream, TcpTransport},
    tls,
};

/// How long one node gets to produce a connected socket. Keeps a blackholed
/// address family from stalling the whole attempt on a kernel-length TCP
/// timeout.
pub(crate) const DIAL_NODE_TIMEOUT: Duration = Duration::from_millis(1500);

/// Joins a host and port into a dialable address, bracketing IPv6 literals.
pub(crate) fn join_host_port(host: &str, port: u16) -> String {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => format!("[{host}]:{port}"),
        _ => format!("{host}:{port}"),
    }
}

#[dynosaur(pub DynDialer = dyn(box) Dialer)]
/// Opens transports toward `host:port` addresses.
///
/// The default is [`NetDialer`]; injecting an implementation routes all
/// relay traffic through it (network namespaces, SOCKS, test fakes).
pub trait Dialer: Send + Sync {
    /// Connects to `addr` (`host:port`, IPv6 hosts bracketed).
    fn dial<'a>(
        &'a self,
        addr: &'a str,
    ) -> impl Future<Output = io::Result<TcpTransport>> + Send + 'a;

    /// Whether this dialer is a SOCKS proxy that resolves host names itself.
    fn is_socks(&self) -> bool;
}

/// Dialer over the host network stack.
#[derive(Debug, Default, Clone, Copy)]
pub struct NetDialer;

impl Dialer for NetDialer {
    async fn dial<'a>(&'a self, addr: &'a str) -> io::Result<TcpTransport> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Box::new(stream) as TcpTransport)
    }

    fn is_socks(&self) -> bool {
        false
    }
}

#[dynosaur(pub DynDnsResolver = dyn(box) DnsResolver)]
/// Optional DNS cache consulted before dialing fixed-URL targets.
pub trait DnsResolver: Send + Sync {
    /// Resolves `host` to one address.
    fn lookup_ip<'a>(
        &'a self,
        host: &'a str,
    ) -> impl Future<Output = io::Result<IpAddr>> + Send + 'a;
}

/// The address to dial for one protocol family, or `None` when the family
/// is disabled. An unset literal means "dial the host name and let DNS
/// choose"; a literal of the wrong family disables that family.
fn family_target(literal: Option<&str>, wanted: fn(&IpAddr) -> bool, host: &str) -> Option<String> {
    match literal {
        None => Some(host.to_string()),
        Some(literal) => match literal.parse::<IpAddr>() {
            Ok(ip) if wanted(&ip) => Some(literal.to_string()),
            _ => None,
        },
    }
}

/// Dials one node, racing IPv4 and IPv6 where enabled. The first socket to
/// connect wins; the loser is aborted and its socket dropped. All-failure
/// returns the first error observed.
pub(crate) async fn dial_node(
    dialer: &Arc<DynDialer<'static>>,
    node: &RelayNode,
) -> Result<TcpTransport, AnyError> {
    if let Some(proxy) = proxy::from_environment(&node.host_name) {
        return dial_node_via_proxy(node, &proxy).await;
    }

    let port = node.port();
    let targets = [
        family_target(node.ipv4.as_deref(), IpAddr::is_ipv4, &node.host_name),
        family_target(node.ipv6.as_deref(), IpAddr::is_ipv6, &node.host_name),
    ];

    let mut racers = JoinSet::new();
    for target in targets.into_iter().flatten() {
        let addr = join_host_port(&target, port);
        let dialer = dialer.clone();
        racers.spawn(async move { dialer.dial(&addr).await });
    }
    if racers.is_empty() {
        return Err(anyerr!(
            "both IPv4 and IPv6 are explicitly disabled for node {}",
            node.host_name
        ));
    }

    let race = async {
        let mut first_err: Option<AnyError> = None;
        while let Some(joined) = racers.join_next().await {
            match joined {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(err)) => {
                    first_err.get_or_insert(err.into());
                }
                Err(err) => {
                    first_err.get_or_insert(anyerr!("dial task failed: {err}"));
                }
            }
        }
        Err(first_err.unwrap_or_else(|| anyerr!("no dial attempt finished")))
    };
    match race.timeout(DIAL_NODE_TIMEOUT).await {
        Ok(res) => res,
        Err(_) => Err(anyerr!(
            "dialing {} timed out after {:?}",
            node.host_name,
            DIAL_NODE_TIMEOUT
        )),
    }
}

/// Dials the region's nodes in order until one connects, skipping STUN-only
/// nodes. All-failure returns the first error observed.
pub(crate) async fn dial_region<'r>(
    dialer: &Arc<DynDialer<'static>>,
    region: &'r RelayRegion,
) -> Result<(TcpTransport, &'r RelayNode), AnyError> {
    if region.nodes.is_empty() {
        return Err(anyerr!(
            "no nodes for region {} ({})",
            region.region_id,
            region.region_code
        ));
    }
    let mut first_err: Option<AnyError> = None;
    for node in &region.nodes {
        if node.stun_only {
            first_err.get_or_insert_with(|| {
                anyerr!(
                    "no non-STUNOnly nodes for region {} ({})",
                    region.region_id,
                    region.region_code
                )
            });
            continue;
        }
        match dial_node(dialer, node).await {
            Ok(stream) => return Ok((stream, node)),
            Err(err) => {
                debug!(node = %node.host_name, "node dial failed: {err:#}");
                first_err.get_or_insert(err);
            }
        }
    }
    Err(first_err.unwrap_or_else(|| anyerr!("no dialable nodes")))
}

/// Connects to `node` through an HTTP(S) proxy using CONNECT.
async fn dial_node_via_proxy(node: &RelayNode, proxy: &ProxyUrl) -> Result<TcpTransport, AnyError> {
    debug!(%proxy, node = %node.host_name, "dialing relay through HTTP proxy");
    let proxy_addr = join_host_port(&proxy.host, proxy.port());
    let stream = TcpStream::connect(&proxy_addr)
        .await
        .std_context("failed to connect to proxy")?;
    let target = join_host_port(&node.host_name, 443);
    match proxy.scheme {
        ProxyScheme::Https => {
            let config = tls::client_config(None, None)?;
            let stream = tls::connect(config, &proxy.host, stream).await?;
            tunnel_through_proxy(stream, &target, proxy).await
        }
        ProxyScheme::Http => tunnel_through_proxy(stream, &target, proxy).await,
    }
}

/// Issues a CONNECT request for `target` over an established proxy
/// connection and returns the tunneled transport. Any non-200 response
/// fails the dial; the connection is dropped on every failure path.
pub(crate) async fn tunnel_through_proxy(
    stream: impl AsyncStream,
    target: &str,
    proxy: &ProxyUrl,
) -> Result<TcpTransport, AnyError> {
    let (read_half, mut write_half) = tokio::io::split(stream);

    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {}\r\n", proxy.host);
    match proxy.auth_header() {
        Ok(Some(value)) => {
            request.push_str(&format!("Proxy-Authorization: {value}\r\n"));
        }
        Ok(None) => {}
        // Keep going without credentials; the proxy will say 407 if it
        // insists.
        Err(err) => warn!("failed to build proxy auth header for {proxy}: {err:#}"),
    }
    request.push_str("\r\n");

    write_half
        .write_all(request.as_bytes())
        .await
        .std_context("failed to write CONNECT request")?;

    let mut reader = HandshakeReader::new(read_half, HEADER_SECTION_MAX_LENGTH);
    let response = HttpResponse::read(&mut reader).await?;
    debug!(%target, status = %response.status, "CONNECT dial");
    if response.status != StatusCode::OK {
        return Err(anyerr!(
            "invalid response status from HTTP proxy {proxy} on CONNECT to {target}: {}",
            response.status_line()
        ));
    }
    Ok(Box::new(tokio::io::join(reader, write_half)))
}
