//! Dual-stack TCP listener for the video protocol.
//!
//! One socket per address family on the same port. The IPv6 socket sets
//! `IPV6_V6ONLY` so the two can coexist; if only one family is available the
//! server runs single-stack with a warning. Accepted connections are handed
//! to a freshly spawned orchestrator task; sessions never serialize.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::constants::DRAIN_WINDOW;
use crate::context::RuntimeContext;
use crate::error::{FramecastError, FramecastResult};
use crate::session::handle_connection;

/// Resolves a bind spec into at most one address per family.
///
/// The unspecified IPv6 address (`::`, the default) expands to the wildcard
/// of both families so the server listens dual-stack. Hostnames resolve
/// through the system lookup; the first address of each family wins.
pub fn resolve_bind_addrs(bind: &str, port: u16) -> FramecastResult<Vec<SocketAddr>> {
    if bind == "::" || bind.is_empty() {
        return Ok(vec![
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
        ]);
    }

    if let Ok(ip) = bind.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }

    let resolved = (bind, port)
        .to_socket_addrs()
        .map_err(|e| FramecastError::Configuration(format!("resolve '{}': {}", bind, e)))?;

    let mut v4 = None;
    let mut v6 = None;
    for addr in resolved {
        match addr {
            SocketAddr::V4(_) if v4.is_none() => v4 = Some(addr),
            SocketAddr::V6(_) if v6.is_none() => v6 = Some(addr),
            _ => {}
        }
    }

    let addrs: Vec<SocketAddr> = [v6, v4].into_iter().flatten().collect();
    if addrs.is_empty() {
        return Err(FramecastError::Configuration(format!(
            "'{}' resolved to no usable addresses",
            bind
        )));
    }
    Ok(addrs)
}

/// Opens one listening socket for `addr`'s family.
///
/// Address reuse is always enabled; IPv6 sockets are pinned to v6-only so a
/// sibling IPv4 socket can share the port.
fn open_listener(addr: SocketAddr) -> FramecastResult<TcpListener> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| FramecastError::Configuration(format!("socket({:?}): {}", domain, e)))?;

    socket
        .set_reuse_address(true)
        .map_err(|e| FramecastError::Configuration(format!("SO_REUSEADDR: {}", e)))?;
    if addr.is_ipv6() {
        socket
            .set_only_v6(true)
            .map_err(|e| FramecastError::Configuration(format!("IPV6_V6ONLY: {}", e)))?;
    }

    socket
        .bind(&addr.into())
        .map_err(|e| FramecastError::Configuration(format!("bind {}: {}", addr, e)))?;
    socket
        .listen(128)
        .map_err(|e| FramecastError::Configuration(format!("listen {}: {}", addr, e)))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| FramecastError::Configuration(e.to_string()))?;

    TcpListener::from_std(socket.into())
        .map_err(|e| FramecastError::Configuration(format!("tokio listener: {}", e)))
}

/// The protocol listener: up to one socket per family, serving concurrently.
pub struct VideoListener {
    listeners: Vec<TcpListener>,
}

impl VideoListener {
    /// Binds every family the bind address resolves to. Partial failure is
    /// fine as long as at least one socket binds.
    pub fn bind(bind: &str, port: u16) -> FramecastResult<Self> {
        let mut listeners = Vec::new();
        for addr in resolve_bind_addrs(bind, port)? {
            let family = if addr.is_ipv6() { "IPv6" } else { "IPv4" };
            match open_listener(addr) {
                Ok(listener) => {
                    log::info!("[Listener] {} listening on {}", family, addr);
                    listeners.push(listener);
                }
                Err(e) => {
                    log::warn!("[Listener] {} socket unavailable: {}", family, e);
                }
            }
        }

        if listeners.is_empty() {
            return Err(FramecastError::Configuration(
                "no listening socket could be created".into(),
            ));
        }
        Ok(Self { listeners })
    }

    /// Local addresses actually bound (useful with port 0).
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|l| l.local_addr().ok())
            .collect()
    }

    /// Accept loop over every bound socket until `shutdown` fires, then a
    /// drain window for in-flight sessions.
    pub async fn serve(self, ctx: RuntimeContext, shutdown: CancellationToken) {
        let tracker = TaskTracker::new();

        for listener in self.listeners {
            let ctx = ctx.clone();
            let shutdown = shutdown.clone();
            let sessions = tracker.clone();
            tracker.spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        accepted = listener.accept() => match accepted {
                            Ok((stream, peer)) => {
                                let ctx = ctx.clone();
                                sessions.spawn(async move {
                                    handle_connection(ctx, stream, peer).await;
                                });
                            }
                            Err(e) => {
                                log::warn!("[Listener] Accept failed: {}", e);
                            }
                        },
                    }
                }
            });
        }

        shutdown.cancelled().await;
        tracker.close();
        log::info!(
            "[Listener] Shutting down, draining sessions for up to {:?}",
            DRAIN_WINDOW
        );
        if tokio::time::timeout(DRAIN_WINDOW, tracker.wait())
            .await
            .is_err()
        {
            log::warn!("[Listener] Drain window elapsed with sessions still running");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_bind_expands_to_both_families() {
        let addrs = resolve_bind_addrs("::", 9090).unwrap();
        assert_eq!(addrs.len(), 2);
        assert!(addrs[0].is_ipv6());
        assert!(addrs[1].is_ipv4());
        assert!(addrs.iter().all(|a| a.port() == 9090));
    }

    #[test]
    fn explicit_ipv4_binds_single_stack() {
        let addrs = resolve_bind_addrs("127.0.0.1", 9090).unwrap();
        assert_eq!(addrs.len(), 1);
        assert!(addrs[0].is_ipv4());
    }

    #[test]
    fn explicit_ipv6_binds_single_stack() {
        let addrs = resolve_bind_addrs("::1", 9090).unwrap();
        assert_eq!(addrs.len(), 1);
        assert!(addrs[0].is_ipv6());
    }

    #[tokio::test]
    async fn bound_sockets_accept_connections() {
        // Port 0 avoids collisions; loopback keeps this hermetic.
        let listener = VideoListener::bind("127.0.0.1", 0).unwrap();
        let addr = listener.local_addrs()[0];

        let accept_task = tokio::spawn(async move {
            listener.listeners[0].accept().await.map(|(_, peer)| peer)
        });
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let peer = accept_task.await.unwrap().unwrap();
        assert_eq!(peer.ip(), client.local_addr().unwrap().ip());
    }

    #[tokio::test]
    async fn v6_only_socket_coexists_with_v4_on_same_port() {
        // Bind v6 first on an ephemeral port, then v4 on the same port.
        let v6 = match open_listener("[::1]:0".parse().unwrap()) {
            Ok(l) => l,
            // Hosts without IPv6 run single-stack; nothing to assert here.
            Err(_) => return,
        };
        let port = v6.local_addr().unwrap().port();
        let v4 = open_listener(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port));
        assert!(v4.is_ok(), "IPv4 bind on port {} failed: {:?}", port, v4.err());
    }
}
