//! The UDP protocol listener.
//!
//! Binds one datagram socket per resolved local address for the configured
//! host and port -- both wildcard families when no host is given -- and
//! runs a receive loop per socket. Datagrams are split into lines, parsed,
//! and applied to the shared metric store. A malformed line is logged and
//! dropped; it never aborts the batch or the listener. Socket loops exit on
//! the shutdown signal or on an unexpected receive failure.
//!
//! ## Metrics
//!
//! `packets_received`: Total datagrams received
//! `bytes_received`: Total bytes received
//! `lines_applied`: Lines parsed and applied to the store
//! `parse_errors`: Lines dropped as malformed
//!

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use metrics::counter;
use serde::Deserialize;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{self, UdpSocket};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::parser;
use crate::signals::Shutdown;
use crate::store::Store;

fn default_port() -> u16 {
    8125
}

fn default_read_buffer_bytes() -> usize {
    4096
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
/// Configuration for [`Listener`].
pub struct Config {
    /// Host to bind. When absent, both the IPv4 and IPv6 wildcard
    /// addresses are bound.
    #[serde(default)]
    pub host: Option<String>,
    /// Port to bind.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Size of the receive buffer; datagrams longer than this are
    /// truncated by the kernel.
    #[serde(default = "default_read_buffer_bytes")]
    pub read_buffer_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: None,
            port: default_port(),
            read_buffer_bytes: default_read_buffer_bytes(),
        }
    }
}

/// Errors produced by [`Listener`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Resolving the configured host failed outright.
    #[error("Failed to resolve {host}:{port}: {source}")]
    Resolve {
        /// Configured host
        host: String,
        /// Configured port
        port: u16,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// Every candidate address failed to bind. Individual failures are
    /// tolerated as long as one socket comes up.
    #[error("No listening socket could be bound for {host}:{port}")]
    NoSocketsBound {
        /// Configured host, wildcard rendered as `*`
        host: String,
        /// Configured port
        port: u16,
    },
    /// Error receiving a packet, other than would-block.
    #[error("Failed to receive packet on {addr}: {source}")]
    Recv {
        /// Listening address
        addr: SocketAddr,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// A per-socket receive task panicked.
    #[error("Listener task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Bind a non-blocking datagram socket with address reuse enabled, so
/// wildcard sockets of both families can share the port.
fn bind_socket(addr: SocketAddr) -> io::Result<std::net::UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        // Keep the IPv6 wildcard from capturing IPv4 traffic, which would
        // conflict with the separately-bound IPv4 socket.
        socket.set_only_v6(true)?;
    }
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

#[derive(Debug)]
/// The UDP listener: owns every bound socket and the receive loops.
pub struct Listener {
    sockets: Vec<UdpSocket>,
    store: Arc<Mutex<Store>>,
    shutdown: Shutdown,
    read_buffer_bytes: usize,
}

impl Listener {
    /// Resolve the configured address and bind every candidate.
    ///
    /// # Errors
    ///
    /// Function will return an error if the host does not resolve or if no
    /// candidate address could be bound. Partial bind failures are logged
    /// and tolerated.
    pub async fn bind(
        config: &Config,
        store: Arc<Mutex<Store>>,
        shutdown: Shutdown,
    ) -> Result<Self, Error> {
        let candidates: Vec<SocketAddr> = match &config.host {
            Some(host) => net::lookup_host((host.as_str(), config.port))
                .await
                .map_err(|source| Error::Resolve {
                    host: host.clone(),
                    port: config.port,
                    source: Box::new(source),
                })?
                .collect(),
            None => vec![
                SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port)),
                SocketAddr::from((Ipv6Addr::UNSPECIFIED, config.port)),
            ],
        };

        let mut sockets = Vec::new();
        for addr in candidates {
            debug!(%addr, "trying to bind");
            let bound = bind_socket(addr).and_then(UdpSocket::from_std);
            match bound {
                Ok(socket) => {
                    info!(%addr, "listening");
                    sockets.push(socket);
                }
                Err(error) => {
                    warn!(%addr, %error, "failed to bind, continuing with remaining candidates");
                }
            }
        }

        if sockets.is_empty() {
            return Err(Error::NoSocketsBound {
                host: config.host.clone().unwrap_or_else(|| "*".to_string()),
                port: config.port,
            });
        }

        Ok(Self {
            sockets,
            store,
            shutdown,
            read_buffer_bytes: config.read_buffer_bytes,
        })
    }

    /// Addresses actually bound, in bind order.
    #[must_use]
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.sockets
            .iter()
            .filter_map(|socket| socket.local_addr().ok())
            .collect()
    }

    /// Run the listener to completion.
    ///
    /// One receive loop runs per bound socket; updates are serialized
    /// through the store's lock. Returns once every loop has exited, which
    /// happens on shutdown or when a socket fails fatally.
    ///
    /// # Errors
    ///
    /// Function will return an error if any socket's receive loop failed;
    /// healthy sockets continue until shutdown regardless.
    pub async fn run(self) -> Result<(), Error> {
        let mut tasks = JoinSet::new();
        for socket in self.sockets {
            let store = Arc::clone(&self.store);
            let shutdown = self.shutdown.clone();
            let read_buffer_bytes = self.read_buffer_bytes;
            tasks.spawn(recv_loop(socket, store, read_buffer_bytes, shutdown));
        }

        let mut result = Ok(());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(error)) => result = Err(error),
                Err(error) => result = Err(Error::Join(error)),
            }
        }
        result
    }
}

async fn recv_loop(
    socket: UdpSocket,
    store: Arc<Mutex<Store>>,
    read_buffer_bytes: usize,
    mut shutdown: Shutdown,
) -> Result<(), Error> {
    let addr = socket.local_addr().map_err(|source| Error::Recv {
        addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        source: Box::new(source),
    })?;
    let mut buf = vec![0; read_buffer_bytes];

    loop {
        tokio::select! {
            packet = socket.recv_from(&mut buf) => {
                match packet {
                    Ok((bytes, _)) => {
                        counter!("packets_received").increment(1);
                        counter!("bytes_received").increment(bytes as u64);
                        process_buffer(&buf[..bytes], &store);
                    }
                    // A receive that would block, or was interrupted, is a
                    // benign no-op.
                    Err(error)
                        if matches!(
                            error.kind(),
                            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                        ) => {}
                    Err(source) => {
                        warn!(%addr, error = %source, "socket receive failed");
                        return Err(Error::Recv {
                            addr,
                            source: Box::new(source),
                        });
                    }
                }
            }
            () = shutdown.recv() => {
                info!(%addr, "shutdown signal received");
                return Ok(());
            }
        }
    }
}

/// Split one datagram into lines and apply each to the store. Empty lines
/// are skipped; malformed lines are logged and dropped without touching
/// the store.
fn process_buffer(buffer: &[u8], store: &Mutex<Store>) {
    for raw in buffer.split(|byte| *byte == b'\n') {
        if raw.is_empty() {
            continue;
        }
        let Ok(line) = std::str::from_utf8(raw) else {
            counter!("parse_errors").increment(1);
            warn!(
                line = %String::from_utf8_lossy(raw),
                "unable to parse line: invalid utf-8"
            );
            continue;
        };
        match parser::parse(line) {
            Ok(update) => {
                store
                    .lock()
                    .expect("metric store lock poisoned")
                    .apply(update);
                counter!("lines_applied").increment(1);
            }
            Err(error) => {
                counter!("parse_errors").increment(1);
                warn!(line, %error, "unable to parse line");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MetricKey, MetricKind};
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    fn loopback_config() -> Config {
        Config {
            host: Some("127.0.0.1".to_string()),
            port: 0,
            read_buffer_bytes: 4096,
        }
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        timeout(Duration::from_secs(5), async {
            while !condition() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ingests_datagrams_and_isolates_bad_lines() {
        let store = Arc::new(Mutex::new(Store::new()));
        let shutdown = Shutdown::new();
        let listener = Listener::bind(&loopback_config(), Arc::clone(&store), shutdown.clone())
            .await
            .expect("bind succeeds");
        let addr = listener.local_addrs()[0];
        let handle = tokio::spawn(listener.run());

        let client = UdpSocket::bind("127.0.0.1:0").await.expect("client binds");
        // One batch: two good lines, one malformed, one empty trailing.
        client
            .send_to(b"requests:3|c\nfoo|c\nqueue:+2|g\n\n", addr)
            .await
            .expect("send succeeds");

        wait_for(|| store.lock().expect("lock").len() == 2).await;

        let store = store.lock().expect("lock");
        let counter = store
            .get(&MetricKey::new(MetricKind::Counter, "requests"))
            .expect("counter created");
        assert!((counter.value() - 3.0).abs() < 1e-9);
        let gauge = store
            .get(&MetricKey::new(MetricKind::Gauge, "queue"))
            .expect("gauge created");
        assert!((gauge.value() - 2.0).abs() < 1e-9);
        // The malformed line created nothing under any type.
        assert!(store.get(&MetricKey::new(MetricKind::Counter, "foo")).is_none());
        drop(store);

        shutdown.signal();
        timeout(Duration::from_secs(5), handle)
            .await
            .expect("listener exits on shutdown")
            .expect("task joins")
            .expect("listener exits cleanly");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn updates_accumulate_across_datagrams() {
        let store = Arc::new(Mutex::new(Store::new()));
        let shutdown = Shutdown::new();
        let listener = Listener::bind(&loopback_config(), Arc::clone(&store), shutdown.clone())
            .await
            .expect("bind succeeds");
        let addr = listener.local_addrs()[0];
        let handle = tokio::spawn(listener.run());

        let client = UdpSocket::bind("127.0.0.1:0").await.expect("client binds");
        for _ in 0..10 {
            client
                .send_to(b"hits:1|c", addr)
                .await
                .expect("send succeeds");
        }

        let key = MetricKey::new(MetricKind::Counter, "hits");
        wait_for(|| {
            store
                .lock()
                .expect("lock")
                .get(&key)
                .is_some_and(|m| m.updates() == 10)
        })
        .await;

        shutdown.signal();
        handle
            .await
            .expect("task joins")
            .expect("listener exits cleanly");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn wildcard_bind_tolerates_partial_failure() {
        // With no host both wildcard families are attempted; at least one
        // must come up even on hosts without IPv6.
        let config = Config {
            host: None,
            port: 0,
            read_buffer_bytes: 4096,
        };
        let store = Arc::new(Mutex::new(Store::new()));
        let shutdown = Shutdown::new();
        let listener = Listener::bind(&config, store, shutdown.clone())
            .await
            .expect("at least one wildcard socket binds");
        assert!(!listener.local_addrs().is_empty());

        let handle = tokio::spawn(listener.run());
        shutdown.signal();
        handle
            .await
            .expect("task joins")
            .expect("listener exits cleanly");
    }
}
