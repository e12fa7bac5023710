use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use russh::client;
use russh::client::AuthResult;
use russh::keys::{PrivateKeyWithHashAlg, PublicKey};
use tokio::io::copy_bidirectional;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::{ProbeSample, SessionHandle, Transport, TransportError};
use crate::config::model::TunnelConfig;

/// SSH keepalive interval for tunnel sessions (seconds).
pub const TUNNEL_KEEPALIVE_INTERVAL_SECS: u64 = 30;

/// Max missed keepalives before russh drops the connection.
pub const TUNNEL_KEEPALIVE_MAX: usize = 3;

/// Upper bound for a latency ping.
const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound for opening one direct-tcpip channel.
const CHANNEL_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

type SessionRef = Arc<client::Handle<TunnelHandler>>;

/// russh client handler for tunnel sessions.
struct TunnelHandler;

impl client::Handler for TunnelHandler {
    type Error = russh::Error;

    /// Accepts every host key. Host key pinning belongs to the caller's
    /// known_hosts policy, which this manager does not own.
    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

#[derive(Default)]
struct Traffic {
    sent: AtomicU64,
    received: AtomicU64,
}

struct SshSession {
    session: SessionRef,
    label: String,
    /// Cancels the local listener and every bridged connection.
    forward: CancellationToken,
    traffic: Arc<Traffic>,
}

/// Real transport: one russh session per tunnel, a local listener per
/// session, one `direct-tcpip` channel per accepted connection.
pub struct SshTransport {
    next_handle: AtomicU64,
    sessions: Mutex<HashMap<SessionHandle, SshSession>>,
}

impl SshTransport {
    pub fn new() -> Self {
        Self {
            next_handle: AtomicU64::new(1),
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for SshTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn connect_error(host: &str, port: u16, err: russh::Error) -> TransportError {
    match err {
        russh::Error::IO(e) if e.kind() == ErrorKind::TimedOut => {
            TransportError::Timeout(format!("{host}:{port}: {e}"))
        }
        russh::Error::IO(e) => TransportError::Unreachable(format!("{host}:{port}: {e}")),
        other => TransportError::Session(format!("{host}:{port}: {other}")),
    }
}

/// Authenticate with the configured private key, then the password.
async fn authenticate(
    session: &mut client::Handle<TunnelHandler>,
    config: &TunnelConfig,
) -> Result<(), TransportError> {
    let user = config.effective_user();
    let creds = &config.credentials;

    let (key, key_problem) = match usable_key(config) {
        Ok(key) => (key, None),
        Err(e) => {
            warn!(user = %user, error = %e, "Skipping private key, trying password");
            (None, Some(e))
        }
    };

    if let Some(key) = key {
        let hash_alg = session
            .best_supported_rsa_hash()
            .await
            .map_err(|e| TransportError::Session(e.to_string()))?
            .flatten();

        match session
            .authenticate_publickey(&user, PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
            .await
        {
            Ok(AuthResult::Success) => return Ok(()),
            Ok(AuthResult::Failure { .. }) => debug!(user = %user, "Public key rejected"),
            Err(e) => warn!(user = %user, error = %e, "Public key authentication errored"),
        }
    }

    if let Some(password) = creds.password.clone().map(Zeroizing::new) {
        match session.authenticate_password(&user, password.as_str()).await {
            Ok(AuthResult::Success) => return Ok(()),
            Ok(AuthResult::Failure { .. }) => debug!(user = %user, "Password rejected"),
            Err(e) => return Err(TransportError::Session(e.to_string())),
        }
    }

    let rejected = format!("{user}@{}:{} rejected all credentials", config.host, config.port);
    Err(TransportError::Auth(match key_problem {
        Some(problem) => format!("{rejected} ({problem})"),
        None => rejected,
    }))
}

/// Load and decode the configured private key, if any.
///
/// An unreadable or undecodable key is reported as `Err` so the caller can
/// still fall back to password authentication.
fn usable_key(config: &TunnelConfig) -> Result<Option<russh::keys::PrivateKey>, String> {
    let creds = &config.credentials;
    let text = match creds.load_private_key().map_err(|e| e.to_string())? {
        Some(text) => Zeroizing::new(text),
        None => return Ok(None),
    };
    let passphrase = creds.passphrase.clone().map(Zeroizing::new);
    russh::keys::decode_secret_key(&text, passphrase.as_ref().map(|p| p.as_str()))
        .map(Some)
        .map_err(|e| format!("Failed to decode private key: {e}"))
}

/// Bind `port` on the IPv4 loopback, and on the IPv6 loopback when the host
/// has one, so `localhost:<port>` reaches the forward whichever way the
/// client resolves it.
async fn bind_loopback(port: u16) -> Result<Vec<TcpListener>, TransportError> {
    let v4 = TcpListener::bind(("127.0.0.1", port)).await.map_err(|e| {
        if e.kind() == ErrorKind::AddrInUse {
            TransportError::PortInUse(port)
        } else {
            TransportError::Session(format!("Failed to bind 127.0.0.1:{port}: {e}"))
        }
    })?;

    match TcpListener::bind(("::1", port)).await {
        Ok(v6) => Ok(vec![v4, v6]),
        // Someone else would answer `localhost` on ::1.
        Err(e) if e.kind() == ErrorKind::AddrInUse => Err(TransportError::PortInUse(port)),
        Err(e) => {
            debug!(port, error = %e, "IPv6 loopback unavailable, forwarding on IPv4 only");
            Ok(vec![v4])
        }
    }
}

fn spawn_accept_loop(
    listener: TcpListener,
    session: SessionRef,
    token: CancellationToken,
    traffic: Arc<Traffic>,
    remote_host: String,
    remote_port: u32,
) {
    tokio::spawn(async move {
        loop {
            let (mut tcp_stream, peer) = tokio::select! {
                _ = token.cancelled() => {
                    debug!(addr = ?listener.local_addr().ok(), "Listener shutting down, releasing port");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                },
            };

            let session = Arc::clone(&session);
            let host = remote_host.clone();
            let token = token.clone();
            let traffic = Arc::clone(&traffic);

            tokio::spawn(async move {
                let channel = tokio::time::timeout(
                    CHANNEL_OPEN_TIMEOUT,
                    session.channel_open_direct_tcpip(&host, remote_port, "127.0.0.1", 0),
                )
                .await;

                let channel = match channel {
                    Ok(Ok(channel)) => channel,
                    Ok(Err(e)) => {
                        warn!(%peer, error = %e, "Failed to open direct-tcpip channel");
                        return;
                    }
                    Err(_) => {
                        warn!(%peer, "Timed out opening direct-tcpip channel");
                        return;
                    }
                };

                let mut channel_stream = channel.into_stream();
                tokio::select! {
                    _ = token.cancelled() => {}
                    copied = copy_bidirectional(&mut tcp_stream, &mut channel_stream) => {
                        // Errors are normal when either side closes.
                        if let Ok((sent, received)) = copied {
                            traffic.sent.fetch_add(sent, Ordering::Relaxed);
                            traffic.received.fetch_add(received, Ordering::Relaxed);
                        }
                    }
                }
            });
        }
    });
}

#[async_trait]
impl Transport for SshTransport {
    async fn establish(&self, config: &TunnelConfig) -> Result<SessionHandle, TransportError> {
        let host = config.host.as_str();
        let port = config.port;

        let ssh_config = if config.keep_alive {
            client::Config {
                inactivity_timeout: None,
                keepalive_interval: Some(Duration::from_secs(TUNNEL_KEEPALIVE_INTERVAL_SECS)),
                keepalive_max: TUNNEL_KEEPALIVE_MAX,
                ..<_>::default()
            }
        } else {
            client::Config {
                inactivity_timeout: None,
                ..<_>::default()
            }
        };

        let connect_future = client::connect(Arc::new(ssh_config), (host, port), TunnelHandler);
        let mut session = match tokio::time::timeout(config.connect_timeout(), connect_future).await
        {
            Ok(result) => result.map_err(|e| connect_error(host, port, e))?,
            Err(_) => {
                return Err(TransportError::Timeout(format!(
                    "{host}:{port} after {}s",
                    config.connect_timeout_secs
                )));
            }
        };

        authenticate(&mut session, config).await?;

        let handle = SessionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let label = format!("{}@{host}:{port}", config.effective_user());
        info!(%handle, target = %label, "SSH session established");

        self.sessions.lock().await.insert(
            handle,
            SshSession {
                session: Arc::new(session),
                label,
                forward: CancellationToken::new(),
                traffic: Arc::new(Traffic::default()),
            },
        );
        Ok(handle)
    }

    async fn bind_forward(
        &self,
        handle: SessionHandle,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<(), TransportError> {
        let (session, token, traffic) = {
            let sessions = self.sessions.lock().await;
            let entry = sessions
                .get(&handle)
                .ok_or_else(|| TransportError::Session(format!("{handle} is not open")))?;
            (
                Arc::clone(&entry.session),
                entry.forward.clone(),
                Arc::clone(&entry.traffic),
            )
        };

        let listeners = bind_loopback(local_port).await?;
        info!(%handle, "Forwarding localhost:{local_port} -> {remote_host}:{remote_port}");

        for listener in listeners {
            spawn_accept_loop(
                listener,
                Arc::clone(&session),
                token.clone(),
                Arc::clone(&traffic),
                remote_host.to_string(),
                u32::from(remote_port),
            );
        }

        Ok(())
    }

    async fn close(&self, handle: SessionHandle) {
        let Some(entry) = self.sessions.lock().await.remove(&handle) else {
            return;
        };
        entry.forward.cancel();
        if let Err(e) = entry
            .session
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
        {
            debug!(%handle, error = %e, "Disconnect after close");
        }
        info!(%handle, target = %entry.label, "SSH session closed");
    }

    /// Traffic is accounted per bridged connection when it finishes.
    async fn probe(&self, handle: SessionHandle) -> Result<ProbeSample, TransportError> {
        let (session, traffic) = {
            let sessions = self.sessions.lock().await;
            let entry = sessions
                .get(&handle)
                .ok_or_else(|| TransportError::LinkLost(format!("{handle} is not open")))?;
            (Arc::clone(&entry.session), Arc::clone(&entry.traffic))
        };

        if session.is_closed() {
            return Err(TransportError::LinkLost("SSH session closed by peer".into()));
        }

        let start = Instant::now();
        let latency = match tokio::time::timeout(PING_TIMEOUT, session.send_ping()).await {
            Ok(Ok(())) => Some(start.elapsed()),
            Ok(Err(e)) => return Err(TransportError::LinkLost(e.to_string())),
            Err(_) => {
                debug!(%handle, "Ping timed out");
                None
            }
        };

        Ok(ProbeSample {
            bytes_sent: traffic.sent.swap(0, Ordering::Relaxed),
            bytes_received: traffic.received.swap(0, Ordering::Relaxed),
            latency,
        })
    }
}
