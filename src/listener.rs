//! Listener sockets.
//!
//! One listener per bound address. A listener owns a randomly generated
//! 128-bit UUID (advertised during SASL and via GetId), a per-server
//! connection id, and the accept loop that mints `:<connId>.<seq>`
//! unique names for accepted peers.

use std::path::PathBuf;

use tokio::net::{TcpListener, UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::address::{Address, AddressFamily};
use crate::auth::generate_guid;
use crate::broker::{Event, Outbound};
use crate::error::{AddressError, Result};
use crate::session::{run_connection, Credentials, Session, SessionId};

enum ListenerSocket {
    Unix(UnixListener),
    Tcp(TcpListener),
}

/// A bound listener and its accept task.
pub(crate) struct ListenerHandle {
    pub conn_id: u32,
    /// Hex-encoded 128-bit listener UUID, advertised via SASL and GetId.
    pub guid: String,
    /// The resolved address (kernel-assigned TCP ports filled in).
    pub address: String,
    unix_path: Option<PathBuf>,
    /// Keeps a convenience socket's temp directory alive.
    pub temp_dir: Option<tempfile::TempDir>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    /// Bind `address` and start accepting connections.
    pub async fn bind(
        address: Address,
        conn_id: u32,
        events: mpsc::Sender<Event>,
    ) -> Result<Self> {
        let guid = generate_guid();
        let (socket, resolved, unix_path) = match &address {
            Address::Unix { path } => {
                // Remove a stale socket and make sure the directory exists.
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let listener = UnixListener::bind(path)?;
                (
                    ListenerSocket::Unix(listener),
                    address.to_string(),
                    Some(path.clone()),
                )
            }
            Address::Tcp { host, port, family } => {
                let mut candidates = tokio::net::lookup_host((host.as_str(), *port)).await?;
                let addr = candidates
                    .find(|a| match family {
                        Some(AddressFamily::Ipv4) => a.is_ipv4(),
                        Some(AddressFamily::Ipv6) => a.is_ipv6(),
                        None => true,
                    })
                    .ok_or_else(|| AddressError::InvalidProperty {
                        property: "host",
                        value: host.clone(),
                    })?;
                let listener = TcpListener::bind(addr).await?;
                let bound_port = listener.local_addr()?.port();
                (
                    ListenerSocket::Tcp(listener),
                    address.clone().with_port(bound_port).to_string(),
                    None,
                )
            }
        };

        info!(conn_id = conn_id, address = %resolved, "Listening for client connections");

        let task = tokio::spawn(accept_loop(socket, conn_id, guid.clone(), events));

        Ok(Self {
            conn_id,
            guid,
            address: resolved,
            unix_path,
            temp_dir: None,
            task,
        })
    }

    /// Stop accepting and remove the socket from the filesystem.
    pub fn close(&self) {
        self.task.abort();
        if let Some(path) = &self.unix_path {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Accept connections and hand each to its own session task.
async fn accept_loop(
    socket: ListenerSocket,
    conn_id: u32,
    guid: String,
    events: mpsc::Sender<Event>,
) {
    let mut next_seq = 0u32;
    loop {
        let id = SessionId {
            conn: conn_id,
            seq: next_seq,
        };
        match &socket {
            ListenerSocket::Unix(listener) => match listener.accept().await {
                Ok((stream, _addr)) => {
                    next_seq += 1;
                    let credentials = peer_credentials(&stream);
                    spawn_session(stream, id, &guid, credentials, events.clone());
                }
                Err(e) => {
                    warn!(conn_id = conn_id, error = %e, "Error accepting client connection");
                }
            },
            ListenerSocket::Tcp(listener) => match listener.accept().await {
                Ok((stream, _addr)) => {
                    next_seq += 1;
                    spawn_session(stream, id, &guid, None, events.clone());
                }
                Err(e) => {
                    warn!(conn_id = conn_id, error = %e, "Error accepting client connection");
                }
            },
        }
    }
}

fn peer_credentials(stream: &UnixStream) -> Option<Credentials> {
    match stream.peer_cred() {
        Ok(cred) => Some(Credentials {
            uid: cred.uid(),
            pid: cred.pid().map(|p| p as u32),
            gid: cred.gid(),
        }),
        Err(e) => {
            debug!(error = %e, "Could not get peer credentials");
            None
        }
    }
}

fn spawn_session<S>(
    stream: S,
    id: SessionId,
    guid: &str,
    credentials: Option<Credentials>,
    events: mpsc::Sender<Event>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    info!(session = %id, "New client connection");
    let session = Session::new(id, guid);
    let (outbound_tx, outbound_rx) = mpsc::channel::<Outbound>(256);
    tokio::spawn(async move {
        // Registration precedes any message from this session because
        // both travel the same event channel from this task.
        if events
            .send(Event::Connected {
                id,
                tx: outbound_tx,
                credentials,
            })
            .await
            .is_err()
        {
            return;
        }
        run_connection(stream, session, events, outbound_rx).await;
    });
}
