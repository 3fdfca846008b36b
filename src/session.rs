//! Per-connection session handling.
//!
//! A session owns its read buffer and auth state and runs the framing
//! state machine: in the auth phase, `\r\n` lines are fed to the SASL
//! server; once authenticated, complete messages are decoded, their
//! sender rewritten to the session's unique name, and handed on. The
//! framing loop never consumes a partial message; a short read rewinds
//! the buffer offset to where the attempt started.

use std::fmt;
use std::str::FromStr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::auth::AuthServer;
use crate::broker::{Event, Outbound};
use crate::error::{ClientError, Error};
use crate::message::Message;
use crate::wire::ReadBuffer;

/// Identity of one session: the connection id of its listener plus the
/// per-listener sequence number. Renders as the unique name `:conn.seq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId {
    pub conn: u32,
    pub seq: u32,
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{}.{}", self.conn, self.seq)
    }
}

impl FromStr for SessionId {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        let rest = s.strip_prefix(':').ok_or(())?;
        let (conn, seq) = rest.split_once('.').ok_or(())?;
        Ok(SessionId {
            conn: conn.parse().map_err(|_| ())?,
            seq: seq.parse().map_err(|_| ())?,
        })
    }
}

/// Unix credentials of a connected peer.
#[derive(Debug, Clone, Copy)]
pub struct Credentials {
    pub uid: u32,
    pub pid: Option<u32>,
    pub gid: u32,
}

/// Protocol phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Auth,
    Message,
}

/// Output of one pass of the framing loop.
#[derive(Debug, Default)]
pub struct SessionOutput {
    /// Auth response bytes to write to the socket verbatim.
    pub responses: Vec<u8>,
    /// Decoded messages, sender already rewritten.
    pub messages: Vec<Message>,
}

/// The protocol state machine of one connection.
pub struct Session {
    id: SessionId,
    unique_name: String,
    buffer: ReadBuffer,
    auth: AuthServer,
    phase: Phase,
    nul_consumed: bool,
}

impl Session {
    /// Create a session for a connection accepted on a listener with the
    /// given GUID.
    pub fn new(id: SessionId, guid: &str) -> Self {
        Self {
            id,
            unique_name: id.to_string(),
            buffer: ReadBuffer::new(),
            auth: AuthServer::new(guid),
            phase: Phase::Auth,
            nul_consumed: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn unique_name(&self) -> &str {
        &self.unique_name
    }

    /// Feed received bytes through the framing loop.
    ///
    /// Loops until the buffer makes no further progress, then compacts
    /// it. Sender fields of decoded messages are always overwritten with
    /// the session's unique name; the client's value is never trusted.
    pub fn receive_bytes(&mut self, chunk: &[u8]) -> Result<SessionOutput, Error> {
        self.buffer.write_bytes(chunk);
        let mut output = SessionOutput::default();
        loop {
            match self.phase {
                Phase::Auth => {
                    if !self.nul_consumed {
                        match self.buffer.read_byte() {
                            None => break,
                            Some(0) => self.nul_consumed = true,
                            Some(byte) => {
                                return Err(ClientError::ProtocolViolation(format!(
                                    "expected NUL to start authentication, got {:#04x}",
                                    byte
                                ))
                                .into());
                            }
                        }
                    }
                    let Some(line) = self.buffer.read_line() else {
                        break;
                    };
                    for response in self.auth.process_request(&line) {
                        trace!(session = %self.unique_name, response = %response, "Auth response");
                        output.responses.extend_from_slice(response.as_bytes());
                        output.responses.extend_from_slice(b"\r\n");
                    }
                    if self.auth.is_authenticated() {
                        debug!(session = %self.unique_name, "Authenticated, entering message phase");
                        self.phase = Phase::Message;
                    }
                }
                Phase::Message => {
                    let Some(mut msg) = self.buffer.read_message()? else {
                        break;
                    };
                    msg.sender = Some(self.unique_name.clone());
                    output.messages.push(msg);
                }
            }
        }
        self.buffer.flush();
        Ok(output)
    }
}

/// Drive one accepted connection until it closes.
///
/// Reads socket chunks into the session state machine, writes auth
/// responses back inline, forwards decoded messages to the broker loop
/// and writes broker-routed messages out. Always reports the disconnect
/// to the broker on the way out.
pub(crate) async fn run_connection<S>(
    mut stream: S,
    mut session: Session,
    events: mpsc::Sender<Event>,
    mut outbound: mpsc::Receiver<Outbound>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let id = session.id();
    let mut chunk = [0u8; 4096];
    loop {
        tokio::select! {
            read = stream.read(&mut chunk) => {
                match read {
                    Ok(0) => {
                        debug!(session = %id, "Client disconnected");
                        break;
                    }
                    Ok(n) => match session.receive_bytes(&chunk[..n]) {
                        Ok(output) => {
                            if !output.responses.is_empty()
                                && stream.write_all(&output.responses).await.is_err()
                            {
                                break;
                            }
                            let mut gone = false;
                            for msg in output.messages {
                                if events.send(Event::Message { id, msg }).await.is_err() {
                                    gone = true;
                                    break;
                                }
                            }
                            if gone {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(session = %id, error = %e, "Closing session");
                            break;
                        }
                    },
                    Err(e) => {
                        debug!(session = %id, error = %e, "Read error");
                        break;
                    }
                }
            }
            item = outbound.recv() => {
                match item {
                    Some(Outbound::Message(msg)) => {
                        if stream.write_all(&msg.to_bytes()).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        debug!(session = %id, "Session closed by broker");
                        break;
                    }
                }
            }
        }
    }
    let _ = events.send(Event::Disconnected { id }).await;
}
