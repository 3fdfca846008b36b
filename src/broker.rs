//! The broker core.
//!
//! One broker task owns all mutable bus state: the session table, the
//! name registry and the serial counter for broker-originated messages.
//! Listener accept loops and per-connection tasks feed a single event
//! channel, so each message is handled to completion (fan-out, signal
//! emission, reply) before the next one is dispatched.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::address::Address;
use crate::error::Result;
use crate::listener::ListenerHandle;
use crate::match_rules::ClientMatchRules;
use crate::message::{Message, MessageBuilder, BUS_INTERFACE, BUS_NAME, BUS_PATH};
use crate::name_registry::{NameRegistry, OwnerChange};
use crate::router::{self, Response};
use crate::session::{Credentials, SessionId};
use crate::wire::Value;

/// Events from listener and connection tasks.
pub(crate) enum Event {
    /// A listener accepted a connection.
    Connected {
        id: SessionId,
        tx: mpsc::Sender<Outbound>,
        credentials: Option<Credentials>,
    },
    /// A session decoded a message (sender already rewritten).
    Message { id: SessionId, msg: Message },
    /// A connection ended.
    Disconnected { id: SessionId },
}

/// Items the broker sends to a connection task.
#[derive(Debug, Clone)]
pub(crate) enum Outbound {
    Message(Arc<Message>),
    /// Write nothing further and drop the socket.
    Close,
}

/// Broker-side state of one connected session.
pub(crate) struct SessionEntry {
    pub unique_name: String,
    pub tx: mpsc::Sender<Outbound>,
    pub hello_received: bool,
    pub match_rules: ClientMatchRules,
    pub credentials: Option<Credentials>,
}

/// A D-Bus message broker.
pub struct Broker {
    events_tx: mpsc::Sender<Event>,
    events_rx: mpsc::Receiver<Event>,
    listeners: Vec<ListenerHandle>,
    /// Connection id handed to the next listener; starts at 1.
    next_connection_id: u32,
    /// Serial for broker-originated messages; independent of any
    /// client's serial space.
    serial: u32,
    pub(crate) sessions: HashMap<SessionId, SessionEntry>,
    pub(crate) registry: NameRegistry,
    pub(crate) features: Vec<String>,
    pub(crate) interfaces: Vec<String>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::channel(1024);
        Self {
            events_tx,
            events_rx,
            listeners: Vec::new(),
            next_connection_id: 1,
            serial: 1,
            sessions: HashMap::new(),
            registry: NameRegistry::new(),
            features: Vec::new(),
            interfaces: Vec::new(),
        }
    }

    /// Listen on a D-Bus address.
    ///
    /// Returns the resolved address string, with the kernel-assigned
    /// port filled in for `tcp:` addresses with `port=0` or none.
    pub async fn add_listener(&mut self, address: &str) -> Result<String> {
        let parsed = Address::parse(address)?;
        self.bind(parsed, None).await
    }

    /// Listen on a Unix socket in a fresh temporary directory.
    pub async fn add_temp_unix_listener(&mut self) -> Result<String> {
        let dir = tempfile::tempdir()?;
        let address = Address::Unix {
            path: dir.path().join("dbus-socket"),
        };
        self.bind(address, Some(dir)).await
    }

    async fn bind(
        &mut self,
        address: Address,
        temp_dir: Option<tempfile::TempDir>,
    ) -> Result<String> {
        let conn_id = self.next_connection_id;
        self.next_connection_id += 1;
        let mut handle = ListenerHandle::bind(address, conn_id, self.events_tx.clone()).await?;
        handle.temp_dir = temp_dir;
        let resolved = handle.address.clone();
        self.listeners.push(handle);
        Ok(resolved)
    }

    /// Run the broker event loop.
    pub async fn run(mut self) -> Result<()> {
        info!("Broker starting");
        loop {
            // The broker holds an event sender itself, so recv never
            // yields None while it runs.
            let Some(event) = self.events_rx.recv().await else {
                return Ok(());
            };
            self.handle_event(event).await;
        }
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Connected {
                id,
                tx,
                credentials,
            } => {
                info!(session = %id, "Client registered");
                self.sessions.insert(
                    id,
                    SessionEntry {
                        unique_name: id.to_string(),
                        tx,
                        hello_received: false,
                        match_rules: ClientMatchRules::new(),
                        credentials,
                    },
                );
            }
            Event::Message { id, msg } => {
                if !self.sessions.contains_key(&id) {
                    debug!(session = %id, "Dropping message from closed session");
                    return;
                }
                router::dispatch(self, msg).await;
            }
            Event::Disconnected { id } => {
                let signals = self.remove_session(id, false).await;
                for signal in signals {
                    router::dispatch(self, signal).await;
                }
            }
        }
    }

    /// Drop a session and vacate its name-queue entries.
    ///
    /// Returns the ownership-transition signals to route. `forced` also
    /// tells the connection task to drop the socket (protocol
    /// violation); for an observed disconnect the socket is gone
    /// already.
    pub(crate) async fn remove_session(&mut self, id: SessionId, forced: bool) -> Vec<Message> {
        let Some(entry) = self.sessions.remove(&id) else {
            return Vec::new();
        };
        if forced {
            let _ = entry.tx.send(Outbound::Close).await;
        }
        info!(session = %id, "Client unregistered");
        let changes: Vec<OwnerChange> = self.registry.remove_session(id);
        let mut signals = Vec::new();
        for change in &changes {
            signals.extend(self.owner_change_signals(change));
        }
        signals
    }

    /// Next serial for a broker-originated message.
    pub(crate) fn next_serial(&mut self) -> u32 {
        let serial = self.serial;
        self.serial += 1;
        serial
    }

    /// Wrap a bus response as a message from `org.freedesktop.DBus`,
    /// linked to the request by `reply_serial`.
    pub(crate) fn wrap_response(&mut self, request: &Message, response: Response) -> Message {
        let serial = self.next_serial();
        match response {
            Response::Reply(values) => MessageBuilder::method_return(request)
                .sender(BUS_NAME)
                .serial(serial)
                .body(&values)
                .build(),
            Response::Error(name, text) => MessageBuilder::error(request, name)
                .sender(BUS_NAME)
                .serial(serial)
                .body(&[Value::String(text)])
                .build(),
        }
    }

    /// The signal sequence for one ownership transition:
    /// `NameOwnerChanged` broadcast first, then `NameLost` to the old
    /// owner (when still connected), then `NameAcquired` to the new one.
    pub(crate) fn owner_change_signals(&mut self, change: &OwnerChange) -> Vec<Message> {
        let old = change.old.map(|id| id.to_string()).unwrap_or_default();
        let new = change.new.map(|id| id.to_string()).unwrap_or_default();
        debug!(name = %change.name, old = %old, new = %new, "Name owner changed");

        let mut signals = vec![self.bus_signal(
            "NameOwnerChanged",
            None,
            &[
                Value::String(change.name.clone()),
                Value::String(old.clone()),
                Value::String(new.clone()),
            ],
        )];
        if change
            .old
            .is_some_and(|id| self.sessions.contains_key(&id))
        {
            signals.push(self.bus_signal(
                "NameLost",
                Some(&old),
                &[Value::String(change.name.clone())],
            ));
        }
        if change.new.is_some() {
            signals.push(self.bus_signal(
                "NameAcquired",
                Some(&new),
                &[Value::String(change.name.clone())],
            ));
        }
        signals
    }

    fn bus_signal(&mut self, member: &str, destination: Option<&str>, body: &[Value]) -> Message {
        let serial = self.next_serial();
        let mut builder = MessageBuilder::signal(BUS_PATH, BUS_INTERFACE, member)
            .sender(BUS_NAME)
            .serial(serial)
            .body(body);
        if let Some(destination) = destination {
            builder = builder.destination(destination);
        }
        builder.build()
    }

    /// Resolve a unique or currently-owned well-known name to a session.
    pub(crate) fn session_by_name(&self, name: &str) -> Option<SessionId> {
        if let Ok(id) = name.parse::<SessionId>() {
            return self.sessions.contains_key(&id).then_some(id);
        }
        self.registry.owner(name)
    }

    /// The hex GUID of the listener with the given connection id.
    pub(crate) fn listener_guid(&self, conn_id: u32) -> Option<String> {
        self.listeners
            .iter()
            .find(|listener| listener.conn_id == conn_id)
            .map(|listener| listener.guid.clone())
    }

    /// Close every session and listener; Unix socket paths are removed.
    pub async fn close(&mut self) {
        info!("Broker closing");
        let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        for id in ids {
            let _ = self.remove_session(id, true).await;
        }
        self.listeners.clear();
    }
}
