//! Message routing.
//!
//! Every message entering the broker flows through [`dispatch`]: fan-out
//! to subscribed sessions, the pre-Hello gate, dispatch of bus-addressed
//! method calls, the unroutable-destination check, and emission of any
//! broker-originated replies and signals. Broker messages re-enter the
//! router through the same work queue, so match rules apply to them and
//! ordering follows emission order.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{trace, warn};

use crate::broker::{Broker, Outbound, SessionEntry};
use crate::bus_interface;
use crate::message::{error_names, Message, BUS_INTERFACE, BUS_NAME};
use crate::session::SessionId;
use crate::wire::Value;

/// Outcome of a bus method, before wrapping into a message.
pub(crate) enum Response {
    Reply(Vec<Value>),
    Error(&'static str, String),
}

struct RouteOutcome {
    follow_ups: Vec<Message>,
    close: Option<SessionId>,
}

enum Work {
    Route(Message),
    Close(SessionId),
}

/// Route one inbound message to completion, including everything it
/// triggers: replies, signals, and forced session closes.
pub(crate) async fn dispatch(broker: &mut Broker, msg: Message) {
    let mut work = VecDeque::from([Work::Route(msg)]);
    while let Some(item) = work.pop_front() {
        match item {
            Work::Route(msg) => {
                let outcome = route_one(broker, msg).await;
                work.extend(outcome.follow_ups.into_iter().map(Work::Route));
                if let Some(id) = outcome.close {
                    work.push_back(Work::Close(id));
                }
            }
            Work::Close(id) => {
                // The forced close may vacate name queues; those
                // transitions are routed like any other signal.
                for signal in broker.remove_session(id, true).await {
                    work.push_back(Work::Route(signal));
                }
            }
        }
    }
}

async fn route_one(broker: &mut Broker, msg: Message) -> RouteOutcome {
    let msg = Arc::new(msg);
    trace!(
        msg_type = ?msg.message_type,
        serial = msg.serial,
        sender = ?msg.sender,
        destination = ?msg.destination,
        interface = ?msg.interface,
        member = ?msg.member,
        "Routing message"
    );

    // Fan out to every session whose destination or match rules accept
    // the message; the originating session is not special-cased.
    let targets: Vec<_> = {
        let broker_ref: &Broker = broker;
        broker_ref
            .sessions
            .iter()
            .filter(|&(id, entry)| delivers_to(broker_ref, *id, entry, &msg))
            .map(|(_, entry)| entry.tx.clone())
            .collect()
    };
    for tx in targets {
        let _ = tx.send(Outbound::Message(msg.clone())).await;
    }

    // Gate on Hello: anything but the Hello call itself closes a session
    // that has not said Hello yet.
    if let Some(id) = sender_session(broker, &msg) {
        if !broker.sessions[&id].hello_received && !is_hello_call(&msg) {
            warn!(session = %id, "Message before Hello, closing session");
            let error = broker.wrap_response(
                &msg,
                Response::Error(
                    error_names::ACCESS_DENIED,
                    "Client tried to send a message before sending Hello".into(),
                ),
            );
            return RouteOutcome {
                follow_ups: vec![error],
                close: Some(id),
            };
        }
    }

    let mut follow_ups = Vec::new();
    if msg.destination.as_deref() == Some(BUS_NAME) {
        if msg.is_method_call() {
            let (signals, response) = bus_interface::handle_method_call(broker, &msg).await;
            follow_ups.extend(signals);
            follow_ups.push(broker.wrap_response(&msg, response));
        } else if msg.is_signal() {
            // Signals addressed to the bus are dropped after fan-out.
            trace!(member = ?msg.member, "Dropping signal addressed to the bus");
        }
    } else if let Some(destination) = msg.destination.as_deref() {
        if !known_destination(broker, destination) {
            let response = Response::Error(
                error_names::SERVICE_UNKNOWN,
                format!("The name {} is not registered", destination),
            );
            follow_ups.push(broker.wrap_response(&msg, response));
        }
    }

    RouteOutcome {
        follow_ups,
        close: None,
    }
}

/// Whether a session receives this message: addressed to its unique
/// name, addressed to a well-known name it currently owns, or accepted
/// by one of its match rules.
fn delivers_to(broker: &Broker, id: SessionId, entry: &SessionEntry, msg: &Message) -> bool {
    if let Some(destination) = msg.destination.as_deref() {
        if destination == entry.unique_name {
            return true;
        }
        if broker.registry.owner(destination) == Some(id) {
            return true;
        }
    }
    entry.match_rules.matches(msg)
}

/// The live session the message's (rewritten) sender names, if any.
fn sender_session(broker: &Broker, msg: &Message) -> Option<SessionId> {
    msg.sender
        .as_deref()
        .and_then(|sender| sender.parse::<SessionId>().ok())
        .filter(|id| broker.sessions.contains_key(id))
}

fn is_hello_call(msg: &Message) -> bool {
    msg.destination.as_deref() == Some(BUS_NAME)
        && msg.interface.as_deref() == Some(BUS_INTERFACE)
        && msg.member.as_deref() == Some("Hello")
}

/// A destination is known when it is a live session's unique name or a
/// currently owned well-known name.
fn known_destination(broker: &Broker, destination: &str) -> bool {
    if let Ok(id) = destination.parse::<SessionId>() {
        return broker.sessions.contains_key(&id);
    }
    broker.registry.owner(destination).is_some()
}
