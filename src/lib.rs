//! minibusd - a small D-Bus message broker.
//!
//! This crate implements the server side of a D-Bus message bus: it
//! accepts client connections over Unix and TCP sockets, runs the SASL
//! handshake, assigns unique bus names, routes messages between peers by
//! destination and match rules, and serves the
//! `org.freedesktop.DBus` bus management interface including name
//! ownership queues and the `NameOwnerChanged`/`NameAcquired`/`NameLost`
//! signals.

pub mod address;
pub mod auth;
pub mod broker;
mod bus_interface;
pub mod error;
mod listener;
pub mod match_rules;
pub mod message;
pub mod name_registry;
mod router;
pub mod session;
pub mod wire;

pub use broker::Broker;
pub use error::{Error, Result};
pub use message::{Message, MessageBuilder, MessageType};
