//! D-Bus message model.
//!
//! The broker-facing view of a message: decoded header fields plus the
//! raw body bytes. Bodies are only unmarshalled on demand (the broker
//! never inspects arguments except for its own method calls), so relayed
//! messages keep their original body encoding byte for byte.

use crate::error::WireError;
use crate::wire::{self, Endian, Value};

/// The bus's own name, also used as the sender of broker-originated
/// messages.
pub const BUS_NAME: &str = "org.freedesktop.DBus";

/// The object path the bus interface lives on.
pub const BUS_PATH: &str = "/org/freedesktop/DBus";

/// The bus management interface.
pub const BUS_INTERFACE: &str = "org.freedesktop.DBus";

/// D-Bus message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    MethodCall = 1,
    MethodReturn = 2,
    Error = 3,
    Signal = 4,
}

impl MessageType {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(MessageType::MethodCall),
            2 => Some(MessageType::MethodReturn),
            3 => Some(MessageType::Error),
            4 => Some(MessageType::Signal),
            _ => None,
        }
    }
}

/// Message header flags.
pub mod flags {
    pub const NO_REPLY_EXPECTED: u8 = 0x1;
}

/// A D-Bus message.
#[derive(Debug, Clone)]
pub struct Message {
    pub message_type: MessageType,
    pub flags: u8,
    pub serial: u32,
    pub path: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub error_name: Option<String>,
    pub reply_serial: Option<u32>,
    pub destination: Option<String>,
    pub sender: Option<String>,
    /// Body signature; empty for an empty body.
    pub signature: String,
    /// Byte order the body (and header, on the wire) is marshalled in.
    pub endian: Endian,
    /// Raw marshalled body bytes.
    pub body: Vec<u8>,
}

impl Message {
    /// Unmarshal the body arguments against the message signature.
    pub fn args(&self) -> Result<Vec<Value>, WireError> {
        wire::decode_body(&self.signature, self.endian, &self.body)
    }

    /// Marshal the complete message for the wire.
    pub fn to_bytes(&self) -> Vec<u8> {
        wire::encode_message(self)
    }

    pub fn is_method_call(&self) -> bool {
        self.message_type == MessageType::MethodCall
    }

    pub fn is_signal(&self) -> bool {
        self.message_type == MessageType::Signal
    }
}

/// Builder for broker-originated messages.
pub struct MessageBuilder {
    msg: Message,
}

impl MessageBuilder {
    fn new(message_type: MessageType) -> Self {
        Self {
            msg: Message {
                message_type,
                flags: 0,
                serial: 0,
                path: None,
                interface: None,
                member: None,
                error_name: None,
                reply_serial: None,
                destination: None,
                sender: None,
                signature: String::new(),
                endian: Endian::Little,
                body: Vec::new(),
            },
        }
    }

    /// Start a method call message.
    pub fn method_call(destination: &str, path: &str, interface: &str, member: &str) -> Self {
        let mut builder = Self::new(MessageType::MethodCall);
        builder.msg.destination = Some(destination.to_string());
        builder.msg.path = Some(path.to_string());
        builder.msg.interface = Some(interface.to_string());
        builder.msg.member = Some(member.to_string());
        builder
    }

    /// Start a reply to `request`, addressed back to its sender.
    pub fn method_return(request: &Message) -> Self {
        let mut builder = Self::new(MessageType::MethodReturn);
        builder.msg.reply_serial = Some(request.serial);
        builder.msg.destination = request.sender.clone();
        builder.msg.flags = flags::NO_REPLY_EXPECTED;
        builder
    }

    /// Start an error reply to `request`.
    pub fn error(request: &Message, error_name: &str) -> Self {
        let mut builder = Self::new(MessageType::Error);
        builder.msg.error_name = Some(error_name.to_string());
        builder.msg.reply_serial = Some(request.serial);
        builder.msg.destination = request.sender.clone();
        builder.msg.flags = flags::NO_REPLY_EXPECTED;
        builder
    }

    /// Start a signal message.
    pub fn signal(path: &str, interface: &str, member: &str) -> Self {
        let mut builder = Self::new(MessageType::Signal);
        builder.msg.path = Some(path.to_string());
        builder.msg.interface = Some(interface.to_string());
        builder.msg.member = Some(member.to_string());
        builder.msg.flags = flags::NO_REPLY_EXPECTED;
        builder
    }

    pub fn destination(mut self, destination: &str) -> Self {
        self.msg.destination = Some(destination.to_string());
        self
    }

    pub fn sender(mut self, sender: &str) -> Self {
        self.msg.sender = Some(sender.to_string());
        self
    }

    pub fn serial(mut self, serial: u32) -> Self {
        self.msg.serial = serial;
        self
    }

    pub fn flags(mut self, flags: u8) -> Self {
        self.msg.flags = flags;
        self
    }

    /// Marshal `values` as the message body.
    pub fn body(mut self, values: &[Value]) -> Self {
        let (signature, body) = wire::encode_body(values);
        self.msg.signature = signature;
        self.msg.body = body;
        self
    }

    pub fn build(self) -> Message {
        self.msg
    }
}

/// Wire names of the D-Bus errors the broker produces.
pub mod error_names {
    pub const ACCESS_DENIED: &str = "org.freedesktop.DBus.Error.AccessDenied";
    pub const FAILED: &str = "org.freedesktop.DBus.Error.Failed";
    pub const INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
    pub const UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
    pub const UNKNOWN_INTERFACE: &str = "org.freedesktop.DBus.Error.UnknownInterface";
    pub const UNKNOWN_PROPERTY: &str = "org.freedesktop.DBus.Error.UnknownProperty";
    pub const PROPERTY_READ_ONLY: &str = "org.freedesktop.DBus.Error.PropertyReadOnly";
    pub const SERVICE_UNKNOWN: &str = "org.freedesktop.DBus.Error.ServiceUnknown";
    pub const SERVICE_NOT_FOUND: &str = "org.freedesktop.DBus.Error.ServiceNotFound";
    pub const NAME_HAS_NO_OWNER: &str = "org.freedesktop.DBus.Error.NameHasNoOwner";
    pub const MATCH_RULE_INVALID: &str = "org.freedesktop.DBus.Error.MatchRuleInvalid";
    pub const MATCH_RULE_NOT_FOUND: &str = "org.freedesktop.DBus.Error.MatchRuleNotFound";
    pub const UNIX_PROCESS_ID_UNKNOWN: &str = "org.freedesktop.DBus.Error.UnixProcessIdUnknown";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_return_links_request() {
        let call = MessageBuilder::method_call("com.example.S", "/", "com.example.I", "Do")
            .serial(41)
            .sender(":1.7")
            .build();
        let reply = MessageBuilder::method_return(&call)
            .sender(BUS_NAME)
            .serial(1)
            .body(&[Value::String("ok".into())])
            .build();

        assert_eq!(reply.reply_serial, Some(41));
        assert_eq!(reply.destination.as_deref(), Some(":1.7"));
        assert_eq!(reply.flags & flags::NO_REPLY_EXPECTED, flags::NO_REPLY_EXPECTED);
        assert_eq!(reply.signature, "s");
    }

    #[test]
    fn test_error_carries_name() {
        let call = MessageBuilder::method_call("a.b", "/", "a.b", "M").serial(2).build();
        let err = MessageBuilder::error(&call, error_names::SERVICE_UNKNOWN)
            .body(&[Value::String("The name a.b is not registered".into())])
            .build();
        assert_eq!(err.message_type, MessageType::Error);
        assert_eq!(err.error_name.as_deref(), Some(error_names::SERVICE_UNKNOWN));
        assert_eq!(err.reply_serial, Some(2));
    }

    #[test]
    fn test_signal_has_no_reply_expected() {
        let sig = MessageBuilder::signal(BUS_PATH, BUS_INTERFACE, "NameOwnerChanged")
            .sender(BUS_NAME)
            .body(&[
                Value::String("com.example.S".into()),
                Value::String("".into()),
                Value::String(":1.0".into()),
            ])
            .build();
        assert!(sig.is_signal());
        assert_eq!(sig.flags, flags::NO_REPLY_EXPECTED);
        assert_eq!(sig.signature, "sss");
        assert!(sig.destination.is_none());
    }
}
