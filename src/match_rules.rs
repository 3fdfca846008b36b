//! D-Bus match rule parsing and matching.
//!
//! Match rules are comma-separated key='value' constraints a session
//! registers with AddMatch; a message is forwarded to the session when
//! every field a rule specifies equals the corresponding message field.
//!
//! A rule's `sender` field is compared literally; a well-known name in a
//! rule is not mapped to the current owner's unique name.

use std::collections::HashMap;

use tracing::trace;

use crate::message::{Message, MessageType};

/// A parsed D-Bus match rule.
///
/// Equality is over the parsed fields, so two rule strings that differ
/// only in spelling (ordering, whitespace) compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MatchRule {
    /// Message type filter (signal, method_call, method_return, error).
    pub msg_type: Option<String>,
    /// Sender filter.
    pub sender: Option<String>,
    /// Interface filter.
    pub interface: Option<String>,
    /// Member (method/signal name) filter.
    pub member: Option<String>,
    /// Object path filter.
    pub path: Option<String>,
    /// Object path namespace filter (matches path and all children).
    pub path_namespace: Option<String>,
    /// Destination filter.
    pub destination: Option<String>,
    /// Argument filters (arg0, arg1, etc.).
    pub args: HashMap<u8, String>,
    /// Argument path filters (arg0path, arg1path, etc.).
    pub arg_paths: HashMap<u8, String>,
    /// Eavesdrop flag (ignored; the broker has no monitor support).
    pub eavesdrop: bool,
}

impl MatchRule {
    /// Parse a match rule string.
    ///
    /// Example: "type='signal',interface='org.freedesktop.DBus',member='NameOwnerChanged'"
    pub fn parse(rule: &str) -> Result<Self, MatchRuleError> {
        let mut result = MatchRule::default();

        // Handle empty rule (matches everything)
        if rule.trim().is_empty() {
            return Ok(result);
        }

        // Parse comma-separated key='value' pairs
        let mut remaining = rule.trim();

        while !remaining.is_empty() {
            remaining = remaining.trim_start();
            if let Some(rest) = remaining.strip_prefix(',') {
                remaining = rest.trim_start();
            }
            if remaining.is_empty() {
                break;
            }

            let eq_pos = remaining.find('=').ok_or_else(|| {
                MatchRuleError::InvalidFormat(format!("Missing '=' in: {}", remaining))
            })?;

            let key = remaining[..eq_pos].trim();
            remaining = &remaining[eq_pos + 1..];

            // Parse the value (usually quoted)
            remaining = remaining.trim_start();
            let value = if let Some(rest) = remaining.strip_prefix('\'') {
                let end = rest
                    .find('\'')
                    .ok_or_else(|| MatchRuleError::InvalidFormat("Unclosed quote".to_string()))?;
                let val = &rest[..end];
                remaining = &rest[end + 1..];
                val.to_string()
            } else {
                let end = remaining.find(',').unwrap_or(remaining.len());
                let val = remaining[..end].trim();
                remaining = &remaining[end..];
                val.to_string()
            };

            match key {
                "type" => result.msg_type = Some(value),
                "sender" => result.sender = Some(value),
                "interface" => result.interface = Some(value),
                "member" => result.member = Some(value),
                "path" => result.path = Some(value),
                "path_namespace" => result.path_namespace = Some(value),
                "destination" => result.destination = Some(value),
                "eavesdrop" => result.eavesdrop = value == "true",
                key if key.starts_with("arg") && key.ends_with("path") => {
                    let num_str = &key[3..key.len() - 4];
                    let num: u8 = num_str
                        .parse()
                        .map_err(|_| MatchRuleError::InvalidArgIndex(key.to_string()))?;
                    if num > 63 {
                        return Err(MatchRuleError::InvalidArgIndex(key.to_string()));
                    }
                    result.arg_paths.insert(num, value);
                }
                key if key.starts_with("arg") => {
                    let num_str = &key[3..];
                    let num: u8 = num_str
                        .parse()
                        .map_err(|_| MatchRuleError::InvalidArgIndex(key.to_string()))?;
                    if num > 63 {
                        return Err(MatchRuleError::InvalidArgIndex(key.to_string()));
                    }
                    result.args.insert(num, value);
                }
                _ => {
                    // Unknown keys are ignored per spec
                    trace!(key = key, "Ignoring unknown match rule key");
                }
            }
        }

        Ok(result)
    }

    /// Check if a message matches this rule.
    pub fn matches(&self, msg: &Message) -> bool {
        if let Some(ref type_filter) = self.msg_type {
            let msg_type_str = match msg.message_type {
                MessageType::MethodCall => "method_call",
                MessageType::MethodReturn => "method_return",
                MessageType::Error => "error",
                MessageType::Signal => "signal",
            };
            if type_filter != msg_type_str {
                return false;
            }
        }

        if let Some(ref sender_filter) = self.sender {
            if msg.sender.as_deref() != Some(sender_filter.as_str()) {
                return false;
            }
        }

        if let Some(ref iface_filter) = self.interface {
            if msg.interface.as_deref() != Some(iface_filter.as_str()) {
                return false;
            }
        }

        if let Some(ref member_filter) = self.member {
            if msg.member.as_deref() != Some(member_filter.as_str()) {
                return false;
            }
        }

        if let Some(ref path_filter) = self.path {
            if msg.path.as_deref() != Some(path_filter.as_str()) {
                return false;
            }
        }

        if let Some(ref ns_filter) = self.path_namespace {
            match msg.path.as_deref() {
                Some(path) => {
                    if path != ns_filter && !path.starts_with(&format!("{}/", ns_filter)) {
                        return false;
                    }
                }
                None => return false,
            }
        }

        if let Some(ref dest_filter) = self.destination {
            match msg.destination.as_deref() {
                Some(dest) if dest == dest_filter => {}
                None if dest_filter.is_empty() => {}
                _ => return false,
            }
        }

        if !self.args.is_empty() || !self.arg_paths.is_empty() {
            // Leading string arguments only; anything else fails the filter.
            let args = match msg.args() {
                Ok(values) => values,
                Err(_) => return false,
            };
            for (idx, expected) in &self.args {
                match args.get(*idx as usize).and_then(|v| v.as_str()) {
                    Some(actual) if actual == expected => {}
                    _ => return false,
                }
            }
            for (idx, path_prefix) in &self.arg_paths {
                match args.get(*idx as usize).and_then(|v| v.as_str()) {
                    Some(actual) => {
                        if actual != path_prefix
                            && !actual.starts_with(&format!("{}/", path_prefix))
                        {
                            return false;
                        }
                    }
                    None => return false,
                }
            }
        }

        true
    }
}

/// Errors that can occur when parsing match rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchRuleError {
    /// Invalid match rule format.
    InvalidFormat(String),
    /// Invalid argument index.
    InvalidArgIndex(String),
}

impl std::fmt::Display for MatchRuleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MatchRuleError::InvalidFormat(msg) => write!(f, "Invalid match rule format: {}", msg),
            MatchRuleError::InvalidArgIndex(key) => write!(f, "Invalid argument index: {}", key),
        }
    }
}

impl std::error::Error for MatchRuleError {}

/// The ordered match rules of one session.
///
/// AddMatch appends without deduplication so that every AddMatch pairs
/// with one RemoveMatch; RemoveMatch removes the first equal rule.
#[derive(Debug, Default)]
pub struct ClientMatchRules {
    rules: Vec<MatchRule>,
}

impl ClientMatchRules {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    /// Append a match rule.
    pub fn add(&mut self, rule: MatchRule) {
        self.rules.push(rule);
    }

    /// Remove the first rule equal to `rule`. Returns false if none is.
    pub fn remove(&mut self, rule: &MatchRule) -> bool {
        match self.rules.iter().position(|r| r == rule) {
            Some(idx) => {
                self.rules.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Check if any rule matches the message.
    pub fn matches(&self, msg: &Message) -> bool {
        self.rules.iter().any(|r| r.matches(msg))
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageBuilder;
    use crate::wire::Value;

    #[test]
    fn test_parse_empty_rule() {
        let rule = MatchRule::parse("").unwrap();
        assert!(rule.msg_type.is_none());
        assert!(rule.sender.is_none());
    }

    #[test]
    fn test_parse_multiple_fields() {
        let rule = MatchRule::parse(
            "type='signal',interface='org.freedesktop.DBus',member='NameOwnerChanged'",
        )
        .unwrap();
        assert_eq!(rule.msg_type, Some("signal".to_string()));
        assert_eq!(rule.interface, Some("org.freedesktop.DBus".to_string()));
        assert_eq!(rule.member, Some("NameOwnerChanged".to_string()));
    }

    #[test]
    fn test_parse_path_and_namespace() {
        let rule = MatchRule::parse("path='/org/freedesktop/DBus'").unwrap();
        assert_eq!(rule.path, Some("/org/freedesktop/DBus".to_string()));

        let rule = MatchRule::parse("path_namespace='/org/freedesktop'").unwrap();
        assert_eq!(rule.path_namespace, Some("/org/freedesktop".to_string()));
    }

    #[test]
    fn test_parse_arg_filters() {
        let rule = MatchRule::parse("arg0='test.Name',arg1path='/org/example'").unwrap();
        assert_eq!(rule.args.get(&0), Some(&"test.Name".to_string()));
        assert_eq!(rule.arg_paths.get(&1), Some(&"/org/example".to_string()));
    }

    #[test]
    fn test_parse_invalid_format() {
        assert!(MatchRule::parse("type").is_err());
        assert!(MatchRule::parse("type='signal").is_err());
    }

    #[test]
    fn test_parse_high_arg_index() {
        assert!(MatchRule::parse("arg64='test'").is_err());
        assert!(MatchRule::parse("arg63='test'").is_ok());
    }

    #[test]
    fn test_equality_ignores_spelling() {
        let a = MatchRule::parse("type='signal',member='Changed'").unwrap();
        let b = MatchRule::parse("member='Changed' , type='signal'").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_matches_type_and_interface() {
        let rule = MatchRule::parse("type='signal',interface='org.example.I'").unwrap();
        let signal = MessageBuilder::signal("/org/example", "org.example.I", "Changed")
            .sender(":1.2")
            .build();
        assert!(rule.matches(&signal));

        let call = MessageBuilder::method_call("a.b", "/org/example", "org.example.I", "Changed")
            .build();
        assert!(!rule.matches(&call));
    }

    #[test]
    fn test_matches_sender_literal() {
        let rule = MatchRule::parse("sender='com.example.S'").unwrap();
        // The sender field is never remapped to the owner's unique name.
        let signal = MessageBuilder::signal("/", "org.example.I", "Changed")
            .sender(":1.2")
            .build();
        assert!(!rule.matches(&signal));
    }

    #[test]
    fn test_matches_arg0() {
        let rule = MatchRule::parse("arg0='com.example.S'").unwrap();
        let signal = MessageBuilder::signal("/org/freedesktop/DBus", "org.freedesktop.DBus", "NameOwnerChanged")
            .body(&[
                Value::String("com.example.S".into()),
                Value::String("".into()),
                Value::String(":1.0".into()),
            ])
            .build();
        assert!(rule.matches(&signal));

        let other = MessageBuilder::signal("/org/freedesktop/DBus", "org.freedesktop.DBus", "NameOwnerChanged")
            .body(&[
                Value::String("com.example.Other".into()),
                Value::String("".into()),
                Value::String(":1.0".into()),
            ])
            .build();
        assert!(!rule.matches(&other));
    }

    #[test]
    fn test_add_remove_first_equal() {
        let mut rules = ClientMatchRules::new();
        let rule = MatchRule::parse("type='signal'").unwrap();
        rules.add(rule.clone());
        rules.add(rule.clone());
        assert_eq!(rules.len(), 2);

        assert!(rules.remove(&rule));
        assert_eq!(rules.len(), 1);
        assert!(rules.remove(&rule));
        assert!(!rules.remove(&rule));
    }

    #[test]
    fn test_path_namespace_matching() {
        let rule = MatchRule::parse("path_namespace='/org/example'").unwrap();
        let matching = MessageBuilder::signal("/org/example/child", "org.example.I", "S").build();
        let boundary = MessageBuilder::signal("/org/examples", "org.example.I", "S").build();
        assert!(rule.matches(&matching));
        assert!(!rule.matches(&boundary));
    }
}
