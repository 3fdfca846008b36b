//! D-Bus SASL authentication handling.
//!
//! Server side of the D-Bus SASL line dialogue, implemented as a pure
//! state machine over `\r\n`-terminated lines so the session framing
//! loop can drive it from its read buffer. Supports the EXTERNAL
//! mechanism, both with an inline hex-encoded UID and via the DATA
//! challenge-response used by busctl-style clients.

use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Authentication phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthState {
    /// Waiting for an AUTH command.
    WaitingForAuth,
    /// Sent a DATA challenge, waiting for the response.
    WaitingForData,
    /// Sent OK, waiting for BEGIN.
    WaitingForBegin,
    /// BEGIN received; the message stream follows.
    Authenticated,
}

/// SASL authentication handler for one connection.
///
/// `process_request` consumes one client line and yields the response
/// lines to write back (without terminators). After `is_authenticated`
/// turns true no further lines must be fed in.
///
/// The UID a client sends during EXTERNAL auth is validated but not
/// retained; connection credentials come from the socket itself.
#[derive(Debug)]
pub struct AuthServer {
    /// The GUID of the listener this connection arrived on.
    guid: String,
    state: AuthState,
}

impl AuthServer {
    pub fn new(guid: impl Into<String>) -> Self {
        Self {
            guid: guid.into(),
            state: AuthState::WaitingForAuth,
        }
    }

    /// Whether the dialogue has completed with BEGIN.
    pub fn is_authenticated(&self) -> bool {
        self.state == AuthState::Authenticated
    }

    /// Process one request line, producing zero or more response lines.
    pub fn process_request(&mut self, line: &str) -> Vec<String> {
        trace!(line = %line, "Received auth line");
        match self.state {
            AuthState::WaitingForAuth => self.process_auth(line),
            AuthState::WaitingForData => self.process_data(line),
            AuthState::WaitingForBegin => self.process_begin(line),
            AuthState::Authenticated => {
                warn!(line = %line, "Auth line after BEGIN");
                vec!["ERROR Already authenticated".into()]
            }
        }
    }

    fn process_auth(&mut self, line: &str) -> Vec<String> {
        if let Some(rest) = line.strip_prefix("AUTH EXTERNAL") {
            let rest = rest.trim();
            if rest.is_empty() {
                // busctl-style: the UID arrives in a DATA response.
                self.state = AuthState::WaitingForData;
                return vec!["DATA".into()];
            }
            match parse_hex_uid(rest) {
                Ok(uid) => {
                    debug!(uid = uid, "EXTERNAL auth with UID");
                    self.state = AuthState::WaitingForBegin;
                    vec![format!("OK {}", self.guid)]
                }
                Err(reason) => {
                    warn!(reason = %reason, "Bad EXTERNAL auth data");
                    vec![format!("ERROR {}", reason)]
                }
            }
        } else if line == "AUTH" || line.starts_with("AUTH ") {
            // Unknown mechanism, or the client asking what we support.
            vec!["REJECTED EXTERNAL".into()]
        } else if line == "CANCEL" || line == "ERROR" || line.starts_with("ERROR ") {
            vec!["REJECTED EXTERNAL".into()]
        } else if line == "BEGIN" {
            vec!["ERROR Not authenticated".into()]
        } else {
            vec!["ERROR Unknown command".into()]
        }
    }

    fn process_data(&mut self, line: &str) -> Vec<String> {
        if let Some(rest) = line.strip_prefix("DATA") {
            let rest = rest.trim();
            if !rest.is_empty() {
                match parse_hex_uid(rest) {
                    Ok(uid) => debug!(uid = uid, "EXTERNAL auth data with UID"),
                    Err(reason) => {
                        self.state = AuthState::WaitingForAuth;
                        return vec![format!("ERROR {}", reason)];
                    }
                }
            }
            self.state = AuthState::WaitingForBegin;
            vec![format!("OK {}", self.guid)]
        } else if line == "CANCEL" || line == "ERROR" || line.starts_with("ERROR ") {
            self.state = AuthState::WaitingForAuth;
            vec!["REJECTED EXTERNAL".into()]
        } else {
            self.state = AuthState::WaitingForAuth;
            vec!["ERROR Expected DATA".into()]
        }
    }

    fn process_begin(&mut self, line: &str) -> Vec<String> {
        match line {
            "BEGIN" => {
                debug!("Authentication successful");
                self.state = AuthState::Authenticated;
                Vec::new()
            }
            // fd-passing is not supported, so decline the negotiation.
            "NEGOTIATE_UNIX_FD" => vec!["ERROR Unix fd passing not supported".into()],
            "CANCEL" | "ERROR" => {
                self.state = AuthState::WaitingForAuth;
                vec!["REJECTED EXTERNAL".into()]
            }
            _ if line.starts_with("ERROR ") => {
                self.state = AuthState::WaitingForAuth;
                vec!["REJECTED EXTERNAL".into()]
            }
            _ => vec!["ERROR Unknown command".into()],
        }
    }
}

/// Parse a hex-encoded UID.
fn parse_hex_uid(hex: &str) -> Result<u32, String> {
    let bytes = hex::decode(hex).map_err(|e| format!("Invalid hex: {}", e))?;
    let uid_str = String::from_utf8(bytes).map_err(|e| format!("Invalid UTF-8: {}", e))?;
    uid_str
        .parse::<u32>()
        .map_err(|e| format!("Invalid UID: {}", e))
}

/// Generate a random GUID for a listener.
pub fn generate_guid() -> String {
    // D-Bus GUIDs are 32 hex characters
    Uuid::new_v4().as_simple().to_string()
}

/// Encode a UID as hex for D-Bus auth.
pub fn encode_uid(uid: u32) -> String {
    hex::encode(uid.to_string().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_auth_with_uid() {
        let mut auth = AuthServer::new("deadbeef".repeat(4));
        let responses = auth.process_request(&format!("AUTH EXTERNAL {}", encode_uid(1000)));
        assert_eq!(responses, vec![format!("OK {}", "deadbeef".repeat(4))]);
        assert!(!auth.is_authenticated());

        let responses = auth.process_request("BEGIN");
        assert!(responses.is_empty());
        assert!(auth.is_authenticated());
    }

    #[test]
    fn test_external_auth_challenge_response() {
        let mut auth = AuthServer::new("0123456789abcdef0123456789abcdef");
        assert_eq!(auth.process_request("AUTH EXTERNAL"), vec!["DATA".to_string()]);
        let responses = auth.process_request(&format!("DATA {}", encode_uid(1000)));
        assert_eq!(responses, vec!["OK 0123456789abcdef0123456789abcdef".to_string()]);
        auth.process_request("BEGIN");
        assert!(auth.is_authenticated());
    }

    #[test]
    fn test_unknown_mechanism_rejected() {
        let mut auth = AuthServer::new(generate_guid());
        assert_eq!(
            auth.process_request("AUTH KERBEROS_V4"),
            vec!["REJECTED EXTERNAL".to_string()]
        );
        assert_eq!(auth.process_request("AUTH"), vec!["REJECTED EXTERNAL".to_string()]);
        assert!(!auth.is_authenticated());
    }

    #[test]
    fn test_begin_before_auth_is_error() {
        let mut auth = AuthServer::new(generate_guid());
        let responses = auth.process_request("BEGIN");
        assert_eq!(responses, vec!["ERROR Not authenticated".to_string()]);
        assert!(!auth.is_authenticated());
    }

    #[test]
    fn test_fd_negotiation_declined() {
        let mut auth = AuthServer::new(generate_guid());
        auth.process_request(&format!("AUTH EXTERNAL {}", encode_uid(0)));
        let responses = auth.process_request("NEGOTIATE_UNIX_FD");
        assert_eq!(responses, vec!["ERROR Unix fd passing not supported".to_string()]);
        // The client can still BEGIN afterwards.
        auth.process_request("BEGIN");
        assert!(auth.is_authenticated());
    }

    #[test]
    fn test_cancel_restarts_dialogue() {
        let mut auth = AuthServer::new(generate_guid());
        auth.process_request(&format!("AUTH EXTERNAL {}", encode_uid(1000)));
        assert_eq!(auth.process_request("CANCEL"), vec!["REJECTED EXTERNAL".to_string()]);
        auth.process_request(&format!("AUTH EXTERNAL {}", encode_uid(1000)));
        auth.process_request("BEGIN");
        assert!(auth.is_authenticated());
    }

    #[test]
    fn test_bad_hex_uid() {
        let mut auth = AuthServer::new(generate_guid());
        let responses = auth.process_request("AUTH EXTERNAL zz");
        assert_eq!(responses.len(), 1);
        assert!(responses[0].starts_with("ERROR "));
    }

    #[test]
    fn test_generate_guid() {
        let guid = generate_guid();
        assert_eq!(guid.len(), 32);
        assert!(guid.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
