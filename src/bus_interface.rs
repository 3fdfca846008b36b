//! The built-in `org.freedesktop.DBus` bus interface.
//!
//! Serves the bus management methods plus the standard Peer,
//! Introspectable and Properties interfaces. Every method verifies its
//! argument signature first and answers `InvalidArgs` on mismatch; all
//! failures are returned to the caller as D-Bus errors and never
//! terminate the broker.

use tracing::debug;

use crate::broker::Broker;
use crate::message::{error_names, Message, BUS_INTERFACE, BUS_NAME, BUS_PATH};
use crate::name_registry::{is_unique_name, is_valid_bus_name, start_service_reply};
use crate::match_rules::MatchRule;
use crate::router::Response;
use crate::session::SessionId;
use crate::wire::Value;

const PEER_INTERFACE: &str = "org.freedesktop.DBus.Peer";
const INTROSPECTABLE_INTERFACE: &str = "org.freedesktop.DBus.Introspectable";
const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

/// Handle a method call addressed to the bus.
///
/// Returns the signals the call triggered (routed before the reply) and
/// the reply itself.
pub(crate) async fn handle_method_call(
    broker: &mut Broker,
    msg: &Message,
) -> (Vec<Message>, Response) {
    let member = msg.member.as_deref().unwrap_or_default().to_string();
    debug!(sender = ?msg.sender, interface = ?msg.interface, member = %member, "Bus method call");

    match msg.interface.as_deref() {
        Some(BUS_INTERFACE) => handle_bus_method(broker, msg, &member),
        Some(PEER_INTERFACE) => (Vec::new(), handle_peer_method(msg, &member).await),
        Some(INTROSPECTABLE_INTERFACE) => {
            (Vec::new(), handle_introspectable_method(msg, &member))
        }
        Some(PROPERTIES_INTERFACE) => (Vec::new(), handle_properties_method(broker, msg, &member)),
        other => (
            Vec::new(),
            Response::Error(
                error_names::UNKNOWN_INTERFACE,
                format!(
                    "Interface {} is not served by the message bus",
                    other.unwrap_or("(none)")
                ),
            ),
        ),
    }
}

fn handle_bus_method(broker: &mut Broker, msg: &Message, member: &str) -> (Vec<Message>, Response) {
    match member {
        "RequestName" => return request_name(broker, msg),
        "ReleaseName" => return release_name(broker, msg),
        _ => {}
    }
    let response = match member {
        "Hello" => hello(broker, msg),
        "ListQueuedOwners" => list_queued_owners(broker, msg),
        "ListNames" => list_names(broker, msg),
        "ListActivatableNames" => match typed_args(msg, "") {
            // No activation support, so nothing is activatable.
            Ok(_) => Response::Reply(vec![Value::string_array(Vec::<String>::new())]),
            Err(response) => response,
        },
        "NameHasOwner" => name_has_owner(broker, msg),
        "StartServiceByName" => start_service_by_name(broker, msg),
        "GetNameOwner" => get_name_owner(broker, msg),
        "AddMatch" => add_match(broker, msg),
        "RemoveMatch" => remove_match(broker, msg),
        "GetId" => get_id(broker, msg),
        "GetConnectionUnixUser" => get_connection_unix_user(broker, msg),
        "GetConnectionUnixProcessID" => get_connection_unix_process_id(broker, msg),
        "GetConnectionCredentials" => get_connection_credentials(broker, msg),
        other => Response::Error(
            error_names::UNKNOWN_METHOD,
            format!("Unknown method {}", other),
        ),
    };
    (Vec::new(), response)
}

/// Verify the call signature and unmarshal the arguments.
fn typed_args(msg: &Message, expected: &str) -> Result<Vec<Value>, Response> {
    if msg.signature != expected {
        return Err(Response::Error(
            error_names::INVALID_ARGS,
            format!(
                "Expected signature '{}', got '{}'",
                expected, msg.signature
            ),
        ));
    }
    msg.args()
        .map_err(|e| Response::Error(error_names::INVALID_ARGS, e.to_string()))
}

/// The live session the (rewritten) sender names. `None` only for
/// broker-originated messages, which never call bus methods.
fn caller(broker: &Broker, msg: &Message) -> Result<SessionId, Response> {
    msg.sender
        .as_deref()
        .and_then(|sender| sender.parse::<SessionId>().ok())
        .filter(|id| broker.sessions.contains_key(id))
        .ok_or_else(|| {
            Response::Error(
                error_names::FAILED,
                "Method call has no connected sender".into(),
            )
        })
}

/// Reject unique and syntactically illegal names for ownership calls.
fn validate_owned_name(name: &str) -> Option<Response> {
    if is_unique_name(name) {
        Some(Response::Error(
            error_names::INVALID_ARGS,
            format!("Cannot acquire or release the unique name {}", name),
        ))
    } else if !is_valid_bus_name(name) {
        Some(Response::Error(
            error_names::INVALID_ARGS,
            format!("{} is not a valid bus name", name),
        ))
    } else {
        None
    }
}

fn hello(broker: &mut Broker, msg: &Message) -> Response {
    if let Err(response) = typed_args(msg, "") {
        return response;
    }
    let id = match caller(broker, msg) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let entry = broker.sessions.get_mut(&id).unwrap();
    if entry.hello_received {
        return Response::Error(error_names::FAILED, "Already handled Hello message".into());
    }
    entry.hello_received = true;
    debug!(session = %id, "Hello handled");
    Response::Reply(vec![Value::String(entry.unique_name.clone())])
}

fn request_name(broker: &mut Broker, msg: &Message) -> (Vec<Message>, Response) {
    let args = match typed_args(msg, "su") {
        Ok(args) => args,
        Err(response) => return (Vec::new(), response),
    };
    let name = args[0].as_str().unwrap();
    let flags = args[1].as_u32().unwrap();
    if let Some(response) = validate_owned_name(name) {
        return (Vec::new(), response);
    }
    let id = match caller(broker, msg) {
        Ok(id) => id,
        Err(response) => return (Vec::new(), response),
    };

    debug!(session = %id, name = %name, flags = flags, "RequestName");
    let (code, change) = broker.registry.request_name(name, id, flags);
    let signals = change
        .map(|change| broker.owner_change_signals(&change))
        .unwrap_or_default();
    (signals, Response::Reply(vec![Value::Uint32(code)]))
}

fn release_name(broker: &mut Broker, msg: &Message) -> (Vec<Message>, Response) {
    let args = match typed_args(msg, "s") {
        Ok(args) => args,
        Err(response) => return (Vec::new(), response),
    };
    let name = args[0].as_str().unwrap();
    if let Some(response) = validate_owned_name(name) {
        return (Vec::new(), response);
    }
    let id = match caller(broker, msg) {
        Ok(id) => id,
        Err(response) => return (Vec::new(), response),
    };

    debug!(session = %id, name = %name, "ReleaseName");
    let (code, change) = broker.registry.release_name(name, id);
    let signals = change
        .map(|change| broker.owner_change_signals(&change))
        .unwrap_or_default();
    (signals, Response::Reply(vec![Value::Uint32(code)]))
}

fn list_queued_owners(broker: &Broker, msg: &Message) -> Response {
    let args = match typed_args(msg, "s") {
        Ok(args) => args,
        Err(response) => return response,
    };
    let name = args[0].as_str().unwrap();
    // An unknown name yields an empty list, not NameHasNoOwner.
    let owners: Vec<String> = broker
        .registry
        .queued_owners(name)
        .into_iter()
        .map(|id| id.to_string())
        .collect();
    Response::Reply(vec![Value::string_array(owners)])
}

fn list_names(broker: &Broker, msg: &Message) -> Response {
    if let Err(response) = typed_args(msg, "") {
        return response;
    }
    let mut names = vec![BUS_NAME.to_string()];
    let mut sessions: Vec<SessionId> = broker.sessions.keys().copied().collect();
    sessions.sort();
    names.extend(sessions.iter().map(|id| id.to_string()));
    let mut queued: Vec<String> = broker.registry.names().map(String::from).collect();
    queued.sort();
    names.extend(queued);
    Response::Reply(vec![Value::string_array(names)])
}

fn name_has_owner(broker: &Broker, msg: &Message) -> Response {
    let args = match typed_args(msg, "s") {
        Ok(args) => args,
        Err(response) => return response,
    };
    let name = args[0].as_str().unwrap();
    let has_owner = name == BUS_NAME || broker.session_by_name(name).is_some();
    Response::Reply(vec![Value::Bool(has_owner)])
}

fn start_service_by_name(broker: &Broker, msg: &Message) -> Response {
    let args = match typed_args(msg, "su") {
        Ok(args) => args,
        Err(response) => return response,
    };
    let name = args[0].as_str().unwrap();
    if name == BUS_NAME || broker.registry.owner(name).is_some() {
        Response::Reply(vec![Value::Uint32(start_service_reply::ALREADY_RUNNING)])
    } else {
        Response::Error(
            error_names::SERVICE_NOT_FOUND,
            format!("The name {} was not provided by any .service files", name),
        )
    }
}

fn get_name_owner(broker: &Broker, msg: &Message) -> Response {
    let args = match typed_args(msg, "s") {
        Ok(args) => args,
        Err(response) => return response,
    };
    let name = args[0].as_str().unwrap();
    if name == BUS_NAME {
        return Response::Reply(vec![Value::String(BUS_NAME.into())]);
    }
    match broker.session_by_name(name) {
        Some(id) => Response::Reply(vec![Value::String(id.to_string())]),
        None => Response::Error(
            error_names::NAME_HAS_NO_OWNER,
            format!("Could not get owner of name '{}': no such name", name),
        ),
    }
}

fn add_match(broker: &mut Broker, msg: &Message) -> Response {
    let args = match typed_args(msg, "s") {
        Ok(args) => args,
        Err(response) => return response,
    };
    let rule_string = args[0].as_str().unwrap();
    let id = match caller(broker, msg) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match MatchRule::parse(rule_string) {
        Ok(rule) => {
            let entry = broker.sessions.get_mut(&id).unwrap();
            entry.match_rules.add(rule);
            debug!(session = %id, rule = %rule_string, rule_count = entry.match_rules.len(), "Added match rule");
            Response::Reply(Vec::new())
        }
        Err(e) => Response::Error(error_names::MATCH_RULE_INVALID, e.to_string()),
    }
}

fn remove_match(broker: &mut Broker, msg: &Message) -> Response {
    let args = match typed_args(msg, "s") {
        Ok(args) => args,
        Err(response) => return response,
    };
    let rule_string = args[0].as_str().unwrap();
    let id = match caller(broker, msg) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match MatchRule::parse(rule_string) {
        Ok(rule) => {
            let entry = broker.sessions.get_mut(&id).unwrap();
            if entry.match_rules.remove(&rule) {
                debug!(session = %id, rule = %rule_string, "Removed match rule");
                Response::Reply(Vec::new())
            } else {
                Response::Error(
                    error_names::MATCH_RULE_NOT_FOUND,
                    "The given match rule wasn't found and can't be removed".into(),
                )
            }
        }
        Err(e) => Response::Error(error_names::MATCH_RULE_INVALID, e.to_string()),
    }
}

fn get_id(broker: &Broker, msg: &Message) -> Response {
    if let Err(response) = typed_args(msg, "") {
        return response;
    }
    let id = match caller(broker, msg) {
        Ok(id) => id,
        Err(response) => return response,
    };
    // Each listener advertises its own UUID, so clients on different
    // listeners of the same broker see different ids.
    match broker.listener_guid(id.conn) {
        Some(guid) => Response::Reply(vec![Value::String(guid)]),
        None => Response::Error(error_names::FAILED, "Listener is gone".into()),
    }
}

/// Resolve a name to credentials: the bus itself answers with the broker
/// process's credentials, otherwise the named session's socket
/// credentials are used.
fn credentials_for_name(
    broker: &Broker,
    name: &str,
    what: &str,
) -> Result<crate::session::Credentials, Response> {
    if name == BUS_NAME {
        return Ok(crate::session::Credentials {
            uid: nix::unistd::getuid().as_raw(),
            pid: Some(std::process::id()),
            gid: nix::unistd::getgid().as_raw(),
        });
    }
    let id = broker.session_by_name(name).ok_or_else(|| {
        Response::Error(
            error_names::NAME_HAS_NO_OWNER,
            format!("Could not get {} of name '{}': no such name", what, name),
        )
    })?;
    broker.sessions[&id].credentials.ok_or_else(|| {
        Response::Error(
            error_names::FAILED,
            format!("Credentials of name '{}' are not available", name),
        )
    })
}

fn get_connection_unix_user(broker: &Broker, msg: &Message) -> Response {
    let args = match typed_args(msg, "s") {
        Ok(args) => args,
        Err(response) => return response,
    };
    match credentials_for_name(broker, args[0].as_str().unwrap(), "UID") {
        Ok(credentials) => Response::Reply(vec![Value::Uint32(credentials.uid)]),
        Err(response) => response,
    }
}

fn get_connection_unix_process_id(broker: &Broker, msg: &Message) -> Response {
    let args = match typed_args(msg, "s") {
        Ok(args) => args,
        Err(response) => return response,
    };
    let name = args[0].as_str().unwrap();
    match credentials_for_name(broker, name, "PID") {
        Ok(credentials) => match credentials.pid {
            Some(pid) => Response::Reply(vec![Value::Uint32(pid)]),
            None => Response::Error(
                error_names::UNIX_PROCESS_ID_UNKNOWN,
                format!("Could not get PID of name '{}': not available", name),
            ),
        },
        Err(response) => response,
    }
}

fn get_connection_credentials(broker: &Broker, msg: &Message) -> Response {
    let args = match typed_args(msg, "s") {
        Ok(args) => args,
        Err(response) => return response,
    };
    match credentials_for_name(broker, args[0].as_str().unwrap(), "credentials") {
        Ok(credentials) => {
            let mut entries = vec![(
                Value::String("UnixUserID".into()),
                Value::Variant(Box::new(Value::Uint32(credentials.uid))),
            )];
            if let Some(pid) = credentials.pid {
                entries.push((
                    Value::String("ProcessID".into()),
                    Value::Variant(Box::new(Value::Uint32(pid))),
                ));
            }
            entries.push((
                Value::String("UnixGroupID".into()),
                Value::Variant(Box::new(Value::Uint32(credentials.gid))),
            ));
            Response::Reply(vec![Value::Dict {
                key_sig: "s".into(),
                value_sig: "v".into(),
                entries,
            }])
        }
        Err(response) => response,
    }
}

async fn handle_peer_method(msg: &Message, member: &str) -> Response {
    match member {
        "Ping" => match typed_args(msg, "") {
            Ok(_) => Response::Reply(Vec::new()),
            Err(response) => response,
        },
        "GetMachineId" => {
            if let Err(response) = typed_args(msg, "") {
                return response;
            }
            match get_machine_id().await {
                Ok(machine_id) => Response::Reply(vec![Value::String(machine_id)]),
                Err(e) => Response::Error(
                    error_names::FAILED,
                    format!("Failed to read machine id: {}", e),
                ),
            }
        }
        other => Response::Error(
            error_names::UNKNOWN_METHOD,
            format!("Unknown method {}", other),
        ),
    }
}

async fn get_machine_id() -> std::io::Result<String> {
    let contents = tokio::fs::read_to_string("/etc/machine-id").await?;
    Ok(contents.trim().to_string())
}

fn handle_introspectable_method(msg: &Message, member: &str) -> Response {
    match member {
        "Introspect" => {
            if let Err(response) = typed_args(msg, "") {
                return response;
            }
            let xml = introspect_xml(msg.path.as_deref().unwrap_or("/"));
            Response::Reply(vec![Value::String(xml)])
        }
        other => Response::Error(
            error_names::UNKNOWN_METHOD,
            format!("Unknown method {}", other),
        ),
    }
}

fn handle_properties_method(broker: &Broker, msg: &Message, member: &str) -> Response {
    match member {
        "Get" => {
            let args = match typed_args(msg, "ss") {
                Ok(args) => args,
                Err(response) => return response,
            };
            let interface = args[0].as_str().unwrap();
            let name = args[1].as_str().unwrap();
            if interface != BUS_INTERFACE {
                return unknown_property_interface(interface);
            }
            match name {
                "Features" => Response::Reply(vec![Value::Variant(Box::new(
                    Value::string_array(broker.features.clone()),
                ))]),
                "Interfaces" => Response::Reply(vec![Value::Variant(Box::new(
                    Value::string_array(broker.interfaces.clone()),
                ))]),
                other => Response::Error(
                    error_names::UNKNOWN_PROPERTY,
                    format!("Unknown property {}", other),
                ),
            }
        }
        "Set" => {
            let args = match typed_args(msg, "ssv") {
                Ok(args) => args,
                Err(response) => return response,
            };
            let interface = args[0].as_str().unwrap();
            let name = args[1].as_str().unwrap();
            if interface != BUS_INTERFACE {
                return unknown_property_interface(interface);
            }
            match name {
                "Features" | "Interfaces" => Response::Error(
                    error_names::PROPERTY_READ_ONLY,
                    format!("Property {} is read-only", name),
                ),
                other => Response::Error(
                    error_names::UNKNOWN_PROPERTY,
                    format!("Unknown property {}", other),
                ),
            }
        }
        "GetAll" => {
            let args = match typed_args(msg, "s") {
                Ok(args) => args,
                Err(response) => return response,
            };
            let interface = args[0].as_str().unwrap();
            if interface != BUS_INTERFACE {
                return unknown_property_interface(interface);
            }
            Response::Reply(vec![Value::Dict {
                key_sig: "s".into(),
                value_sig: "v".into(),
                entries: vec![
                    (
                        Value::String("Features".into()),
                        Value::Variant(Box::new(Value::string_array(broker.features.clone()))),
                    ),
                    (
                        Value::String("Interfaces".into()),
                        Value::Variant(Box::new(Value::string_array(broker.interfaces.clone()))),
                    ),
                ],
            }])
        }
        other => Response::Error(
            error_names::UNKNOWN_METHOD,
            format!("Unknown method {}", other),
        ),
    }
}

fn unknown_property_interface(interface: &str) -> Response {
    Response::Error(
        error_names::UNKNOWN_PROPERTY,
        format!("Unknown interface {}", interface),
    )
}

/// The child `<node>` entry shown when introspecting a strict prefix of
/// the bus object path.
fn child_node(request_path: &str) -> Option<&'static str> {
    if request_path == BUS_PATH {
        return None;
    }
    let rest = if request_path == "/" {
        &BUS_PATH[1..]
    } else {
        BUS_PATH.strip_prefix(request_path)?.strip_prefix('/')?
    };
    rest.split('/').next()
}

fn introspect_xml(request_path: &str) -> String {
    let mut xml = String::from(
        r#"<!DOCTYPE node PUBLIC "-//freedesktop//DTD D-BUS Object Introspection 1.0//EN"
"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd">
<node>
  <interface name="org.freedesktop.DBus">
    <method name="Hello">
      <arg direction="out" type="s"/>
    </method>
    <method name="RequestName">
      <arg direction="in" type="s"/>
      <arg direction="in" type="u"/>
      <arg direction="out" type="u"/>
    </method>
    <method name="ReleaseName">
      <arg direction="in" type="s"/>
      <arg direction="out" type="u"/>
    </method>
    <method name="ListQueuedOwners">
      <arg direction="in" type="s"/>
      <arg direction="out" type="as"/>
    </method>
    <method name="ListNames">
      <arg direction="out" type="as"/>
    </method>
    <method name="ListActivatableNames">
      <arg direction="out" type="as"/>
    </method>
    <method name="NameHasOwner">
      <arg direction="in" type="s"/>
      <arg direction="out" type="b"/>
    </method>
    <method name="StartServiceByName">
      <arg direction="in" type="s"/>
      <arg direction="in" type="u"/>
      <arg direction="out" type="u"/>
    </method>
    <method name="GetNameOwner">
      <arg direction="in" type="s"/>
      <arg direction="out" type="s"/>
    </method>
    <method name="AddMatch">
      <arg direction="in" type="s"/>
    </method>
    <method name="RemoveMatch">
      <arg direction="in" type="s"/>
    </method>
    <method name="GetId">
      <arg direction="out" type="s"/>
    </method>
    <method name="GetConnectionUnixUser">
      <arg direction="in" type="s"/>
      <arg direction="out" type="u"/>
    </method>
    <method name="GetConnectionUnixProcessID">
      <arg direction="in" type="s"/>
      <arg direction="out" type="u"/>
    </method>
    <method name="GetConnectionCredentials">
      <arg direction="in" type="s"/>
      <arg direction="out" type="a{sv}"/>
    </method>
    <signal name="NameOwnerChanged">
      <arg type="s"/>
      <arg type="s"/>
      <arg type="s"/>
    </signal>
    <signal name="NameLost">
      <arg type="s"/>
    </signal>
    <signal name="NameAcquired">
      <arg type="s"/>
    </signal>
  </interface>
  <interface name="org.freedesktop.DBus.Peer">
    <method name="Ping"/>
    <method name="GetMachineId">
      <arg direction="out" type="s"/>
    </method>
  </interface>
  <interface name="org.freedesktop.DBus.Introspectable">
    <method name="Introspect">
      <arg direction="out" type="s"/>
    </method>
  </interface>
  <interface name="org.freedesktop.DBus.Properties">
    <method name="Get">
      <arg direction="in" type="s"/>
      <arg direction="in" type="s"/>
      <arg direction="out" type="v"/>
    </method>
    <method name="Set">
      <arg direction="in" type="s"/>
      <arg direction="in" type="s"/>
      <arg direction="in" type="v"/>
    </method>
    <method name="GetAll">
      <arg direction="in" type="s"/>
      <arg direction="out" type="a{sv}"/>
    </method>
  </interface>
"#,
    );
    if let Some(child) = child_node(request_path) {
        xml.push_str(&format!("  <node name=\"{}\"/>\n", child));
    }
    xml.push_str("</node>");
    xml
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_node_for_prefix_paths() {
        assert_eq!(child_node("/"), Some("org"));
        assert_eq!(child_node("/org"), Some("freedesktop"));
        assert_eq!(child_node("/org/freedesktop"), Some("DBus"));
        assert_eq!(child_node("/org/freedesktop/DBus"), None);
        assert_eq!(child_node("/org/free"), None);
        assert_eq!(child_node("/com/example"), None);
    }

    #[test]
    fn test_introspect_xml_lists_interfaces() {
        let xml = introspect_xml(BUS_PATH);
        for needle in [
            "org.freedesktop.DBus",
            "org.freedesktop.DBus.Peer",
            "org.freedesktop.DBus.Introspectable",
            "org.freedesktop.DBus.Properties",
            "RequestName",
            "NameOwnerChanged",
        ] {
            assert!(xml.contains(needle), "missing {}", needle);
        }
        assert!(!xml.contains("<node name="));

        let xml = introspect_xml("/org");
        assert!(xml.contains("<node name=\"freedesktop\"/>"));
    }
}
