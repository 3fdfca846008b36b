//! Bus name ownership registry.
//!
//! Each requested well-known name has a queue of (session, request)
//! entries in insertion order; the owner is the entry at the head, so
//! ownership is a function of position. A queue with no entries does not
//! exist. Callers act on the returned [`OwnerChange`] transitions to
//! emit `NameOwnerChanged`/`NameLost`/`NameAcquired`.

use std::collections::HashMap;

use crate::session::SessionId;

/// Request name flags (from the D-Bus spec).
pub mod request_name_flags {
    /// Allow replacement of this owner by another connection.
    pub const ALLOW_REPLACEMENT: u32 = 0x1;
    /// Attempt to replace the existing owner if possible.
    pub const REPLACE_EXISTING: u32 = 0x2;
    /// Don't queue if the name is already owned - return immediately.
    pub const DO_NOT_QUEUE: u32 = 0x4;
}

/// Request name reply codes (from the D-Bus spec).
pub mod request_name_reply {
    /// Caller is now the primary owner of the name.
    pub const PRIMARY_OWNER: u32 = 1;
    /// Caller is in queue waiting for the name.
    pub const IN_QUEUE: u32 = 2;
    /// Name is already owned and DO_NOT_QUEUE was specified.
    pub const EXISTS: u32 = 3;
    /// Caller was already the primary owner of the name.
    pub const ALREADY_OWNER: u32 = 4;
}

/// Release name reply codes (from the D-Bus spec).
pub mod release_name_reply {
    /// Caller has released the name successfully.
    pub const RELEASED: u32 = 1;
    /// The name does not exist (was not owned by anyone).
    pub const NON_EXISTENT: u32 = 2;
    /// The caller does not own and is not queued for this name.
    pub const NOT_OWNER: u32 = 3;
}

/// StartServiceByName reply codes (from the D-Bus spec).
pub mod start_service_reply {
    /// The service was started.
    pub const SUCCESS: u32 = 1;
    /// The service was already running.
    pub const ALREADY_RUNNING: u32 = 2;
}

/// One session's standing request for a name.
///
/// Re-requesting overwrites all three flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NameRequest {
    pub allow_replacement: bool,
    pub replace_existing: bool,
    pub do_not_queue: bool,
}

impl NameRequest {
    pub fn from_flags(flags: u32) -> Self {
        Self {
            allow_replacement: flags & request_name_flags::ALLOW_REPLACEMENT != 0,
            replace_existing: flags & request_name_flags::REPLACE_EXISTING != 0,
            do_not_queue: flags & request_name_flags::DO_NOT_QUEUE != 0,
        }
    }
}

/// An ownership transition of one name.
///
/// `None` represents "no owner" on either side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerChange {
    pub name: String,
    pub old: Option<SessionId>,
    pub new: Option<SessionId>,
}

/// Queue for a single name. The head entry is the owner.
#[derive(Debug, Default)]
struct NameQueue {
    requests: Vec<(SessionId, NameRequest)>,
}

impl NameQueue {
    fn owner(&self) -> Option<SessionId> {
        self.requests.first().map(|(session, _)| *session)
    }

    fn position(&self, session: SessionId) -> Option<usize> {
        self.requests.iter().position(|(s, _)| *s == session)
    }
}

/// Ownership queues for all requested names.
#[derive(Debug, Default)]
pub struct NameRegistry {
    queues: HashMap<String, NameQueue>,
}

impl NameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request `name` for `session`, per the RequestName queue discipline.
    ///
    /// Returns the RequestName reply code and the ownership transition,
    /// if the owner changed.
    pub fn request_name(
        &mut self,
        name: &str,
        session: SessionId,
        flags: u32,
    ) -> (u32, Option<OwnerChange>) {
        let request = NameRequest::from_flags(flags);
        let queue = self.queues.entry(name.to_string()).or_default();
        let old_owner = queue.owner();

        // Upsert: a re-request overwrites the stored flags.
        match queue.position(session) {
            Some(pos) => queue.requests[pos].1 = request,
            None => queue.requests.push((session, request)),
        }

        // Replacement: move to the front when the current owner allows it.
        if let Some(owner) = queue.owner() {
            if owner != session && request.replace_existing && queue.requests[0].1.allow_replacement
            {
                let pos = queue.position(session).unwrap();
                let entry = queue.requests.remove(pos);
                queue.requests.insert(0, entry);
            }
        }

        // Purge every queued (non-owner) entry that asked not to queue.
        let mut index = 0;
        queue.requests.retain(|(_, request)| {
            let keep = index == 0 || !request.do_not_queue;
            index += 1;
            keep
        });

        let new_owner = queue.owner();
        let code = if new_owner == Some(session) {
            if old_owner == Some(session) {
                request_name_reply::ALREADY_OWNER
            } else {
                request_name_reply::PRIMARY_OWNER
            }
        } else if queue.position(session).is_some() {
            request_name_reply::IN_QUEUE
        } else {
            request_name_reply::EXISTS
        };

        let change = (old_owner != new_owner).then(|| OwnerChange {
            name: name.to_string(),
            old: old_owner,
            new: new_owner,
        });
        (code, change)
    }

    /// Release `session`'s entry for `name`.
    pub fn release_name(&mut self, name: &str, session: SessionId) -> (u32, Option<OwnerChange>) {
        let Some(queue) = self.queues.get_mut(name) else {
            return (release_name_reply::NON_EXISTENT, None);
        };
        let old_owner = queue.owner();
        match queue.position(session) {
            Some(pos) => {
                queue.requests.remove(pos);
                let new_owner = queue.owner();
                if queue.requests.is_empty() {
                    self.queues.remove(name);
                }
                let change = (old_owner != new_owner).then(|| OwnerChange {
                    name: name.to_string(),
                    old: old_owner,
                    new: new_owner,
                });
                (release_name_reply::RELEASED, change)
            }
            None => (release_name_reply::NOT_OWNER, None),
        }
    }

    /// Remove a session from every queue (disconnect cleanup).
    ///
    /// Empty queues are deleted; every head transition is reported so
    /// the caller can emit the ownership-change signals.
    pub fn remove_session(&mut self, session: SessionId) -> Vec<OwnerChange> {
        let mut changes = Vec::new();
        self.queues.retain(|name, queue| {
            let old_owner = queue.owner();
            queue.requests.retain(|(s, _)| *s != session);
            let new_owner = queue.owner();
            if old_owner != new_owner {
                changes.push(OwnerChange {
                    name: name.clone(),
                    old: old_owner,
                    new: new_owner,
                });
            }
            !queue.requests.is_empty()
        });
        changes
    }

    /// The current owner of `name`.
    pub fn owner(&self, name: &str) -> Option<SessionId> {
        self.queues.get(name).and_then(|q| q.owner())
    }

    /// All queued sessions for `name` in queue order, owner first.
    pub fn queued_owners(&self, name: &str) -> Vec<SessionId> {
        self.queues
            .get(name)
            .map(|q| q.requests.iter().map(|(s, _)| *s).collect())
            .unwrap_or_default()
    }

    /// Names with a live queue.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.queues.keys().map(|name| name.as_str())
    }
}

/// Whether `name` is a syntactically legal well-known bus name.
pub fn is_valid_bus_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 255 || name.starts_with(':') {
        return false;
    }
    let elements: Vec<&str> = name.split('.').collect();
    if elements.len() < 2 {
        return false;
    }
    elements.iter().all(|element| {
        !element.is_empty()
            && !element.starts_with(|c: char| c.is_ascii_digit())
            && element
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    })
}

/// Whether `name` is a unique (bus-assigned) name.
pub fn is_unique_name(name: &str) -> bool {
    name.starts_with(':')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(conn: u32, seq: u32) -> SessionId {
        SessionId { conn, seq }
    }

    const NAME: &str = "org.example.Test";

    #[test]
    fn test_first_request_becomes_owner() {
        let mut registry = NameRegistry::new();
        let (code, change) = registry.request_name(NAME, session(1, 0), 0);

        assert_eq!(code, request_name_reply::PRIMARY_OWNER);
        let change = change.unwrap();
        assert_eq!(change.old, None);
        assert_eq!(change.new, Some(session(1, 0)));
        assert_eq!(registry.owner(NAME), Some(session(1, 0)));
    }

    #[test]
    fn test_repeat_request_is_already_owner_without_signals() {
        let mut registry = NameRegistry::new();
        registry.request_name(NAME, session(1, 0), 0);

        let (code, change) = registry.request_name(NAME, session(1, 0), 0);
        assert_eq!(code, request_name_reply::ALREADY_OWNER);
        assert!(change.is_none());

        let (code, change) = registry.request_name(NAME, session(1, 0), 0);
        assert_eq!(code, request_name_reply::ALREADY_OWNER);
        assert!(change.is_none());
    }

    #[test]
    fn test_second_request_queues() {
        let mut registry = NameRegistry::new();
        registry.request_name(NAME, session(1, 0), 0);

        let (code, change) = registry.request_name(NAME, session(1, 1), 0);
        assert_eq!(code, request_name_reply::IN_QUEUE);
        assert!(change.is_none());
        assert_eq!(
            registry.queued_owners(NAME),
            vec![session(1, 0), session(1, 1)]
        );
    }

    #[test]
    fn test_do_not_queue_purges_entry() {
        let mut registry = NameRegistry::new();
        registry.request_name(NAME, session(1, 0), 0);

        let (code, change) = registry.request_name(
            NAME,
            session(1, 1),
            request_name_flags::DO_NOT_QUEUE,
        );
        assert_eq!(code, request_name_reply::EXISTS);
        assert!(change.is_none());
        assert_eq!(registry.queued_owners(NAME), vec![session(1, 0)]);
    }

    #[test]
    fn test_replacement_requires_both_flags() {
        let mut registry = NameRegistry::new();
        registry.request_name(NAME, session(1, 0), 0);

        // Owner does not allow replacement: stays queued.
        let (code, _) =
            registry.request_name(NAME, session(1, 1), request_name_flags::REPLACE_EXISTING);
        assert_eq!(code, request_name_reply::IN_QUEUE);

        // Re-request by the owner overwrites its flags to allow replacement.
        let (code, change) =
            registry.request_name(NAME, session(1, 0), request_name_flags::ALLOW_REPLACEMENT);
        assert_eq!(code, request_name_reply::ALREADY_OWNER);
        assert!(change.is_none());

        // Now the waiter can take over; the old owner stays queued behind it.
        let (code, change) =
            registry.request_name(NAME, session(1, 1), request_name_flags::REPLACE_EXISTING);
        assert_eq!(code, request_name_reply::PRIMARY_OWNER);
        let change = change.unwrap();
        assert_eq!(change.old, Some(session(1, 0)));
        assert_eq!(change.new, Some(session(1, 1)));
        assert_eq!(
            registry.queued_owners(NAME),
            vec![session(1, 1), session(1, 0)]
        );
    }

    #[test]
    fn test_replacement_preserves_relative_order_of_waiters() {
        let mut registry = NameRegistry::new();
        registry.request_name(NAME, session(1, 0), request_name_flags::ALLOW_REPLACEMENT);
        registry.request_name(NAME, session(1, 1), 0);
        registry.request_name(NAME, session(1, 2), request_name_flags::REPLACE_EXISTING);

        assert_eq!(
            registry.queued_owners(NAME),
            vec![session(1, 2), session(1, 0), session(1, 1)]
        );
    }

    #[test]
    fn test_release_by_owner_promotes_next() {
        let mut registry = NameRegistry::new();
        registry.request_name(NAME, session(1, 0), 0);
        registry.request_name(NAME, session(1, 1), 0);

        let (code, change) = registry.release_name(NAME, session(1, 0));
        assert_eq!(code, release_name_reply::RELEASED);
        let change = change.unwrap();
        assert_eq!(change.old, Some(session(1, 0)));
        assert_eq!(change.new, Some(session(1, 1)));
        assert_eq!(registry.queued_owners(NAME), vec![session(1, 1)]);
    }

    #[test]
    fn test_release_last_entry_deletes_queue() {
        let mut registry = NameRegistry::new();
        registry.request_name(NAME, session(1, 0), 0);

        let (code, change) = registry.release_name(NAME, session(1, 0));
        assert_eq!(code, release_name_reply::RELEASED);
        assert_eq!(change.unwrap().new, None);
        assert!(registry.names().next().is_none());
        assert_eq!(registry.queued_owners(NAME), Vec::<SessionId>::new());
    }

    #[test]
    fn test_release_from_queue_is_released_without_transition() {
        let mut registry = NameRegistry::new();
        registry.request_name(NAME, session(1, 0), 0);
        registry.request_name(NAME, session(1, 1), 0);

        let (code, change) = registry.release_name(NAME, session(1, 1));
        assert_eq!(code, release_name_reply::RELEASED);
        assert!(change.is_none());
        assert_eq!(registry.queued_owners(NAME), vec![session(1, 0)]);
    }

    #[test]
    fn test_release_unknown_name() {
        let mut registry = NameRegistry::new();
        let (code, change) = registry.release_name(NAME, session(1, 0));
        assert_eq!(code, release_name_reply::NON_EXISTENT);
        assert!(change.is_none());
    }

    #[test]
    fn test_release_without_entry() {
        let mut registry = NameRegistry::new();
        registry.request_name(NAME, session(1, 0), 0);

        let (code, change) = registry.release_name(NAME, session(1, 9));
        assert_eq!(code, release_name_reply::NOT_OWNER);
        assert!(change.is_none());
    }

    #[test]
    fn test_remove_session_transfers_and_deletes() {
        let mut registry = NameRegistry::new();
        registry.request_name("org.example.A", session(1, 0), 0);
        registry.request_name("org.example.A", session(1, 1), 0);
        registry.request_name("org.example.B", session(1, 0), 0);

        let mut changes = registry.remove_session(session(1, 0));
        changes.sort_by(|a, b| a.name.cmp(&b.name));

        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].name, "org.example.A");
        assert_eq!(changes[0].new, Some(session(1, 1)));
        assert_eq!(changes[1].name, "org.example.B");
        assert_eq!(changes[1].new, None);

        assert_eq!(registry.owner("org.example.A"), Some(session(1, 1)));
        assert!(registry.names().all(|n| n != "org.example.B"));
    }

    #[test]
    fn test_remove_queued_session_is_silent() {
        let mut registry = NameRegistry::new();
        registry.request_name(NAME, session(1, 0), 0);
        registry.request_name(NAME, session(1, 1), 0);

        let changes = registry.remove_session(session(1, 1));
        assert!(changes.is_empty());
        assert_eq!(registry.queued_owners(NAME), vec![session(1, 0)]);
    }

    #[test]
    fn test_bus_name_validation() {
        assert!(is_valid_bus_name("com.example.Service"));
        assert!(is_valid_bus_name("a.b"));
        assert!(is_valid_bus_name("org.freedesktop.DBus"));
        assert!(is_valid_bus_name("com.example.with-dash_and_underscore"));

        assert!(!is_valid_bus_name(""));
        assert!(!is_valid_bus_name("single"));
        assert!(!is_valid_bus_name(".leading.dot"));
        assert!(!is_valid_bus_name("trailing.dot."));
        assert!(!is_valid_bus_name("com..double"));
        assert!(!is_valid_bus_name("com.1digit"));
        assert!(!is_valid_bus_name("com.exa mple"));
        assert!(!is_valid_bus_name(":1.0"));
        assert!(is_unique_name(":1.0"));
    }
}
