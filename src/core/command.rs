//! The command object model: the single envelope every control operation
//! flows through, whether it arrives over the local socket or a broker.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How far a command is allowed to fan out beyond the host that issued it.
///
/// Mirrors the original's `_broadcast` integer (`0`=local only, `1`=cluster,
/// `2`=global) but as a named enum so the router never has to remember the
/// ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastScope {
    /// Handle locally only; never publish to the broker.
    None,
    /// Publish to the local cluster's topic/queue.
    Cluster,
    /// Publish to every cluster sharing the broker (the `prefix.global` topic).
    Global,
}

impl Default for BroadcastScope {
    fn default() -> Self {
        Self::None
    }
}

/// A single control operation, fully self-describing: the handler name to
/// route to, its positional/keyword arguments, and the bookkeeping the
/// router and broker adapter need to avoid re-delivering it forever.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    /// Unique id, generated once at creation and carried through every hop
    /// so a command's full fan-out can be traced by this value.
    pub guid: String,
    /// The registered handler name (e.g. `"reload_dataset"`).
    pub name: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    #[serde(default)]
    pub kwargs: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub broadcast_scope: BroadcastScope,
    /// Hostnames that must not re-handle this command; the broker consumer
    /// appends the local hostname here before publishing, never truncates.
    #[serde(default)]
    pub ignore_on_hosts: Vec<String>,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            guid: Uuid::new_v4().to_string(),
            name: name.into(),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
            broadcast_scope: BroadcastScope::None,
            ignore_on_hosts: Vec::new(),
        }
    }

    pub fn with_kwargs(mut self, kwargs: BTreeMap<String, serde_json::Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn with_scope(mut self, scope: BroadcastScope) -> Self {
        self.broadcast_scope = scope;
        self
    }

    /// Appends `host` to the ignore list if it is not already present.
    /// Append-only: entries are never removed once recorded.
    pub fn ignore_host(&mut self, host: impl Into<String>) {
        let host = host.into();
        if !self.ignore_on_hosts.iter().any(|h| h == &host) {
            self.ignore_on_hosts.push(host);
        }
    }

    pub fn kwarg_str(&self, key: &str) -> Option<&str> {
        self.kwargs.get(key).and_then(|v| v.as_str())
    }

    pub fn kwarg_bool(&self, key: &str, default: bool) -> bool {
        self.kwargs.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
    }
}

/// The outcome of routing a [`Command`] to a handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub guid: String,
    pub state: ResponseState,
    pub message: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseState {
    Success,
    Error,
}

impl CommandResponse {
    pub fn success(guid: impl Into<String>, message: impl Serialize) -> Self {
        Self {
            guid: guid.into(),
            state: ResponseState::Success,
            message: serde_json::to_value(message).unwrap_or(serde_json::Value::Null),
        }
    }

    pub fn ok(guid: impl Into<String>) -> Self {
        Self::success(guid, serde_json::Value::Bool(true))
    }

    pub fn error(guid: impl Into<String>, err: &crate::core::errors::CoreError) -> Self {
        Self {
            guid: guid.into(),
            state: ResponseState::Error,
            message: serde_json::json!({
                "kind": err.kind(),
                "message": err.to_string(),
            }),
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == ResponseState::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignore_host_is_append_only_and_deduplicates() {
        let mut cmd = Command::new("reload_dataset");
        cmd.ignore_host("host-a");
        cmd.ignore_host("host-b");
        cmd.ignore_host("host-a");
        assert_eq!(cmd.ignore_on_hosts, vec!["host-a", "host-b"]);
    }

    #[test]
    fn default_scope_is_none() {
        let cmd = Command::new("list_datasets");
        assert_eq!(cmd.broadcast_scope, BroadcastScope::None);
    }

    #[test]
    fn response_error_carries_taxonomy_kind() {
        let err = crate::core::errors::CoreError::validation("bad email");
        let resp = CommandResponse::error("abc", &err);
        assert_eq!(resp.message["kind"], "validation_error");
        assert!(!resp.is_success());
    }
}
