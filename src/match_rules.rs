//! D-Bus match rule parsing and matching.
//!
//! Match rules are used to subscribe to signals. The bus keys its handler
//! registry and the daemon-side AddMatch refcount on the canonical string
//! form, so two spellings of the same rule coalesce.

use std::collections::HashMap;

use tracing::trace;

use crate::message::{Message, MessageType};
use crate::value::Value;

/// A parsed D-Bus match rule.
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
}

impl MatchRule {
    /// An empty rule, which matches everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// A rule scoped to one signal: `(sender, path, interface, member)`.
    pub fn for_signal(sender: &str, path: &str, interface: &str, member: &str) -> Self {
        MatchRule {
            msg_type: Some("signal".to_string()),
            sender: Some(sender.to_string()),
            path: Some(path.to_string()),
            interface: Some(interface.to_string()),
            member: Some(member.to_string()),
            ..MatchRule::default()
        }
    }

    /// Parse a match rule string: comma-separated `key='value'` filters,
    /// e.g. `type='signal',interface='org.freedesktop.DBus'`.
    pub fn parse(rule: &str) -> Result<Self, MatchRuleError> {
        let mut parsed = MatchRule::new();
        let mut cursor = rule;
        while let Some((key, value, rest)) = next_filter(cursor)? {
            parsed.set_filter(key, value)?;
            cursor = rest;
        }
        Ok(parsed)
    }

    fn set_filter(&mut self, key: &str, value: String) -> Result<(), MatchRuleError> {
        match key {
            "type" => self.msg_type = Some(value),
            "sender" => self.sender = Some(value),
            "interface" => self.interface = Some(value),
            "member" => self.member = Some(value),
            "path" => self.path = Some(value),
            "path_namespace" => self.path_namespace = Some(value),
            "destination" => self.destination = Some(value),
            _ if key.starts_with("arg") => {
                let suffix = &key[3..];
                let (index_text, is_path_filter) = match suffix.strip_suffix("path") {
                    Some(index_text) => (index_text, true),
                    None => (suffix, false),
                };
                let index: u8 = index_text
                    .parse()
                    .ok()
                    .filter(|index| *index <= 63)
                    .ok_or_else(|| MatchRuleError::InvalidArgIndex(key.to_string()))?;
                if is_path_filter {
                    self.arg_paths.insert(index, value);
                } else {
                    self.args.insert(index, value);
                }
            }
            other => {
                // Tolerated so newer daemons can add filter kinds.
                trace!(key = other, "Skipping unrecognized match rule key");
            }
        }
        Ok(())
    }

    /// The canonical string form: fixed key order, argument filters sorted
    /// by index. Used as the AddMatch argument and the registry key.
    pub fn canonical_string(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        if let Some(v) = &self.msg_type {
            parts.push(format!("type='{v}'"));
        }
        if let Some(v) = &self.sender {
            parts.push(format!("sender='{v}'"));
        }
        if let Some(v) = &self.interface {
            parts.push(format!("interface='{v}'"));
        }
        if let Some(v) = &self.member {
            parts.push(format!("member='{v}'"));
        }
        if let Some(v) = &self.path {
            parts.push(format!("path='{v}'"));
        }
        if let Some(v) = &self.path_namespace {
            parts.push(format!("path_namespace='{v}'"));
        }
        if let Some(v) = &self.destination {
            parts.push(format!("destination='{v}'"));
        }
        let mut args: Vec<_> = self.args.iter().collect();
        args.sort_by_key(|(idx, _)| **idx);
        for (idx, v) in args {
            parts.push(format!("arg{idx}='{v}'"));
        }
        let mut arg_paths: Vec<_> = self.arg_paths.iter().collect();
        arg_paths.sort_by_key(|(idx, _)| **idx);
        for (idx, v) in arg_paths {
            parts.push(format!("arg{idx}path='{v}'"));
        }
        parts.join(",")
    }

    /// Check if a message matches this rule.
    pub fn matches(&self, msg: &Message) -> bool {
        if let Some(type_filter) = &self.msg_type {
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

        if let Some(sender_filter) = &self.sender {
            if msg.sender.as_deref() != Some(sender_filter.as_str()) {
                return false;
            }
        }

        if let Some(iface_filter) = &self.interface {
            if msg.interface.as_deref() != Some(iface_filter.as_str()) {
                return false;
            }
        }

        if let Some(member_filter) = &self.member {
            if msg.member.as_deref() != Some(member_filter.as_str()) {
                return false;
            }
        }

        if let Some(path_filter) = &self.path {
            if msg.path.as_deref() != Some(path_filter.as_str()) {
                return false;
            }
        }

        // path_namespace matches the path and all of its children.
        if let Some(ns_filter) = &self.path_namespace {
            match &msg.path {
                Some(path) => {
                    if path != ns_filter && !path.starts_with(&format!("{ns_filter}/")) {
                        return false;
                    }
                }
                None => return false,
            }
        }

        if let Some(dest_filter) = &self.destination {
            match &msg.destination {
                Some(dest) if dest == dest_filter => {}
                None if dest_filter.is_empty() => {}
                _ => return false,
            }
        }

        for (idx, expected) in &self.args {
            match msg.body.get(*idx as usize) {
                Some(Value::String(actual)) if actual == expected => {}
                _ => return false,
            }
        }

        // argNpath matches strings and object paths by path prefix, in
        // either direction.
        for (idx, prefix) in &self.arg_paths {
            let actual = match msg.body.get(*idx as usize) {
                Some(Value::String(s)) | Some(Value::ObjectPath(s)) => s,
                _ => return false,
            };
            let rule_is_prefix = prefix.ends_with('/') && actual.starts_with(prefix.as_str());
            let arg_is_parent = actual == prefix || actual.starts_with(&format!("{prefix}/"));
            if !rule_is_prefix && !arg_is_parent {
                return false;
            }
        }

        true
    }
}

/// Take the next `key='value'` filter off the front of `input`, returning
/// the key, the unquoted value, and the unconsumed remainder. `Ok(None)`
/// once only separators are left.
fn next_filter(input: &str) -> Result<Option<(&str, String, &str)>, MatchRuleError> {
    let input = input.trim_start_matches(|c: char| c == ',' || c.is_whitespace());
    if input.is_empty() {
        return Ok(None);
    }

    let Some((key, after_key)) = input.split_once('=') else {
        return Err(MatchRuleError::InvalidFormat(format!(
            "filter without '=': {input:?}"
        )));
    };
    let key = key.trim();
    if key.is_empty() {
        return Err(MatchRuleError::InvalidFormat(format!(
            "filter without a key: {input:?}"
        )));
    }

    let after_key = after_key.trim_start();
    if let Some(quoted) = after_key.strip_prefix('\'') {
        let Some(end) = quoted.find('\'') else {
            return Err(MatchRuleError::InvalidFormat(format!(
                "unterminated quote in value for {key:?}"
            )));
        };
        Ok(Some((key, quoted[..end].to_string(), &quoted[end + 1..])))
    } else {
        // Bare values run to the next comma.
        let end = after_key.find(',').unwrap_or(after_key.len());
        Ok(Some((
            key,
            after_key[..end].trim_end().to_string(),
            &after_key[end..],
        )))
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
            MatchRuleError::InvalidFormat(msg) => write!(f, "Invalid match rule format: {msg}"),
            MatchRuleError::InvalidArgIndex(key) => write!(f, "Invalid argument index: {key}"),
        }
    }
}

impl std::error::Error for MatchRuleError {}
