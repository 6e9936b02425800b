//! Application identities and the registry of known applications.
//!
//! A session server only talks to clients whose application name is known to
//! its client registry. The registry is an external collaborator: anything
//! implementing [`AppRegistry`] works. [`StaticAppRegistry`] is an in-memory
//! implementation that can be loaded from JSON.
//!
//! # Example
//!
//! ```
//! use shmwire::app::{AppRegistry, StaticAppRegistry};
//!
//! let registry = StaticAppRegistry::from_json(r#"[
//!     { "name": "cli", "exec_path": "/usr/bin/cli" },
//!     { "name": "srv", "allowed_clients": ["cli"] }
//! ]"#).unwrap();
//!
//! let srv = registry.lookup("srv").unwrap();
//! assert!(srv.allows_client("cli"));
//! assert!(registry.lookup("unknown").is_none());
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Identity of one side of a session: application name plus process id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessIdentity {
    pub app_name: String,
    pub pid: u32,
}

impl ProcessIdentity {
    pub fn new(app_name: impl Into<String>, pid: u32) -> Self {
        Self {
            app_name: app_name.into(),
            pid,
        }
    }

    /// Identity of the calling process under the given application name.
    pub fn current(app_name: impl Into<String>) -> Self {
        Self::new(app_name, std::process::id())
    }
}

impl fmt::Display for ProcessIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.app_name, self.pid)
    }
}

/// Static description of an application that may take part in sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<u32>,
    /// Client application names a server accepts. Empty means any client
    /// known to the server's client registry.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_clients: Vec<String>,
}

impl AppDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exec_path: None,
            user_id: None,
            allowed_clients: Vec::new(),
        }
    }

    pub fn exec_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.exec_path = Some(path.into());
        self
    }

    pub fn user_id(mut self, uid: u32) -> Self {
        self.user_id = Some(uid);
        self
    }

    pub fn allow_client(mut self, client: impl Into<String>) -> Self {
        self.allowed_clients.push(client.into());
        self
    }

    /// Whether this (server) application accepts sessions from `client`.
    pub fn allows_client(&self, client: &str) -> bool {
        self.allowed_clients.is_empty() || self.allowed_clients.iter().any(|c| c == client)
    }
}

/// Lookup of application descriptors by name.
pub trait AppRegistry: Send + Sync {
    fn lookup(&self, app_name: &str) -> Option<AppDescriptor>;
}

/// In-memory [`AppRegistry`].
#[derive(Debug, Clone, Default)]
pub struct StaticAppRegistry {
    apps: HashMap<String, AppDescriptor>,
}

impl StaticAppRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON array of [`AppDescriptor`]s.
    pub fn from_json(json: &str) -> Result<Self> {
        let apps: Vec<AppDescriptor> = serde_json::from_str(json)?;
        Ok(apps.into_iter().collect())
    }

    /// Load a JSON array of [`AppDescriptor`]s from a file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Add (or replace) an application.
    pub fn insert(&mut self, app: AppDescriptor) -> &mut Self {
        self.apps.insert(app.name.clone(), app);
        self
    }

    pub fn with(mut self, app: AppDescriptor) -> Self {
        self.insert(app);
        self
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }
}

impl FromIterator<AppDescriptor> for StaticAppRegistry {
    fn from_iter<I: IntoIterator<Item = AppDescriptor>>(iter: I) -> Self {
        let mut registry = Self::new();
        for app in iter {
            registry.insert(app);
        }
        registry
    }
}

impl AppRegistry for StaticAppRegistry {
    fn lookup(&self, app_name: &str) -> Option<AppDescriptor> {
        self.apps.get(app_name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_display() {
        let id = ProcessIdentity::new("srv", 42);
        assert_eq!(id.to_string(), "srv[42]");
        assert_eq!(ProcessIdentity::current("x").pid, std::process::id());
    }

    #[test]
    fn test_allows_client() {
        let open = AppDescriptor::new("srv");
        assert!(open.allows_client("anyone"));

        let closed = AppDescriptor::new("srv").allow_client("cli");
        assert!(closed.allows_client("cli"));
        assert!(!closed.allows_client("other"));
    }

    #[test]
    fn test_registry_from_json() {
        let registry = StaticAppRegistry::from_json(
            r#"[{"name": "a", "user_id": 1000}, {"name": "b"}]"#,
        )
        .unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.lookup("a").unwrap().user_id, Some(1000));
        assert!(registry.lookup("c").is_none());
    }

    #[test]
    fn test_registry_rejects_bad_json() {
        assert!(StaticAppRegistry::from_json("{not json").is_err());
    }

    #[test]
    fn test_registry_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("apps.json");
        std::fs::write(&path, r#"[{"name": "cli"}]"#).unwrap();

        let registry = StaticAppRegistry::from_file(&path).unwrap();
        assert!(registry.lookup("cli").is_some());
    }

    #[test]
    fn test_descriptor_json_omits_defaults() {
        let json = serde_json::to_string(&AppDescriptor::new("x")).unwrap();
        assert_eq!(json, r#"{"name":"x"}"#);
    }
}
