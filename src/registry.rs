use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};

/// A target host and its connection parameters. Immutable once registered
/// for the lifetime of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    /// Stable identifier, unique within the registry (typically the name
    /// operators know the machine by).
    pub id: String,
    pub addr: String,
    pub port: u16,
    pub username: String,
    /// Reference into the credential manager; never the material itself.
    pub credential: String,
}

impl Host {
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.addr, self.port)
    }
}

/// Known set of target hosts, passed by reference into the scheduler.
#[derive(Debug, Default)]
pub struct HostRegistry {
    hosts: HashMap<String, Host>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a host, replacing any previous entry with the same id.
    pub fn register(&mut self, host: Host) {
        self.hosts.insert(host.id.clone(), host);
    }

    pub fn resolve(&self, host_id: &str) -> Result<&Host> {
        self.hosts
            .get(host_id)
            .ok_or_else(|| FleetError::UnknownHost(host_id.to_string()))
    }

    pub fn host_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.hosts.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

/// Authentication material resolved on demand for one connection attempt.
///
/// Callers must not persist this; it never enters job, task, or attempt
/// records.
#[derive(Clone)]
pub enum AuthMaterial {
    KeyFile {
        path: PathBuf,
        passphrase: Option<String>,
    },
    Password(String),
}

impl std::fmt::Debug for AuthMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMaterial::KeyFile { path, .. } => {
                f.debug_struct("KeyFile").field("path", path).finish()
            }
            AuthMaterial::Password(_) => f.write_str("Password(<redacted>)"),
        }
    }
}

/// Resolves credential references to usable authentication material.
#[derive(Debug, Default)]
pub struct CredentialManager {
    entries: HashMap<String, AuthMaterial>,
}

impl CredentialManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_key_file(&mut self, id: &str, path: PathBuf, passphrase: Option<String>) {
        self.entries
            .insert(id.to_string(), AuthMaterial::KeyFile { path, passphrase });
    }

    pub fn add_password(&mut self, id: &str, password: String) {
        self.entries
            .insert(id.to_string(), AuthMaterial::Password(password));
    }

    pub fn resolve(&self, credential_id: &str) -> Result<AuthMaterial> {
        match self.entries.get(credential_id) {
            Some(AuthMaterial::KeyFile { path, passphrase }) => {
                if !path.exists() {
                    return Err(FleetError::CredentialUnavailable(format!(
                        "key file not found: {}",
                        path.display()
                    )));
                }
                Ok(AuthMaterial::KeyFile {
                    path: path.clone(),
                    passphrase: passphrase.clone(),
                })
            }
            Some(material) => Ok(material.clone()),
            None => Err(FleetError::CredentialUnavailable(format!(
                "no such credential: {credential_id}"
            ))),
        }
    }
}
