//! SSH target and hop configuration

use std::fmt;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Stable identifier of a saved host, used as the trust-store key
pub type HostId = String;

pub(crate) fn default_port() -> u16 {
    22
}

/// Authentication methods supported
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    /// Password authentication
    Password { password: String },

    /// SSH key authentication
    Key {
        /// Path to private key file
        key_path: String,
        /// Optional passphrase for encrypted keys
        passphrase: Option<String>,
    },

    /// SSH certificate authentication (OpenSSH certificates)
    Certificate {
        key_path: String,
        /// Path to certificate file (*-cert.pub)
        cert_path: String,
        passphrase: Option<String>,
    },

    /// Keyboard-Interactive authentication (2FA/TOTP), answered through the
    /// session's keyboard-interactive prompt
    KeyboardInteractive,
}

impl AuthMethod {
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password {
            password: password.into(),
        }
    }

    pub fn key(key_path: impl Into<String>, passphrase: Option<String>) -> Self {
        Self::Key {
            key_path: key_path.into(),
            passphrase,
        }
    }

    pub fn certificate(
        key_path: impl Into<String>,
        cert_path: impl Into<String>,
        passphrase: Option<String>,
    ) -> Self {
        Self::Certificate {
            key_path: key_path.into(),
            cert_path: cert_path.into(),
            passphrase,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AuthMethod::Password { .. } => "password",
            AuthMethod::Key { .. } => "key",
            AuthMethod::Certificate { .. } => "certificate",
            AuthMethod::KeyboardInteractive => "keyboard_interactive",
        }
    }
}

// Secrets stay out of logs and panic messages
impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::Password { .. } => f.write_str("Password { .. }"),
            AuthMethod::Key { key_path, .. } => {
                f.debug_struct("Key").field("key_path", key_path).finish_non_exhaustive()
            }
            AuthMethod::Certificate {
                key_path,
                cert_path,
                ..
            } => f
                .debug_struct("Certificate")
                .field("key_path", key_path)
                .field("cert_path", cert_path)
                .finish_non_exhaustive(),
            AuthMethod::KeyboardInteractive => f.write_str("KeyboardInteractive"),
        }
    }
}

/// One hop of a connection: jump host or final target
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HopDescriptor {
    pub host_id: HostId,
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub auth: AuthMethod,
}

impl HopDescriptor {
    pub fn new(
        host_id: impl Into<String>,
        hostname: impl Into<String>,
        username: impl Into<String>,
        auth: AuthMethod,
    ) -> Self {
        Self {
            host_id: host_id.into(),
            hostname: hostname.into(),
            port: 22,
            username: username.into(),
            auth,
        }
    }

    /// Set custom port
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    pub fn display_label(&self) -> String {
        format!("{}@{}:{}", self.username, self.hostname, self.port)
    }
}

/// Remote SSH target of a session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SshTarget {
    /// The host itself, with the credentials used for the final hop
    pub host: HopDescriptor,
    /// Name of a configured proxy-jump profile, if this host is reached
    /// through jump hosts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_jump: Option<String>,
}

impl SshTarget {
    pub fn direct(host: HopDescriptor) -> Self {
        Self {
            host,
            proxy_jump: None,
        }
    }

    pub fn via(host: HopDescriptor, profile: impl Into<String>) -> Self {
        Self {
            host,
            proxy_jump: Some(profile.into()),
        }
    }
}

/// Credentials for jump hosts, keyed by host id
///
/// Handed to the chain resolver so hops can be filled in without the profile
/// itself carrying secrets.
#[derive(Debug, Default)]
pub struct CredentialBook {
    entries: DashMap<HostId, AuthMethod>,
}

impl CredentialBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, host_id: impl Into<String>, auth: AuthMethod) {
        self.entries.insert(host_id.into(), auth);
    }

    pub fn get(&self, host_id: &str) -> Option<AuthMethod> {
        self.entries.get(host_id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, host_id: &str) -> Option<AuthMethod> {
        self.entries.remove(host_id).map(|(_, auth)| auth)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_hides_password() {
        let auth = AuthMethod::password("hunter2");
        let printed = format!("{:?}", auth);
        assert!(!printed.contains("hunter2"));

        let key = AuthMethod::key("~/.ssh/id_ed25519", Some("secret".into()));
        let printed = format!("{:?}", key);
        assert!(printed.contains("id_ed25519"));
        assert!(!printed.contains("secret"));
    }

    #[test]
    fn test_hop_descriptor_builder() {
        let hop = HopDescriptor::new("bastion", "bastion.example.com", "admin", AuthMethod::KeyboardInteractive)
            .port(2222);
        assert_eq!(hop.address(), "bastion.example.com:2222");
        assert_eq!(hop.display_label(), "admin@bastion.example.com:2222");
    }

    #[test]
    fn test_auth_method_serde_tag() {
        let json = serde_json::to_string(&AuthMethod::KeyboardInteractive).unwrap();
        assert_eq!(json, r#"{"type":"keyboard_interactive"}"#);

        let hop: HopDescriptor = serde_json::from_str(
            r#"{"host_id":"db","hostname":"db.internal","username":"root","auth":{"type":"password","password":"x"}}"#,
        )
        .unwrap();
        assert_eq!(hop.port, 22);
    }

    #[test]
    fn test_credential_book() {
        let book = CredentialBook::new();
        assert!(book.is_empty());
        book.insert("jump-01", AuthMethod::password("pw"));
        assert_eq!(book.get("jump-01"), Some(AuthMethod::password("pw")));
        assert_eq!(book.len(), 1);
        assert!(book.remove("jump-01").is_some());
        assert!(book.get("jump-01").is_none());
    }
}
