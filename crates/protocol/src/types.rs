use serde::{Deserialize, Serialize};

/// How a connection authenticates against the remote host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthMethod {
    Password,
    PrivateKey,
    Both,
}

/// Parameters used to (re)establish a remote session.
///
/// `id` is the connection identity: stable across reconnect attempts and
/// unique per profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    pub id: String,
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub auth_method: AuthMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<String>,
}

fn default_port() -> u16 {
    22
}

/// Reasons a [`ConnectionConfig`] is rejected before any network call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("connection name must not be empty")]
    EmptyName,
    #[error("host must not be empty")]
    EmptyHost,
    #[error("username must not be empty")]
    EmptyUsername,
    #[error("port must not be 0")]
    ZeroPort,
    #[error("{0:?} authentication is missing its credential")]
    MissingCredential(AuthMethod),
}

impl ConnectionConfig {
    /// Creates a password-authenticated profile on the default port.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        host: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            host: host.into(),
            port: default_port(),
            username: username.into(),
            auth_method: AuthMethod::Password,
            password: None,
            private_key_path: None,
        }
    }

    /// `user@host:port`, for logs.
    pub fn address(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }

    /// Checks that the profile is complete enough to attempt a connection.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if self.host.is_empty() {
            return Err(ValidationError::EmptyHost);
        }
        if self.username.is_empty() {
            return Err(ValidationError::EmptyUsername);
        }
        if self.port == 0 {
            return Err(ValidationError::ZeroPort);
        }

        let has_credential = match self.auth_method {
            AuthMethod::Password => self.password.is_some(),
            AuthMethod::PrivateKey => self.private_key_path.is_some(),
            AuthMethod::Both => self.password.is_some() || self.private_key_path.is_some(),
        };
        if !has_credential {
            return Err(ValidationError::MissingCredential(self.auth_method));
        }
        Ok(())
    }
}

/// Lifecycle status of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl ConnectionStatus {
    /// Whether the connection is confirmed gone (no live session behind it).
    pub fn is_gone(self) -> bool {
        matches!(self, Self::Disconnected | Self::Error)
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}
