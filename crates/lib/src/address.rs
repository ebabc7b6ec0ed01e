//! Recipient addresses in the messaging network's `user[.agent][:device]@server` form.

use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Server suffix for individual user accounts.
pub const DEFAULT_USER_SERVER: &str = "s.whatsapp.net";

/// Why an address string was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("address is empty")]
    Empty,
    #[error("address contains whitespace")]
    Whitespace,
    #[error("address is missing the @server suffix")]
    MissingServer,
    #[error("address has more than one '@'")]
    MultipleAt,
    #[error("address user part is empty")]
    EmptyUser,
    #[error("address server part is empty")]
    EmptyServer,
    #[error("invalid agent part: {0}")]
    InvalidAgent(String),
    #[error("invalid device part: {0}")]
    InvalidDevice(String),
}

/// A parsed protocol address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub user: String,
    pub agent: u8,
    pub device: u16,
    pub server: String,
}

impl Address {
    /// Parse `user[.agent][:device]@server`.
    pub fn parse(s: &str) -> Result<Self, AddressError> {
        if s.is_empty() {
            return Err(AddressError::Empty);
        }
        if s.chars().any(char::is_whitespace) {
            return Err(AddressError::Whitespace);
        }
        let mut parts = s.split('@');
        let local = parts.next().unwrap_or_default();
        let server = parts.next().ok_or(AddressError::MissingServer)?;
        if parts.next().is_some() {
            return Err(AddressError::MultipleAt);
        }
        if server.is_empty() {
            return Err(AddressError::EmptyServer);
        }

        let (user_agent, device) = match local.split_once(':') {
            Some((ua, dev)) => {
                let device = dev
                    .parse::<u16>()
                    .map_err(|_| AddressError::InvalidDevice(dev.to_string()))?;
                (ua, device)
            }
            None => (local, 0),
        };
        let (user, agent) = match user_agent.split_once('.') {
            Some((u, ag)) => {
                let agent = ag
                    .parse::<u8>()
                    .map_err(|_| AddressError::InvalidAgent(ag.to_string()))?;
                (u, agent)
            }
            None => (user_agent, 0),
        };
        if user.is_empty() {
            return Err(AddressError::EmptyUser);
        }

        Ok(Self {
            user: user.to_string(),
            agent,
            device,
            server: server.to_string(),
        })
    }

    /// Plain user address on the default server (no agent/device).
    pub fn user(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            agent: 0,
            device: 0,
            server: DEFAULT_USER_SERVER.to_string(),
        }
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.user)?;
        if self.agent != 0 {
            write!(f, ".{}", self.agent)?;
        }
        if self.device != 0 {
            write!(f, ":{}", self.device)?;
        }
        write!(f, "@{}", self.server)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
