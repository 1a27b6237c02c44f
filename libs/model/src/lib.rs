//! Shared vocabulary of the firewall core.
//!
//! Everything in here is cheap to copy and free of policy: the profile ID,
//! the verdict enum and its severity ordering, IP scope classification and
//! the process-ID sentinels used when attribution fails.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod scope;
mod verdict;

pub use scope::IpScope;
pub use verdict::Verdict;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a profile in the profile store.
///
/// Profile IDs are scoped by their source, e.g. `local/firefox` or
/// `special/unidentified`.
#[derive(Hash, Deserialize, Serialize, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ProfileId(String);

impl ProfileId {
    pub fn local(name: &str) -> Self {
        Self(format!("local/{name}"))
    }

    pub fn special(name: &str) -> Self {
        Self(format!("special/{name}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ProfileId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self, f)
    }
}

/// An OS process ID as used throughout the core.
///
/// Negative values are sentinels, see the constants below.
pub type Pid = i32;

/// The process could not be identified; packets attributed to this PID are
/// handled with the most restrictive defaults.
pub const PID_UNIDENTIFIED: Pid = -1;

/// The OS networking stack itself (inbound traffic without a local socket).
pub const PID_NETWORK_HOST: Pid = -255;

/// Kernel-owned sockets.
pub const PID_SYSTEM: Pid = 0;

/// Our current best guess about general network connectivity.
///
/// Ordering is "best first": anything `>= Portal` counts as degraded, which
/// is what the connectivity-domain grant keys on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkState {
    Online,
    Portal,
    Offline,
}

impl NetworkState {
    pub fn is_degraded(&self) -> bool {
        *self >= NetworkState::Portal
    }
}

impl fmt::Display for NetworkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkState::Online => write!(f, "online"),
            NetworkState::Portal => write!(f, "captive portal"),
            NetworkState::Offline => write!(f, "offline"),
        }
    }
}
