//! Scope names used to address broadcasts and RPC servers.

use std::fmt;

/// A transport address such as `channel/default/category/cat1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Scope(String);

/// Which side of a component a buffer represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferRole {
    Output,
    Input,
}

impl BufferRole {
    pub fn suffix(&self) -> &'static str {
        match self {
            BufferRole::Output => "OB",
            BufferRole::Input => "IB",
        }
    }
}

impl Scope {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Broadcast address of a category within a channel.
    pub fn category(channel: &str, category: &str) -> Self {
        Self(format!("channel/{}/category/{}", channel, category))
    }

    /// Unique name and RPC endpoint of a buffer.
    pub fn component(basename: &str, instance_id: &str, role: BufferRole) -> Self {
        Self(format!(
            "component/{}-{}/{}",
            basename,
            instance_id,
            role.suffix()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Scope {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Scope {
    fn from(s: String) -> Self {
        Self(s)
    }
}
