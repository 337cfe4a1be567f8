//! # Resource Naming
//!
//! Maps a logical name to the broker resource used by each messaging pattern.
//! The one-character prefix is the only routing mechanism, so peers built
//! against the same scheme interoperate as long as the prefixes match exactly.

use std::fmt;

/// The messaging pattern a broker resource belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pattern {
    /// Fire-and-forget queue (`d`).
    Direct,
    /// Durable task queue (`p`).
    Task,
    /// Fanout exchange (`e`).
    Event,
    /// RPC request queue (`r`).
    Rpc,
}

impl Pattern {
    /// All patterns, in prefix order.
    pub const ALL: [Pattern; 4] = [Self::Direct, Self::Task, Self::Event, Self::Rpc];

    /// The prefix prepended to logical names.
    pub const fn prefix(self) -> char {
        match self {
            Self::Direct => 'd',
            Self::Task => 'p',
            Self::Event => 'e',
            Self::Rpc => 'r',
        }
    }

    /// Broker resource name for `name` under this pattern.
    pub fn resource(self, name: &str) -> String {
        let mut resource = String::with_capacity(name.len() + 1);
        resource.push(self.prefix());
        resource.push_str(name);
        resource
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Direct => "direct",
            Self::Task => "task",
            Self::Event => "event",
            Self::Rpc => "rpc",
        };
        f.write_str(label)
    }
}

/// Shorthand for [`Pattern::resource`].
pub fn resource_name(pattern: Pattern, name: &str) -> String {
    pattern.resource(name)
}
