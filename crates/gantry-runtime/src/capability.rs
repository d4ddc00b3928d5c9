//! Capability-based security model for plugins.
//!
//! Programs declare the capabilities they need through compile-time
//! directives. The set is evaluated once when a program is loaded; the
//! runtime never rescans directive strings at call time.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// A capability that a program can declare.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Full trust. Implies every other capability.
    Trusted,

    /// Read from any database namespace, not only the plugin's own.
    OpenAnyDatabase,

    /// Write to any database namespace, not only the plugin's own.
    WriteAnyDatabaseNamespace,

    /// Custom capability for extension.
    Custom(String),
}

impl Capability {
    /// Parse a capability from a directive token.
    pub fn parse(s: &str) -> Self {
        match s {
            "trusted" => Capability::Trusted,
            "openAnyDatabase" => Capability::OpenAnyDatabase,
            "writeAnyDatabaseNamespace" => Capability::WriteAnyDatabaseNamespace,
            other => Capability::Custom(other.to_string()),
        }
    }

    /// Convert capability to its directive token.
    pub fn as_str(&self) -> &str {
        match self {
            Capability::Trusted => "trusted",
            Capability::OpenAnyDatabase => "openAnyDatabase",
            Capability::WriteAnyDatabaseNamespace => "writeAnyDatabaseNamespace",
            Capability::Custom(s) => s,
        }
    }
}

/// A set of capabilities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet {
    capabilities: HashSet<Capability>,
}

impl CapabilitySet {
    /// Create an empty capability set.
    pub fn new() -> Self {
        Self {
            capabilities: HashSet::new(),
        }
    }

    /// Create a capability set from a list of capability strings.
    pub fn from_strings<I, S>(strings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let capabilities = strings
            .into_iter()
            .map(|s| Capability::parse(s.as_ref()))
            .collect();
        Self { capabilities }
    }

    /// Build the set from program directives.
    ///
    /// Every directive value is split on whitespace and commas, and each
    /// token must match a capability name exactly. `"untrusted"` does not
    /// grant `trusted`.
    pub fn from_directives(directives: &BTreeMap<String, String>) -> Self {
        Self::from_strings(
            directives
                .values()
                .flat_map(|v| v.split(|c: char| c.is_whitespace() || c == ','))
                .map(|t| t.trim_matches('"'))
                .filter(|t| !t.is_empty()),
        )
    }

    /// Add a capability to the set.
    pub fn add(&mut self, cap: Capability) {
        self.capabilities.insert(cap);
    }

    /// Check if the set grants a capability. `Trusted` grants everything.
    pub fn has(&self, cap: &Capability) -> bool {
        self.is_trusted() || self.capabilities.contains(cap)
    }

    /// Check for the `Trusted` capability.
    pub fn is_trusted(&self) -> bool {
        self.capabilities.contains(&Capability::Trusted)
    }

    /// Check if this set grants every capability of another.
    pub fn contains_all(&self, other: &CapabilitySet) -> bool {
        other.iter().all(|c| self.has(c))
    }

    /// Get all declared capabilities.
    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.capabilities.iter()
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<T: IntoIterator<Item = Capability>>(iter: T) -> Self {
        Self {
            capabilities: iter.into_iter().collect(),
        }
    }
}
