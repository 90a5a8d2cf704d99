//! Glob and string matchers used by the built-in criteria.
//!
//! | Pattern | Semantics |
//! |---------|-----------|
//! | `"*"` | matches everything |
//! | `"prefix*"` | prefix match |
//! | `"*suffix"` | suffix match |
//! | `"*contains*"` | contains match |
//! | `"exact"` | exact match |

use serde::{Deserialize, Serialize};

/// A compiled glob pattern supporting `*`, `prefix*`, `*suffix`, `*mid*`,
/// and exact matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobPattern {
    /// Matches every value.
    Wildcard,
    /// Matches exactly.
    Exact(String),
    /// Matches values starting with the prefix.
    Prefix(String),
    /// Matches values ending with the suffix.
    Suffix(String),
    /// Matches values containing the substring.
    Contains(String),
}

impl GlobPattern {
    /// Compile a pattern string.
    #[must_use]
    pub fn new(s: &str) -> Self {
        if s == "*" {
            return Self::Wildcard;
        }
        match (s.starts_with('*'), s.ends_with('*')) {
            (true, true) => {
                let inner = &s[1..s.len() - 1];
                if inner.is_empty() {
                    Self::Wildcard
                } else {
                    Self::Contains(inner.to_string())
                }
            }
            (true, false) => Self::Suffix(s[1..].to_string()),
            (false, true) => Self::Prefix(s[..s.len() - 1].to_string()),
            (false, false) => Self::Exact(s.to_string()),
        }
    }

    /// Test a value against the pattern.
    #[must_use]
    pub fn matches(&self, value: &str) -> bool {
        match self {
            Self::Wildcard => true,
            Self::Exact(e) => value == e,
            Self::Prefix(p) => value.starts_with(p.as_str()),
            Self::Suffix(s) => value.ends_with(s.as_str()),
            Self::Contains(c) => value.contains(c.as_str()),
        }
    }
}

/// String matcher as written in route policy YAML.
///
/// Either a glob shorthand (`email: "*@example.com"`) or an explicit
/// operator block (`email: { ends_with: "@example.com" }`). Every operator
/// present in a block must hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringMatcher {
    /// Glob shorthand.
    Glob(String),
    /// Explicit operators.
    Ops(StringOps),
}

/// Explicit string matcher operators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StringOps {
    /// Exact equality.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is: Option<String>,
    /// Prefix match.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub starts_with: Option<String>,
    /// Suffix match.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ends_with: Option<String>,
    /// Substring match.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contains: Option<String>,
    /// Membership in a list.
    #[serde(rename = "in", skip_serializing_if = "Option::is_none")]
    pub one_of: Option<Vec<String>>,
}

impl StringOps {
    fn is_empty(&self) -> bool {
        self.is.is_none()
            && self.starts_with.is_none()
            && self.ends_with.is_none()
            && self.contains.is_none()
            && self.one_of.is_none()
    }
}

/// Compiled [`StringMatcher`].
#[derive(Debug, Clone)]
pub enum CompiledMatcher {
    /// Glob shorthand.
    Glob(GlobPattern),
    /// Explicit operators.
    Ops(StringOps),
}

impl CompiledMatcher {
    /// Compile a matcher, rejecting an operator block with no operators.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem when the matcher is empty.
    pub fn compile(matcher: &StringMatcher) -> std::result::Result<Self, String> {
        match matcher {
            StringMatcher::Glob(s) => Ok(Self::Glob(GlobPattern::new(s))),
            StringMatcher::Ops(ops) if ops.is_empty() => {
                Err("string matcher has no operators".to_string())
            }
            StringMatcher::Ops(ops) => Ok(Self::Ops(ops.clone())),
        }
    }

    /// Test a value.
    #[must_use]
    pub fn matches(&self, value: &str) -> bool {
        match self {
            Self::Glob(g) => g.matches(value),
            Self::Ops(ops) => {
                ops.is.as_deref().is_none_or(|v| value == v)
                    && ops.starts_with.as_deref().is_none_or(|v| value.starts_with(v))
                    && ops.ends_with.as_deref().is_none_or(|v| value.ends_with(v))
                    && ops.contains.as_deref().is_none_or(|v| value.contains(v))
                    && ops
                        .one_of
                        .as_ref()
                        .is_none_or(|list| list.iter().any(|v| v == value))
            }
        }
    }
}
