//! Error taxonomy reported at a group boundary.

use crate::types::GroupId;
use thiserror::Error;

/// Everything that can go wrong while evaluating or mutating a group.
///
/// None of these is fatal: the evaluation driver converts each one into an
/// empty result plus a user-visible message for the affected group only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GroupError {
    /// A referenced name is not in the set visible to the group
    /// (not evaluated yet, positioned after it, removed, or failed).
    #[error("There is no visible observable with name \"{name}\"!")]
    DependencyLookup { name: String },
    
    /// The definition explicitly returned a structured error.
    #[error("{0}")]
    Constructor(String),
    
    /// A stream errored or user code panicked while the clock was driven.
    #[error("Runtime error: {0}")]
    Runtime(String),
    
    /// The operation targeted a group that has been disposed.
    #[error("Group {group} is disposed")]
    DisposedAccess { group: GroupId },
}

impl GroupError {
    /// Creates a dependency lookup error.
    pub fn lookup(name: impl Into<String>) -> Self {
        Self::DependencyLookup { name: name.into() }
    }
    
    /// Creates a constructor error.
    pub fn constructor(msg: impl Into<String>) -> Self {
        Self::Constructor(msg.into())
    }
    
    /// Creates a runtime error.
    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::Runtime(msg.into())
    }
    
    /// Creates a disposed access error.
    pub fn disposed(group: GroupId) -> Self {
        Self::DisposedAccess { group }
    }
    
    /// Short stable tag for logs and exports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DependencyLookup { .. } => "dependency_lookup",
            Self::Constructor(_) => "constructor",
            Self::Runtime(_) => "runtime",
            Self::DisposedAccess { .. } => "disposed_access",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    
    #[test]
    fn test_lookup_error_names_the_dependency() {
        let err = GroupError::lookup("A");
        assert_eq!(err.to_string(), "There is no visible observable with name \"A\"!");
        assert_eq!(err.kind(), "dependency_lookup");
    }
    
    #[test]
    fn test_constructor_error_is_the_bare_message() {
        assert_eq!(GroupError::constructor("bad input").to_string(), "bad input");
    }
}
