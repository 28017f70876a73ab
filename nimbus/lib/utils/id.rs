use std::fmt;

use uuid::Uuid;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The kinds of objects nimbus hands out identifiers for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdKind {
    /// A sandbox.
    Sandbox,

    /// A volume.
    Volume,

    /// A template.
    Template,

    /// A template build.
    Build,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl IdKind {
    /// The prefix ids of this kind start with.
    pub fn prefix(&self) -> &'static str {
        match self {
            IdKind::Sandbox => "sbx_",
            IdKind::Volume => "vol_",
            IdKind::Template => "tpl_",
            IdKind::Build => "bld_",
        }
    }

    /// Returns true if `id` looks like an identifier of this kind.
    pub fn matches(&self, id: &str) -> bool {
        id.strip_prefix(self.prefix())
            .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_alphanumeric()))
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Generates a new opaque, prefixed identifier.
pub fn new_id(kind: IdKind) -> String {
    format!("{}{}", kind.prefix(), Uuid::new_v4().simple())
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for IdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdKind::Sandbox => write!(f, "sandbox"),
            IdKind::Volume => write!(f, "volume"),
            IdKind::Template => write!(f, "template"),
            IdKind::Build => write!(f, "build"),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_id_is_prefixed_and_unique() {
        let a = new_id(IdKind::Sandbox);
        let b = new_id(IdKind::Sandbox);
        assert!(a.starts_with("sbx_"));
        assert_ne!(a, b);
        assert!(IdKind::Sandbox.matches(&a));
        assert!(!IdKind::Volume.matches(&a));
        assert!(!IdKind::Volume.matches("vol_"));
        assert!(!IdKind::Volume.matches("vol_../x"));
    }
}
