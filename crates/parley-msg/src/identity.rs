//! ---
//! parley_section: "02-cross-context-messaging"
//! parley_subsection: "module"
//! parley_type: "source"
//! parley_scope: "code"
//! parley_description: "Cross-context message bus, arbitration and broadcaster."
//! parley_version: "v0.0.0-prealpha"
//! parley_owner: "tbd"
//! ---
use std::fmt;

use once_cell::sync::OnceCell;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{BusError, Result};

static PROCESS_IDENTITY: OnceCell<ContextId> = OnceCell::new();

/// Kind of execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextKind {
    /// The single long-lived context.
    Background,
    /// Toolbar popup; zero or more instances.
    Popup,
    /// Settings page; zero or more instances.
    Options,
    /// Script injected into a web page; zero or more instances.
    Content,
}

impl ContextKind {
    /// Whether at most one context of this kind exists.
    pub fn is_singleton(self) -> bool {
        matches!(self, ContextKind::Background)
    }

    /// Tag prefix used in identifiers.
    pub fn as_str(self) -> &'static str {
        match self {
            ContextKind::Background => "background",
            ContextKind::Popup => "popup",
            ContextKind::Options => "options",
            ContextKind::Content => "content",
        }
    }
}

impl fmt::Display for ContextKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identifier of one execution context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId {
    kind: ContextKind,
    tag: String,
}

impl ContextId {
    /// The fixed identifier of the long-lived context.
    pub fn background() -> Self {
        Self {
            kind: ContextKind::Background,
            tag: ContextKind::Background.as_str().to_owned(),
        }
    }

    /// Mint an identifier for a new context of `kind`.
    ///
    /// Plural kinds get a random numeric suffix (`popup-73421`); collisions
    /// are not defended against.
    pub fn generate(kind: ContextKind) -> Self {
        if kind.is_singleton() {
            return Self::background();
        }
        let suffix: u32 = rand::thread_rng().gen();
        Self {
            kind,
            tag: format!("{}-{}", kind.as_str(), suffix),
        }
    }

    /// Context kind.
    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    /// Full tag, e.g. `background` or `options-1289`.
    pub fn as_str(&self) -> &str {
        &self.tag
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag)
    }
}

/// Process-wide identity, assigned once at startup and never changed.
pub struct ContextIdentity;

impl ContextIdentity {
    /// Assign this process its identity, or return the one already assigned.
    ///
    /// Asking again for the same kind is harmless and yields the same
    /// identifier; asking for a different kind is refused.
    pub fn establish(kind: ContextKind) -> Result<&'static ContextId> {
        let identity = PROCESS_IDENTITY.get_or_init(|| {
            let id = ContextId::generate(kind);
            info!(context = %id, "context identity established");
            id
        });
        if identity.kind() != kind {
            return Err(BusError::IdentityConflict {
                established: identity.to_string(),
                requested: kind,
            });
        }
        Ok(identity)
    }

    /// Identity of this process, if already established.
    pub fn current() -> Option<&'static ContextId> {
        PROCESS_IDENTITY.get()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn background_identity_is_constant() {
        assert_eq!(ContextId::generate(ContextKind::Background), ContextId::background());
        assert_eq!(ContextId::background().as_str(), "background");
    }

    #[test]
    fn plural_identities_carry_kind_prefix() {
        let id = ContextId::generate(ContextKind::Options);
        assert!(id.as_str().starts_with("options-"));
        assert_eq!(id.kind(), ContextKind::Options);
        let suffix = &id.as_str()["options-".len()..];
        assert!(suffix.parse::<u32>().is_ok());
    }

    #[test]
    fn concurrent_plural_contexts_do_not_collide() {
        for _ in 0..1_000 {
            let a = ContextId::generate(ContextKind::Popup);
            let b = ContextId::generate(ContextKind::Popup);
            assert_ne!(a, b);
        }
        let many: HashSet<_> = (0..500)
            .map(|_| ContextId::generate(ContextKind::Content))
            .collect();
        assert_eq!(many.len(), 500);
    }

    #[test]
    fn process_identity_is_assigned_once() {
        let first = ContextIdentity::establish(ContextKind::Popup).expect("establish");
        let again = ContextIdentity::establish(ContextKind::Popup).expect("same kind");
        assert!(std::ptr::eq(first, again));
        assert_eq!(ContextIdentity::current(), Some(first));

        let err = ContextIdentity::establish(ContextKind::Background)
            .expect_err("cannot reassign identity");
        assert!(matches!(err, BusError::IdentityConflict { .. }));
        assert_eq!(ContextIdentity::current(), Some(first));
    }
}
