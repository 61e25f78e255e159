//! Entity trait: identity + continuity across state changes.

/// Anything stored in the RBAC graph under a stable identifier.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;
}

/// Entities addressed by a unique, human-facing name.
pub trait Named {
    fn name(&self) -> &str;
}
