//! Who is signed in.

use kupid_proto::message::ActorId;

/// Supplies the current actor's identifier.
///
/// Returning `None` (or a non-member id) means nobody is signed in; every
/// operation that needs an actor refuses to start in that case.
pub trait IdentityProvider: Send + Sync + 'static {
    /// The signed-in actor, if any.
    fn current_actor(&self) -> Option<ActorId>;
}

/// An identity fixed at construction, typically read from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticIdentity(Option<ActorId>);

impl StaticIdentity {
    /// Signs in as `actor`. Ids `<= 0` are treated as signed out.
    #[must_use]
    pub const fn new(actor: ActorId) -> Self {
        if actor.is_member() {
            Self(Some(actor))
        } else {
            Self(None)
        }
    }

    /// No one signed in.
    #[must_use]
    pub const fn anonymous() -> Self {
        Self(None)
    }
}

impl IdentityProvider for StaticIdentity {
    fn current_actor(&self) -> Option<ActorId> {
        self.0
    }
}

/// Resolves the signed-in actor, filtering out placeholder ids.
pub(crate) fn resolve(provider: &dyn IdentityProvider) -> Option<ActorId> {
    provider.current_actor().filter(|actor| actor.is_member())
}
