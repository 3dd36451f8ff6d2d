use std::sync::RwLock;

use crate::auth::AuthContext;

/// Answers "is this terminal currently authenticated" for the sync engine.
///
/// License activation and sign-in live outside this crate; the host app
/// implements this trait (or uses [`StaticIdentityProvider`]) to hand the
/// current identity to push and pull.
pub trait IdentityProvider: Send + Sync {
    /// The current identity, or `None` when the terminal is signed out.
    fn current(&self) -> Option<AuthContext>;

    fn is_authenticated(&self) -> bool {
        self.current().is_some()
    }
}

/// Identity holder the host app updates on sign-in and sign-out
#[derive(Default)]
pub struct StaticIdentityProvider {
    context: RwLock<Option<AuthContext>>,
}

impl StaticIdentityProvider {
    pub fn new(context: Option<AuthContext>) -> Self {
        Self {
            context: RwLock::new(context),
        }
    }

    pub fn sign_in(&self, context: AuthContext) {
        match self.context.write() {
            Ok(mut guard) => *guard = Some(context),
            Err(poisoned) => *poisoned.into_inner() = Some(context),
        }
    }

    pub fn sign_out(&self) {
        match self.context.write() {
            Ok(mut guard) => *guard = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
    }
}

impl IdentityProvider for StaticIdentityProvider {
    fn current(&self) -> Option<AuthContext> {
        match self.context.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn sign_in_and_out_toggle_authentication() {
        let identity = StaticIdentityProvider::new(None);
        assert!(!identity.is_authenticated());

        identity.sign_in(AuthContext::new(Uuid::new_v4(), "T-01", "shop-1", "token"));
        assert!(identity.is_authenticated());
        assert_eq!(identity.current().unwrap().terminal_id, "T-01");

        identity.sign_out();
        assert!(identity.current().is_none());
    }
}
