pub mod context;
pub mod identity;

// Re-export public items
pub use context::AuthContext;
pub use identity::{IdentityProvider, StaticIdentityProvider};
