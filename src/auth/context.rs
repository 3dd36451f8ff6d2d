use uuid::Uuid;

/// Represents the authenticated identity a terminal operates under
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// The ID of the signed-in cashier or operator
    pub user_id: Uuid,

    /// The ID of this POS terminal, embedded in every outgoing sync payload
    pub terminal_id: String,

    /// The tenant (merchant) this terminal belongs to
    pub tenant_id: String,

    /// Bearer token presented to the cloud ledger
    pub api_token: String,
}

impl AuthContext {
    /// Create a new authentication context
    pub fn new(user_id: Uuid, terminal_id: &str, tenant_id: &str, api_token: &str) -> Self {
        Self {
            user_id,
            terminal_id: terminal_id.to_string(),
            tenant_id: tenant_id.to_string(),
            api_token: api_token.to_string(),
        }
    }
}
