use serde::{Deserialize, Serialize};

/// A short-lived capability authorizing one delegation to one agent under
/// one plan. Fetched fresh for every delegation and never cached.
#[derive(Clone, Serialize, Deserialize)]
pub struct AccessConfig {
    pub plan_id: String,
    pub agent_id: String,
    pub access_token: String,
    /// Endpoint the agent is reachable at, when the ledger proxies it.
    #[serde(default)]
    pub endpoint: Option<String>,
}

// Tokens must never end up in logs.
impl std::fmt::Debug for AccessConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessConfig")
            .field("plan_id", &self.plan_id)
            .field("agent_id", &self.agent_id)
            .field("access_token", &"<redacted>")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}
