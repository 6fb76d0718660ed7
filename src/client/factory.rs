//! Client factory: one client per (application id, api key) pair.

use super::{AlgoliaClient, RetryPolicy, SearchClient};
use crate::config::ClientConfig;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Integration identification attached to every outgoing request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAgentInfo {
    pub integration_name: String,
    pub integration_version: String,
    pub platform_name: Option<String>,
    pub platform_version: Option<String>,
}

impl Default for UserAgentInfo {
    fn default() -> Self {
        Self {
            integration_name: "WP Search with Algolia".to_string(),
            integration_version: env!("CARGO_PKG_VERSION").to_string(),
            platform_name: None,
            platform_version: None,
        }
    }
}

impl UserAgentInfo {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            integration_name: config.integration_name.clone(),
            integration_version: config
                .integration_version
                .clone()
                .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
            platform_name: config.platform_name.clone(),
            platform_version: config.platform_version.clone(),
        }
    }

    /// e.g. `Algolia for Rust (0.3.2); WP Search with Algolia (2.8.0); WordPress (6.4)`
    pub fn header_value(&self) -> String {
        let mut ua = format!(
            "Algolia for Rust ({}); {} ({})",
            env!("CARGO_PKG_VERSION"),
            self.integration_name,
            self.integration_version
        );
        if let Some(platform) = &self.platform_name {
            let version = self.platform_version.as_deref().unwrap_or("unknown");
            ua.push_str(&format!("; {} ({})", platform, version));
        }
        ua
    }
}

type ClientKey = (String, String);

pub struct ClientFactory {
    user_agent: UserAgentInfo,
    retry: RetryPolicy,
    clients: Mutex<HashMap<ClientKey, Arc<dyn SearchClient>>>,
}

impl ClientFactory {
    pub fn new(user_agent: UserAgentInfo, retry: RetryPolicy) -> Self {
        Self {
            user_agent,
            retry,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(
            UserAgentInfo::from_config(config),
            RetryPolicy::from_config(config),
        )
    }

    /// Create (or reuse) the client for a credential pair.
    ///
    /// Returns `None` when either credential is empty or the HTTP client cannot
    /// be built. Callers treat `None` as "sync disabled", not as an error.
    pub fn create(&self, app_id: &str, api_key: &str) -> Option<Arc<dyn SearchClient>> {
        let app_id = app_id.trim();
        let api_key = api_key.trim();
        if app_id.is_empty() || api_key.is_empty() {
            info!("Algolia credentials not configured; sync disabled");
            return None;
        }

        let key = (app_id.to_string(), api_key.to_string());
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(client) = clients.get(&key) {
            return Some(client.clone());
        }

        match AlgoliaClient::new(
            app_id,
            api_key,
            self.user_agent.header_value(),
            self.retry.clone(),
        ) {
            Ok(client) => {
                let client: Arc<dyn SearchClient> = Arc::new(client);
                clients.insert(key, client.clone());
                info!(app_id = %app_id, "Algolia client created");
                Some(client)
            }
            Err(e) => {
                warn!(app_id = %app_id, error = %e, "Failed to create Algolia client; sync disabled");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factory() -> ClientFactory {
        ClientFactory::new(UserAgentInfo::default(), RetryPolicy::default())
    }

    #[test]
    fn test_empty_credentials_yield_no_client() {
        let f = factory();
        assert!(f.create("", "key").is_none());
        assert!(f.create("APP", "  ").is_none());
    }

    #[test]
    fn test_same_credentials_share_client() {
        let f = factory();
        let a = f.create("APP", "key").unwrap();
        let b = f.create("APP", "key").unwrap();
        let c = f.create("APP", "other").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_user_agent_header() {
        let ua = UserAgentInfo {
            integration_name: "WP Search with Algolia".into(),
            integration_version: "2.8.0".into(),
            platform_name: Some("WordPress".into()),
            platform_version: Some("6.4".into()),
        };
        let header = ua.header_value();
        assert!(header.contains("WP Search with Algolia (2.8.0)"));
        assert!(header.ends_with("; WordPress (6.4)"));
    }
}
