//! Shared fixtures for the in-file test modules.

use std::sync::Arc;

use crate::agent::client::AgentClient;
use crate::config::{
    AgentConfig, Config, CrmConfig, DbConfig, NotifierConfig, QueueConfig, ServerConfig,
    TwilioConfig,
};
use crate::crm::CrmClient;
use crate::notify::Notifier;
use crate::schedule::clock;
use crate::store::Database;
use crate::twilio::client::TwilioClient;
use crate::AppState;

pub fn test_config() -> Config {
    Config {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            external_url: "https://example.com".to_string(),
            route_prefix: "/outgoing".to_string(),
        },
        twilio: TwilioConfig {
            account_sid: "ACtest".to_string(),
            auth_token: "secret".to_string(),
            phone_number: "+390000000000".to_string(),
        },
        agent: AgentConfig {
            agent_id: "agent_test".to_string(),
            api_key: "key".to_string(),
        },
        crm: CrmConfig::default(),
        notifier: NotifierConfig::default(),
        queue: QueueConfig::default(),
        db: DbConfig::default(),
    }
}

/// Full application state over an in-memory database. No outbound network
/// happens unless a test drives a client directly.
pub async fn test_state() -> AppState {
    let config = test_config();
    let tz = clock::parse_zone(&config.queue.timezone).unwrap();
    AppState {
        db: Database::open_in_memory().await.unwrap(),
        twilio: Arc::new(TwilioClient::new(&config.twilio)),
        agent: Arc::new(AgentClient::new(&config.agent)),
        crm: Arc::new(CrmClient::new(&config.crm)),
        notifier: Arc::new(Notifier::new("")),
        tz,
        config,
    }
}
