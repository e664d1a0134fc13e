//! Fully wired in-process server for tests: in-memory SQLite, in-process
//! cache and bus, live dispatcher running.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use tidings_shared::constants::DELIVERY_TOPIC;
use tidings_shared::{Role, UserId};
use tidings_store::{Database, User};

use crate::api::AppState;
use crate::bus::{BroadcastBus, LocalBus};
use crate::cache::MemoryCache;
use crate::config::ServerConfig;
use crate::message_log::MessageLog;
use crate::service::Messenger;
use crate::transport::{spawn_dispatcher, Hub};

pub fn user(id: &str) -> UserId {
    UserId::parse(id).unwrap()
}

pub struct Fixture {
    pub config: Arc<ServerConfig>,
    pub state: AppState,
    pub messenger: Messenger,
    pub hub: Hub,
    pub memory_cache: Arc<MemoryCache>,
    /// Direct handle on the log, bypassing the cache.
    pub cold: MessageLog,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::with_config(ServerConfig {
            signing_secret: Some("test-secret".to_string()),
            directory_token: Some("sync-token".to_string()),
            instance_id: "test-node".to_string(),
            ..ServerConfig::default()
        })
        .await
    }

    pub async fn with_config(config: ServerConfig) -> Self {
        let config = Arc::new(config);
        let mut db = Database::open_in_memory().unwrap();
        db.set_broadcast_counts_unread(config.broadcast_counts_unread);
        let log = MessageLog::new(db, Duration::from_secs(5));

        let memory_cache = Arc::new(MemoryCache::new());
        let bus: Arc<dyn BroadcastBus> = Arc::new(LocalBus::new());
        let state = AppState::assemble(config.clone(), log.clone(), memory_cache.clone(), bus.clone());

        let events = bus.subscribe(DELIVERY_TOPIC).await.unwrap();
        spawn_dispatcher(events, state.hub.clone());

        Self {
            config,
            messenger: state.messenger.clone(),
            hub: state.hub.clone(),
            state,
            memory_cache,
            cold: log,
        }
    }

    pub async fn add_user(&self, id: &str, role: Role) {
        self.state
            .directory
            .upsert(User {
                id: user(id),
                role,
                display_name: id.to_uppercase(),
                phone: None,
                avatar_url: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    pub async fn expire_cache(&self) {
        self.memory_cache.clear().await;
    }
}
