//! Test helpers shared by the integration tests

use std::sync::Arc;

use fleet_control::{
    alerts::AlertEvaluator,
    commands::{CommandClient, CorrelationEngine, FailureNotice, RetryNotice},
    crypto::CredentialCipher,
    gateway::{AgentLink, ConnectionRegistry},
    hub::UiHub,
    notify::NullNotifier,
    router::MessageRouter,
    store::{memory::MemoryStore, AgentRecord, Store},
    watchdog::WatchlistSupervisor,
};
use tokio::sync::mpsc;

/// A fully wired control plane talking to one fake agent.
///
/// `wire_rx` receives every frame the hub sends to agent 1; feed frames
/// back in through `router.handle_frame(1, ...)`.
pub struct TestPlane {
    pub store: Arc<MemoryStore>,
    pub registry: Arc<ConnectionRegistry>,
    pub engine: Arc<CorrelationEngine>,
    pub commands: CommandClient,
    pub router: MessageRouter,
    pub hub: UiHub,
    pub wire_rx: mpsc::UnboundedReceiver<String>,
    pub retry_rx: mpsc::UnboundedReceiver<RetryNotice>,
    pub failed_rx: mpsc::UnboundedReceiver<FailureNotice>,
}

pub async fn test_plane() -> TestPlane {
    test_plane_with_retries(3).await
}

pub async fn test_plane_with_retries(max_retries: u32) -> TestPlane {
    let store = Arc::new(MemoryStore::new());
    store
        .add_agent(AgentRecord {
            id: 1,
            name: "web-1".into(),
            token_hash: None,
            is_online: true,
            last_seen_utc: None,
        })
        .await;

    let registry = Arc::new(ConnectionRegistry::new());
    let (wire_tx, wire_rx) = mpsc::unbounded_channel();
    registry.register(1, AgentLink::new(registry.allocate_connection_id(), wire_tx));

    let hub = UiHub::new(64);
    let notifier = Arc::new(NullNotifier);
    let (engine, retry_rx, failed_rx) = CorrelationEngine::new(max_retries);
    let commands = CommandClient::new(Arc::clone(&registry), Arc::clone(&engine));

    let alerts = Arc::new(AlertEvaluator::new(
        store.clone() as Arc<dyn Store>,
        hub.clone(),
        notifier.clone() as Arc<dyn fleet_control::notify::Notifier>,
    ));
    let watchdog = Arc::new(WatchlistSupervisor::new(
        commands.clone(),
        store.clone() as Arc<dyn Store>,
        hub.clone(),
        notifier as Arc<dyn fleet_control::notify::Notifier>,
    ));
    let router = MessageRouter::new(
        store.clone() as Arc<dyn Store>,
        hub.clone(),
        Arc::clone(&engine),
        alerts,
        watchdog,
    );

    TestPlane {
        store,
        registry,
        engine,
        commands,
        router,
        hub,
        wire_rx,
        retry_rx,
        failed_rx,
    }
}

/// Cipher with a fixed key, for tests that need encrypt/decrypt symmetry.
pub fn test_cipher() -> CredentialCipher {
    use base64::Engine;
    let key = base64::engine::general_purpose::STANDARD.encode([42u8; 32]);
    CredentialCipher::from_base64(&key).unwrap()
}
