use std::sync::Arc;
use std::time::Instant;

use crate::config::Settings;
use crate::connection_manager::{ConnectionRegistry, RegistryConfig};
use crate::relay::RelayClient;
use crate::tenant::{CommandRecovery, InMemoryTenantDirectory};

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub directory: Arc<InMemoryTenantDirectory>,
    pub registry: Arc<ConnectionRegistry>,
    pub relay: Arc<RelayClient>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(settings: Settings) -> Self {
        let directory = Arc::new(InMemoryTenantDirectory::new(
            settings.relay.assume_live_sessions,
        ));

        let mut registry =
            ConnectionRegistry::new(RegistryConfig::from(&settings.relay), directory.clone());
        if let Some(command) = settings.relay.recovery_command.clone() {
            tracing::info!(command = %command, "Session recovery command configured");
            registry = registry.with_recovery(Arc::new(CommandRecovery::new(command)));
        }
        let registry = Arc::new(registry);

        let relay = Arc::new(RelayClient::new(
            registry.clone(),
            settings.relay.request_timeout(),
        ));

        Self {
            settings: Arc::new(settings),
            directory,
            registry,
            relay,
            started_at: Instant::now(),
        }
    }
}
