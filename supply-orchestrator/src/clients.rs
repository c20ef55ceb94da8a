use std::sync::Arc;

use supply_providers::{CmdbClient, CvmClient, DvmClient, ItsmClient, PoolClient, SopsClient};

use crate::config::{Backend, ConfigError, Settings};

/// Handles to every downstream service.
#[derive(Clone)]
pub struct Clients {
    pub cvm: Arc<dyn CvmClient>,
    pub dvm: Arc<dyn DvmClient>,
    pub cmdb: Arc<dyn CmdbClient>,
    pub pool: Arc<dyn PoolClient>,
    pub itsm: Arc<dyn ItsmClient>,
    pub sops: Arc<dyn SopsClient>,
}

impl Clients {
    /// One backend serving every service.
    pub fn from_backend<T>(backend: Arc<T>) -> Self
    where
        T: CvmClient + DvmClient + CmdbClient + PoolClient + ItsmClient + SopsClient + 'static,
    {
        Self {
            cvm: backend.clone(),
            dvm: backend.clone(),
            cmdb: backend.clone(),
            pool: backend.clone(),
            itsm: backend.clone(),
            sops: backend,
        }
    }

    pub fn build(settings: &Settings) -> Result<Self, ConfigError> {
        match settings.backend {
            Backend::Mock => Self::mock(),
            Backend::Gateway => Self::gateway(settings),
        }
    }

    #[cfg(feature = "backend-mock")]
    fn mock() -> Result<Self, ConfigError> {
        tracing::warn!("⚠️ [clients] using the in-process mock backend");
        Ok(Self::from_backend(Arc::new(
            supply_providers::mock::MockCloud::new(),
        )))
    }

    #[cfg(not(feature = "backend-mock"))]
    fn mock() -> Result<Self, ConfigError> {
        Err(ConfigError::Invalid {
            key: "SUPPLY_BACKEND",
            value: "mock (built without backend-mock)".to_string(),
        })
    }

    #[cfg(feature = "backend-gateway")]
    fn gateway(settings: &Settings) -> Result<Self, ConfigError> {
        let client = supply_providers::gateway::GatewayClient::new(
            &settings.gateway_url,
            &settings.gateway_token,
        )
        .map_err(|e| ConfigError::Invalid {
            key: "SUPPLY_GATEWAY_URL",
            value: format!("{} ({})", settings.gateway_url, e),
        })?;
        tracing::info!("[clients] gateway backend at {}", settings.gateway_url);
        Ok(Self::from_backend(Arc::new(client)))
    }

    #[cfg(not(feature = "backend-gateway"))]
    fn gateway(_settings: &Settings) -> Result<Self, ConfigError> {
        Err(ConfigError::Invalid {
            key: "SUPPLY_BACKEND",
            value: "gateway (built without backend-gateway)".to_string(),
        })
    }
}
