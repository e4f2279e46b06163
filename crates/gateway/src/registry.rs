//! Connector ownership: construction from config, lookup by id, shutdown.

use crate::config::GatewayConfig;
use crate::connector::{Connector, UpstreamConnector};
use crate::error::{GatewayError, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Owns every connector for the lifetime of the process. Read-only after
/// construction; profiles and resolvers only borrow connectors from here.
pub struct ConnectorRegistry {
    connectors: HashMap<String, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn from_config(config: &GatewayConfig) -> Self {
        let connectors = config
            .mcp_servers
            .iter()
            .map(|(server_id, descriptor)| {
                let connector: Arc<dyn Connector> = Arc::new(UpstreamConnector::new(
                    server_id.clone(),
                    descriptor.clone(),
                ));
                (server_id.clone(), connector)
            })
            .collect();
        Self { connectors }
    }

    #[cfg(test)]
    pub(crate) fn with_connectors(
        connectors: impl IntoIterator<Item = Arc<dyn Connector>>,
    ) -> Self {
        Self {
            connectors: connectors
                .into_iter()
                .map(|connector| (connector.id().to_string(), connector))
                .collect(),
        }
    }

    pub fn contains(&self, server_id: &str) -> bool {
        self.connectors.contains_key(server_id)
    }

    pub fn get(&self, server_id: &str) -> Result<Arc<dyn Connector>> {
        self.connectors
            .get(server_id)
            .cloned()
            .ok_or_else(|| GatewayError::InvalidRequest(format!("unknown server: {server_id}")))
    }

    /// Dispose every connector concurrently, wait for all of them to settle,
    /// and aggregate any failures into a single error.
    pub async fn dispose_all(&self) -> Result<()> {
        let results = futures::future::join_all(self.connectors.values().map(|connector| {
            let connector = connector.clone();
            async move { connector.dispose().await }
        }))
        .await;

        let failures: Vec<String> = results
            .into_iter()
            .filter_map(|result| result.err().map(|e| e.to_string()))
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(GatewayError::Internal(failures.join("; ")))
        }
    }
}
