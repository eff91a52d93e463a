use std::sync::Arc;
use tracing::{info, warn};

use crate::config::GatewayConfig;
use crate::error::{GatewayError, RegistryError};
use crate::fragment::Plugin;
use crate::plugins;
use crate::resolver_dispatcher::{ErrorCode, Request, ResolverDispatcher, Response, ResponseError};
use crate::schema_registry::{CompositeSchema, InMemorySchemaRegistry};
use crate::store_mapper::DocumentStore;
use crate::{Caller, WireRequest};

/// The serving side: a sealed composite schema plus the dispatcher over it.
pub struct Gateway {
    dispatcher: ResolverDispatcher,
}

impl Gateway {
    pub fn new(schema: Arc<CompositeSchema>, store: Arc<dyn DocumentStore>) -> Self {
        Gateway {
            dispatcher: ResolverDispatcher::new(schema, store),
        }
    }

    /// Runs the build phase: registers every plugin, then seals the schema.
    pub fn from_plugins(
        plugins: &[Box<dyn Plugin>],
        store: Arc<dyn DocumentStore>,
    ) -> Result<Self, RegistryError> {
        let mut registry = InMemorySchemaRegistry::new();
        for plugin in plugins {
            registry.register_plugin(plugin.as_ref()).inspect_err(|e| {
                warn!(plugin = plugin.namespace(), error = %e, "plugin rejected");
            })?;
            info!(plugin = plugin.namespace(), "plugin registered");
        }
        Ok(Gateway::new(registry.seal(), store))
    }

    pub fn from_config(
        config: &GatewayConfig,
        store: Arc<dyn DocumentStore>,
    ) -> Result<Self, GatewayError> {
        let plugins = config
            .plugins
            .iter()
            .map(|name| {
                plugins::find(name).ok_or_else(|| GatewayError::UnknownPlugin(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Gateway::from_plugins(&plugins, store)?)
    }

    pub fn schema(&self) -> &CompositeSchema {
        self.dispatcher.schema()
    }

    pub fn dispatcher(&self) -> &ResolverDispatcher {
        &self.dispatcher
    }

    pub async fn execute(&self, request: Request) -> Response {
        self.dispatcher.dispatch(request).await
    }

    pub async fn process_request(&self, request: WireRequest, caller: Caller) -> Response {
        match request.into_request(caller) {
            Ok(request) => self.execute(request).await,
            Err(message) => Response::failure(ResponseError::new(
                ErrorCode::BadRequest,
                message,
                Vec::new(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_mapper::MemoryStore;
    use serde_json::json;

    #[test]
    fn unknown_plugin_is_rejected() {
        let config = GatewayConfig {
            plugins: vec!["accounts".to_string(), "raffle".to_string()],
            ..GatewayConfig::default()
        };
        assert!(matches!(
            Gateway::from_config(&config, Arc::new(MemoryStore::new())),
            Err(GatewayError::UnknownPlugin(name)) if name == "raffle"
        ));
    }

    #[test]
    fn check_in_requires_accounts_types() {
        let config = GatewayConfig {
            plugins: vec!["check_in".to_string()],
            ..GatewayConfig::default()
        };
        assert!(matches!(
            Gateway::from_config(&config, Arc::new(MemoryStore::new())),
            Err(GatewayError::Registry(RegistryError::InvalidMutationAction { .. }))
        ));
    }

    #[test]
    fn built_in_plugins_compose_into_sealed_schema() {
        let gateway =
            Gateway::from_config(&GatewayConfig::default(), Arc::new(MemoryStore::new())).unwrap();
        let schema = gateway.schema();

        assert_eq!(schema.namespaces().collect::<Vec<_>>(), vec!["accounts", "check_in"]);
        assert_eq!(
            schema
                .type_descriptor("CheckIn")
                .map(|t| t.collection.as_str()),
            Some("check_in.CheckIn")
        );
        assert!(schema.operation("checkIn").is_some());
        assert!(schema.operation("users").is_some());
    }

    #[tokio::test]
    async fn malformed_graphql_is_a_bad_request() {
        let gateway =
            Gateway::from_config(&GatewayConfig::default(), Arc::new(MemoryStore::new())).unwrap();
        let request: WireRequest =
            serde_json::from_value(json!({ "query": "{ users { id }" })).unwrap();

        let response = gateway.process_request(request, Caller::anonymous()).await;
        assert_eq!(response.data, None);
        assert_eq!(response.errors[0].code(), ErrorCode::BadRequest);
    }
}
