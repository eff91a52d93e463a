pub mod authorization;
pub mod config;
pub mod error;
pub mod fragment;
pub mod gateway;
pub mod mutation_executor;
pub mod operation_parser;
pub mod plugins;
pub mod resolver_dispatcher;
pub mod schema_registry;
pub mod server;
pub mod store_mapper;

pub use authorization::{AccessPolicy, Decision, authorize};
pub use config::GatewayConfig;
pub use fragment::{Plugin, SchemaFragment};
pub use gateway::Gateway;
pub use mutation_executor::{MutationAction, MutationExecutor};
pub use resolver_dispatcher::{Request, ResolverContext, ResolverDispatcher, Response};
pub use schema_registry::{CompositeSchema, InMemorySchemaRegistry, SchemaRegistry};
pub use store_mapper::{CollectionId, Document, DocumentStore, MemoryStore, TypeMapper};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A caller role as asserted by the identity collaborator. Comparison is
/// case-sensitive.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(String);

impl Role {
    pub fn new(name: impl Into<String>) -> Self {
        Role(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Role {
    fn from(name: &str) -> Self {
        Role::new(name)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who is making a request. Both parts are optional: an anonymous caller
/// only passes public policies.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Caller {
    pub id: Option<String>,
    pub role: Option<Role>,
}

impl Caller {
    pub fn new(id: impl Into<String>, role: impl Into<Role>) -> Self {
        Caller {
            id: Some(id.into()),
            role: Some(role.into()),
        }
    }

    pub fn with_role(role: impl Into<Role>) -> Self {
        Caller {
            id: None,
            role: Some(role.into()),
        }
    }

    pub fn anonymous() -> Self {
        Caller::default()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GraphQLRequest {
    pub query: String,
    pub variables: Option<Value>,
    pub operation_name: Option<String>,
}

/// Body of `POST /graphql`: either the direct operation form or a GraphQL
/// document.
#[derive(Deserialize, Debug)]
#[serde(untagged)]
pub enum WireRequest {
    Operation(Request),
    GraphQL(GraphQLRequest),
}

impl WireRequest {
    pub fn into_request(self, caller: Caller) -> Result<Request, String> {
        let mut request = match self {
            WireRequest::Operation(request) => request,
            WireRequest::GraphQL(graphql) => operation_parser::parse_operation(
                &graphql.query,
                graphql.variables.as_ref(),
                graphql.operation_name.as_deref(),
            )?,
        };
        request.caller = caller;
        Ok(request)
    }
}
