use serde_json::Value;

use crate::error::{RegistryError, ResolveError, StoreError};
use crate::fragment::{Plugin, SchemaFragment, field_fn, resolver_fn};
use crate::mutation_executor::MutationAction;
use crate::resolver_dispatcher::{Arguments, ResolverContext};
use crate::store_mapper::SortDirection;

const SCHEMA: &str = include_str!(concat!(env!("OUT_SCHEMAS"), "/accounts.graphql"));

pub struct AccountsPlugin;

impl Plugin for AccountsPlugin {
    fn namespace(&self) -> &'static str {
        "accounts"
    }

    fn fragment(&self) -> Result<SchemaFragment, RegistryError> {
        Ok(SchemaFragment::from_sdl(self.namespace(), SCHEMA)?
            .resolver("users", resolver_fn(users))
            .resolver("user", resolver_fn(user))
            .resolver("events", resolver_fn(events))
            .mutation_action("createUser", MutationAction::insert("User"))
            .mutation_action("createEvent", MutationAction::insert("Event"))
            .field_resolver(
                "User.displayName",
                field_fn(|user| {
                    let name = user.get("name").and_then(Value::as_str).unwrap_or_default();
                    match user.get("role").and_then(Value::as_str) {
                        Some(role) => Ok(Value::String(format!("{} ({})", name, role))),
                        None => Err("user has no role".to_string()),
                    }
                }),
            ))
    }
}

async fn users(_args: Arguments, ctx: ResolverContext) -> Result<Value, ResolveError> {
    list(&ctx, "User", "name").await
}

async fn events(_args: Arguments, ctx: ResolverContext) -> Result<Value, ResolveError> {
    list(&ctx, "Event", "startsAt").await
}

async fn user(args: Arguments, ctx: ResolverContext) -> Result<Value, ResolveError> {
    let id = args
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| ResolveError::message("'id' is required"))?;
    let collection = ctx.store().collection_for("User")?;
    match ctx.store().find_by_id(&collection, id).await {
        Ok(document) => Ok(document.to_value()),
        Err(StoreError::NotFound { .. }) => Ok(Value::Null),
        Err(e) => Err(e.into()),
    }
}

async fn list(
    ctx: &ResolverContext,
    type_name: &str,
    sort_key: &str,
) -> Result<Value, ResolveError> {
    let collection = ctx.store().collection_for(type_name)?;
    let documents = ctx
        .store()
        .find_all(&collection, sort_key, SortDirection::Ascending)
        .await?;
    Ok(Value::Array(documents.iter().map(|document| document.to_value()).collect()))
}
