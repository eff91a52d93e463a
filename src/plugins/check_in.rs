use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::Caller;
use crate::error::{MutationError, RegistryError, ResolveError};
use crate::fragment::{Plugin, SchemaFragment, field_fn, resolver_fn};
use crate::mutation_executor::MutationAction;
use crate::resolver_dispatcher::{Arguments, ResolverContext};
use crate::store_mapper::SortDirection;

const SCHEMA: &str = include_str!(concat!(env!("OUT_SCHEMAS"), "/check_in.graphql"));

pub struct CheckInPlugin;

impl Plugin for CheckInPlugin {
    fn namespace(&self) -> &'static str {
        "check_in"
    }

    fn fragment(&self) -> Result<SchemaFragment, RegistryError> {
        Ok(SchemaFragment::from_sdl(self.namespace(), SCHEMA)?
            .resolver("checkIns", resolver_fn(check_ins))
            .mutation_action(
                "checkIn",
                MutationAction::insert("CheckIn")
                    .references("user", "User")
                    .references("event", "Event")
                    .prepare(stamp),
            )
            .field_resolver(
                "CheckIn.day",
                field_fn(|check_in| {
                    let timestamp = check_in
                        .get("timestamp")
                        .and_then(Value::as_str)
                        .ok_or_else(|| "check-in has no timestamp".to_string())?;
                    let parsed = DateTime::parse_from_rfc3339(timestamp)
                        .map_err(|e| format!("bad timestamp '{}': {}", timestamp, e))?;
                    Ok(Value::String(parsed.date_naive().to_string()))
                }),
            ))
    }
}

fn stamp(input: &Map<String, Value>, caller: &Caller) -> Result<Map<String, Value>, MutationError> {
    let mut record = input.clone();
    record.insert(
        "timestamp".to_string(),
        Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)),
    );
    record.insert(
        "checkedInBy".to_string(),
        caller.id.clone().map_or(Value::Null, Value::String),
    );
    Ok(record)
}

async fn check_ins(args: Arguments, ctx: ResolverContext) -> Result<Value, ResolveError> {
    let collection = ctx.store().collection_for("CheckIn")?;
    let documents = ctx
        .store()
        .find_all(&collection, "timestamp", SortDirection::Ascending)
        .await?;
    let event = args.get("event").and_then(Value::as_str);
    Ok(Value::Array(
        documents
            .iter()
            .filter(|document| event.is_none_or(|event| document.value("event") == event))
            .map(|document| document.to_value())
            .collect(),
    ))
}
