//! Each mutation action performs exactly one document write.

use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::Caller;
use crate::error::{MutationError, StoreError};
use crate::fragment::{OperationDecl, OperationHandler};
use crate::resolver_dispatcher::{Arguments, ResolverContext};
use crate::schema_registry::CompositeSchema;
use crate::store_mapper::{Document, Filter};

/// Turns the validated input object into the record to write.
pub type PrepareFn = Arc<
    dyn Fn(&Map<String, Value>, &Caller) -> Result<Map<String, Value>, MutationError>
        + Send
        + Sync,
>;

/// An input field holding the id of an entity that must already exist.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntityReference {
    pub input_field: String,
    pub type_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteKind {
    Insert,
    /// Patches the target document whose id is in `id_field`.
    UpdateById { id_field: String },
}

#[derive(Clone)]
pub struct MutationAction {
    target: String,
    input_argument: String,
    references: Vec<EntityReference>,
    write: WriteKind,
    prepare: Option<PrepareFn>,
}

impl fmt::Debug for MutationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationAction")
            .field("target", &self.target)
            .field("input_argument", &self.input_argument)
            .field("references", &self.references)
            .field("write", &self.write)
            .finish_non_exhaustive()
    }
}

impl MutationAction {
    pub fn insert(target: impl Into<String>) -> Self {
        MutationAction {
            target: target.into(),
            input_argument: "input".to_string(),
            references: Vec::new(),
            write: WriteKind::Insert,
            prepare: None,
        }
    }

    pub fn update_by_id(target: impl Into<String>, id_field: impl Into<String>) -> Self {
        MutationAction {
            write: WriteKind::UpdateById {
                id_field: id_field.into(),
            },
            ..MutationAction::insert(target)
        }
    }

    pub fn input_argument(mut self, name: impl Into<String>) -> Self {
        self.input_argument = name.into();
        self
    }

    pub fn references(
        mut self,
        input_field: impl Into<String>,
        type_name: impl Into<String>,
    ) -> Self {
        self.references.push(EntityReference {
            input_field: input_field.into(),
            type_name: type_name.into(),
        });
        self
    }

    pub fn prepare<F>(mut self, prepare: F) -> Self
    where
        F: Fn(&Map<String, Value>, &Caller) -> Result<Map<String, Value>, MutationError>
            + Send
            + Sync
            + 'static,
    {
        self.prepare = Some(Arc::new(prepare));
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Registration-time consistency check against the mutation it backs.
    pub(crate) fn validate(
        &self,
        declaration: &OperationDecl,
        schema: &CompositeSchema,
    ) -> Result<(), String> {
        if schema.type_descriptor(&self.target).is_none() {
            return Err(format!("target '{}' is not a declared type", self.target));
        }
        if declaration.return_type.base_name() != self.target {
            return Err(format!(
                "returns {} but writes '{}'",
                declaration.return_type, self.target
            ));
        }

        let argument = declaration
            .argument(&self.input_argument)
            .ok_or_else(|| format!("no argument named '{}'", self.input_argument))?;
        let input = schema
            .input(argument.value_type.base_name())
            .ok_or_else(|| format!("argument '{}' is not an input object", self.input_argument))?;

        for reference in &self.references {
            if input.field(&reference.input_field).is_none() {
                return Err(format!("input has no field '{}'", reference.input_field));
            }
            if schema.type_descriptor(&reference.type_name).is_none() {
                return Err(format!("referenced type '{}' is not declared", reference.type_name));
            }
        }
        if let WriteKind::UpdateById { id_field } = &self.write {
            if input.field(id_field).is_none() {
                return Err(format!("input has no field '{}'", id_field));
            }
        }
        Ok(())
    }
}

pub struct MutationExecutor {
    schema: Arc<CompositeSchema>,
}

impl MutationExecutor {
    pub fn new(schema: Arc<CompositeSchema>) -> Self {
        MutationExecutor { schema }
    }

    /// Must only be called once the mutation's policy has allowed the caller.
    pub async fn execute(
        &self,
        mutation_name: &str,
        arguments: &Arguments,
        ctx: &ResolverContext,
    ) -> Result<Document, MutationError> {
        let action = match self.schema.handler(mutation_name) {
            Some(OperationHandler::Mutation(action)) => action,
            _ => return Err(MutationError::UnknownMutation(mutation_name.to_string())),
        };
        let input = match arguments.get(&action.input_argument) {
            Some(Value::Object(input)) => input,
            _ => {
                return Err(MutationError::InvalidInput(format!(
                    "'{}' must be an object",
                    action.input_argument
                )));
            }
        };
        let mapper = ctx.store();

        for reference in &action.references {
            let id = id_field(input, &reference.input_field)?;
            let collection = mapper.collection_for(&reference.type_name)?;
            ensure_exists(mapper.find_by_id(&collection, id).await, &reference.type_name, id)?;
        }

        let collection = mapper.collection_for(&action.target)?;
        let target_id = match &action.write {
            WriteKind::Insert => None,
            WriteKind::UpdateById { id_field: field } => {
                let id = id_field(input, field)?;
                ensure_exists(mapper.find_by_id(&collection, id).await, &action.target, id)?;
                Some(id.to_string())
            }
        };

        let mut record = match &action.prepare {
            Some(prepare) => prepare(input, ctx.caller())?,
            None => input.clone(),
        };

        let document = match target_id {
            None => mapper.insert(&collection, record).await?,
            Some(id) => {
                if let WriteKind::UpdateById { id_field } = &action.write {
                    record.remove(id_field);
                }
                mapper
                    .update_where(&collection, &Filter::eq("id", id.as_str()), &record)
                    .await?;
                mapper.find_by_id(&collection, &id).await?
            }
        };

        info!(
            mutation = mutation_name,
            collection = %collection,
            id = %document.id,
            "mutation applied"
        );
        Ok(document)
    }
}

fn id_field<'a>(input: &'a Map<String, Value>, field: &str) -> Result<&'a str, MutationError> {
    input
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| MutationError::InvalidInput(format!("'{}' must be an id", field)))
}

fn ensure_exists(
    lookup: Result<Document, StoreError>,
    type_name: &str,
    id: &str,
) -> Result<(), MutationError> {
    match lookup {
        Ok(_) => Ok(()),
        Err(StoreError::NotFound { .. }) => {
            debug!(type_name, id, "referenced entity missing");
            Err(MutationError::ReferenceNotFound {
                type_name: type_name.to_string(),
                id: id.to_string(),
            })
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::SchemaFragment;
    use crate::schema_registry::{InMemorySchemaRegistry, SchemaRegistry};
    use crate::store_mapper::{MemoryStore, TypeMapper};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const SDL: &str = r#"
        type Member { id: ID! name: String! }
        type Team { id: ID! title: String! }
        type Membership { id: ID! member: ID! team: ID! addedBy: ID }
        input MemberInput { name: String! }
        input JoinInput { member: ID! team: ID! }
        input RenameInput { id: ID! name: String! }
        type Mutation {
            addMember(input: MemberInput!): Member! @auth(requires: [Admin])
            join(input: JoinInput!): Membership! @auth(requires: [Admin])
            renameMember(input: RenameInput!): Member! @auth(requires: [Admin])
        }
    "#;

    struct Fixture {
        executor: MutationExecutor,
        ctx: ResolverContext,
        mapper: Arc<TypeMapper>,
    }

    fn fixture() -> Fixture {
        let fragment = SchemaFragment::from_sdl("teams", SDL)
            .unwrap()
            .mutation_action("addMember", MutationAction::insert("Member"))
            .mutation_action(
                "join",
                MutationAction::insert("Membership")
                    .references("member", "Member")
                    .references("team", "Team")
                    .prepare(|input, caller| {
                        let mut record = input.clone();
                        record.insert("addedBy".to_string(), json!(caller.id));
                        Ok(record)
                    }),
            )
            .mutation_action("renameMember", MutationAction::update_by_id("Member", "id"));

        let mut registry = InMemorySchemaRegistry::new();
        registry.register(fragment).unwrap();
        let schema = registry.seal();
        let mapper = Arc::new(TypeMapper::new(Arc::new(MemoryStore::new()), &schema));
        Fixture {
            executor: MutationExecutor::new(schema),
            ctx: ResolverContext::new(Caller::new("admin-1", "Admin"), mapper.clone()),
            mapper,
        }
    }

    fn args(value: Value) -> Arguments {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    async fn counts(mapper: &TypeMapper) -> Vec<usize> {
        let mut counts = Vec::new();
        for type_name in ["Member", "Team", "Membership"] {
            let collection = mapper.collection_for(type_name).unwrap();
            counts.push(mapper.count(&collection).await.unwrap());
        }
        counts
    }

    #[tokio::test]
    async fn inserts_and_returns_the_new_entity() {
        let f = fixture();
        let member = f
            .executor
            .execute("addMember", &args(json!({ "input": { "name": "Grace" } })), &f.ctx)
            .await
            .unwrap();
        assert_eq!(member.value("name"), json!("Grace"));
        assert!(!member.id.is_empty());
    }

    #[tokio::test]
    async fn links_existing_entities() {
        let f = fixture();
        let member = f
            .executor
            .execute("addMember", &args(json!({ "input": { "name": "Grace" } })), &f.ctx)
            .await
            .unwrap();
        let teams = f.mapper.collection_for("Team").unwrap();
        let team = f
            .mapper
            .insert(&teams, args(json!({ "title": "Compilers" })))
            .await
            .unwrap();

        let link = f
            .executor
            .execute(
                "join",
                &args(json!({ "input": { "member": member.id, "team": team.id } })),
                &f.ctx,
            )
            .await
            .unwrap();
        assert_eq!(link.value("member"), json!(member.id));
        assert_eq!(link.value("team"), json!(team.id));
        assert_eq!(link.value("addedBy"), json!("admin-1"));
    }

    #[tokio::test]
    async fn missing_reference_fails_without_writing() {
        let f = fixture();
        let member = f
            .executor
            .execute("addMember", &args(json!({ "input": { "name": "Grace" } })), &f.ctx)
            .await
            .unwrap();
        let before = counts(&f.mapper).await;

        let err = f
            .executor
            .execute(
                "join",
                &args(json!({ "input": { "member": member.id, "team": "missing-team" } })),
                &f.ctx,
            )
            .await
            .unwrap_err();

        assert_eq!(
            err,
            MutationError::ReferenceNotFound {
                type_name: "Team".to_string(),
                id: "missing-team".to_string(),
            }
        );
        assert_eq!(counts(&f.mapper).await, before);
    }

    #[tokio::test]
    async fn update_patches_a_single_existing_document() {
        let f = fixture();
        let member = f
            .executor
            .execute("addMember", &args(json!({ "input": { "name": "Grace" } })), &f.ctx)
            .await
            .unwrap();

        let renamed = f
            .executor
            .execute(
                "renameMember",
                &args(json!({ "input": { "id": member.id, "name": "Grace Hopper" } })),
                &f.ctx,
            )
            .await
            .unwrap();
        assert_eq!(renamed.id, member.id);
        assert_eq!(renamed.value("name"), json!("Grace Hopper"));

        let err = f
            .executor
            .execute(
                "renameMember",
                &args(json!({ "input": { "id": "ghost", "name": "Nobody" } })),
                &f.ctx,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MutationError::ReferenceNotFound { .. }));
    }

    #[tokio::test]
    async fn rejects_non_object_input() {
        let f = fixture();
        let err = f
            .executor
            .execute("addMember", &args(json!({ "input": "Grace" })), &f.ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, MutationError::InvalidInput(_)));
    }

    #[test]
    fn validate_rejects_mismatched_targets() {
        let fragment = SchemaFragment::from_sdl("teams", SDL)
            .unwrap()
            .mutation_action("addMember", MutationAction::insert("Team"))
            .mutation_action("join", MutationAction::insert("Membership"))
            .mutation_action("renameMember", MutationAction::update_by_id("Member", "id"));
        let mut registry = InMemorySchemaRegistry::new();
        assert!(matches!(
            registry.register(fragment),
            Err(crate::error::RegistryError::InvalidMutationAction { operation, .. })
                if operation == "addMember"
        ));
    }
}
