use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::RegistryError;
use crate::fragment::{
    FieldDecl, FieldResolver, InputDecl, OperationDecl, OperationHandler, OperationKind, Plugin,
    SchemaFragment, TypeRef, is_builtin_scalar, scalar_accepts,
};
use crate::store_mapper::{CollectionId, derive_collection_id};

/// Build-phase registration contract. Once sealed, the composite schema is
/// shared read-only and there is no way to register further fragments.
pub trait SchemaRegistry {
    fn register(&mut self, fragment: SchemaFragment) -> Result<(), RegistryError>;
    fn compose(&self) -> CompositeSchema;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TypeDescriptor {
    pub name: String,
    pub namespace: String,
    pub fields: Vec<FieldDecl>,
    pub collection: CollectionId,
    /// Fields backed by a field resolver; stored records may omit them.
    pub resolved_fields: BTreeSet<String>,
}

impl TypeDescriptor {
    pub fn field(&self, name: &str) -> Option<&FieldDecl> {
        self.fields.iter().find(|field| field.name == name)
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct CompositeSchema {
    namespaces: BTreeSet<String>,
    types: BTreeMap<String, TypeDescriptor>,
    inputs: BTreeMap<String, InputDecl>,
    queries: BTreeMap<String, OperationDecl>,
    mutations: BTreeMap<String, OperationDecl>,
    #[serde(skip)]
    handlers: HashMap<String, OperationHandler>,
    #[serde(skip)]
    field_resolvers: HashMap<String, FieldResolverSlot>,
}

#[derive(Clone)]
struct FieldResolverSlot(FieldResolver);

impl std::fmt::Debug for FieldResolverSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FieldResolver(..)")
    }
}

impl CompositeSchema {
    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.namespaces.iter().map(String::as_str)
    }

    pub fn types(&self) -> impl Iterator<Item = &TypeDescriptor> {
        self.types.values()
    }

    pub fn type_descriptor(&self, name: &str) -> Option<&TypeDescriptor> {
        self.types.get(name)
    }

    pub fn input(&self, name: &str) -> Option<&InputDecl> {
        self.inputs.get(name)
    }

    pub fn operation(&self, name: &str) -> Option<&OperationDecl> {
        self.queries.get(name).or_else(|| self.mutations.get(name))
    }

    pub fn handler(&self, operation: &str) -> Option<&OperationHandler> {
        self.handlers.get(operation)
    }

    pub fn field_resolver(&self, type_name: &str, field: &str) -> Option<&FieldResolver> {
        self.field_resolvers
            .get(&format!("{}.{}", type_name, field))
            .map(|slot| &slot.0)
    }

    // Types, inputs and operations share one namespace with the built-in scalars.
    fn declares(&self, name: &str) -> bool {
        is_builtin_scalar(name)
            || self.types.contains_key(name)
            || self.inputs.contains_key(name)
            || self.operation(name).is_some()
    }

    pub fn declared_names(&self) -> BTreeSet<String> {
        self.types
            .keys()
            .chain(self.inputs.keys())
            .chain(self.queries.keys())
            .chain(self.mutations.keys())
            .cloned()
            .collect()
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Checks a value against a declared input-position type.
    pub fn check_value(&self, value_type: &TypeRef, value: &Value) -> Result<(), String> {
        match value_type {
            TypeRef::NonNull(inner) => {
                if value.is_null() {
                    return Err(format!("expected {}, found null", value_type));
                }
                self.check_value(inner, value)
            }
            _ if value.is_null() => Ok(()),
            TypeRef::List(inner) => match value {
                Value::Array(items) => items
                    .iter()
                    .try_for_each(|item| self.check_value(inner, item)),
                _ => Err(format!("expected {}, found {}", value_type, value)),
            },
            TypeRef::Named(name) if is_builtin_scalar(name) => {
                if scalar_accepts(name, value) {
                    Ok(())
                } else {
                    Err(format!("expected {}, found {}", name, value))
                }
            }
            TypeRef::Named(name) => {
                let input = self
                    .inputs
                    .get(name)
                    .ok_or_else(|| format!("'{}' is not an input type", name))?;
                let Value::Object(fields) = value else {
                    return Err(format!("expected {}, found {}", name, value));
                };
                if let Some(unknown) = fields.keys().find(|key| input.field(key).is_none()) {
                    return Err(format!("'{}' has no field '{}'", name, unknown));
                }
                for field in &input.fields {
                    let value = fields.get(&field.name).unwrap_or(&Value::Null);
                    self.check_value(&field.value_type, value)
                        .map_err(|e| format!("{}.{}: {}", name, field.name, e))?;
                }
                Ok(())
            }
        }
    }

    fn is_output_type(&self, name: &str) -> bool {
        is_builtin_scalar(name) || self.types.contains_key(name)
    }

    fn is_input_type(&self, name: &str) -> bool {
        is_builtin_scalar(name) || self.inputs.contains_key(name)
    }
}

pub struct InMemorySchemaRegistry {
    composite: CompositeSchema,
}

impl InMemorySchemaRegistry {
    pub fn new() -> Self {
        InMemorySchemaRegistry {
            composite: CompositeSchema::default(),
        }
    }

    pub fn register_plugin(&mut self, plugin: &dyn Plugin) -> Result<(), RegistryError> {
        let fragment = plugin.fragment()?;
        if fragment.namespace != plugin.namespace() {
            return Err(RegistryError::InvalidNamespace(fragment.namespace));
        }
        self.register(fragment)
    }

    pub fn seal(self) -> Arc<CompositeSchema> {
        info!(
            namespaces = self.composite.namespaces.len(),
            types = self.composite.types.len(),
            queries = self.composite.queries.len(),
            mutations = self.composite.mutations.len(),
            "composite schema sealed"
        );
        Arc::new(self.composite)
    }

    /// Validates a fragment against the current composite without touching it.
    /// The returned candidate is the composite with the fragment merged in.
    fn merge(&self, fragment: SchemaFragment) -> Result<CompositeSchema, RegistryError> {
        let namespace = fragment.namespace.clone();
        if !is_valid_namespace(&namespace) || self.composite.namespaces.contains(&namespace) {
            return Err(RegistryError::InvalidNamespace(namespace));
        }
        let duplicate = |name: &str| RegistryError::DuplicateName {
            namespace: namespace.clone(),
            name: name.to_string(),
        };

        let mut candidate = self.composite.clone();
        candidate.namespaces.insert(namespace.clone());

        for declaration in &fragment.types {
            if candidate.declares(&declaration.name) {
                return Err(duplicate(&declaration.name));
            }
            let mut seen = HashSet::new();
            for field in &declaration.fields {
                if !seen.insert(field.name.as_str()) {
                    return Err(duplicate(&format!("{}.{}", declaration.name, field.name)));
                }
            }
            candidate.types.insert(
                declaration.name.clone(),
                TypeDescriptor {
                    name: declaration.name.clone(),
                    namespace: namespace.clone(),
                    fields: declaration.fields.clone(),
                    collection: derive_collection_id(&namespace, &declaration.name),
                    resolved_fields: BTreeSet::new(),
                },
            );
        }

        for declaration in &fragment.inputs {
            if candidate.declares(&declaration.name) {
                return Err(duplicate(&declaration.name));
            }
            let mut seen = HashSet::new();
            for field in &declaration.fields {
                if !seen.insert(field.name.as_str()) {
                    return Err(duplicate(&format!("{}.{}", declaration.name, field.name)));
                }
            }
            candidate
                .inputs
                .insert(declaration.name.clone(), declaration.clone());
        }

        for declaration in fragment.queries.iter().chain(&fragment.mutations) {
            if candidate.declares(&declaration.name) {
                return Err(duplicate(&declaration.name));
            }
            let mut seen = HashSet::new();
            for argument in &declaration.arguments {
                if !seen.insert(argument.name.as_str()) {
                    return Err(duplicate(&format!("{}({})", declaration.name, argument.name)));
                }
            }
            let target = match declaration.kind {
                OperationKind::Query => &mut candidate.queries,
                OperationKind::Mutation => &mut candidate.mutations,
            };
            target.insert(declaration.name.clone(), declaration.clone());
        }

        // References are checked once everything in the fragment is known, so
        // declaration order inside a fragment does not matter.
        for declaration in &fragment.types {
            for field in &declaration.fields {
                check_reference(
                    &candidate,
                    &format!("{}.{}", declaration.name, field.name),
                    &field.field_type,
                    Position::Output,
                )?;
            }
        }
        for declaration in &fragment.inputs {
            for field in &declaration.fields {
                check_reference(
                    &candidate,
                    &format!("{}.{}", declaration.name, field.name),
                    &field.value_type,
                    Position::Input,
                )?;
            }
        }
        for declaration in fragment.queries.iter().chain(&fragment.mutations) {
            for argument in &declaration.arguments {
                check_reference(
                    &candidate,
                    &format!("{}({})", declaration.name, argument.name),
                    &argument.value_type,
                    Position::Input,
                )?;
            }
            check_reference(
                &candidate,
                &declaration.name,
                &declaration.return_type,
                Position::Output,
            )?;
        }

        for (operation, handler) in &fragment.handlers {
            let declaration = fragment
                .queries
                .iter()
                .chain(&fragment.mutations)
                .find(|declaration| &declaration.name == operation)
                .ok_or_else(|| RegistryError::UnknownResolverTarget(operation.clone()))?;
            if let OperationHandler::Mutation(action) = handler {
                if declaration.kind != OperationKind::Mutation {
                    return Err(RegistryError::InvalidMutationAction {
                        operation: operation.clone(),
                        reason: "mutation actions can only back mutations".to_string(),
                    });
                }
                action
                    .validate(declaration, &candidate)
                    .map_err(|reason| RegistryError::InvalidMutationAction {
                        operation: operation.clone(),
                        reason,
                    })?;
            }
            candidate
                .handlers
                .insert(operation.clone(), handler.clone());
        }

        for declaration in fragment.queries.iter().chain(&fragment.mutations) {
            if !fragment.handlers.contains_key(&declaration.name) {
                return Err(RegistryError::MissingResolver(declaration.name.clone()));
            }
        }
        for declaration in &fragment.mutations {
            if declaration.policy.is_public() {
                return Err(RegistryError::PublicMutation(declaration.name.clone()));
            }
        }

        for (key, entry) in &fragment.field_resolvers {
            // Field resolvers attach only to the fragment's own types.
            let known = key.split_once('.').is_some_and(|(type_name, field)| {
                fragment
                    .types
                    .iter()
                    .any(|t| t.name == type_name && t.fields.iter().any(|f| f.name == field))
            });
            let Some((type_name, field)) = key.split_once('.').filter(|_| known) else {
                return Err(RegistryError::UnknownResolverTarget(key.clone()));
            };
            if let Some(descriptor) = candidate.types.get_mut(type_name) {
                descriptor.resolved_fields.insert(field.to_string());
            }
            candidate
                .field_resolvers
                .insert(key.clone(), FieldResolverSlot(entry.0.clone()));
        }

        Ok(candidate)
    }
}

impl Default for InMemorySchemaRegistry {
    fn default() -> Self {
        InMemorySchemaRegistry::new()
    }
}

impl SchemaRegistry for InMemorySchemaRegistry {
    fn register(&mut self, fragment: SchemaFragment) -> Result<(), RegistryError> {
        let namespace = fragment.namespace.clone();
        let names = fragment.declared_names().len();
        let candidate = self.merge(fragment)?;
        self.composite = candidate;
        debug!(namespace = %namespace, names, "registered schema fragment");
        Ok(())
    }

    fn compose(&self) -> CompositeSchema {
        self.composite.clone()
    }
}

#[derive(Clone, Copy)]
enum Position {
    Input,
    Output,
}

fn check_reference(
    schema: &CompositeSchema,
    owner: &str,
    reference: &TypeRef,
    position: Position,
) -> Result<(), RegistryError> {
    let target = reference.base_name();
    let (resolves, expected) = match position {
        Position::Output => (schema.is_output_type(target), "type or scalar"),
        Position::Input => (schema.is_input_type(target), "input or scalar"),
    };
    if resolves {
        Ok(())
    } else {
        Err(RegistryError::DanglingReference {
            owner: owner.to_string(),
            target: target.to_string(),
            expected,
        })
    }
}

fn is_valid_namespace(namespace: &str) -> bool {
    !namespace.is_empty()
        && namespace
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::{field_fn, resolver_fn};
    use crate::mutation_executor::MutationAction;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn stub_resolver() -> crate::fragment::OperationResolver {
        resolver_fn(|_args, _ctx| async { Ok::<_, crate::error::ResolveError>(Value::Null) })
    }

    fn venues() -> SchemaFragment {
        SchemaFragment::from_sdl(
            "venues",
            r#"
            type Venue { id: ID! name: String! }
            input VenueInput { name: String! }
            type Query { venues: [Venue!]! @public }
            type Mutation { addVenue(input: VenueInput!): Venue @auth(requires: [Organizer]) }
            "#,
        )
        .unwrap()
        .resolver("venues", stub_resolver())
        .mutation_action("addVenue", MutationAction::insert("Venue"))
    }

    fn sponsors() -> SchemaFragment {
        SchemaFragment::from_sdl(
            "sponsors",
            r#"
            type Sponsor { id: ID! company: String! venue: ID }
            type Query { sponsors: [Sponsor!]! @auth(requires: [Organizer]) }
            "#,
        )
        .unwrap()
        .resolver("sponsors", stub_resolver())
    }

    #[test]
    fn disjoint_fragments_merge_into_the_union() {
        let mut registry = InMemorySchemaRegistry::new();
        let venues = venues();
        let sponsors = sponsors();

        let expected: BTreeSet<String> = venues
            .declared_names()
            .into_iter()
            .chain(sponsors.declared_names())
            .map(str::to_string)
            .collect();

        registry.register(venues.clone()).unwrap();
        registry.register(sponsors.clone()).unwrap();
        let composite = registry.compose();

        assert_eq!(composite.declared_names(), expected);

        let venue = composite.type_descriptor("Venue").unwrap();
        assert_eq!(venue.fields, venues.types[0].fields);
        assert_eq!(venue.collection.as_str(), "venues.Venue");
        assert_eq!(
            composite.operation("sponsors").unwrap(),
            &sponsors.queries[0]
        );
        assert_eq!(
            composite.namespaces().collect::<Vec<_>>(),
            vec!["sponsors", "venues"]
        );
    }

    #[test]
    fn duplicate_type_is_rejected_and_composite_is_unchanged() {
        let mut registry = InMemorySchemaRegistry::new();
        registry.register(venues()).unwrap();
        let before = serde_json::to_string(&registry.compose()).unwrap();

        let intruder = SchemaFragment::from_sdl(
            "intruder",
            r#"
            type Badge { id: ID! }
            type Venue { id: ID! capacity: Int }
            type Query { badges: [Badge] @public }
            "#,
        )
        .unwrap()
        .resolver("badges", stub_resolver());

        assert_eq!(
            registry.register(intruder),
            Err(RegistryError::DuplicateName {
                namespace: "intruder".to_string(),
                name: "Venue".to_string(),
            })
        );
        let after = serde_json::to_string(&registry.compose()).unwrap();
        assert_eq!(before, after);
        assert!(registry.compose().type_descriptor("Badge").is_none());
    }

    #[test]
    fn duplicate_operation_is_rejected() {
        let mut registry = InMemorySchemaRegistry::new();
        registry.register(venues()).unwrap();

        let clash = SchemaFragment::from_sdl(
            "clash",
            "type Query { venues: [String] @public }",
        )
        .unwrap()
        .resolver("venues", stub_resolver());

        assert!(matches!(
            registry.register(clash),
            Err(RegistryError::DuplicateName { name, .. }) if name == "venues"
        ));
    }

    #[test]
    fn operation_named_like_a_type_is_rejected() {
        let mut registry = InMemorySchemaRegistry::new();
        registry.register(venues()).unwrap();
        let before = registry.compose().declared_names();

        let clash = SchemaFragment::from_sdl("badges", "type Query { Venue: [Venue] @public }")
            .unwrap()
            .resolver("Venue", stub_resolver());

        assert_eq!(
            registry.register(clash),
            Err(RegistryError::DuplicateName {
                namespace: "badges".to_string(),
                name: "Venue".to_string(),
            })
        );
        assert_eq!(registry.compose().declared_names(), before);
    }

    #[test]
    fn type_named_like_an_operation_is_rejected() {
        let mut registry = InMemorySchemaRegistry::new();
        registry.register(venues()).unwrap();

        let clash = SchemaFragment::from_sdl("lists", "type venues { id: ID! }").unwrap();

        assert!(matches!(
            registry.register(clash),
            Err(RegistryError::DuplicateName { name, .. }) if name == "venues"
        ));
        assert!(registry.compose().type_descriptor("venues").is_none());
    }

    #[test]
    fn type_named_like_a_scalar_is_rejected() {
        let mut registry = InMemorySchemaRegistry::new();
        let fragment = SchemaFragment::from_sdl("scalars", "type String { id: ID! }").unwrap();
        assert!(matches!(
            registry.register(fragment),
            Err(RegistryError::DuplicateName { .. })
        ));
    }

    #[test]
    fn dangling_reference_is_rejected() {
        let mut registry = InMemorySchemaRegistry::new();
        let fragment = SchemaFragment::from_sdl(
            "talks",
            r#"
            type Talk { id: ID! speaker: Speaker }
            "#,
        )
        .unwrap();

        assert_eq!(
            registry.register(fragment),
            Err(RegistryError::DanglingReference {
                owner: "Talk.speaker".to_string(),
                target: "Speaker".to_string(),
                expected: "type or scalar",
            })
        );
        assert!(registry.compose().declared_names().is_empty());
    }

    #[test]
    fn references_may_point_into_earlier_fragments() {
        let mut registry = InMemorySchemaRegistry::new();
        registry.register(venues()).unwrap();

        let fragment = SchemaFragment::from_sdl(
            "tours",
            r#"
            type Tour { id: ID! }
            type Query { tourVenue(input: VenueInput): Venue @public }
            "#,
        )
        .unwrap()
        .resolver("tourVenue", stub_resolver());
        registry.register(fragment).unwrap();
    }

    #[test]
    fn object_type_in_argument_position_is_rejected() {
        let mut registry = InMemorySchemaRegistry::new();
        registry.register(venues()).unwrap();
        let fragment = SchemaFragment::from_sdl(
            "bad",
            "type Query { find(venue: Venue): String @public }",
        )
        .unwrap()
        .resolver("find", stub_resolver());

        assert!(matches!(
            registry.register(fragment),
            Err(RegistryError::DanglingReference { expected: "input or scalar", .. })
        ));
    }

    #[test]
    fn every_operation_needs_a_resolver() {
        let mut registry = InMemorySchemaRegistry::new();
        let fragment =
            SchemaFragment::from_sdl("lonely", "type Query { ping: String @public }").unwrap();
        assert_eq!(
            registry.register(fragment),
            Err(RegistryError::MissingResolver("ping".to_string()))
        );
    }

    #[test]
    fn resolvers_must_target_declared_operations_and_fields() {
        let mut registry = InMemorySchemaRegistry::new();
        let fragment = sponsors().resolver("ghost", stub_resolver());
        assert_eq!(
            registry.register(fragment),
            Err(RegistryError::UnknownResolverTarget("ghost".to_string()))
        );

        let fragment = sponsors().field_resolver("Sponsor.logo", field_fn(|_| Ok(json!(null))));
        assert_eq!(
            registry.register(fragment),
            Err(RegistryError::UnknownResolverTarget("Sponsor.logo".to_string()))
        );
    }

    #[test]
    fn public_mutation_is_rejected() {
        let mut registry = InMemorySchemaRegistry::new();
        let fragment = SchemaFragment::from_sdl(
            "open",
            r#"
            type Note { id: ID! text: String! }
            input NoteInput { text: String! }
            type Mutation { addNote(input: NoteInput!): Note @public }
            "#,
        )
        .unwrap()
        .mutation_action("addNote", MutationAction::insert("Note"));

        assert_eq!(
            registry.register(fragment),
            Err(RegistryError::PublicMutation("addNote".to_string()))
        );
    }

    #[test]
    fn namespaces_must_be_valid_and_unique() {
        let mut registry = InMemorySchemaRegistry::new();
        assert_eq!(
            registry.register(SchemaFragment::new("Bad.Name")),
            Err(RegistryError::InvalidNamespace("Bad.Name".to_string()))
        );
        registry.register(SchemaFragment::new("empty")).unwrap();
        assert!(registry.register(SchemaFragment::new("empty")).is_err());
    }

    #[test]
    fn check_value_walks_input_objects() {
        let mut registry = InMemorySchemaRegistry::new();
        registry.register(venues()).unwrap();
        let schema = registry.seal();
        let input = TypeRef::non_null(TypeRef::named("VenueInput"));

        assert!(schema.check_value(&input, &json!({ "name": "Hall A" })).is_ok());
        assert!(schema.check_value(&input, &json!({})).is_err());
        assert!(schema.check_value(&input, &json!({ "name": "A", "size": 3 })).is_err());
        assert!(schema.check_value(&input, &json!(null)).is_err());
        assert!(
            schema
                .check_value(&TypeRef::list(TypeRef::named("Int")), &json!([1, 2, null]))
                .is_ok()
        );
    }
}
