use futures::future::BoxFuture;
use graphql_parser::parse_schema;
use graphql_parser::schema::{
    Definition, Directive, InputValue, Type, TypeDefinition, TypeExtension,
};
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::authorization::AccessPolicy;
use crate::error::{RegistryError, ResolveError};
use crate::mutation_executor::MutationAction;
use crate::resolver_dispatcher::{Arguments, ResolverContext};
use crate::Role;

pub const BUILTIN_SCALARS: [&str; 5] = ["ID", "String", "Int", "Float", "Boolean"];

pub fn is_builtin_scalar(name: &str) -> bool {
    BUILTIN_SCALARS.contains(&name)
}

pub fn scalar_accepts(scalar: &str, value: &Value) -> bool {
    match scalar {
        "ID" | "String" => value.is_string(),
        "Int" => value.is_i64() || value.is_u64(),
        "Float" => value.is_number(),
        "Boolean" => value.is_boolean(),
        _ => false,
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TypeRef {
    Named(String),
    List(Box<TypeRef>),
    NonNull(Box<TypeRef>),
}

impl TypeRef {
    pub fn named(name: impl Into<String>) -> Self {
        TypeRef::Named(name.into())
    }

    pub fn non_null(inner: TypeRef) -> Self {
        TypeRef::NonNull(Box::new(inner))
    }

    pub fn list(inner: TypeRef) -> Self {
        TypeRef::List(Box::new(inner))
    }

    pub fn base_name(&self) -> &str {
        match self {
            TypeRef::Named(name) => name,
            TypeRef::List(inner) | TypeRef::NonNull(inner) => inner.base_name(),
        }
    }

    pub fn is_nullable(&self) -> bool {
        !matches!(self, TypeRef::NonNull(_))
    }

    fn from_sdl(ty: &Type<'_, String>) -> Self {
        match ty {
            Type::NamedType(name) => TypeRef::Named(name.clone()),
            Type::ListType(inner) => TypeRef::list(TypeRef::from_sdl(inner)),
            Type::NonNullType(inner) => TypeRef::non_null(TypeRef::from_sdl(inner)),
        }
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeRef::Named(name) => f.write_str(name),
            TypeRef::List(inner) => write!(f, "[{}]", inner),
            TypeRef::NonNull(inner) => write!(f, "{}!", inner),
        }
    }
}

impl Serialize for TypeRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A field of an entity type. `policy` restricts who may read the field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FieldDecl {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: TypeRef,
    pub nullable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<AccessPolicy>,
}

impl FieldDecl {
    pub fn new(name: impl Into<String>, field_type: TypeRef) -> Self {
        let nullable = field_type.is_nullable();
        FieldDecl {
            name: name.into(),
            field_type,
            nullable,
            policy: None,
        }
    }

    pub fn restricted(mut self, policy: AccessPolicy) -> Self {
        self.policy = Some(policy);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TypeDecl {
    pub name: String,
    pub fields: Vec<FieldDecl>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ArgumentDecl {
    pub name: String,
    #[serde(rename = "type")]
    pub value_type: TypeRef,
}

impl ArgumentDecl {
    pub fn new(name: impl Into<String>, value_type: TypeRef) -> Self {
        ArgumentDecl {
            name: name.into(),
            value_type,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InputDecl {
    pub name: String,
    pub fields: Vec<ArgumentDecl>,
}

impl InputDecl {
    pub fn field(&self, name: &str) -> Option<&ArgumentDecl> {
        self.fields.iter().find(|field| field.name == name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Query,
    Mutation,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OperationDecl {
    pub name: String,
    pub kind: OperationKind,
    pub arguments: Vec<ArgumentDecl>,
    pub return_type: TypeRef,
    pub policy: AccessPolicy,
}

impl OperationDecl {
    pub fn argument(&self, name: &str) -> Option<&ArgumentDecl> {
        self.arguments.iter().find(|argument| argument.name == name)
    }
}

pub type OperationResolver = Arc<
    dyn Fn(Arguments, ResolverContext) -> BoxFuture<'static, Result<Value, ResolveError>>
        + Send
        + Sync,
>;

/// Projects one field from an already-resolved parent entity.
pub type FieldResolver = Arc<dyn Fn(&Value) -> Result<Value, String> + Send + Sync>;

pub fn resolver_fn<F, Fut>(f: F) -> OperationResolver
where
    F: Fn(Arguments, ResolverContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ResolveError>> + Send + 'static,
{
    Arc::new(move |arguments, context| Box::pin(f(arguments, context)))
}

pub fn field_fn<F>(f: F) -> FieldResolver
where
    F: Fn(&Value) -> Result<Value, String> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// What runs when an operation is dispatched.
#[derive(Clone)]
pub enum OperationHandler {
    Resolver(OperationResolver),
    /// Mutations executed through the mutation executor.
    Mutation(MutationAction),
}

impl fmt::Debug for OperationHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationHandler::Resolver(_) => f.write_str("OperationHandler::Resolver(..)"),
            OperationHandler::Mutation(action) => {
                f.debug_tuple("OperationHandler::Mutation").field(action).finish()
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct SchemaFragment {
    pub namespace: String,
    pub types: Vec<TypeDecl>,
    pub inputs: Vec<InputDecl>,
    pub queries: Vec<OperationDecl>,
    pub mutations: Vec<OperationDecl>,
    pub handlers: HashMap<String, OperationHandler>,
    pub field_resolvers: HashMap<String, FieldResolverEntry>,
}

#[derive(Clone)]
pub struct FieldResolverEntry(pub FieldResolver);

impl fmt::Debug for FieldResolverEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FieldResolver(..)")
    }
}

impl SchemaFragment {
    pub fn new(namespace: impl Into<String>) -> Self {
        SchemaFragment {
            namespace: namespace.into(),
            types: Vec::new(),
            inputs: Vec::new(),
            queries: Vec::new(),
            mutations: Vec::new(),
            handlers: HashMap::new(),
            field_resolvers: HashMap::new(),
        }
    }

    pub fn from_sdl(namespace: impl Into<String>, sdl: &str) -> Result<Self, RegistryError> {
        let mut fragment = SchemaFragment::new(namespace);
        let document = parse_schema::<String>(sdl).map_err(|e| fragment.parse_error(e))?;

        for definition in document.definitions {
            match definition {
                Definition::TypeDefinition(TypeDefinition::Object(object)) => {
                    fragment.push_object(object.name, object.fields)?;
                }
                Definition::TypeExtension(TypeExtension::Object(extension)) => {
                    fragment.push_object(extension.name, extension.fields)?;
                }
                Definition::TypeDefinition(TypeDefinition::InputObject(input)) => {
                    let fields = input
                        .fields
                        .iter()
                        .map(argument_decl)
                        .collect();
                    fragment.inputs.push(InputDecl {
                        name: input.name,
                        fields,
                    });
                }
                other => {
                    return Err(fragment.parse_error(format!(
                        "unsupported definition: {}",
                        definition_kind(&other)
                    )));
                }
            }
        }

        Ok(fragment)
    }

    pub fn with_type(mut self, declaration: TypeDecl) -> Self {
        self.types.push(declaration);
        self
    }

    pub fn with_input(mut self, declaration: InputDecl) -> Self {
        self.inputs.push(declaration);
        self
    }

    pub fn with_query(mut self, declaration: OperationDecl) -> Self {
        self.queries.push(declaration);
        self
    }

    pub fn with_mutation(mut self, declaration: OperationDecl) -> Self {
        self.mutations.push(declaration);
        self
    }

    pub fn resolver(mut self, operation: impl Into<String>, resolver: OperationResolver) -> Self {
        self.handlers
            .insert(operation.into(), OperationHandler::Resolver(resolver));
        self
    }

    pub fn mutation_action(mut self, operation: impl Into<String>, action: MutationAction) -> Self {
        self.handlers
            .insert(operation.into(), OperationHandler::Mutation(action));
        self
    }

    /// `key` is `Type.field`.
    pub fn field_resolver(mut self, key: impl Into<String>, resolver: FieldResolver) -> Self {
        self.field_resolvers
            .insert(key.into(), FieldResolverEntry(resolver));
        self
    }

    /// Type and input names followed by operation names, in declaration order.
    pub fn declared_names(&self) -> Vec<&str> {
        self.types
            .iter()
            .map(|t| t.name.as_str())
            .chain(self.inputs.iter().map(|i| i.name.as_str()))
            .chain(self.queries.iter().map(|q| q.name.as_str()))
            .chain(self.mutations.iter().map(|m| m.name.as_str()))
            .collect()
    }

    fn push_object(
        &mut self,
        name: String,
        fields: Vec<graphql_parser::schema::Field<'_, String>>,
    ) -> Result<(), RegistryError> {
        let kind = match name.as_str() {
            "Query" => Some(OperationKind::Query),
            "Mutation" => Some(OperationKind::Mutation),
            _ => None,
        };

        match kind {
            Some(kind) => {
                for field in fields {
                    let policy = self.policy_from_directives(&field.name, &field.directives)?;
                    let operation = OperationDecl {
                        arguments: field
                            .arguments
                            .iter()
                            .map(argument_decl)
                            .collect(),
                        return_type: TypeRef::from_sdl(&field.field_type),
                        policy: policy.unwrap_or_default(),
                        name: field.name,
                        kind,
                    };
                    match kind {
                        OperationKind::Query => self.queries.push(operation),
                        OperationKind::Mutation => self.mutations.push(operation),
                    }
                }
            }
            None => {
                let mut declared = Vec::with_capacity(fields.len());
                for field in fields {
                    let owner = format!("{}.{}", name, field.name);
                    let policy = self.policy_from_directives(&owner, &field.directives)?;
                    let mut decl = FieldDecl::new(field.name, TypeRef::from_sdl(&field.field_type));
                    decl.policy = policy;
                    declared.push(decl);
                }
                self.types.push(TypeDecl {
                    name,
                    fields: declared,
                });
            }
        }
        Ok(())
    }

    fn policy_from_directives(
        &self,
        owner: &str,
        directives: &[Directive<'_, String>],
    ) -> Result<Option<AccessPolicy>, RegistryError> {
        let mut policy = None;
        for directive in directives {
            let parsed = match directive.name.as_str() {
                "public" => AccessPolicy::Public,
                "auth" => {
                    let requires = directive
                        .arguments
                        .iter()
                        .find(|(name, _)| name == "requires")
                        .map(|(_, value)| value)
                        .ok_or_else(|| {
                            self.parse_error(format!(
                                "@auth on '{}' needs a 'requires' argument",
                                owner
                            ))
                        })?;
                    let roles = self.roles_from_value(owner, requires)?;
                    AccessPolicy::Roles(roles.into_iter().collect())
                }
                other => {
                    return Err(self.parse_error(format!(
                        "unsupported directive @{} on '{}'",
                        other, owner
                    )));
                }
            };
            if policy.replace(parsed).is_some() {
                return Err(self.parse_error(format!(
                    "'{}' declares more than one access directive",
                    owner
                )));
            }
        }
        Ok(policy)
    }

    fn roles_from_value(
        &self,
        owner: &str,
        value: &graphql_parser::query::Value<'_, String>,
    ) -> Result<Vec<Role>, RegistryError> {
        use graphql_parser::query::Value as GqlValue;

        match value {
            GqlValue::String(role) | GqlValue::Enum(role) => Ok(vec![Role::new(role.clone())]),
            GqlValue::List(items) => items
                .iter()
                .map(|item| match item {
                    GqlValue::String(role) | GqlValue::Enum(role) => Ok(Role::new(role.clone())),
                    _ => Err(self.parse_error(format!("roles on '{}' must be names", owner))),
                })
                .collect(),
            _ => Err(self.parse_error(format!("roles on '{}' must be a list of names", owner))),
        }
    }

    fn parse_error(&self, message: impl fmt::Display) -> RegistryError {
        RegistryError::Parse {
            namespace: self.namespace.clone(),
            message: message.to_string(),
        }
    }
}

fn definition_kind(definition: &Definition<'_, String>) -> &'static str {
    match definition {
        Definition::SchemaDefinition(_) => "schema definition",
        Definition::DirectiveDefinition(_) => "directive definition",
        Definition::TypeDefinition(TypeDefinition::Scalar(_)) => "custom scalar",
        Definition::TypeDefinition(TypeDefinition::Interface(_)) => "interface",
        Definition::TypeDefinition(TypeDefinition::Union(_)) => "union",
        Definition::TypeDefinition(TypeDefinition::Enum(_)) => "enum",
        Definition::TypeDefinition(_) => "type definition",
        Definition::TypeExtension(_) => "type extension",
    }
}

fn argument_decl(value: &InputValue<'_, String>) -> ArgumentDecl {
    ArgumentDecl::new(value.name.clone(), TypeRef::from_sdl(&value.value_type))
}

/// The registration contract every plugin implements. Fragments are
/// produced once, during the build phase.
pub trait Plugin: Send + Sync {
    fn namespace(&self) -> &'static str;

    fn fragment(&self) -> Result<SchemaFragment, RegistryError>;
}
