//! Request dispatch: authorize, resolve, then project the requested fields.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{MutationError, ResolveError};
use crate::fragment::{OperationDecl, OperationHandler};
use crate::mutation_executor::MutationExecutor;
use crate::schema_registry::{CompositeSchema, TypeDescriptor};
use crate::store_mapper::{DocumentStore, TypeMapper};
use crate::{Caller, Role};

pub type Arguments = Map<String, Value>;

/// Handed to every operation resolver.
#[derive(Clone)]
pub struct ResolverContext {
    caller: Caller,
    mapper: Arc<TypeMapper>,
}

impl ResolverContext {
    pub fn new(caller: Caller, mapper: Arc<TypeMapper>) -> Self {
        ResolverContext { caller, mapper }
    }

    pub fn caller(&self) -> &Caller {
        &self.caller
    }

    pub fn role(&self) -> Option<&Role> {
        self.caller.role.as_ref()
    }

    pub fn identity(&self) -> Option<&str> {
        self.caller.id.as_deref()
    }

    pub fn store(&self) -> &TypeMapper {
        &self.mapper
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Request {
    pub operation: String,
    #[serde(default)]
    pub arguments: Arguments,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(skip)]
    pub caller: Caller,
}

impl Request {
    pub fn new(operation: impl Into<String>, caller: Caller) -> Self {
        Request {
            operation: operation.into(),
            arguments: Arguments::new(),
            fields: Vec::new(),
            caller,
        }
    }

    pub fn argument(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.insert(name.into(), value.into());
        self
    }

    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields.extend(fields.into_iter().map(Into::into));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    BadRequest,
    UnknownOperation,
    PermissionDenied,
    InvalidArguments,
    ReferenceNotFound,
    ResolverError,
    FieldResolutionError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum PathSegment {
    Field(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorExtensions {
    pub code: ErrorCode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResponseError {
    pub message: String,
    pub path: Vec<PathSegment>,
    pub extensions: ErrorExtensions,
}

impl ResponseError {
    pub fn new(code: ErrorCode, message: impl Into<String>, path: Vec<PathSegment>) -> Self {
        ResponseError {
            message: message.into(),
            path,
            extensions: ErrorExtensions { code },
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.extensions.code
    }
}

/// `{data}`, `{data, errors}` or `{errors}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ResponseError>,
}

impl Response {
    pub fn failure(error: ResponseError) -> Self {
        Response {
            data: None,
            errors: vec![error],
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestState {
    Received,
    Authorizing,
    Denied,
    Authorized,
    Resolving,
    Failed,
    Completed,
}

struct RequestTrace<'a> {
    operation: &'a str,
    state: RequestState,
}

impl<'a> RequestTrace<'a> {
    fn new(operation: &'a str) -> Self {
        debug!(operation, state = ?RequestState::Received, "request received");
        RequestTrace {
            operation,
            state: RequestState::Received,
        }
    }

    fn advance(&mut self, next: RequestState) {
        debug!(operation = self.operation, from = ?self.state, to = ?next, "request state");
        self.state = next;
    }
}

pub struct ResolverDispatcher {
    schema: Arc<CompositeSchema>,
    mapper: Arc<TypeMapper>,
    executor: MutationExecutor,
}

impl ResolverDispatcher {
    pub fn new(schema: Arc<CompositeSchema>, store: Arc<dyn DocumentStore>) -> Self {
        let mapper = Arc::new(TypeMapper::new(store, &schema));
        ResolverDispatcher {
            executor: MutationExecutor::new(schema.clone()),
            schema,
            mapper,
        }
    }

    pub fn schema(&self) -> &CompositeSchema {
        &self.schema
    }

    pub fn mapper(&self) -> Arc<TypeMapper> {
        self.mapper.clone()
    }

    pub async fn dispatch(&self, request: Request) -> Response {
        let Request {
            operation: name,
            arguments,
            fields,
            caller,
        } = request;
        let mut trace = RequestTrace::new(&name);
        let operation_path = vec![PathSegment::Field(name.clone())];

        let Some(operation) = self.schema.operation(&name) else {
            trace.advance(RequestState::Failed);
            return Response::failure(ResponseError::new(
                ErrorCode::UnknownOperation,
                format!("unknown operation '{}'", name),
                Vec::new(),
            ));
        };

        trace.advance(RequestState::Authorizing);
        if !operation.policy.check(caller.role.as_ref()).is_allowed() {
            trace.advance(RequestState::Denied);
            warn!(operation = %name, role = ?caller.role, "permission denied");
            return Response::failure(ResponseError::new(
                ErrorCode::PermissionDenied,
                format!("not allowed to call '{}'", name),
                operation_path,
            ));
        }
        trace.advance(RequestState::Authorized);

        trace.advance(RequestState::Resolving);
        if let Err(message) = self.check_arguments(operation, &arguments) {
            trace.advance(RequestState::Failed);
            return Response::failure(ResponseError::new(
                ErrorCode::InvalidArguments,
                message,
                operation_path,
            ));
        }

        let ctx = ResolverContext::new(caller.clone(), self.mapper.clone());
        let resolved = match self.resolve_operation(operation, arguments, ctx).await {
            Ok(value) => value,
            Err(e) => {
                trace.advance(RequestState::Failed);
                return Response::failure(ResponseError::new(
                    resolve_error_code(&e),
                    e.to_string(),
                    operation_path,
                ));
            }
        };
        if resolved.is_null() && !operation.return_type.is_nullable() {
            trace.advance(RequestState::Failed);
            return Response::failure(ResponseError::new(
                ErrorCode::ResolverError,
                format!("'{}' returned null for {}", name, operation.return_type),
                operation_path,
            ));
        }

        let mut errors = Vec::new();
        let data = self.project(
            operation,
            resolved,
            &fields,
            &caller,
            &operation_path,
            &mut errors,
        );
        trace.advance(RequestState::Completed);

        let mut body = Map::new();
        body.insert(name.clone(), data);
        Response {
            data: Some(Value::Object(body)),
            errors,
        }
    }

    fn check_arguments(
        &self,
        operation: &OperationDecl,
        arguments: &Arguments,
    ) -> Result<(), String> {
        if let Some(unknown) = arguments.keys().find(|key| operation.argument(key).is_none()) {
            return Err(format!("'{}' has no argument '{}'", operation.name, unknown));
        }
        for argument in &operation.arguments {
            let value = arguments.get(&argument.name).unwrap_or(&Value::Null);
            self.schema
                .check_value(&argument.value_type, value)
                .map_err(|e| format!("argument '{}': {}", argument.name, e))?;
        }
        Ok(())
    }

    async fn resolve_operation(
        &self,
        operation: &OperationDecl,
        arguments: Arguments,
        ctx: ResolverContext,
    ) -> Result<Value, ResolveError> {
        match self.schema.handler(&operation.name) {
            Some(OperationHandler::Resolver(resolver)) => resolver(arguments, ctx).await,
            Some(OperationHandler::Mutation(_)) => {
                let document = self
                    .executor
                    .execute(&operation.name, &arguments, &ctx)
                    .await?;
                Ok(document.to_value())
            }
            None => Err(ResolveError::message(format!(
                "no resolver for '{}'",
                operation.name
            ))),
        }
    }

    /// Stage two: project the requested fields out of the resolved value.
    fn project(
        &self,
        operation: &OperationDecl,
        resolved: Value,
        fields: &[String],
        caller: &Caller,
        path: &[PathSegment],
        errors: &mut Vec<ResponseError>,
    ) -> Value {
        let Some(descriptor) = self.schema.type_descriptor(operation.return_type.base_name()) else {
            return resolved;
        };

        match resolved {
            Value::Null => Value::Null,
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .enumerate()
                    .map(|(index, item)| {
                        let mut item_path = path.to_vec();
                        item_path.push(PathSegment::Index(index));
                        self.project_entity(descriptor, item, fields, caller, &item_path, errors)
                    })
                    .collect(),
            ),
            entity @ Value::Object(_) => {
                self.project_entity(descriptor, &entity, fields, caller, path, errors)
            }
            other => {
                errors.push(ResponseError::new(
                    ErrorCode::FieldResolutionError,
                    format!("expected {} object, found {}", descriptor.name, other),
                    path.to_vec(),
                ));
                Value::Null
            }
        }
    }

    fn project_entity(
        &self,
        descriptor: &TypeDescriptor,
        parent: &Value,
        fields: &[String],
        caller: &Caller,
        path: &[PathSegment],
        errors: &mut Vec<ResponseError>,
    ) -> Value {
        if parent.is_null() {
            return Value::Null;
        }

        let mut seen = HashSet::new();
        let mut projected = Map::new();
        for field in fields.iter().filter(|field| seen.insert(field.as_str())) {
            let value = match self.resolve_field(descriptor, parent, field, caller) {
                Ok(value) => value,
                Err((code, message)) => {
                    let mut field_path = path.to_vec();
                    field_path.push(PathSegment::Field(field.clone()));
                    errors.push(ResponseError::new(code, message, field_path));
                    Value::Null
                }
            };
            projected.insert(field.clone(), value);
        }
        Value::Object(projected)
    }

    fn resolve_field(
        &self,
        descriptor: &TypeDescriptor,
        parent: &Value,
        field: &str,
        caller: &Caller,
    ) -> Result<Value, (ErrorCode, String)> {
        let declaration = descriptor.field(field).ok_or_else(|| {
            (
                ErrorCode::FieldResolutionError,
                format!("'{}' has no field '{}'", descriptor.name, field),
            )
        })?;

        if let Some(policy) = &declaration.policy {
            if !policy.check(caller.role.as_ref()).is_allowed() {
                return Err((
                    ErrorCode::PermissionDenied,
                    format!("not allowed to read '{}.{}'", descriptor.name, field),
                ));
            }
        }

        let value = match self.schema.field_resolver(&descriptor.name, field) {
            Some(resolver) => {
                resolver(parent).map_err(|message| (ErrorCode::FieldResolutionError, message))?
            }
            None => parent.get(field).cloned().unwrap_or(Value::Null),
        };

        if value.is_null() && !declaration.nullable {
            return Err((
                ErrorCode::FieldResolutionError,
                format!("'{}.{}' resolved to null", descriptor.name, field),
            ));
        }
        Ok(value)
    }
}

fn resolve_error_code(error: &ResolveError) -> ErrorCode {
    match error {
        ResolveError::Mutation(MutationError::ReferenceNotFound { .. }) => {
            ErrorCode::ReferenceNotFound
        }
        ResolveError::Mutation(MutationError::InvalidInput(_)) => ErrorCode::InvalidArguments,
        _ => ErrorCode::ResolverError,
    }
}
