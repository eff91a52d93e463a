use graphql_parser::query::{
    Definition, OperationDefinition, Selection, SelectionSet, Value as GqlValue, parse_query,
};
use serde_json::{Map, Number, Value};

use crate::Caller;
use crate::resolver_dispatcher::Request;

/// Exactly one root field is allowed; only its flat selection set is read.
pub fn parse_operation(
    query: &str,
    variables: Option<&Value>,
    operation_name: Option<&str>,
) -> Result<Request, String> {
    let document =
        parse_query::<String>(query).map_err(|e| format!("Failed to parse query: {}", e))?;

    let mut operations = Vec::new();
    for definition in &document.definitions {
        match definition {
            Definition::Operation(operation) => operations.push(operation),
            Definition::Fragment(fragment) => {
                return Err(format!("fragment '{}' is not supported", fragment.name));
            }
        }
    }

    let selected = match operation_name {
        Some(wanted) => operations
            .into_iter()
            .find(|operation| name_of(operation) == Some(wanted))
            .ok_or_else(|| format!("no operation named '{}'", wanted))?,
        None => {
            if operations.len() != 1 {
                return Err("expected exactly one operation; pass operationName".to_string());
            }
            operations[0]
        }
    };

    let selection_set = match selected {
        OperationDefinition::SelectionSet(set) => set,
        OperationDefinition::Query(query) => &query.selection_set,
        OperationDefinition::Mutation(mutation) => &mutation.selection_set,
        OperationDefinition::Subscription(_) => {
            return Err("subscriptions are not supported".to_string());
        }
    };

    let empty = Map::new();
    let variables = match variables {
        Some(Value::Object(variables)) => variables,
        Some(Value::Null) | None => &empty,
        Some(_) => return Err("variables must be an object".to_string()),
    };

    let mut roots = field_selections(selection_set)?;
    if roots.len() != 1 {
        return Err(format!("expected exactly one root field, found {}", roots.len()));
    }
    let root = roots.remove(0);

    let mut request = Request::new(root.name.clone(), Caller::anonymous());
    for (name, value) in &root.arguments {
        request
            .arguments
            .insert(name.clone(), to_json(value, variables));
    }
    request.fields = field_selections(&root.selection_set)?
        .into_iter()
        .map(|field| field.name.clone())
        .collect();
    Ok(request)
}

fn name_of<'a>(operation: &'a OperationDefinition<'_, String>) -> Option<&'a str> {
    match operation {
        OperationDefinition::Query(query) => query.name.as_deref(),
        OperationDefinition::Mutation(mutation) => mutation.name.as_deref(),
        OperationDefinition::Subscription(subscription) => subscription.name.as_deref(),
        OperationDefinition::SelectionSet(_) => None,
    }
}

fn field_selections<'a, 'q>(
    selection_set: &'a SelectionSet<'q, String>,
) -> Result<Vec<&'a graphql_parser::query::Field<'q, String>>, String> {
    selection_set
        .items
        .iter()
        .map(|selection| match selection {
            Selection::Field(field) => Ok(field),
            Selection::FragmentSpread(spread) => {
                Err(format!("fragment spread '{}' is not supported", spread.fragment_name))
            }
            Selection::InlineFragment(_) => Err("inline fragments are not supported".to_string()),
        })
        .collect()
}

fn to_json(value: &GqlValue<'_, String>, variables: &Map<String, Value>) -> Value {
    match value {
        GqlValue::Variable(name) => variables.get(name).cloned().unwrap_or(Value::Null),
        GqlValue::Int(number) => number.as_i64().map(Value::from).unwrap_or(Value::Null),
        GqlValue::Float(float) => Number::from_f64(*float)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        GqlValue::String(string) => Value::String(string.clone()),
        GqlValue::Boolean(boolean) => Value::Bool(*boolean),
        GqlValue::Null => Value::Null,
        GqlValue::Enum(name) => Value::String(name.clone()),
        GqlValue::List(items) => {
            Value::Array(items.iter().map(|item| to_json(item, variables)).collect())
        }
        GqlValue::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(name, value)| (name.clone(), to_json(value, variables)))
                .collect(),
        ),
    }
}
