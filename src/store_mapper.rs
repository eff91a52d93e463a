use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::StoreError;
use crate::fragment::scalar_accepts;
use crate::schema_registry::{CompositeSchema, TypeDescriptor};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct CollectionId(String);

impl CollectionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The naming function. Namespaces never contain `.`, so distinct
/// `(namespace, type_name)` pairs never produce the same id.
pub fn derive_collection_id(namespace: &str, type_name: &str) -> CollectionId {
    CollectionId(format!("{}.{}", namespace, type_name))
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Document {
    pub fn new(id: impl Into<String>, fields: Map<String, Value>) -> Self {
        Document {
            id: id.into(),
            fields,
        }
    }

    pub fn value(&self, field: &str) -> Value {
        if field == "id" {
            return Value::String(self.id.clone());
        }
        self.fields.get(field).cloned().unwrap_or(Value::Null)
    }

    pub fn to_value(&self) -> Value {
        let mut object = self.fields.clone();
        object.insert("id".to_string(), Value::String(self.id.clone()));
        Value::Object(object)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// Conjunction of field equalities. The empty filter matches everything.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Filter(BTreeMap<String, Value>);

impl Filter {
    pub fn all() -> Self {
        Filter::default()
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::all().and(field, value)
    }

    pub fn and(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    pub fn matches(&self, document: &Document) -> bool {
        self.0
            .iter()
            .all(|(field, expected)| &document.value(field) == expected)
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(
        &self,
        collection: &CollectionId,
        id: &str,
    ) -> Result<Option<Document>, StoreError>;

    async fn scan(&self, collection: &CollectionId) -> Result<Vec<Document>, StoreError>;

    /// Fails with `DuplicateId` if the id is taken.
    async fn insert(&self, collection: &CollectionId, document: Document) -> Result<(), StoreError>;

    /// Applies `patch` to every matching document; each document is updated
    /// atomically. Returns the number of documents updated.
    async fn update_where(
        &self,
        collection: &CollectionId,
        filter: &Filter,
        patch: &Map<String, Value>,
    ) -> Result<usize, StoreError>;

    async fn count(&self, collection: &CollectionId) -> Result<usize, StoreError>;
}

/// Process-local store. Each write happens under a single lock acquisition.
pub struct MemoryStore {
    collections: RwLock<HashMap<CollectionId, BTreeMap<String, Document>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            collections: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(
        &self,
        collection: &CollectionId,
        id: &str,
    ) -> Result<Option<Document>, StoreError> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .and_then(|documents| documents.get(id))
            .cloned())
    }

    async fn scan(&self, collection: &CollectionId) -> Result<Vec<Document>, StoreError> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|documents| documents.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn insert(
        &self,
        collection: &CollectionId,
        document: Document,
    ) -> Result<(), StoreError> {
        let mut collections = self.collections.write().await;
        let documents = collections.entry(collection.clone()).or_default();
        if documents.contains_key(&document.id) {
            return Err(StoreError::DuplicateId {
                collection: collection.to_string(),
                id: document.id,
            });
        }
        documents.insert(document.id.clone(), document);
        Ok(())
    }

    async fn update_where(
        &self,
        collection: &CollectionId,
        filter: &Filter,
        patch: &Map<String, Value>,
    ) -> Result<usize, StoreError> {
        let mut collections = self.collections.write().await;
        let Some(documents) = collections.get_mut(collection) else {
            return Ok(0);
        };

        let mut updated = 0;
        for document in documents.values_mut().filter(|document| filter.matches(document)) {
            for (field, value) in patch {
                document.fields.insert(field.clone(), value.clone());
            }
            updated += 1;
        }
        Ok(updated)
    }

    async fn count(&self, collection: &CollectionId) -> Result<usize, StoreError> {
        let collections = self.collections.read().await;
        Ok(collections.get(collection).map_or(0, BTreeMap::len))
    }
}

/// Resolves declared types to collections and validates record shapes.
pub struct TypeMapper {
    store: Arc<dyn DocumentStore>,
    collections: HashMap<String, CollectionId>,
    shapes: HashMap<CollectionId, TypeDescriptor>,
}

impl TypeMapper {
    pub fn new(store: Arc<dyn DocumentStore>, schema: &CompositeSchema) -> Self {
        let mut collections = HashMap::new();
        let mut shapes = HashMap::new();
        for descriptor in schema.types() {
            collections.insert(descriptor.name.clone(), descriptor.collection.clone());
            shapes.insert(descriptor.collection.clone(), descriptor.clone());
        }
        TypeMapper {
            store,
            collections,
            shapes,
        }
    }

    pub fn collection_for(&self, type_name: &str) -> Result<CollectionId, StoreError> {
        self.collections
            .get(type_name)
            .cloned()
            .ok_or_else(|| StoreError::UnknownType(type_name.to_string()))
    }

    pub async fn find_by_id(
        &self,
        collection: &CollectionId,
        id: &str,
    ) -> Result<Document, StoreError> {
        self.shape(collection)?;
        self.store
            .get(collection, id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })
    }

    /// All documents of a collection ordered by `sort_key` (ties broken by
    /// id). Descending is exactly the reverse of ascending.
    pub async fn find_all(
        &self,
        collection: &CollectionId,
        sort_key: &str,
        direction: SortDirection,
    ) -> Result<Vec<Document>, StoreError> {
        self.shape(collection)?;
        let mut documents = self.store.scan(collection).await?;
        documents.sort_by(|a, b| {
            compare_values(&a.value(sort_key), &b.value(sort_key)).then_with(|| a.id.cmp(&b.id))
        });
        if direction == SortDirection::Descending {
            documents.reverse();
        }
        Ok(documents)
    }

    pub async fn insert(
        &self,
        collection: &CollectionId,
        fields: Map<String, Value>,
    ) -> Result<Document, StoreError> {
        let shape = self.shape(collection)?;
        validate_record(shape, &fields, false)?;

        let document = Document::new(uuid::Uuid::now_v7().to_string(), fields);
        self.store.insert(collection, document.clone()).await?;
        debug!(collection = %collection, id = %document.id, "inserted document");
        Ok(document)
    }

    pub async fn update_where(
        &self,
        collection: &CollectionId,
        filter: &Filter,
        patch: &Map<String, Value>,
    ) -> Result<usize, StoreError> {
        let shape = self.shape(collection)?;
        validate_record(shape, patch, true)?;

        let updated = self.store.update_where(collection, filter, patch).await?;
        debug!(collection = %collection, updated, "updated documents");
        Ok(updated)
    }

    pub async fn count(&self, collection: &CollectionId) -> Result<usize, StoreError> {
        self.shape(collection)?;
        self.store.count(collection).await
    }

    fn shape(&self, collection: &CollectionId) -> Result<&TypeDescriptor, StoreError> {
        self.shapes
            .get(collection)
            .ok_or_else(|| StoreError::UnknownCollection(collection.to_string()))
    }
}

/// `partial` records (patches) may omit fields but may not null out
/// non-nullable ones. `id` is never writable.
fn validate_record(
    shape: &TypeDescriptor,
    fields: &Map<String, Value>,
    partial: bool,
) -> Result<(), StoreError> {
    let mismatch = |reason: String| StoreError::ShapeMismatch {
        collection: shape.collection.to_string(),
        reason,
    };

    for (name, value) in fields {
        if name == "id" {
            return Err(mismatch("'id' is assigned by the store".to_string()));
        }
        let declared = shape
            .field(name)
            .ok_or_else(|| mismatch(format!("undeclared field '{}'", name)))?;
        if value.is_null() {
            if !declared.nullable {
                return Err(mismatch(format!("field '{}' cannot be null", name)));
            }
            continue;
        }
        if !stored_value_fits(&declared.field_type, value) {
            return Err(mismatch(format!(
                "field '{}' expects {}",
                name, declared.field_type
            )));
        }
    }

    if !partial {
        let required = shape
            .fields
            .iter()
            .filter(|f| !f.nullable && f.name != "id" && !shape.resolved_fields.contains(&f.name));
        for field in required {
            if !fields.contains_key(&field.name) {
                return Err(mismatch(format!("missing field '{}'", field.name)));
            }
        }
    }
    Ok(())
}

// Only scalars are checked; references to other entities are stored as ids
// and list items are checked one level deep.
fn stored_value_fits(field_type: &crate::fragment::TypeRef, value: &Value) -> bool {
    use crate::fragment::{TypeRef, is_builtin_scalar};

    match field_type {
        TypeRef::NonNull(inner) => !value.is_null() && stored_value_fits(inner, value),
        TypeRef::List(inner) => match value {
            Value::Array(items) => items
                .iter()
                .all(|item| {
                    (item.is_null() && inner.is_nullable()) || stored_value_fits(inner, item)
                }),
            Value::Null => true,
            _ => false,
        },
        TypeRef::Named(name) if is_builtin_scalar(name) => {
            value.is_null() || scalar_accepts(name, value)
        }
        TypeRef::Named(_) => true,
    }
}

/// Total order used for sorting: null < bool < number < string < array < object.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(value: &Value) -> u8 {
        match value {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.total_cmp(&y)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::SchemaFragment;
    use crate::schema_registry::{InMemorySchemaRegistry, SchemaRegistry};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const SDL: &str = r#"
        type Ticket {
            id: ID!
            seat: Int!
            holder: String
            tags: [String!]
        }
    "#;

    fn mapper() -> TypeMapper {
        let mut registry = InMemorySchemaRegistry::new();
        registry
            .register(SchemaFragment::from_sdl("tickets", SDL).unwrap())
            .unwrap();
        let schema = registry.seal();
        TypeMapper::new(Arc::new(MemoryStore::new()), &schema)
    }

    fn record(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[test]
    fn collection_ids_are_deterministic_and_distinct() {
        assert_eq!(
            derive_collection_id("tickets", "Ticket"),
            derive_collection_id("tickets", "Ticket")
        );
        assert_ne!(
            derive_collection_id("tickets", "Ticket"),
            derive_collection_id("tickets", "Tickets")
        );
        assert_ne!(
            derive_collection_id("a_b", "C"),
            derive_collection_id("a", "b_C")
        );
        assert_eq!(derive_collection_id("tickets", "Ticket").as_str(), "tickets.Ticket");
    }

    #[test]
    fn unknown_type_has_no_collection() {
        assert_eq!(
            mapper().collection_for("Seat"),
            Err(StoreError::UnknownType("Seat".to_string()))
        );
    }

    #[tokio::test]
    async fn find_all_orders_by_sort_key_and_reverses_exactly() {
        let mapper = mapper();
        let tickets = mapper.collection_for("Ticket").unwrap();

        for seat in [7, 3, 9, 3, 1] {
            mapper
                .insert(&tickets, record(json!({ "seat": seat })))
                .await
                .unwrap();
        }

        let ascending = mapper
            .find_all(&tickets, "seat", SortDirection::Ascending)
            .await
            .unwrap();
        let seats: Vec<Value> = ascending.iter().map(|d| d.value("seat")).collect();
        assert_eq!(seats, vec![json!(1), json!(3), json!(3), json!(7), json!(9)]);

        let mut ids: Vec<&str> = ascending.iter().map(|d| d.id.as_str()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 5);

        let mut descending = mapper
            .find_all(&tickets, "seat", SortDirection::Descending)
            .await
            .unwrap();
        descending.reverse();
        assert_eq!(descending, ascending);
    }

    #[tokio::test]
    async fn insert_assigns_fresh_ids() {
        let mapper = mapper();
        let tickets = mapper.collection_for("Ticket").unwrap();

        let first = mapper.insert(&tickets, record(json!({ "seat": 1 }))).await.unwrap();
        let second = mapper.insert(&tickets, record(json!({ "seat": 1 }))).await.unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(mapper.find_by_id(&tickets, &first.id).await.unwrap(), first);
        assert_eq!(mapper.count(&tickets).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn insert_rejects_records_that_do_not_fit_the_shape() {
        let mapper = mapper();
        let tickets = mapper.collection_for("Ticket").unwrap();

        for bad in [
            json!({}),
            json!({ "seat": "A4" }),
            json!({ "seat": 1, "price": 10 }),
            json!({ "seat": 1, "id": "mine" }),
            json!({ "seat": 1, "tags": ["vip", null] }),
        ] {
            let result = mapper.insert(&tickets, record(bad.clone())).await;
            assert!(
                matches!(result, Err(StoreError::ShapeMismatch { .. })),
                "accepted {}",
                bad
            );
        }
        assert_eq!(mapper.count(&tickets).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn find_by_id_reports_not_found() {
        let mapper = mapper();
        let tickets = mapper.collection_for("Ticket").unwrap();
        assert_eq!(
            mapper.find_by_id(&tickets, "nope").await,
            Err(StoreError::NotFound {
                collection: "tickets.Ticket".to_string(),
                id: "nope".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn update_where_patches_matching_documents() {
        let mapper = mapper();
        let tickets = mapper.collection_for("Ticket").unwrap();
        for seat in [1, 2, 2] {
            mapper.insert(&tickets, record(json!({ "seat": seat }))).await.unwrap();
        }

        let updated = mapper
            .update_where(&tickets, &Filter::eq("seat", 2), &record(json!({ "holder": "ada" })))
            .await
            .unwrap();
        assert_eq!(updated, 2);

        let held: Vec<Document> = mapper
            .find_all(&tickets, "seat", SortDirection::Ascending)
            .await
            .unwrap()
            .into_iter()
            .filter(|d| d.value("holder") == json!("ada"))
            .collect();
        assert_eq!(held.len(), 2);

        let err = mapper
            .update_where(&tickets, &Filter::all(), &record(json!({ "seat": null })))
            .await;
        assert!(matches!(err, Err(StoreError::ShapeMismatch { .. })));
    }

    #[test]
    fn value_ordering_ranks_kinds() {
        assert_eq!(compare_values(&json!(null), &json!(false)), Ordering::Less);
        assert_eq!(compare_values(&json!(2), &json!(10)), Ordering::Less);
        assert_eq!(compare_values(&json!("b"), &json!("a")), Ordering::Greater);
        assert_eq!(compare_values(&json!(1.5), &json!(1.5)), Ordering::Equal);
    }
}
