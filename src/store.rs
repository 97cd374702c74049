use crate::error::{ServerError, ServerResult};
use parking_lot::RwLock;
use serde_json::{Map, Value};

/// A stored document: a JSON object carrying a string `_id`
pub type Document = Map<String, Value>;

/// Field-equality filter; an empty filter matches every document
pub type Filter = Map<String, Value>;

pub const ID_FIELD: &str = "_id";

/// Pagination for [`DocumentStore::find`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FindOptions {
    pub skip: usize,
    pub limit: Option<usize>,
}

impl FindOptions {
    /// Options for 1-based `page` of `limit` documents
    pub fn page(page: usize, limit: usize) -> Self {
        Self {
            skip: page.saturating_sub(1).saturating_mul(limit),
            limit: Some(limit),
        }
    }
}

/// The persistence collaborator the handlers talk to
pub trait DocumentStore: Send + Sync {
    /// Documents matching `filter`, in insertion order
    fn find(&self, filter: &Filter, options: FindOptions) -> ServerResult<Vec<Document>>;

    fn find_by_id(&self, id: &str) -> ServerResult<Option<Document>>;

    /// Insert a document, assigning a fresh `_id`; returns the stored copy
    fn save(&self, document: Document) -> ServerResult<Document>;

    /// Insert like [`DocumentStore::save`] unless a stored document has the
    /// same value for `field`. The check and the insert are one atomic step;
    /// `None` means a conflicting document exists and nothing was stored.
    fn save_unique(&self, field: &str, document: Document) -> ServerResult<Option<Document>>;

    /// Merge `changes` into the document; returns the updated copy
    fn update_one(&self, id: &str, changes: Document) -> ServerResult<Option<Document>>;

    /// Remove a document; returns what was removed
    fn delete_one(&self, id: &str) -> ServerResult<Option<Document>>;
}

fn matches(document: &Document, filter: &Filter) -> bool {
    filter
        .iter()
        .all(|(field, expected)| document.get(field) == Some(expected))
}

fn id_of(document: &Document) -> Option<&str> {
    document.get(ID_FIELD).and_then(Value::as_str)
}

fn with_new_id(mut document: Document) -> ServerResult<Document> {
    if document.contains_key(ID_FIELD) {
        return Err(ServerError::Store(format!(
            "{} is assigned by the store",
            ID_FIELD
        )));
    }

    let id = uuid::Uuid::new_v4().to_string();
    document.insert(ID_FIELD.to_string(), Value::String(id));
    Ok(document)
}

/// In-memory [`DocumentStore`]
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: RwLock<Vec<Document>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }
}

impl DocumentStore for MemoryStore {
    fn find(&self, filter: &Filter, options: FindOptions) -> ServerResult<Vec<Document>> {
        let documents = self.documents.read();
        let matching = documents
            .iter()
            .filter(|doc| matches(doc, filter))
            .skip(options.skip);

        Ok(match options.limit {
            Some(limit) => matching.take(limit).cloned().collect(),
            None => matching.cloned().collect(),
        })
    }

    fn find_by_id(&self, id: &str) -> ServerResult<Option<Document>> {
        Ok(self
            .documents
            .read()
            .iter()
            .find(|doc| id_of(doc) == Some(id))
            .cloned())
    }

    fn save(&self, document: Document) -> ServerResult<Document> {
        let document = with_new_id(document)?;
        self.documents.write().push(document.clone());
        Ok(document)
    }

    fn save_unique(&self, field: &str, document: Document) -> ServerResult<Option<Document>> {
        let document = with_new_id(document)?;
        let mut documents = self.documents.write();
        if let Some(value) = document.get(field) {
            if documents.iter().any(|doc| doc.get(field) == Some(value)) {
                return Ok(None);
            }
        }
        documents.push(document.clone());
        Ok(Some(document))
    }

    fn update_one(&self, id: &str, changes: Document) -> ServerResult<Option<Document>> {
        if changes.contains_key(ID_FIELD) {
            return Err(ServerError::Store(format!("{} cannot be changed", ID_FIELD)));
        }

        let mut documents = self.documents.write();
        Ok(documents
            .iter_mut()
            .find(|doc| id_of(doc) == Some(id))
            .map(|doc| {
                doc.extend(changes);
                doc.clone()
            }))
    }

    fn delete_one(&self, id: &str) -> ServerResult<Option<Document>> {
        let mut documents = self.documents.write();
        Ok(documents
            .iter()
            .position(|doc| id_of(doc) == Some(id))
            .map(|index| documents.remove(index)))
    }
}
