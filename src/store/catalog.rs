// src/store/catalog.rs

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::engine::FieldSpec;
use crate::errors::StoreError;
use crate::store::lock;
use crate::types::{BoxFuture, FieldId};

/// Generation settings of every generated field.
pub trait FieldCatalog: Send + Sync {
    fn field(&self, id: FieldId) -> BoxFuture<'_, Result<Option<FieldSpec>, StoreError>>;

    fn fields(&self) -> BoxFuture<'_, Result<Vec<FieldSpec>, StoreError>>;

    /// Set the field's `auto_update`; returns `false` for an unknown field.
    fn set_auto_update(
        &self,
        id: FieldId,
        enabled: bool,
    ) -> BoxFuture<'_, Result<bool, StoreError>>;
}

#[derive(Debug, Default)]
pub struct MemoryCatalog {
    fields: Mutex<BTreeMap<FieldId, FieldSpec>>,
}

impl MemoryCatalog {
    pub fn new(fields: impl IntoIterator<Item = FieldSpec>) -> Self {
        Self {
            fields: Mutex::new(fields.into_iter().map(|f| (f.id, f)).collect()),
        }
    }

    /// Insert or replace a field.
    pub fn insert(&self, field: FieldSpec) {
        lock(&self.fields).insert(field.id, field);
    }

    pub fn remove(&self, id: FieldId) -> Option<FieldSpec> {
        lock(&self.fields).remove(&id)
    }
}

impl FieldCatalog for MemoryCatalog {
    fn field(&self, id: FieldId) -> BoxFuture<'_, Result<Option<FieldSpec>, StoreError>> {
        let field = lock(&self.fields).get(&id).cloned();
        Box::pin(std::future::ready(Ok(field)))
    }

    fn fields(&self) -> BoxFuture<'_, Result<Vec<FieldSpec>, StoreError>> {
        let fields = lock(&self.fields).values().cloned().collect();
        Box::pin(std::future::ready(Ok(fields)))
    }

    fn set_auto_update(
        &self,
        id: FieldId,
        enabled: bool,
    ) -> BoxFuture<'_, Result<bool, StoreError>> {
        let found = match lock(&self.fields).get_mut(&id) {
            Some(field) => {
                field.auto_update = enabled;
                true
            }
            None => false,
        };
        Box::pin(std::future::ready(Ok(found)))
    }
}
