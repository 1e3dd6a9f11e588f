//! Operation trait and the typed registry of named operations

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tenant_access::UpstreamCredential;
use tenant_store::Permission;

use crate::error::{Error, Result};

const MAX_NAME_LEN: usize = 64;

/// Boxed future returned by [`Operation::invoke`].
pub type OperationFuture<'a> = Pin<Box<dyn Future<Output = Result<Value>> + Send + 'a>>;

/// One named upstream call.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn Operation>`).
pub trait Operation: Send + Sync {
    fn name(&self) -> &str;

    /// Plan permission a caller needs to invoke this operation.
    fn permission(&self) -> Permission {
        Permission::Read
    }

    /// Usage units charged for a successful call.
    fn cost(&self) -> u64 {
        1
    }

    fn invoke<'a>(&'a self, credential: &'a UpstreamCredential, params: Value)
    -> OperationFuture<'a>;
}

/// Names are lowercase identifiers with `.`, `_` or `-` separators, starting
/// with a letter, e.g. `contacts.search`.
pub fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name.starts_with(|c: char| c.is_ascii_lowercase())
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'.' | b'_' | b'-'));
    if valid {
        Ok(())
    } else {
        Err(Error::Catalog(format!("invalid operation name {name:?}")))
    }
}

/// Immutable-after-startup mapping from operation name to implementation.
#[derive(Default)]
pub struct OperationCatalog {
    operations: HashMap<String, Arc<dyn Operation>>,
}

impl OperationCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an operation. Rejects malformed and duplicate names.
    pub fn register(&mut self, operation: Arc<dyn Operation>) -> Result<()> {
        let name = operation.name().to_string();
        validate_name(&name)?;
        if self.operations.contains_key(&name) {
            return Err(Error::Catalog(format!("duplicate operation {name:?}")));
        }
        self.operations.insert(name, operation);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Operation>> {
        self.operations.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.operations.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}
