//! Route an authenticated call to its operation and meter it
//!
//! Unknown names and missing plan permissions fail before anything leaves the
//! process and are not metered. Every invocation that runs, successful or not,
//! produces one usage record; recording happens off the response path.

use std::sync::Arc;
use std::time::Instant;

use common::now_millis;
use serde_json::Value;
use tenant_access::TenantContext;
use tenant_store::{CredentialStore, UsageRecord};
use tracing::{debug, warn};

use crate::catalog::OperationCatalog;
use crate::error::{Error, Result};

pub struct Dispatcher {
    catalog: Arc<OperationCatalog>,
    store: Arc<dyn CredentialStore>,
}

impl Dispatcher {
    pub fn new(catalog: Arc<OperationCatalog>, store: Arc<dyn CredentialStore>) -> Self {
        Self { catalog, store }
    }

    pub fn catalog(&self) -> &OperationCatalog {
        &self.catalog
    }

    pub async fn dispatch(&self, ctx: &TenantContext, name: &str, params: Value) -> Result<Value> {
        let operation = self
            .catalog
            .get(name)
            .ok_or_else(|| Error::UnknownOperation(name.to_string()))?;

        let required = operation.permission();
        if !ctx.has_permission(required) {
            debug!(tenant_id = %ctx.tenant_id, operation = name, %required, "permission denied");
            return Err(Error::PermissionDenied {
                operation: name.to_string(),
                required,
            });
        }

        let started = Instant::now();
        let result = operation.invoke(&ctx.credential, params).await;
        let elapsed = started.elapsed();
        metrics::histogram!("gateway_operation_duration_seconds", "operation" => name.to_string())
            .record(elapsed.as_secs_f64());

        let (cost, status_code) = match &result {
            Ok(_) => (operation.cost(), 200),
            Err(e) => {
                debug!(tenant_id = %ctx.tenant_id, operation = name, error = %e, "operation failed");
                (0, e.status_code())
            }
        };
        self.record_usage(UsageRecord {
            tenant_id: ctx.tenant_id.clone(),
            operation: name.to_string(),
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            cost,
            status_code,
            recorded_at: now_millis(),
        });

        result
    }

    fn record_usage(&self, usage: UsageRecord) {
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = store.record_usage(&usage).await {
                warn!(
                    tenant_id = %usage.tenant_id,
                    operation = %usage.operation,
                    error = %e,
                    "failed to record usage"
                );
            }
        });
    }
}
