//! SQLite-backed credential store
//!
//! One connection behind a mutex. Statements are short and never span an
//! await, so the lock is only held for the duration of a single query or
//! transaction.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use common::now_millis;
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::{
    ApiKeyRecord, AuthMethod, InstallationStatus, OAuthInstallBundle, OAuthInstallation, Tenant,
    TenantConfig, TokenUpdate, UsageRecord,
};
use crate::{CredentialStore, StoreFuture};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tenants (
    id TEXT PRIMARY KEY,
    subdomain TEXT NOT NULL UNIQUE,
    auth_method TEXT NOT NULL,
    oauth_installation_id TEXT,
    location_id TEXT,
    upstream_api_key TEXT,
    plan_tier TEXT NOT NULL,
    usage_limit INTEGER NOT NULL,
    current_usage INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS api_keys (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL REFERENCES tenants(id),
    key_hash TEXT NOT NULL,
    key_prefix TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL,
    last_used_at INTEGER
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_api_keys_key_hash ON api_keys(key_hash);
CREATE INDEX IF NOT EXISTS idx_api_keys_tenant_id ON api_keys(tenant_id);

CREATE TABLE IF NOT EXISTS oauth_installations (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL REFERENCES tenants(id),
    location_id TEXT NOT NULL,
    company_id TEXT,
    access_token TEXT NOT NULL,
    refresh_token TEXT NOT NULL,
    expires_at INTEGER NOT NULL,
    scopes TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL,
    installed_at INTEGER NOT NULL,
    last_refreshed_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_oauth_installations_tenant_id ON oauth_installations(tenant_id);
CREATE INDEX IF NOT EXISTS idx_oauth_installations_expires_at ON oauth_installations(expires_at);

CREATE TABLE IF NOT EXISTS usage_records (
    id INTEGER PRIMARY KEY,
    tenant_id TEXT NOT NULL REFERENCES tenants(id),
    operation TEXT NOT NULL,
    elapsed_ms INTEGER NOT NULL,
    cost INTEGER NOT NULL,
    status_code INTEGER NOT NULL,
    recorded_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_usage_records_tenant_id ON usage_records(tenant_id);
"#;

const TENANT_COLUMNS: &str = "t.id, t.subdomain, t.auth_method, t.oauth_installation_id, \
     t.location_id, t.upstream_api_key, t.plan_tier, t.usage_limit, t.current_usage, \
     t.status, t.created_at, t.updated_at";

const API_KEY_COLUMNS: &str =
    "k.id, k.tenant_id, k.key_hash, k.key_prefix, k.is_active, k.created_at, k.last_used_at";

const INSTALLATION_COLUMNS: &str = "i.id, i.tenant_id, i.location_id, i.company_id, \
     i.access_token, i.refresh_token, i.expires_at, i.scopes, i.status, i.installed_at, \
     i.last_refreshed_at";

/// Number of columns in [`TENANT_COLUMNS`], the offset of a joined key row.
const TENANT_COLUMN_COUNT: usize = 12;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database file and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        let store = Self::init(conn)?;
        info!(path = %path.display(), "credential store opened");
        Ok(store)
    }

    /// Private in-memory database. Used by tests and throwaway setups.
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Database("connection lock poisoned".into()))
    }

    fn upsert_tenant(conn: &Connection, tenant: &Tenant) -> Result<()> {
        conn.execute(
            r#"
            INSERT INTO tenants (
                id, subdomain, auth_method, oauth_installation_id, location_id,
                upstream_api_key, plan_tier, usage_limit, current_usage, status,
                created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(id) DO UPDATE SET
                subdomain = excluded.subdomain,
                auth_method = excluded.auth_method,
                oauth_installation_id = excluded.oauth_installation_id,
                location_id = excluded.location_id,
                upstream_api_key = excluded.upstream_api_key,
                plan_tier = excluded.plan_tier,
                usage_limit = excluded.usage_limit,
                status = excluded.status,
                updated_at = excluded.updated_at
            "#,
            params![
                tenant.id,
                tenant.subdomain,
                tenant.auth_method,
                tenant.oauth_installation_id,
                tenant.location_id,
                tenant.upstream_api_key,
                tenant.plan_tier,
                tenant.usage_limit,
                tenant.current_usage,
                tenant.status,
                tenant.created_at,
                tenant.updated_at,
            ],
        )?;
        Ok(())
    }

    fn insert_api_key(conn: &Connection, key: &ApiKeyRecord) -> Result<()> {
        conn.execute(
            r#"
            INSERT INTO api_keys (
                id, tenant_id, key_hash, key_prefix, is_active, created_at, last_used_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(key_hash) DO NOTHING
            "#,
            params![
                key.id,
                key.tenant_id,
                key.key_hash,
                key.key_prefix,
                key.is_active,
                key.created_at,
                key.last_used_at,
            ],
        )?;
        Ok(())
    }

    fn upsert_installation(conn: &Connection, installation: &OAuthInstallation) -> Result<()> {
        conn.execute(
            r#"
            INSERT INTO oauth_installations (
                id, tenant_id, location_id, company_id, access_token, refresh_token,
                expires_at, scopes, status, installed_at, last_refreshed_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(id) DO UPDATE SET
                tenant_id = excluded.tenant_id,
                location_id = excluded.location_id,
                company_id = excluded.company_id,
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                expires_at = excluded.expires_at,
                scopes = excluded.scopes,
                status = excluded.status,
                last_refreshed_at = excluded.last_refreshed_at
            "#,
            params![
                installation.id,
                installation.tenant_id,
                installation.location_id,
                installation.company_id,
                installation.access_token,
                installation.refresh_token,
                installation.expires_at,
                installation.scopes.join(" "),
                installation.status,
                installation.installed_at,
                installation.last_refreshed_at,
            ],
        )?;
        Ok(())
    }

    fn link_oauth(
        conn: &Connection,
        tenant_id: &str,
        installation_id: &str,
        location_id: &str,
    ) -> Result<()> {
        let changed = conn.execute(
            r#"
            UPDATE tenants SET
                auth_method = ?2,
                oauth_installation_id = ?3,
                location_id = ?4,
                upstream_api_key = NULL,
                updated_at = ?5
            WHERE id = ?1
            "#,
            params![
                tenant_id,
                AuthMethod::OAuth,
                installation_id,
                location_id,
                now_millis()
            ],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("tenant {tenant_id}")));
        }
        Ok(())
    }

    fn install(&self, bundle: &OAuthInstallBundle) -> Result<String> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let existing: Option<(String, Option<String>)> = tx
            .query_row(
                "SELECT id, oauth_installation_id FROM tenants WHERE subdomain = ?1",
                params![bundle.tenant.subdomain],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        // Only the tenant already linked to this installation may re-grant it.
        let tenant_id = match existing {
            Some((id, linked)) if linked.as_deref() == Some(bundle.installation.id.as_str()) => {
                debug!(tenant_id = %id, "re-granting existing oauth installation");
                id
            }
            Some((id, _)) => {
                debug!(tenant_id = %id, "install rejected: subdomain already registered");
                return Err(Error::Conflict(format!(
                    "subdomain {} is already registered",
                    bundle.tenant.subdomain
                )));
            }
            None => bundle.tenant.id.clone(),
        };

        let owner: Option<String> = tx
            .query_row(
                "SELECT tenant_id FROM oauth_installations WHERE id = ?1",
                params![bundle.installation.id],
                |row| row.get(0),
            )
            .optional()?;
        if owner.is_some_and(|owner| owner != tenant_id) {
            return Err(Error::Conflict(format!(
                "installation {} belongs to another tenant",
                bundle.installation.id
            )));
        }

        if tenant_id == bundle.tenant.id {
            Self::upsert_tenant(&tx, &bundle.tenant)?;
        }

        let mut installation = bundle.installation.clone();
        installation.tenant_id.clone_from(&tenant_id);
        Self::upsert_installation(&tx, &installation)?;
        Self::link_oauth(&tx, &tenant_id, &installation.id, &installation.location_id)?;

        let mut api_key = bundle.api_key.clone();
        api_key.tenant_id.clone_from(&tenant_id);
        Self::insert_api_key(&tx, &api_key)?;

        tx.commit()?;
        Ok(tenant_id)
    }

    fn tenant_and_key(&self, key_hash: &str) -> Result<(Tenant, ApiKeyRecord)> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {TENANT_COLUMNS}, {API_KEY_COLUMNS} FROM api_keys k \
             JOIN tenants t ON t.id = k.tenant_id \
             WHERE k.key_hash = ?1 AND k.is_active = 1"
        );
        conn.query_row(&sql, params![key_hash], |row| {
            Ok((tenant_from_row(row)?, api_key_from_row(row, TENANT_COLUMN_COUNT)?))
        })
        .optional()?
        .ok_or_else(|| Error::NotFound("active api key".into()))
    }

    fn tenant_config(&self, tenant_id: &str) -> Result<TenantConfig> {
        let conn = self.conn()?;
        let tenant = conn
            .query_row(
                &format!("SELECT {TENANT_COLUMNS} FROM tenants t WHERE t.id = ?1"),
                params![tenant_id],
                tenant_from_row,
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("tenant {tenant_id}")))?;

        let installation = match tenant.oauth_installation_id.as_deref() {
            Some(id) => conn
                .query_row(
                    &format!("SELECT {INSTALLATION_COLUMNS} FROM oauth_installations i WHERE i.id = ?1"),
                    params![id],
                    installation_from_row,
                )
                .optional()?,
            None => None,
        };

        Ok(TenantConfig {
            tenant,
            installation,
        })
    }

    fn installation(&self, installation_id: &str) -> Result<OAuthInstallation> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {INSTALLATION_COLUMNS} FROM oauth_installations i WHERE i.id = ?1"),
            params![installation_id],
            installation_from_row,
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("installation {installation_id}")))
    }

    fn update_tokens(&self, update: &TokenUpdate) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            r#"
            UPDATE oauth_installations SET
                access_token = ?2,
                refresh_token = ?3,
                expires_at = ?4,
                last_refreshed_at = ?5
            WHERE id = ?1
            "#,
            params![
                update.installation_id,
                update.access_token,
                update.refresh_token,
                update.expires_at,
                update.refreshed_at,
            ],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!(
                "installation {}",
                update.installation_id
            )));
        }
        Ok(())
    }

    fn set_installation_status(
        &self,
        installation_id: &str,
        status: InstallationStatus,
    ) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE oauth_installations SET status = ?2 WHERE id = ?1",
            params![installation_id, status],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("installation {installation_id}")));
        }
        Ok(())
    }

    fn remove_installation(&self, installation_id: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE tenants SET oauth_installation_id = NULL, updated_at = ?2 \
             WHERE oauth_installation_id = ?1",
            params![installation_id, now_millis()],
        )?;
        let removed = tx.execute(
            "DELETE FROM oauth_installations WHERE id = ?1",
            params![installation_id],
        )?;
        if removed == 0 {
            return Err(Error::NotFound(format!("installation {installation_id}")));
        }
        tx.commit()?;
        Ok(())
    }

    fn expiring_before(&self, before: u64) -> Result<Vec<OAuthInstallation>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {INSTALLATION_COLUMNS} FROM oauth_installations i \
             WHERE i.status = ?1 AND i.expires_at < ?2 ORDER BY i.expires_at"
        ))?;
        let rows = stmt.query_map(
            params![InstallationStatus::Active, before],
            installation_from_row,
        )?;
        let installations = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(installations)
    }

    fn insert_usage(&self, usage: &UsageRecord) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO usage_records (
                tenant_id, operation, elapsed_ms, cost, status_code, recorded_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                usage.tenant_id,
                usage.operation,
                usage.elapsed_ms,
                usage.cost,
                usage.status_code,
                usage.recorded_at,
            ],
        )?;
        if usage.cost > 0 {
            tx.execute(
                "UPDATE tenants SET current_usage = current_usage + ?2 WHERE id = ?1",
                params![usage.tenant_id, usage.cost],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

fn tenant_from_row(row: &Row<'_>) -> rusqlite::Result<Tenant> {
    Ok(Tenant {
        id: row.get(0)?,
        subdomain: row.get(1)?,
        auth_method: row.get(2)?,
        oauth_installation_id: row.get(3)?,
        location_id: row.get(4)?,
        upstream_api_key: row.get(5)?,
        plan_tier: row.get(6)?,
        usage_limit: row.get(7)?,
        current_usage: row.get(8)?,
        status: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn api_key_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<ApiKeyRecord> {
    Ok(ApiKeyRecord {
        id: row.get(offset)?,
        tenant_id: row.get(offset + 1)?,
        key_hash: row.get(offset + 2)?,
        key_prefix: row.get(offset + 3)?,
        is_active: row.get(offset + 4)?,
        created_at: row.get(offset + 5)?,
        last_used_at: row.get(offset + 6)?,
    })
}

fn installation_from_row(row: &Row<'_>) -> rusqlite::Result<OAuthInstallation> {
    let scopes: String = row.get(7)?;
    Ok(OAuthInstallation {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        location_id: row.get(2)?,
        company_id: row.get(3)?,
        access_token: row.get(4)?,
        refresh_token: row.get(5)?,
        expires_at: row.get(6)?,
        scopes: scopes.split_whitespace().map(str::to_string).collect(),
        status: row.get(8)?,
        installed_at: row.get(9)?,
        last_refreshed_at: row.get(10)?,
    })
}

impl CredentialStore for SqliteStore {
    fn create_tenant<'a>(&'a self, tenant: &'a Tenant) -> StoreFuture<'a, ()> {
        Box::pin(async move { Self::upsert_tenant(&*self.conn()?, tenant) })
    }

    fn create_api_key<'a>(&'a self, key: &'a ApiKeyRecord) -> StoreFuture<'a, ()> {
        Box::pin(async move { Self::insert_api_key(&*self.conn()?, key) })
    }

    fn find_tenant_and_active_key_by_hash<'a>(
        &'a self,
        key_hash: &'a str,
    ) -> StoreFuture<'a, (Tenant, ApiKeyRecord)> {
        Box::pin(async move { self.tenant_and_key(key_hash) })
    }

    fn touch_api_key<'a>(&'a self, key_id: &'a str, used_at: u64) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.conn()?.execute(
                "UPDATE api_keys SET last_used_at = ?2 WHERE id = ?1",
                params![key_id, used_at],
            )?;
            Ok(())
        })
    }

    fn revoke_api_key<'a>(&'a self, key_id: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let changed = self.conn()?.execute(
                "UPDATE api_keys SET is_active = 0 WHERE id = ?1",
                params![key_id],
            )?;
            if changed == 0 {
                return Err(Error::NotFound(format!("api key {key_id}")));
            }
            Ok(())
        })
    }

    fn find_tenant_config<'a>(&'a self, tenant_id: &'a str) -> StoreFuture<'a, TenantConfig> {
        Box::pin(async move { self.tenant_config(tenant_id) })
    }

    fn create_oauth_installation<'a>(
        &'a self,
        installation: &'a OAuthInstallation,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move { Self::upsert_installation(&*self.conn()?, installation) })
    }

    fn find_oauth_installation<'a>(
        &'a self,
        installation_id: &'a str,
    ) -> StoreFuture<'a, OAuthInstallation> {
        Box::pin(async move { self.installation(installation_id) })
    }

    fn update_oauth_tokens<'a>(&'a self, update: &'a TokenUpdate) -> StoreFuture<'a, ()> {
        Box::pin(async move { self.update_tokens(update) })
    }

    fn mark_installation_revoked<'a>(&'a self, installation_id: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.set_installation_status(installation_id, InstallationStatus::Revoked)
        })
    }

    fn link_tenant_to_oauth<'a>(
        &'a self,
        tenant_id: &'a str,
        installation_id: &'a str,
        location_id: &'a str,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            Self::link_oauth(&*self.conn()?, tenant_id, installation_id, location_id)
        })
    }

    fn install_oauth<'a>(&'a self, bundle: &'a OAuthInstallBundle) -> StoreFuture<'a, String> {
        Box::pin(async move { self.install(bundle) })
    }

    fn remove_oauth_installation<'a>(&'a self, installation_id: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move { self.remove_installation(installation_id) })
    }

    fn list_installations_expiring_before(
        &self,
        before: u64,
    ) -> StoreFuture<'_, Vec<OAuthInstallation>> {
        Box::pin(async move { self.expiring_before(before) })
    }

    fn record_usage<'a>(&'a self, usage: &'a UsageRecord) -> StoreFuture<'a, ()> {
        Box::pin(async move { self.insert_usage(usage) })
    }
}
