//! Persisted records and their enumerations
//!
//! Timestamps are unix milliseconds. Fields holding secrets (`upstream_api_key`,
//! `access_token`, `refresh_token`) always carry cipher envelopes, never
//! plaintext, and are still kept out of `Debug` output.

use std::fmt;
use std::str::FromStr;

use rusqlite::ToSql;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// Unrecognised text for one of the stored enumerations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Enumerations persisted as TEXT columns.
macro_rules! text_enum {
    ($name:ident, $kind:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ParseEnumError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse::<$name>()
                    .map_err(|e| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

/// How a tenant's upstream calls are authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthMethod {
    #[serde(rename = "api_key")]
    ApiKey,
    #[serde(rename = "oauth")]
    OAuth,
}

text_enum!(AuthMethod, "auth method" {
    ApiKey => "api_key",
    OAuth => "oauth",
});

/// Capability an operation requires from the caller's plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
    Bulk,
}

text_enum!(Permission, "permission" {
    Read => "read",
    Write => "write",
    Bulk => "bulk",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Free,
    Starter,
    Pro,
    Enterprise,
}

text_enum!(PlanTier, "plan tier" {
    Free => "free",
    Starter => "starter",
    Pro => "pro",
    Enterprise => "enterprise",
});

impl PlanTier {
    /// Billable operations per tenant before `QuotaExceeded`.
    pub fn usage_limit(&self) -> u64 {
        match self {
            Self::Free => 1_000,
            Self::Starter => 10_000,
            Self::Pro => 100_000,
            Self::Enterprise => 1_000_000,
        }
    }

    pub fn permissions(&self) -> &'static [Permission] {
        match self {
            Self::Free => &[Permission::Read],
            Self::Starter => &[Permission::Read, Permission::Write],
            Self::Pro | Self::Enterprise => {
                &[Permission::Read, Permission::Write, Permission::Bulk]
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    Active,
    Suspended,
}

text_enum!(TenantStatus, "tenant status" {
    Active => "active",
    Suspended => "suspended",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallationStatus {
    Active,
    Revoked,
}

text_enum!(InstallationStatus, "installation status" {
    Active => "active",
    Revoked => "revoked",
});

#[derive(Clone)]
pub struct Tenant {
    pub id: String,
    pub subdomain: String,
    pub auth_method: AuthMethod,
    pub oauth_installation_id: Option<String>,
    pub location_id: Option<String>,
    /// Cipher envelope of the tenant's static upstream key (api_key tenants).
    pub upstream_api_key: Option<String>,
    pub plan_tier: PlanTier,
    pub usage_limit: u64,
    pub current_usage: u64,
    pub status: TenantStatus,
    pub created_at: u64,
    pub updated_at: u64,
}

impl fmt::Debug for Tenant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tenant")
            .field("id", &self.id)
            .field("subdomain", &self.subdomain)
            .field("auth_method", &self.auth_method)
            .field("oauth_installation_id", &self.oauth_installation_id)
            .field("location_id", &self.location_id)
            .field(
                "upstream_api_key",
                &self.upstream_api_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("plan_tier", &self.plan_tier)
            .field("usage_limit", &self.usage_limit)
            .field("current_usage", &self.current_usage)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl Tenant {
    pub fn is_active(&self) -> bool {
        self.status == TenantStatus::Active
    }

    pub fn quota_exhausted(&self) -> bool {
        self.current_usage >= self.usage_limit
    }
}

/// Stored half of a tenant API key. The raw key is never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKeyRecord {
    pub id: String,
    pub tenant_id: String,
    pub key_hash: String,
    pub key_prefix: String,
    pub is_active: bool,
    pub created_at: u64,
    pub last_used_at: Option<u64>,
}

#[derive(Clone)]
pub struct OAuthInstallation {
    pub id: String,
    pub tenant_id: String,
    pub location_id: String,
    pub company_id: Option<String>,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: u64,
    pub scopes: Vec<String>,
    pub status: InstallationStatus,
    pub installed_at: u64,
    pub last_refreshed_at: Option<u64>,
}

impl fmt::Debug for OAuthInstallation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthInstallation")
            .field("id", &self.id)
            .field("tenant_id", &self.tenant_id)
            .field("location_id", &self.location_id)
            .field("company_id", &self.company_id)
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl OAuthInstallation {
    pub fn is_active(&self) -> bool {
        self.status == InstallationStatus::Active
    }
}

/// New token pair for one installation, written in a single statement.
#[derive(Clone)]
pub struct TokenUpdate {
    pub installation_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: u64,
    pub refreshed_at: u64,
}

impl fmt::Debug for TokenUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenUpdate")
            .field("installation_id", &self.installation_id)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Tenant plus its installation, if it authenticates upstream via OAuth.
#[derive(Debug, Clone)]
pub struct TenantConfig {
    pub tenant: Tenant,
    pub installation: Option<OAuthInstallation>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRecord {
    pub tenant_id: String,
    pub operation: String,
    pub elapsed_ms: u64,
    /// Billable weight; zero for failed calls.
    pub cost: u64,
    pub status_code: u16,
    pub recorded_at: u64,
}

/// Everything a completed OAuth callback persists, written atomically.
///
/// When a tenant with the same subdomain already exists it is re-linked and
/// keeps its id; `tenant.id` is only used for a brand-new tenant.
#[derive(Debug, Clone)]
pub struct OAuthInstallBundle {
    pub tenant: Tenant,
    pub installation: OAuthInstallation,
    pub api_key: ApiKeyRecord,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enums_roundtrip_through_text() {
        for tier in [
            PlanTier::Free,
            PlanTier::Starter,
            PlanTier::Pro,
            PlanTier::Enterprise,
        ] {
            assert_eq!(tier.as_str().parse::<PlanTier>().unwrap(), tier);
        }
        assert_eq!("oauth".parse::<AuthMethod>().unwrap(), AuthMethod::OAuth);
        assert_eq!(AuthMethod::ApiKey.to_string(), "api_key");
    }

    #[test]
    fn unknown_text_is_rejected() {
        let err = "platinum".parse::<PlanTier>().unwrap_err();
        assert_eq!(err.to_string(), "unknown plan tier: platinum");
    }

    #[test]
    fn serde_names_match_column_text() {
        assert_eq!(
            serde_json::to_string(&AuthMethod::OAuth).unwrap(),
            "\"oauth\""
        );
        assert_eq!(
            serde_json::to_string(&PlanTier::Enterprise).unwrap(),
            "\"enterprise\""
        );
    }

    #[test]
    fn plan_limits_and_permissions() {
        assert_eq!(PlanTier::Free.usage_limit(), 1_000);
        assert_eq!(PlanTier::Enterprise.usage_limit(), 1_000_000);
        assert_eq!(PlanTier::Free.permissions(), &[Permission::Read]);
        assert!(PlanTier::Starter.permissions().contains(&Permission::Write));
        assert!(!PlanTier::Starter.permissions().contains(&Permission::Bulk));
        assert!(PlanTier::Pro.permissions().contains(&Permission::Bulk));
    }

    #[test]
    fn debug_hides_envelopes() {
        let installation = OAuthInstallation {
            id: "loc_1".into(),
            tenant_id: "t1".into(),
            location_id: "loc_1".into(),
            company_id: None,
            access_token: "ENVELOPE-A".into(),
            refresh_token: "ENVELOPE-R".into(),
            expires_at: 0,
            scopes: vec![],
            status: InstallationStatus::Active,
            installed_at: 0,
            last_refreshed_at: None,
        };
        let debug = format!("{installation:?}");
        assert!(!debug.contains("ENVELOPE"));
    }
}
