//! Catalog entries backed by a single upstream HTTP call
//!
//! Each entry maps an operation name to `METHOD {base_url}{path}`. Path
//! placeholders like `{contact_id}` are filled from params (consumed params are
//! removed). `{location_id}` always comes from the tenant credential; a
//! `location_id` param that names a different location is rejected.
//! GET and DELETE send the remaining params as a query string, every other
//! method sends them as a JSON body. The tenant credential goes out as a
//! bearer token.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, Url};
use serde::Deserialize;
use serde_json::{Map, Value};
use tenant_access::UpstreamCredential;
use tenant_store::Permission;
use tracing::debug;

use crate::catalog::{Operation, OperationFuture, validate_name};
use crate::error::{Error, Result};

const ERROR_BODY_LIMIT: usize = 2048;
const LOCATION_PLACEHOLDER: &str = "location_id";

/// One `[[operations]]` config entry.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpOperationSpec {
    pub name: String,
    #[serde(default = "default_method")]
    pub method: String,
    pub path: String,
    #[serde(default = "default_permission")]
    pub permission: Permission,
    #[serde(default = "default_cost")]
    pub cost: u64,
}

fn default_method() -> String {
    "GET".into()
}

fn default_permission() -> Permission {
    Permission::Read
}

fn default_cost() -> u64 {
    1
}

/// Shared upstream endpoint, client and timeout.
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    base_url: Url,
    client: reqwest::Client,
    timeout: Duration,
}

impl UpstreamTarget {
    pub fn new(base_url: &str, client: reqwest::Client, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| Error::Catalog(format!("invalid upstream base_url {base_url:?}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(Error::Catalog("upstream base_url cannot be a base".into()));
        }
        Ok(Self {
            base_url,
            client,
            timeout,
        })
    }
}

pub struct HttpOperation {
    name: String,
    method: Method,
    path: String,
    permission: Permission,
    cost: u64,
    target: Arc<UpstreamTarget>,
}

impl std::fmt::Debug for HttpOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpOperation")
            .field("name", &self.name)
            .field("method", &self.method)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl HttpOperation {
    /// Validate a config entry and bind it to the upstream target.
    pub fn from_spec(spec: HttpOperationSpec, target: Arc<UpstreamTarget>) -> Result<Self> {
        validate_name(&spec.name)?;
        let method = spec
            .method
            .to_ascii_uppercase()
            .parse::<Method>()
            .map_err(|_| Error::Catalog(format!("{}: invalid method {:?}", spec.name, spec.method)))?;
        if !spec.path.starts_with('/') {
            return Err(Error::Catalog(format!(
                "{}: path must start with '/'",
                spec.name
            )));
        }
        if spec.path.matches('{').count() != spec.path.matches('}').count() {
            return Err(Error::Catalog(format!(
                "{}: unbalanced placeholder in path",
                spec.name
            )));
        }
        if spec.cost == 0 {
            return Err(Error::Catalog(format!("{}: cost must be at least 1", spec.name)));
        }
        Ok(Self {
            name: spec.name,
            method,
            path: spec.path,
            permission: spec.permission,
            cost: spec.cost,
            target,
        })
    }

    fn build_url(&self, location_id: Option<&str>, params: &mut Map<String, Value>) -> Result<Url> {
        let mut url = self.target.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| Error::Catalog("upstream base_url cannot be a base".into()))?;
            segments.pop_if_empty();
            for segment in self.path.trim_start_matches('/').split('/') {
                segments.push(&render_segment(segment, location_id, params)?);
            }
        }
        Ok(url)
    }

    async fn call(&self, credential: &UpstreamCredential, params: Value) -> Result<Value> {
        let mut params = match params {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            _ => return Err(Error::InvalidParams("params must be a JSON object".into())),
        };
        check_location(credential.location_id.as_deref(), &params)?;
        let url = self.build_url(credential.location_id.as_deref(), &mut params)?;

        let mut request = self
            .target
            .client
            .request(self.method.clone(), url)
            .bearer_auth(credential.token.expose())
            .header(reqwest::header::ACCEPT, "application/json")
            .timeout(self.target.timeout);
        request = if self.method == Method::GET || self.method == Method::DELETE {
            request.query(&query_pairs(&params))
        } else {
            request.json(&Value::Object(params))
        };

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Transport(format!(
                    "upstream timed out after {}s",
                    self.target.timeout.as_secs()
                ))
            } else {
                Error::Transport(e.to_string())
            }
        })?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Transport(format!("failed to read upstream body: {e}")))?;
        debug!(operation = %self.name, status = status.as_u16(), "upstream responded");

        if !status.is_success() {
            return Err(Error::Upstream {
                status: status.as_u16(),
                body: truncate(body),
            });
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body)
            .map_err(|e| Error::Transport(format!("upstream returned invalid JSON: {e}")))
    }
}

impl Operation for HttpOperation {
    fn name(&self) -> &str {
        &self.name
    }

    fn permission(&self) -> Permission {
        self.permission
    }

    fn cost(&self) -> u64 {
        self.cost
    }

    fn invoke<'a>(&'a self, credential: &'a UpstreamCredential, params: Value) -> OperationFuture<'a> {
        Box::pin(self.call(credential, params))
    }
}

/// Fill `{name}` placeholders in one path segment.
fn render_segment(
    segment: &str,
    location_id: Option<&str>,
    params: &mut Map<String, Value>,
) -> Result<String> {
    let mut out = String::with_capacity(segment.len());
    let mut rest = segment;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after
            .find('}')
            .ok_or_else(|| Error::Catalog(format!("unclosed placeholder in {segment:?}")))?;
        let key = &after[..close];
        let value = if key == LOCATION_PLACEHOLDER {
            params.remove(key);
            location_id
                .map(str::to_string)
                .ok_or_else(|| Error::InvalidParams("tenant has no location".into()))?
        } else {
            match params.remove(key) {
                Some(value) => scalar(&value).ok_or_else(|| {
                    Error::InvalidParams(format!(
                        "path parameter {key:?} must be a string or number"
                    ))
                })?,
                None => {
                    return Err(Error::InvalidParams(format!(
                        "missing path parameter {key:?}"
                    )));
                }
            }
        };
        if value.is_empty() {
            return Err(Error::InvalidParams(format!(
                "path parameter {key:?} is empty"
            )));
        }
        out.push_str(&value);
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// The tenant's location is fixed by its credential, never by the caller.
fn check_location(location_id: Option<&str>, params: &Map<String, Value>) -> Result<()> {
    match (location_id, params.get(LOCATION_PLACEHOLDER)) {
        (Some(bound), Some(requested)) if scalar(requested).as_deref() != Some(bound) => Err(
            Error::InvalidParams("location_id does not match the tenant's location".into()),
        ),
        _ => Ok(()),
    }
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn query_pairs(params: &Map<String, Value>) -> Vec<(String, String)> {
    params
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k.clone(), scalar(v).unwrap_or_else(|| v.to_string())))
        .collect()
}

fn truncate(mut body: String) -> String {
    if body.len() > ERROR_BODY_LIMIT {
        let mut cut = ERROR_BODY_LIMIT;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}
