//! PostgREST-style REST backend.
//!
//! Each table is exposed at `{base}/rest/v1/{table}`. Rows are filtered with
//! `column=op.value` query parameters, and writes ask for the affected rows
//! back with `Prefer: return=representation`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde_json::Value;

use crate::config::SyncConfig;
use crate::error::{ConfigError, StoreError};
use crate::protocol;
use crate::record::{Fields, ID, Record};
use crate::registry::Table;
use crate::store::{Predicate, StoreAdapter};

pub struct RestRemote {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    access_token: Option<String>,
}

impl RestRemote {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Connectivity(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            access_token: None,
        })
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self, ConfigError> {
        let url = config
            .remote_url
            .as_deref()
            .ok_or(ConfigError::Missing("TASKSYNC_REMOTE_URL"))?;
        Self::new(url, config.api_key.clone(), config.request_timeout()).map_err(|_| {
            ConfigError::Invalid {
                var: "TASKSYNC_REMOTE_URL",
                value: url.to_string(),
            }
        })
    }

    /// Authenticate as a signed-in user instead of with the bare API key.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, table: Table) -> RequestBuilder {
        let url = format!("{}/rest/v1/{}", self.base_url, table.name());
        let mut builder = self.client.request(method, url);
        if let Some(key) = &self.api_key {
            builder = builder.header("apikey", key);
        }
        if let Some(token) = self.access_token.as_ref().or(self.api_key.as_ref()) {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    /// Send a request and decode the returned rows.
    async fn send(&self, table: Table, builder: RequestBuilder) -> Result<Vec<Record>, StoreError> {
        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, body));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| StoreError::validation(format!("unreadable {table} response: {e}")))?;
        match body {
            Value::Array(rows) => rows
                .iter()
                .map(|row| protocol::from_wire(table, row))
                .collect(),
            Value::Object(_) => Ok(vec![protocol::from_wire(table, &body)?]),
            Value::Null => Ok(Vec::new()),
            other => Err(StoreError::validation(format!(
                "unexpected {table} response: {other}"
            ))),
        }
    }
}

fn transport_error(err: reqwest::Error) -> StoreError {
    if err.is_timeout() {
        StoreError::Connectivity(format!("request timed out: {err}"))
    } else {
        StoreError::Connectivity(err.to_string())
    }
}

/// Map an HTTP failure onto the store error taxonomy.
fn status_error(status: StatusCode, body: String) -> StoreError {
    let message = format!("HTTP {status}: {body}");
    match status {
        StatusCode::CONFLICT => StoreError::Conflict(message),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            StoreError::Connectivity(message)
        }
        s if s.is_server_error() => StoreError::Connectivity(message),
        _ => StoreError::Validation(message),
    }
}

/// Render a normalized internal value as a PostgREST filter operand.
fn filter_operand(table: Table, field: &str, value: &Value) -> Result<(String, String), StoreError> {
    let meta = table.meta();
    let column = meta
        .field(field)
        .ok_or_else(|| StoreError::validation(format!("{table} has no field {field:?}")))?;
    let mut single = Fields::new();
    single.insert(field.to_string(), value.clone());
    let wire = protocol::to_wire(table, &single)?;
    let operand = match wire.get(column.column) {
        None | Some(Value::Null) => "is.null".to_string(),
        Some(Value::String(s)) => format!("eq.{s}"),
        Some(other) => format!("eq.{other}"),
    };
    Ok((column.column.to_string(), operand))
}

/// Translate a predicate into query parameters.
fn filter_params(table: Table, predicate: &Predicate) -> Result<Vec<(String, String)>, StoreError> {
    let mut params = Vec::new();
    push_filters(table, predicate, &mut params)?;
    Ok(params)
}

fn push_filters(
    table: Table,
    predicate: &Predicate,
    params: &mut Vec<(String, String)>,
) -> Result<(), StoreError> {
    match predicate {
        Predicate::All => {}
        Predicate::Eq(field, value) => params.push(filter_operand(table, field, value)?),
        Predicate::ModifiedSince(ts) => {
            params.push((
                "updated_at".to_string(),
                format!("gte.{}", protocol::format_timestamp(*ts)?),
            ));
        }
        Predicate::Dirty => {
            return Err(StoreError::Unsupported(
                "dirty filter on the remote store".into(),
            ));
        }
        Predicate::And(parts) => {
            for part in parts {
                push_filters(table, part, params)?;
            }
        }
    }
    Ok(())
}

fn id_filter(id: &str) -> [(&'static str, String); 1] {
    [(ID, format!("eq.{id}"))]
}

#[async_trait]
impl StoreAdapter for RestRemote {
    async fn get(&self, table: Table, id: &str) -> Result<Option<Record>, StoreError> {
        let builder = self
            .request(Method::GET, table)
            .query(&[("select", "*")])
            .query(&id_filter(id));
        Ok(self.send(table, builder).await?.into_iter().next())
    }

    async fn query(&self, table: Table, predicate: &Predicate) -> Result<Vec<Record>, StoreError> {
        let params = filter_params(table, predicate)?;
        let builder = self
            .request(Method::GET, table)
            .query(&[("select", "*"), ("order", "updated_at.asc")])
            .query(&params);
        self.send(table, builder).await
    }

    async fn create(&self, table: Table, record: &Record) -> Result<Option<Record>, StoreError> {
        let row = protocol::to_wire(table, record.fields())?;
        let builder = self
            .request(Method::POST, table)
            .header("Prefer", "return=representation")
            .json(&row);
        Ok(self.send(table, builder).await?.into_iter().next())
    }

    async fn update(
        &self,
        table: Table,
        id: &str,
        patch: &Fields,
    ) -> Result<Option<Record>, StoreError> {
        let mut row = protocol::to_wire(table, patch)?;
        row.remove(ID);
        let builder = self
            .request(Method::PATCH, table)
            .query(&id_filter(id))
            .header("Prefer", "return=representation")
            .json(&row);
        Ok(self.send(table, builder).await?.into_iter().next())
    }

    async fn delete(&self, table: Table, id: &str) -> Result<Option<Record>, StoreError> {
        let builder = self
            .request(Method::DELETE, table)
            .query(&id_filter(id))
            .header("Prefer", "return=representation");
        Ok(self.send(table, builder).await?.into_iter().next())
    }
}
