//! HTTP client for a PostgREST-style backend.
//!
//! Tables live under `/rest/v1/{table}`; version-guarded writes, deltas and
//! multi-record operations are RPCs under `/rest/v1/rpc/{name}`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value as JsonValue};

use crate::db::{Filter, Order, Query};
use crate::error::{Error, Result};
use crate::models::{Currency, EntityId, Table};
use crate::sync::{DeltaRequest, DeltaResponse};
use crate::util::{compact_text, is_http_url, normalize_text_option};

use super::{RemoteClient, RemoteError, RemoteResult, WriteResponse};

const REQUEST_TIMEOUT_SECS: u64 = 15;

#[derive(Clone)]
pub struct HttpRemoteClient {
    base_url: String,
    api_key: String,
    access_token: Option<String>,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpRemoteClient {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpRemoteClient")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish_non_exhaustive()
    }
}

impl HttpRemoteClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let base_url = normalize_text_option(Some(base_url.into()))
            .ok_or_else(|| Error::InvalidInput("remote URL must not be empty".to_string()))?;
        if !is_http_url(&base_url) {
            return Err(Error::InvalidInput(
                "remote URL must include http:// or https://".to_string(),
            ));
        }
        let api_key = normalize_text_option(Some(api_key.into()))
            .ok_or_else(|| Error::InvalidInput("API key must not be empty".to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            access_token: None,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()?,
        })
    }

    /// Authenticate requests as a user instead of the anonymous key
    #[must_use]
    pub fn with_access_token(mut self, token: Option<String>) -> Self {
        self.access_token = normalize_text_option(token);
        self
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let token = self.access_token.as_deref().unwrap_or(&self.api_key);
        self.client
            .request(method, format!("{}/rest/v1/{path}", self.base_url))
            .header("apikey", &self.api_key)
            .bearer_auth(token)
            .header(reqwest::header::ACCEPT, "application/json")
    }

    async fn send<T: DeserializeOwned>(builder: RequestBuilder) -> RemoteResult<T> {
        let response = builder
            .send()
            .await
            .map_err(|error| RemoteError::unreachable(format!("request failed: {error}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(parse_error_body(status, &body));
        }

        response
            .json::<T>()
            .await
            .map_err(|error| RemoteError::unreachable(format!("invalid response body: {error}")))
    }

    async fn call<T: DeserializeOwned>(&self, name: &str, args: &JsonValue) -> RemoteResult<T> {
        Self::send(self.request(Method::POST, &format!("rpc/{name}")).json(args)).await
    }
}

#[async_trait]
impl RemoteClient for HttpRemoteClient {
    async fn fetch(&self, table: Table, id: EntityId) -> RemoteResult<Option<JsonValue>> {
        let rows: Vec<JsonValue> = Self::send(
            self.request(Method::GET, table.name())
                .query(&[("select", "*".to_string()), ("id", format!("eq.{id}"))]),
        )
        .await?;
        Ok(rows.into_iter().next())
    }

    async fn select(&self, table: Table, query: &Query) -> RemoteResult<Vec<JsonValue>> {
        Self::send(
            self.request(Method::GET, table.name())
                .query(&query_params(query)),
        )
        .await
    }

    async fn write(
        &self,
        table: Table,
        record: JsonValue,
        expected_version: i64,
    ) -> RemoteResult<JsonValue> {
        let args = json!({
            "p_table": table.name(),
            "p_record": record,
            "p_expected_version": expected_version,
        });
        let response: WriteResponse<JsonValue> = self.call("versioned_write", &args).await?;
        response.into_remote_result()
    }

    async fn changes_since(&self, request: &DeltaRequest) -> RemoteResult<DeltaResponse<JsonValue>> {
        let args = serde_json::to_value(request)
            .map_err(|error| RemoteError::unreachable(error.to_string()))?;
        self.call("changes_since", &args).await
    }

    async fn rpc(&self, name: &str, args: JsonValue) -> RemoteResult<JsonValue> {
        self.call(name, &args).await
    }

    async fn list_currencies(&self) -> RemoteResult<Vec<Currency>> {
        Self::send(self.request(Method::GET, Table::Currencies.name()).query(&[
            ("select", "code,name,symbol,decimals"),
            ("order", "code.asc"),
        ]))
        .await
    }
}

/// Render a query as PostgREST URL parameters
fn query_params(query: &Query) -> Vec<(String, String)> {
    let mut params = vec![("select".to_string(), "*".to_string())];
    for filter in &query.filters {
        let param = match filter {
            Filter::Active => ("deleted_at".to_string(), "is.null".to_string()),
            Filter::Tombstoned => ("deleted_at".to_string(), "not.is.null".to_string()),
            // Sync status is local-only; every remote row is acknowledged
            Filter::Status(_) => continue,
            Filter::VersionAfter(version) => ("version".to_string(), format!("gt.{version}")),
            Filter::Eq(column, value) => {
                let rendered = match value {
                    JsonValue::String(text) => text.clone(),
                    other => other.to_string(),
                };
                ((*column).to_string(), format!("eq.{rendered}"))
            }
        };
        params.push(param);
    }

    let order = match query.order {
        Order::UpdatedDesc => "updated_at.desc",
        Order::VersionAsc => "version.asc",
    };
    params.push(("order".to_string(), order.to_string()));

    if let Some(limit) = query.limit {
        params.push(("limit".to_string(), limit.to_string()));
        params.push(("offset".to_string(), query.offset.to_string()));
    }
    params
}

fn parse_error_body(status: StatusCode, body: &str) -> RemoteError {
    let mut error = serde_json::from_str::<RemoteError>(body)
        .ok()
        .filter(|parsed| parsed.code.is_some() || !parsed.message.is_empty())
        .unwrap_or_else(|| {
            let trimmed = compact_text(body);
            if trimmed.is_empty() {
                RemoteError::unreachable(format!("HTTP {}", status.as_u16()))
            } else {
                RemoteError::unreachable(format!("{trimmed} ({})", status.as_u16()))
            }
        });
    if status == StatusCode::CONFLICT && error.code.is_none() {
        error.conflict = true;
    }
    error
}
