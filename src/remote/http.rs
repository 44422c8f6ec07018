//! HTTP remote store
//!
//! Talks to a document REST API (`/_api/database/{db}/document/{collection}`)
//! where each document carries an `owner` field scoping it to an identity
//! and a `_key` that maps to the engine's `id`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};

use super::{RemoteError, RemoteResult, RemoteStore};
use crate::connectivity::ReachabilityProbe;
use crate::record::{Payload, Record, ID_FIELD};

const OWNER_FIELD: &str = "owner";
const KEY_FIELD: &str = "_key";

pub struct HttpRemote {
    base_url: String,
    database: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpRemote {
    pub fn new(base_url: &str, database: &str, timeout: Duration) -> RemoteResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(4)
            .build()
            .map_err(|e| RemoteError::Network(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            database: database.to_string(),
            token: None,
            client,
        })
    }

    pub fn with_token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    fn document_path(&self, collection: &str) -> String {
        format!(
            "{}/_api/database/{}/document/{}",
            self.base_url, self.database, collection
        )
    }

    async fn send(
        &self,
        method: reqwest::Method,
        url: &str,
        body: Option<&Value>,
    ) -> RemoteResult<Value> {
        let mut request = self.client.request(method, url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        if let Some(b) = body {
            request = request.json(b);
        }

        let response = request.send().await.map_err(classify_transport)?;
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(classify_status(status, url, &error_text));
        }

        let text = response
            .text()
            .await
            .map_err(|e| RemoteError::Network(format!("failed to read response: {}", e)))?;
        if text.is_empty() {
            return Ok(Value::Null);
        }

        serde_json::from_str(&text)
            .map_err(|e| RemoteError::Rejected(format!("unparseable response: {} - {}", e, text)))
    }
}

fn classify_transport(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Timeout
    } else {
        RemoteError::Network(format!("HTTP request failed: {}", err))
    }
}

fn classify_status(status: StatusCode, url: &str, body: &str) -> RemoteError {
    let message = format!("HTTP {} {}: {}", status, url, body);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::PermissionDenied(message),
        StatusCode::NOT_FOUND => RemoteError::NotFound(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => RemoteError::Timeout,
        StatusCode::TOO_MANY_REQUESTS => RemoteError::Network(message),
        s if s.is_client_error() => RemoteError::Rejected(message),
        _ => RemoteError::Network(message),
    }
}

/// Remote document -> engine record (`_key` becomes `id`, owner dropped)
fn to_record(document: Value) -> Option<Record> {
    let mut map = match document {
        Value::Object(map) => map,
        _ => return None,
    };
    let key = map.remove(KEY_FIELD)?;
    map.remove(OWNER_FIELD);
    map.retain(|k, _| !k.starts_with('_'));
    map.insert(ID_FIELD.to_string(), key);
    Some(map)
}

fn to_document(identity: &str, key: Option<&str>, data: &Payload) -> Value {
    let mut document = data.clone();
    document.remove(ID_FIELD);
    document.insert(OWNER_FIELD.to_string(), json!(identity));
    if let Some(key) = key {
        document.insert(KEY_FIELD.to_string(), json!(key));
    }
    Value::Object(document)
}

#[async_trait]
impl RemoteStore for HttpRemote {
    async fn create_record(
        &self,
        collection: &str,
        identity: &str,
        client_id: &str,
        data: &Payload,
    ) -> RemoteResult<String> {
        // Temporary ids are device-local; let the server assign a key
        let key = if crate::record::is_temporary_id(client_id) {
            None
        } else {
            Some(client_id)
        };
        let document = to_document(identity, key, data);

        let response = self
            .send(
                reqwest::Method::POST,
                &self.document_path(collection),
                Some(&document),
            )
            .await?;

        response
            .get(KEY_FIELD)
            .and_then(|k| k.as_str())
            .map(|k| k.to_string())
            .ok_or_else(|| RemoteError::Rejected("create response carried no _key".to_string()))
    }

    async fn update_record(
        &self,
        collection: &str,
        identity: &str,
        id: &str,
        partial: &Payload,
    ) -> RemoteResult<()> {
        let payload = json!({
            "document": to_document(identity, None, partial),
            "merge": true
        });
        let url = format!("{}/{}", self.document_path(collection), id);
        self.send(reqwest::Method::PUT, &url, Some(&payload)).await?;
        Ok(())
    }

    async fn delete_record(&self, collection: &str, _identity: &str, id: &str) -> RemoteResult<()> {
        let url = format!("{}/{}", self.document_path(collection), id);
        match self.send(reqwest::Method::DELETE, &url, None).await {
            // Already gone
            Err(RemoteError::NotFound(_)) => Ok(()),
            other => other.map(|_| ()),
        }
    }

    async fn fetch_all(&self, collection: &str, identity: &str) -> RemoteResult<Vec<Record>> {
        let payload = json!({
            "database": self.database,
            "sdbql": "FOR d IN @@collection FILTER d.owner == @owner RETURN d",
            "bind_vars": {"@collection": collection, "owner": identity}
        });
        let url = format!("{}/_api/query", self.base_url);
        let response = self
            .send(reqwest::Method::POST, &url, Some(&payload))
            .await?;

        Ok(response
            .get("result")
            .and_then(|r| r.as_array())
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter_map(to_record)
            .collect())
    }
}

#[async_trait]
impl ReachabilityProbe for HttpRemote {
    async fn probe(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        self.send(reqwest::Method::GET, &url, None).await.is_ok()
    }
}
