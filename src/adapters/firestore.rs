use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde_json::{json, Map, Value};
use tracing::{debug, instrument};

use crate::config::RemoteConfig;
use crate::error::RemoteError;
use crate::ports::DocumentStore;

/// Collection listed by `probe`.
const PROBE_COLLECTION: &str = "containers";

/// Remote document store client speaking the Firestore REST v1 API.
///
/// `put` is a mask-less PATCH (full overwrite), `merge` a PATCH with an update
/// mask over the given top-level fields, and `update` the same with a
/// `currentDocument.exists` precondition.
pub struct FirestoreClient {
    http: Client,
    documents_url: Url,
    auth_token: Option<String>,
}

impl FirestoreClient {
    pub fn new(config: &RemoteConfig) -> anyhow::Result<Self> {
        if config.project_id.trim().is_empty() {
            anyhow::bail!("REMOTE_PROJECT_ID must be set");
        }

        let mut documents_url = Url::parse(&config.base_url)
            .with_context(|| format!("invalid REMOTE_BASE_URL '{}'", config.base_url))?;
        documents_url
            .path_segments_mut()
            .map_err(|_| anyhow::anyhow!("REMOTE_BASE_URL cannot be a base URL"))?
            .pop_if_empty()
            .extend([
                "projects",
                config.project_id.as_str(),
                "databases",
                config.database.as_str(),
                "documents",
            ]);

        let http = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .context("failed to build remote store HTTP client")?;

        Ok(Self {
            http,
            documents_url,
            auth_token: config.auth_token.clone(),
        })
    }

    fn document_url(&self, path: &str) -> Result<Url, RemoteError> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if segments.is_empty() {
            return Err(RemoteError::InvalidPayload(format!("empty document path '{}'", path)));
        }

        let mut url = self.documents_url.clone();
        url.path_segments_mut()
            .map_err(|_| RemoteError::InvalidPayload("remote base URL has no path".into()))?
            .extend(segments);
        Ok(url)
    }

    /// `collection_path/document_id`, with the id kept as exactly one segment.
    fn collection_document_url(&self, collection_path: &str, document_id: &str) -> Result<Url, RemoteError> {
        if document_id.trim().is_empty() || document_id.contains('/') {
            return Err(RemoteError::InvalidPayload(format!(
                "'{}' is not a valid document id",
                document_id
            )));
        }

        let mut url = self.document_url(collection_path)?;
        url.path_segments_mut()
            .map_err(|_| RemoteError::InvalidPayload("remote base URL has no path".into()))?
            .push(document_id);
        Ok(url)
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> Result<(), RemoteError> {
        let mut request = self.http.request(method, url).query(query);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_builder() {
                RemoteError::InvalidPayload(e.to_string())
            } else {
                RemoteError::Unreachable(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let mut detail = response.text().await.unwrap_or_default();
        detail.truncate(512);
        let message = format!("{}: {}", status, detail.trim());

        if is_outage(status) {
            Err(RemoteError::Unreachable(message))
        } else {
            Err(RemoteError::Rejected(message))
        }
    }

    async fn patch(
        &self,
        url: Url,
        fields: &Value,
        masked: bool,
        must_exist: bool,
    ) -> Result<(), RemoteError> {
        let fields = fields
            .as_object()
            .ok_or_else(|| RemoteError::InvalidPayload("document fields must be a JSON object".into()))?;

        let mut query: Vec<(&str, String)> = Vec::new();
        if masked {
            query.extend(fields.keys().map(|k| ("updateMask.fieldPaths", field_path(k))));
        }
        if must_exist {
            query.push(("currentDocument.exists", "true".to_string()));
        }

        self.send(Method::PATCH, url, &query, Some(json!({ "fields": encode_fields(fields) })))
            .await
    }
}

#[async_trait]
impl DocumentStore for FirestoreClient {
    #[instrument(skip(self, fields), fields(collection = %collection_path, document = %document_id))]
    async fn put(&self, collection_path: &str, document_id: &str, fields: &Value) -> Result<(), RemoteError> {
        let url = self.collection_document_url(collection_path, document_id)?;
        self.patch(url, fields, false, false).await?;
        debug!("document written");
        Ok(())
    }

    #[instrument(skip(self, fields), fields(collection = %collection_path, document = %document_id))]
    async fn merge(&self, collection_path: &str, document_id: &str, fields: &Value) -> Result<(), RemoteError> {
        let url = self.collection_document_url(collection_path, document_id)?;
        self.patch(url, fields, true, false).await?;
        debug!("document merged");
        Ok(())
    }

    #[instrument(skip(self, fields), fields(document = %document_path))]
    async fn update(&self, document_path: &str, fields: &Value) -> Result<(), RemoteError> {
        let url = self.document_url(document_path)?;
        self.patch(url, fields, true, true).await?;
        debug!("document updated");
        Ok(())
    }

    async fn probe(&self) -> Result<(), RemoteError> {
        let url = self.document_url(PROBE_COLLECTION)?;
        self.send(Method::GET, url, &[("pageSize", "1".to_string())], None).await
    }
}

/// Statuses that say "the service is not usable right now" rather than
/// "this write is wrong".
fn is_outage(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
}

/// Quotes a top-level field name for an update mask when it is not a plain
/// identifier.
fn field_path(name: &str) -> String {
    let simple = name.chars().next().map_or(false, |c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if simple {
        name.to_string()
    } else {
        format!("`{}`", name.replace('\\', "\\\\").replace('`', "\\`"))
    }
}

fn encode_fields(fields: &Map<String, Value>) -> Value {
    Value::Object(
        fields
            .iter()
            .map(|(k, v)| (k.clone(), encode_value(v)))
            .collect(),
    )
}

/// JSON value to Firestore typed value.
pub fn encode_value(value: &Value) -> Value {
    match value {
        Value::Null => json!({ "nullValue": null }),
        Value::Bool(b) => json!({ "booleanValue": b }),
        Value::Number(n) => match n.as_i64() {
            Some(i) => json!({ "integerValue": i.to_string() }),
            None => json!({ "doubleValue": n.as_f64() }),
        },
        Value::String(s) => json!({ "stringValue": s }),
        Value::Array(items) => json!({
            "arrayValue": { "values": items.iter().map(encode_value).collect::<Vec<_>>() }
        }),
        Value::Object(map) => json!({ "mapValue": { "fields": encode_fields(map) } }),
    }
}
