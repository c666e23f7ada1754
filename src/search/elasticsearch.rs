//! HTTP client wrapper for writing documents to Elasticsearch.

use super::{SearchIndex, SearchIndexError};
use crate::config::SearchSettings;
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::Serialize;
use serde_json::json;
use time::OffsetDateTime;

/// Document body stored for each indexed document.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct SearchDocument<'a> {
    document_id: i64,
    title: &'a str,
    content: &'a str,
    #[serde(with = "time::serde::rfc3339")]
    indexed_at_utc: OffsetDateTime,
}

/// Lightweight HTTP client for Elasticsearch document writes.
pub struct ElasticsearchService {
    pub(crate) client: Client,
    pub(crate) base_url: String,
    pub(crate) index: String,
}

impl ElasticsearchService {
    /// Construct a client for the configured cluster and index.
    pub fn new(settings: &SearchSettings) -> Result<Self, SearchIndexError> {
        let client = Client::builder().user_agent("dms-pipeline/0.1").build()?;
        let base_url = normalize_base_url(&settings.url).map_err(SearchIndexError::InvalidUrl)?;
        if settings.index.trim().is_empty() {
            return Err(SearchIndexError::InvalidUrl("index name is empty".into()));
        }
        tracing::debug!(url = %base_url, index = %settings.index, "Initialized Elasticsearch HTTP client");

        Ok(Self {
            client,
            base_url,
            index: settings.index.clone(),
        })
    }

    /// Create the index with explicit field mappings.
    pub async fn create_index(&self) -> Result<(), SearchIndexError> {
        let body = json!({
            "mappings": {
                "properties": {
                    "DocumentId": { "type": "long" },
                    "Title": { "type": "text" },
                    "Content": { "type": "text" },
                    "IndexedAtUtc": { "type": "date" }
                }
            }
        });

        let response = self
            .request(Method::PUT, &self.index)
            .json(&body)
            .send()
            .await?;

        // a concurrent worker may have created it first
        if response.status() == StatusCode::BAD_REQUEST {
            let body = response.text().await.unwrap_or_default();
            if body.contains("resource_already_exists_exception") {
                return Ok(());
            }
            return Err(SearchIndexError::UnexpectedStatus {
                status: StatusCode::BAD_REQUEST,
                body,
            });
        }

        self.ensure_success(response, || {
            tracing::info!(index = %self.index, "Search index created");
        })
        .await
    }

    async fn index_exists(&self) -> Result<bool, SearchIndexError> {
        let response = self.request(Method::HEAD, &self.index).send().await?;

        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => {
                let body = response.text().await.unwrap_or_default();
                let error = SearchIndexError::UnexpectedStatus { status, body };
                tracing::error!(index = %self.index, error = %error, "Index existence check failed");
                Err(error)
            }
        }
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        self.client.request(method, format_endpoint(&self.base_url, path))
    }

    async fn ensure_success<F>(
        &self,
        response: reqwest::Response,
        on_success: F,
    ) -> Result<(), SearchIndexError>
    where
        F: FnOnce(),
    {
        if response.status().is_success() {
            on_success();
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let error = SearchIndexError::UnexpectedStatus { status, body };
            tracing::error!(error = %error, "Elasticsearch request failed");
            Err(error)
        }
    }
}

#[async_trait]
impl SearchIndex for ElasticsearchService {
    async fn ensure_index(&self) -> Result<(), SearchIndexError> {
        if self.index_exists().await? {
            return Ok(());
        }
        tracing::debug!(index = %self.index, "Creating search index");
        self.create_index().await
    }

    async fn upsert_document(
        &self,
        document_id: i64,
        title: &str,
        text: &str,
    ) -> Result<(), SearchIndexError> {
        let document = SearchDocument {
            document_id,
            title,
            content: text,
            indexed_at_utc: OffsetDateTime::now_utc(),
        };

        let response = self
            .request(Method::PUT, &format!("{}/_doc/{document_id}", self.index))
            .json(&document)
            .send()
            .await?;

        self.ensure_success(response, || {
            tracing::debug!(index = %self.index, document_id, chars = text.len(), "Document indexed");
        })
        .await
    }
}

fn normalize_base_url(url: &str) -> Result<String, String> {
    let mut parsed = reqwest::Url::parse(url).map_err(|err| err.to_string())?;
    let path = parsed.path().trim_end_matches('/').to_string();
    parsed.set_path(&path);
    Ok(parsed.to_string())
}

fn format_endpoint(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{base}/{path}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{
        Method::{HEAD, PUT},
        MockServer,
    };

    fn service(server: &MockServer) -> ElasticsearchService {
        ElasticsearchService {
            client: Client::builder()
                .user_agent("dms-pipeline-test")
                .build()
                .expect("client"),
            base_url: server.base_url(),
            index: "documents".into(),
        }
    }

    #[tokio::test]
    async fn upsert_puts_document_under_its_id() {
        let server = MockServer::start_async().await;
        let service = service(&server);

        let mock = server
            .mock_async(|when, then| {
                when.method(PUT)
                    .path("/documents/_doc/42")
                    .body_contains("\"DocumentId\":42")
                    .body_contains("\"Title\":\"Invoice\"")
                    .body_contains("\"Content\":\"hello world\"")
                    .body_contains("\"IndexedAtUtc\"");
                then.status(201).json_body(json!({ "result": "created" }));
            })
            .await;

        service
            .upsert_document(42, "Invoice", "hello world")
            .await
            .expect("upsert");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn repeated_upserts_target_the_same_document() {
        let server = MockServer::start_async().await;
        let service = service(&server);

        let mock = server
            .mock_async(|when, then| {
                when.method(PUT).path("/documents/_doc/7");
                then.status(200).json_body(json!({ "result": "updated" }));
            })
            .await;

        for _ in 0..3 {
            service.upsert_document(7, "t", "x").await.expect("upsert");
        }
        mock.assert_hits_async(3).await;
    }

    #[tokio::test]
    async fn upsert_surfaces_error_status() {
        let server = MockServer::start_async().await;
        let service = service(&server);

        server
            .mock_async(|when, then| {
                when.method(PUT).path("/documents/_doc/1");
                then.status(503).body("cluster unavailable");
            })
            .await;

        let error = service
            .upsert_document(1, "t", "x")
            .await
            .expect_err("error status");
        assert!(matches!(
            error,
            SearchIndexError::UnexpectedStatus { status, .. } if status == StatusCode::SERVICE_UNAVAILABLE
        ));
    }

    #[tokio::test]
    async fn ensure_index_creates_missing_index() {
        let server = MockServer::start_async().await;
        let service = service(&server);

        let head = server
            .mock_async(|when, then| {
                when.method(HEAD).path("/documents");
                then.status(404);
            })
            .await;
        let create = server
            .mock_async(|when, then| {
                when.method(PUT)
                    .path("/documents")
                    .body_contains("\"IndexedAtUtc\":{\"type\":\"date\"}");
                then.status(200).json_body(json!({ "acknowledged": true }));
            })
            .await;

        service.ensure_index().await.expect("ensure index");
        head.assert_async().await;
        create.assert_async().await;
    }

    #[tokio::test]
    async fn ensure_index_skips_existing_index() {
        let server = MockServer::start_async().await;
        let service = service(&server);

        server
            .mock_async(|when, then| {
                when.method(HEAD).path("/documents");
                then.status(200);
            })
            .await;
        let create = server
            .mock_async(|when, then| {
                when.method(PUT).path("/documents");
                then.status(200);
            })
            .await;

        service.ensure_index().await.expect("ensure index");
        create.assert_hits_async(0).await;
    }

    #[tokio::test]
    async fn create_tolerates_concurrent_creation() {
        let server = MockServer::start_async().await;
        let service = service(&server);

        server
            .mock_async(|when, then| {
                when.method(PUT).path("/documents");
                then.status(400).json_body(json!({
                    "error": { "type": "resource_already_exists_exception" }
                }));
            })
            .await;

        service.create_index().await.expect("already exists is fine");
    }

    #[test]
    fn normalize_base_url_trims_trailing_slash() {
        assert_eq!(
            normalize_base_url("http://elasticsearch:9200/").expect("url"),
            "http://elasticsearch:9200/"
        );
        assert_eq!(
            normalize_base_url("http://proxy/es/").expect("url"),
            "http://proxy/es"
        );
        assert!(normalize_base_url("not a url").is_err());
    }

    #[test]
    fn format_endpoint_joins_segments() {
        assert_eq!(
            format_endpoint("http://es:9200/", "/documents/_doc/1"),
            "http://es:9200/documents/_doc/1"
        );
    }
}
