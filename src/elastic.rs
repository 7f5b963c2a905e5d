//! Elasticsearch clients
//!
//! - [`ElasticBackend`] counts hits with the `_count` API
//! - [`KibanaStore`] reads saved searches out of the `.kibana` index
//!
//! Saved-search documents carry their query as a JSON string nested inside
//! the document (`kibanaSavedObjectMeta.searchSourceJSON`). Both layers are
//! decoded into typed structs; a document that does not fit is skipped on its
//! own without failing the whole fetch.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::SecondsFormat;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument, trace, warn};

use crate::backend::{QueryBackend, RuleStore, TimeWindow};
use crate::config::{ElasticConfig, KibanaConfig};
use crate::error::{QueryError, StoreError};

const KIBANA_INDEX: &str = ".kibana";

/// Upper bound on saved searches read per fetch
const SAVED_SEARCH_PAGE_SIZE: usize = 1000;

/// Connection details shared by both clients
#[derive(Debug, Clone)]
struct Endpoint {
    url: String,
    user: Option<String>,
    password: Option<String>,
}

impl Endpoint {
    fn new(url: &str, user: Option<String>, password: Option<String>) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            user,
            password,
        }
    }

    fn post(&self, client: &reqwest::Client, path: &str) -> reqwest::RequestBuilder {
        let request = client.post(format!("{}/{}", self.url, path));
        match &self.user {
            Some(user) => request.basic_auth(user, self.password.as_ref()),
            None => request,
        }
    }
}

/// Counts documents through the Elasticsearch `_count` API
#[derive(Debug, Clone)]
pub struct ElasticBackend {
    client: reqwest::Client,
    endpoint: Endpoint,
    time_field: String,
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: i64,
}

impl ElasticBackend {
    pub fn new(
        url: &str,
        user: Option<String>,
        password: Option<String>,
        time_field: impl Into<String>,
    ) -> Result<Self, QueryError> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            endpoint: Endpoint::new(url, user, password),
            time_field: time_field.into(),
        })
    }

    pub fn from_config(config: &ElasticConfig) -> Result<Self, QueryError> {
        Self::new(
            &config.url,
            config.user.clone(),
            config.password.clone(),
            config.time_field.clone(),
        )
    }

    /// Backend counting against the Elasticsearch that holds a Kibana's saved searches
    pub fn for_kibana(config: &KibanaConfig) -> Result<Self, QueryError> {
        Self::new(
            &config.kibana_es_url,
            config.kibana_es_user.clone(),
            config.kibana_es_pass.clone(),
            config.time_field.clone(),
        )
    }

    fn count_body(&self, query: &str, window: TimeWindow) -> serde_json::Value {
        json!({
            "query": {
                "bool": {
                    "filter": [{
                        "range": {
                            self.time_field.as_str(): {
                                "gte": window.from.to_rfc3339_opts(SecondsFormat::Millis, true),
                                "lte": window.to.to_rfc3339_opts(SecondsFormat::Millis, true),
                                "format": "strict_date_optional_time"
                            }
                        }
                    }],
                    "must": [{
                        "query_string": { "query": query }
                    }]
                }
            }
        })
    }
}

#[async_trait]
impl QueryBackend for ElasticBackend {
    #[instrument(skip(self, window), fields(url = %self.endpoint.url))]
    async fn search(
        &self,
        index: &str,
        query: &str,
        window: TimeWindow,
        deadline: Duration,
    ) -> Result<u64, QueryError> {
        let body = self.count_body(query, window);
        trace!("counting with {body}");

        let response = self
            .endpoint
            .post(&self.client, &format!("{index}/_count"))
            .json(&body)
            .timeout(deadline)
            .send()
            .await
            .map_err(|e| timeout_or(e, QueryError::Timeout(deadline)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(QueryError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let CountResponse { count } = response
            .json()
            .await
            .map_err(|e| timeout_or(e, QueryError::Timeout(deadline)))?;

        debug!("{count} hits");
        u64::try_from(count).map_err(|_| QueryError::NegativeCount(count))
    }
}

fn timeout_or<E: From<reqwest::Error>>(err: reqwest::Error, timeout: E) -> E {
    if err.is_timeout() { timeout } else { err.into() }
}

/// Reads saved searches from a Kibana's `.kibana` index
#[derive(Debug, Clone)]
pub struct KibanaStore {
    client: reqwest::Client,
    endpoint: Endpoint,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    hits: Hits,
}

#[derive(Debug, Deserialize)]
struct Hits {
    #[serde(default)]
    hits: Vec<Hit>,
}

#[derive(Debug, Deserialize)]
struct Hit {
    #[serde(rename = "_id", default)]
    id: String,

    /// Decoded per document so one bad document cannot poison the fetch
    #[serde(rename = "_source", default)]
    source: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct SavedObject {
    search: Option<SavedSearch>,
}

#[derive(Debug, Deserialize)]
struct SavedSearch {
    title: String,

    #[serde(rename = "kibanaSavedObjectMeta")]
    meta: SavedObjectMeta,
}

#[derive(Debug, Deserialize)]
struct SavedObjectMeta {
    #[serde(rename = "searchSourceJSON")]
    search_source_json: String,
}

#[derive(Debug, Deserialize)]
struct SearchSource {
    query: SourceQuery,
}

#[derive(Debug, Deserialize)]
struct SourceQuery {
    query: QueryText,
}

/// Newer Kibanas store the query text directly, older ones a `query_string` clause
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum QueryText {
    Plain(String),
    Lucene { query_string: QueryString },
}

#[derive(Debug, Deserialize)]
struct QueryString {
    query: String,
}

impl QueryText {
    fn into_expression(self) -> String {
        let text = match self {
            QueryText::Plain(text) => text,
            QueryText::Lucene { query_string } => query_string.query,
        };

        // an empty saved query matches everything
        if text.trim().is_empty() {
            "*".to_string()
        } else {
            text
        }
    }
}

impl KibanaStore {
    pub fn new(
        url: &str,
        user: Option<String>,
        password: Option<String>,
    ) -> Result<Self, StoreError> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            endpoint: Endpoint::new(url, user, password),
        })
    }

    pub fn from_config(config: &KibanaConfig) -> Result<Self, StoreError> {
        Self::new(
            &config.kibana_es_url,
            config.kibana_es_user.clone(),
            config.kibana_es_pass.clone(),
        )
    }
}

#[async_trait]
impl RuleStore for KibanaStore {
    #[instrument(skip(self), fields(url = %self.endpoint.url))]
    async fn fetch_matching(
        &self,
        title_prefix: &str,
        deadline: Duration,
    ) -> Result<BTreeMap<String, String>, StoreError> {
        let body = json!({
            "size": SAVED_SEARCH_PAGE_SIZE,
            "query": { "term": { "type": "search" } }
        });

        let response = self
            .endpoint
            .post(&self.client, &format!("{KIBANA_INDEX}/_search"))
            .json(&body)
            .timeout(deadline)
            .send()
            .await
            .map_err(|e| timeout_or(e, StoreError::Timeout(deadline)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| timeout_or(e, StoreError::Timeout(deadline)))?;

        if !status.is_success() {
            return Err(StoreError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        let response: SearchResponse = serde_json::from_str(&text)?;
        Ok(extract_rules(response, title_prefix))
    }
}

fn extract_rules(response: SearchResponse, prefix: &str) -> BTreeMap<String, String> {
    let total = response.hits.hits.len();
    let mut rules = BTreeMap::new();

    for hit in response.hits.hits {
        let search = match serde_json::from_value::<SavedObject>(hit.source) {
            Ok(SavedObject {
                search: Some(search),
            }) => search,
            Ok(_) => continue,
            Err(e) => {
                warn!(id = %hit.id, "skipping undecodable saved object: {e}");
                continue;
            }
        };

        if !search.title.starts_with(prefix) {
            continue;
        }

        match serde_json::from_str::<SearchSource>(&search.meta.search_source_json) {
            Ok(source) => {
                let query = source.query.query.into_expression();
                trace!(title = %search.title, "matched saved search: {query}");
                rules.insert(search.title, query);
            }
            Err(e) => {
                warn!(title = %search.title, "skipping saved search with malformed searchSourceJSON: {e}");
            }
        }
    }

    debug!("{} of {total} saved objects matched prefix {prefix:?}", rules.len());
    rules
}
