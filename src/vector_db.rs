//! Vector index access: the payload schema, the Qdrant REST client, and an
//! in-process index with the same contract.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use ndarray::Array1;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::error::{RagError, Result, Service};

/// Page a chunk was cut from. Stored as an integer, or `"N/A"` for sources
/// without pagination.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "PageRepr", into = "PageRepr")]
pub enum Page {
    Number(u32),
    #[default]
    NotApplicable,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum PageRepr {
    Number(u32),
    Text(String),
}

impl TryFrom<PageRepr> for Page {
    type Error = String;

    fn try_from(repr: PageRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            PageRepr::Number(n) => Ok(Page::Number(n)),
            PageRepr::Text(text) if text.trim() == "N/A" => Ok(Page::NotApplicable),
            PageRepr::Text(text) => text
                .trim()
                .parse()
                .map(Page::Number)
                .map_err(|_| format!("invalid page value {text:?}")),
        }
    }
}

impl From<Page> for PageRepr {
    fn from(page: Page) -> Self {
        match page {
            Page::Number(n) => PageRepr::Number(n),
            Page::NotApplicable => PageRepr::Text("N/A".to_string()),
        }
    }
}

impl fmt::Display for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Page::Number(n) => write!(f, "{n}"),
            Page::NotApplicable => f.write_str("N/A"),
        }
    }
}

/// Index point id: sequential integers for document collections, random
/// UUIDs for the legislation collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PointId {
    Num(u64),
    Uuid(Uuid),
}

impl PointId {
    pub fn random() -> Self {
        PointId::Uuid(Uuid::new_v4())
    }
}

impl fmt::Display for PointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PointId::Num(n) => write!(f, "{n}"),
            PointId::Uuid(id) => write!(f, "{id}"),
        }
    }
}

/// Payload stored with every point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPayload {
    #[serde(alias = "conteudo")]
    pub content: String,
    pub source: String,
    #[serde(default)]
    pub page: Page,
    #[serde(default, alias = "Title", skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub id: PointId,
    pub vector: Array1<f32>,
    pub payload: ChunkPayload,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntry {
    pub id: PointId,
    /// `None` when the stored payload does not match [`ChunkPayload`].
    pub payload: Option<ChunkPayload>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredEntry {
    pub id: PointId,
    pub score: f32,
    pub payload: ChunkPayload,
}

/// Operations issued against the vector index.
///
/// Reads against a collection that does not exist return nothing, and
/// deleting from one is a no-op.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn list_collections(&self) -> Result<Vec<String>>;

    /// Creates the collection with cosine distance if it is absent.
    async fn ensure_collection(&self, collection: &str, dimension: usize) -> Result<()>;

    async fn upsert(&self, collection: &str, entries: Vec<IndexEntry>) -> Result<()>;

    /// Nearest entries to `vector`, best score first.
    async fn search(
        &self,
        collection: &str,
        vector: &Array1<f32>,
        limit: usize,
    ) -> Result<Vec<ScoredEntry>>;

    /// Every entry in the collection, fetched `page_size` points per request.
    async fn scroll(&self, collection: &str, page_size: usize) -> Result<Vec<StoredEntry>>;

    /// Removes every entry whose payload `source` equals `source`.
    async fn delete_by_source(&self, collection: &str, source: &str) -> Result<()>;
}

/// Client for the Qdrant REST API.
pub struct QdrantIndex {
    client: Client,
    base_url: String,
}

impl QdrantIndex {
    pub fn new(base_url: &str, api_key: Option<&str>, timeout: Duration) -> Result<Self> {
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(RagError::config("Qdrant URL must be an http(s) URL"));
        }
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = api_key.map(str::trim).filter(|key| !key.is_empty()) {
            headers.insert(
                "api-key",
                HeaderValue::from_str(key).map_err(|_| RagError::config("invalid Qdrant API key"))?,
            );
        }
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|err| RagError::config(format!("failed to build Qdrant HTTP client: {err}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// Sends the request; `Ok(None)` means the collection does not exist.
    async fn execute(&self, request: RequestBuilder) -> Result<Option<Response>> {
        let response = request
            .send()
            .await
            .map_err(|err| RagError::from_reqwest(Service::VectorIndex, err))?;
        let status = response.status();
        match classify_status(status) {
            StatusClass::Success => Ok(Some(response)),
            StatusClass::MissingCollection => Ok(None),
            StatusClass::Failure => {
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "<body unavailable>".to_string());
                Err(RagError::from_status(Service::VectorIndex, status, body))
            }
        }
    }

    async fn parse<T: DeserializeOwned>(response: Response) -> Result<T> {
        response
            .json::<QdrantResponse<T>>()
            .await
            .map(|body| body.result)
            .map_err(|err| RagError::malformed(Service::VectorIndex, err.to_string()))
    }
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn list_collections(&self) -> Result<Vec<String>> {
        let request = self.client.get(self.url("collections"));
        let Some(response) = self.execute(request).await? else {
            return Ok(Vec::new());
        };
        let listing: CollectionsResult = Self::parse(response).await?;
        Ok(listing.collections.into_iter().map(|c| c.name).collect())
    }

    async fn ensure_collection(&self, collection: &str, dimension: usize) -> Result<()> {
        let existing = self
            .execute(self.client.get(self.url(&format!("collections/{collection}"))))
            .await?;
        if existing.is_some() {
            return Ok(());
        }
        let request = self
            .client
            .put(self.url(&format!("collections/{collection}")))
            .json(&create_collection_body(dimension));
        let outcome = self.execute(request).await.map(|_| ());
        accept_existing_collection(collection, outcome)
    }

    async fn upsert(&self, collection: &str, entries: Vec<IndexEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let request = self
            .client
            .put(self.url(&format!("collections/{collection}/points")))
            .query(&[("wait", "true")])
            .json(&upsert_body(&entries));
        match self.execute(request).await? {
            Some(_) => Ok(()),
            None => Err(RagError::Service {
                service: Service::VectorIndex,
                status: StatusCode::NOT_FOUND,
                message: format!("collection {collection} does not exist"),
            }),
        }
    }

    async fn search(
        &self,
        collection: &str,
        vector: &Array1<f32>,
        limit: usize,
    ) -> Result<Vec<ScoredEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let body = SearchRequest {
            vector: vector.to_vec(),
            limit,
            with_payload: true,
        };
        let request = self
            .client
            .post(self.url(&format!("collections/{collection}/points/search")))
            .json(&body);
        let Some(response) = self.execute(request).await? else {
            return Ok(Vec::new());
        };
        let hits: Vec<WireScoredPoint> = Self::parse(response).await?;
        Ok(hits
            .into_iter()
            .filter_map(|hit| {
                validate_payload(collection, hit.id, hit.payload).map(|payload| ScoredEntry {
                    id: hit.id,
                    score: hit.score,
                    payload,
                })
            })
            .collect())
    }

    async fn scroll(&self, collection: &str, page_size: usize) -> Result<Vec<StoredEntry>> {
        let mut entries = Vec::new();
        let mut offset = None;
        loop {
            let body = ScrollRequest {
                limit: page_size.max(1),
                with_payload: true,
                with_vector: false,
                offset,
            };
            let request = self
                .client
                .post(self.url(&format!("collections/{collection}/points/scroll")))
                .json(&body);
            let Some(response) = self.execute(request).await? else {
                return Ok(entries);
            };
            let page: ScrollResult = Self::parse(response).await?;
            offset = absorb_scroll_page(collection, page, &mut entries);
            if offset.is_none() {
                return Ok(entries);
            }
        }
    }

    async fn delete_by_source(&self, collection: &str, source: &str) -> Result<()> {
        let body = json!({
            "filter": {
                "must": [
                    { "key": "source", "match": { "value": source } }
                ]
            }
        });
        let request = self
            .client
            .post(self.url(&format!("collections/{collection}/points/delete")))
            .query(&[("wait", "true")])
            .json(&body);
        self.execute(request).await?;
        Ok(())
    }
}

fn create_collection_body(dimension: usize) -> serde_json::Value {
    json!({
        "vectors": {
            "size": dimension,
            "distance": "Cosine"
        }
    })
}

fn upsert_body(entries: &[IndexEntry]) -> serde_json::Value {
    let points: Vec<WirePoint<'_>> = entries
        .iter()
        .map(|entry| WirePoint {
            id: entry.id,
            vector: entry.vector.to_vec(),
            payload: &entry.payload,
        })
        .collect();
    json!({ "points": points })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusClass {
    Success,
    /// 404: reads treat the collection as empty, deletes as a no-op.
    MissingCollection,
    Failure,
}

fn classify_status(status: StatusCode) -> StatusClass {
    if status == StatusCode::NOT_FOUND {
        StatusClass::MissingCollection
    } else if status.is_success() {
        StatusClass::Success
    } else {
        StatusClass::Failure
    }
}

/// A 409 on create means another writer created the collection first.
fn accept_existing_collection(collection: &str, outcome: Result<()>) -> Result<()> {
    match outcome {
        Ok(()) => {
            tracing::info!(collection, "created collection");
            Ok(())
        }
        Err(RagError::Service {
            status: StatusCode::CONFLICT,
            ..
        }) => Ok(()),
        Err(err) => Err(err),
    }
}

/// Appends one scroll page to `entries` and returns the offset of the next page.
///
/// Points with a malformed payload keep their id so callers can account for it.
fn absorb_scroll_page(
    collection: &str,
    page: ScrollResult,
    entries: &mut Vec<StoredEntry>,
) -> Option<PointId> {
    entries.extend(page.points.into_iter().map(|point| StoredEntry {
        id: point.id,
        payload: validate_payload(collection, point.id, point.payload),
    }));
    page.next_page_offset
}

/// Points whose payload does not match [`ChunkPayload`] yield `None`.
fn validate_payload(
    collection: &str,
    id: PointId,
    payload: Option<serde_json::Value>,
) -> Option<ChunkPayload> {
    let Some(raw) = payload else {
        tracing::warn!(collection, %id, "point has no payload, skipping");
        return None;
    };
    match serde_json::from_value::<ChunkPayload>(raw) {
        Ok(payload) => Some(payload),
        Err(err) => {
            tracing::warn!(collection, %id, error = %err, "point payload is malformed, skipping");
            None
        }
    }
}

#[derive(Deserialize)]
struct QdrantResponse<T> {
    result: T,
}

#[derive(Deserialize)]
struct CollectionsResult {
    collections: Vec<CollectionDescription>,
}

#[derive(Deserialize)]
struct CollectionDescription {
    name: String,
}

#[derive(Serialize)]
struct WirePoint<'a> {
    id: PointId,
    vector: Vec<f32>,
    payload: &'a ChunkPayload,
}

#[derive(Serialize)]
struct SearchRequest {
    vector: Vec<f32>,
    limit: usize,
    with_payload: bool,
}

#[derive(Deserialize)]
struct WireScoredPoint {
    id: PointId,
    score: f32,
    #[serde(default)]
    payload: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct ScrollRequest {
    limit: usize,
    with_payload: bool,
    with_vector: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    offset: Option<PointId>,
}

#[derive(Deserialize)]
struct ScrollResult {
    points: Vec<WireRecord>,
    #[serde(default)]
    next_page_offset: Option<PointId>,
}

#[derive(Deserialize)]
struct WireRecord {
    id: PointId,
    #[serde(default)]
    payload: Option<serde_json::Value>,
}


#[cfg(test)]
mod tests {
    use super::*;
    use super::memory::MemoryIndex;
    use ndarray::array;

    fn payload(source: &str, page: Page, content: &str) -> ChunkPayload {
        ChunkPayload {
            content: content.to_string(),
            source: source.to_string(),
            page,
            title: None,
        }
    }

    #[test]
    fn test_page_serialization() {
        assert_eq!(serde_json::to_value(Page::Number(3)).unwrap(), json!(3));
        assert_eq!(serde_json::to_value(Page::NotApplicable).unwrap(), json!("N/A"));
        assert_eq!(serde_json::from_value::<Page>(json!(7)).unwrap(), Page::Number(7));
        assert_eq!(
            serde_json::from_value::<Page>(json!("N/A")).unwrap(),
            Page::NotApplicable
        );
        assert!(serde_json::from_value::<Page>(json!("first")).is_err());
    }

    #[test]
    fn test_payload_accepts_legislation_fields() {
        let raw = json!({
            "Title": "Lei nº 13.709",
            "source": "https://www.planalto.gov.br/lei13709compilado.htm",
            "page": "N/A",
            "content": "Art. 1º Esta Lei dispõe sobre o tratamento de dados pessoais"
        });
        let parsed: ChunkPayload = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.page, Page::NotApplicable);
        assert_eq!(parsed.title.as_deref(), Some("Lei nº 13.709"));

        let legacy = json!({ "conteudo": "texto", "source": "documents/a.pdf" });
        let parsed: ChunkPayload = serde_json::from_value(legacy).unwrap();
        assert_eq!(parsed.content, "texto");
        assert_eq!(parsed.page, Page::NotApplicable);
    }

    #[test]
    fn test_point_ids_round_trip_both_shapes() {
        let numeric: PointId = serde_json::from_value(json!(42)).unwrap();
        assert_eq!(numeric, PointId::Num(42));
        let uuid: PointId =
            serde_json::from_value(json!("5c56c793-69f3-4fbf-87e6-c4bf54c28c26")).unwrap();
        assert!(matches!(uuid, PointId::Uuid(_)));
    }

    #[test]
    fn test_malformed_payloads_are_skipped() {
        let body = json!({
            "result": [
                { "id": 1, "score": 0.9, "payload": { "content": "a", "source": "documents/a.pdf", "page": 1 } },
                { "id": 2, "score": 0.8, "payload": { "source": "documents/a.pdf" } },
                { "id": 3, "score": 0.7 }
            ]
        });
        let parsed: QdrantResponse<Vec<WireScoredPoint>> = serde_json::from_value(body).unwrap();
        let valid: Vec<ChunkPayload> = parsed
            .result
            .into_iter()
            .filter_map(|hit| validate_payload("docs", hit.id, hit.payload))
            .collect();
        assert_eq!(valid, vec![payload("documents/a.pdf", Page::Number(1), "a")]);
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(classify_status(StatusCode::OK), StatusClass::Success);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), StatusClass::MissingCollection);
        assert_eq!(classify_status(StatusCode::BAD_REQUEST), StatusClass::Failure);
        assert_eq!(classify_status(StatusCode::SERVICE_UNAVAILABLE), StatusClass::Failure);
    }

    #[test]
    fn test_conflict_on_create_means_collection_exists() {
        let conflict = RagError::Service {
            service: Service::VectorIndex,
            status: StatusCode::CONFLICT,
            message: "Collection `docs` already exists!".to_string(),
        };
        assert!(accept_existing_collection("docs", Err(conflict)).is_ok());
        assert!(accept_existing_collection("docs", Ok(())).is_ok());

        let rejected = RagError::Service {
            service: Service::VectorIndex,
            status: StatusCode::BAD_REQUEST,
            message: "bad vector size".to_string(),
        };
        assert!(accept_existing_collection("docs", Err(rejected)).is_err());
    }

    #[test]
    fn test_scroll_pages_follow_next_offset() {
        let pages = vec![
            json!({
                "points": [
                    { "id": 1, "payload": { "content": "a", "source": "documents/a.pdf", "page": 1 } },
                    { "id": 2, "payload": { "content": "b", "source": "documents/a.pdf", "page": "primeira" } }
                ],
                "next_page_offset": 3
            }),
            json!({
                "points": [
                    { "id": 3, "payload": { "content": "c", "source": "documents/b.pdf", "page": 1 } }
                ],
                "next_page_offset": null
            }),
        ];

        let mut entries = Vec::new();
        let mut offsets = Vec::new();
        for raw in pages {
            let page: ScrollResult = serde_json::from_value(raw).unwrap();
            offsets.push(absorb_scroll_page("docs", page, &mut entries));
        }

        assert_eq!(offsets, vec![Some(PointId::Num(3)), None]);
        let ids: Vec<PointId> = entries.iter().map(|entry| entry.id).collect();
        assert_eq!(ids, vec![PointId::Num(1), PointId::Num(2), PointId::Num(3)]);
        assert!(entries[0].payload.is_some());
        assert!(entries[1].payload.is_none());
    }

    #[test]
    fn test_create_collection_body() {
        assert_eq!(
            create_collection_body(1536),
            json!({ "vectors": { "size": 1536, "distance": "Cosine" } })
        );
    }

    #[test]
    fn test_upsert_body_matches_points_api() {
        let uuid = Uuid::parse_str("5c56c793-69f3-4fbf-87e6-c4bf54c28c26").unwrap();
        let entries = vec![
            IndexEntry {
                id: PointId::Num(7),
                vector: array![0.5, 0.25],
                payload: payload("documents/a.pdf", Page::Number(2), "Art. 7º"),
            },
            IndexEntry {
                id: PointId::Uuid(uuid),
                vector: array![0.0, 1.0],
                payload: ChunkPayload {
                    title: Some("Lei nº 8.078".to_string()),
                    ..payload("https://www.planalto.gov.br/l8078.htm", Page::NotApplicable, "Art. 1º")
                },
            },
        ];
        assert_eq!(
            upsert_body(&entries),
            json!({
                "points": [
                    {
                        "id": 7,
                        "vector": [0.5, 0.25],
                        "payload": { "content": "Art. 7º", "source": "documents/a.pdf", "page": 2 }
                    },
                    {
                        "id": "5c56c793-69f3-4fbf-87e6-c4bf54c28c26",
                        "vector": [0.0, 1.0],
                        "payload": {
                            "content": "Art. 1º",
                            "source": "https://www.planalto.gov.br/l8078.htm",
                            "page": "N/A",
                            "title": "Lei nº 8.078"
                        }
                    }
                ]
            })
        );
    }

    #[test]
    fn test_search_request_shape() {
        let body = SearchRequest {
            vector: vec![0.5, 0.25],
            limit: 3,
            with_payload: true,
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({ "vector": [0.5, 0.25], "limit": 3, "with_payload": true })
        );
    }

    #[test]
    fn test_scroll_request_omits_missing_offset() {
        let body = ScrollRequest {
            limit: 256,
            with_payload: true,
            with_vector: false,
            offset: None,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert!(value.get("offset").is_none());
    }

    #[tokio::test]
    async fn test_memory_index_search_orders_by_score() {
        let index = MemoryIndex::new();
        index.ensure_collection("docs", 2).await.unwrap();
        index
            .upsert(
                "docs",
                vec![
                    IndexEntry {
                        id: PointId::Num(0),
                        vector: array![1.0, 0.0],
                        payload: payload("documents/a.pdf", Page::Number(1), "east"),
                    },
                    IndexEntry {
                        id: PointId::Num(1),
                        vector: array![0.0, 1.0],
                        payload: payload("documents/b.pdf", Page::Number(1), "north"),
                    },
                ],
            )
            .await
            .unwrap();

        let hits = index.search("docs", &array![0.1, 0.9], 5).await.unwrap();
        let contents: Vec<&str> = hits.iter().map(|h| h.payload.content.as_str()).collect();
        assert_eq!(contents, vec!["north", "east"]);
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn test_memory_index_missing_collection_is_not_an_error() {
        let index = MemoryIndex::new();
        assert!(index.search("nope", &array![1.0], 3).await.unwrap().is_empty());
        assert!(index.scroll("nope", 100).await.unwrap().is_empty());
        index.delete_by_source("nope", "documents/a.pdf").await.unwrap();

        let err = index.upsert("nope", Vec::new()).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_memory_index_delete_by_source() {
        let index = MemoryIndex::new();
        index.ensure_collection("docs", 1).await.unwrap();
        let entries = ["documents/a.pdf", "documents/b.pdf", "documents/a.pdf"]
            .iter()
            .enumerate()
            .map(|(i, source)| IndexEntry {
                id: PointId::Num(i as u64),
                vector: array![1.0],
                payload: payload(source, Page::Number(1), "x"),
            })
            .collect();
        index.upsert("docs", entries).await.unwrap();

        index.delete_by_source("docs", "documents/a.pdf").await.unwrap();
        let remaining = index.scroll("docs", 10).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(
            remaining[0].payload.as_ref().unwrap().source,
            "documents/b.pdf"
        );
    }

    #[tokio::test]
    async fn test_memory_index_rejects_wrong_dimension() {
        let index = MemoryIndex::new();
        index.ensure_collection("docs", 3).await.unwrap();
        let result = index
            .upsert(
                "docs",
                vec![IndexEntry {
                    id: PointId::Num(0),
                    vector: array![1.0],
                    payload: payload("documents/a.pdf", Page::Number(1), "x"),
                }],
            )
            .await;
        assert!(matches!(
            result,
            Err(RagError::Service {
                status: StatusCode::BAD_REQUEST,
                ..
            })
        ));
    }
}
