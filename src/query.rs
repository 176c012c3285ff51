//! `/v1/query`: retrieval over the in-process chunk index.
//!
//! Every query first passes the index consistency guard. Retrieved chunks
//! are then checked against the catalog snapshots: a chunk built from a
//! checksum the catalog no longer records means the chunk index lags the
//! catalog, and the request fails with `INDEX_STALE`.
//!
//! Answers are extractive. The summary is the leading sentence of the best
//! chunk, and every retrieved chunk becomes a reference and a citation.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use rag_backend_core::guard::ensure_index_current;
use rag_backend_core::store::CatalogStore;
use rag_backend_core::IndexUnavailable;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{HandlerResult, TransportError};
use crate::search::{tokenize, ChunkIndex, ScoredChunk};

pub const DEFAULT_MAX_CONTEXT_TOKENS: u32 = 4096;

const CHUNKS_PER_SOURCE: usize = 3;
const CHARS_PER_TOKEN: usize = 4;
const PREVIEW_CHARS: usize = 160;
const SUMMARY_CHARS: usize = 320;
const NO_CONTEXT_CONFIDENCE: f64 = 0.25;

#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub question: String,
    pub conversation_id: Option<String>,
    pub max_context_tokens: u32,
    pub trace_id: Option<String>,
}

impl QueryRequest {
    pub fn from_body(body: &Value) -> Result<Self, TransportError> {
        let question = body
            .get("question")
            .ok_or_else(|| TransportError::invalid_request("Missing 'question' field in query request body"))?;
        let question = match question {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => return Err(malformed()),
        };

        Ok(Self {
            question,
            conversation_id: optional_string(body.get("conversation_id"))?,
            max_context_tokens: context_tokens(body.get("max_context_tokens"))?,
            trace_id: optional_string(body.get("trace_id"))?,
        })
    }
}

fn malformed() -> TransportError {
    TransportError::invalid_request("Query request fields are malformed")
}

fn optional_string(value: Option<&Value>) -> Result<Option<String>, TransportError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(malformed()),
    }
}

fn context_tokens(value: Option<&Value>) -> Result<u32, TransportError> {
    match value {
        None | Some(Value::Null) => Ok(DEFAULT_MAX_CONTEXT_TOKENS),
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(malformed),
        Some(Value::String(s)) => s.trim().parse().map_err(|_| malformed()),
        Some(_) => Err(malformed()),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reference {
    pub label: String,
    pub url: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Citation {
    pub alias: String,
    pub document_ref: String,
    pub excerpt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResponse {
    pub summary: String,
    pub steps: Vec<String>,
    pub references: Vec<Reference>,
    pub citations: Vec<Citation>,
    pub confidence: f64,
    pub trace_id: String,
    pub latency_ms: u64,
    pub retrieval_latency_ms: u64,
    pub index_version: String,
    pub answer: Option<String>,
    pub no_answer: bool,
    pub semantic_chunk_count: usize,
}

pub struct QueryService {
    catalog: Arc<dyn CatalogStore>,
    index: Arc<ChunkIndex>,
}

impl QueryService {
    pub fn new(catalog: Arc<dyn CatalogStore>, index: Arc<ChunkIndex>) -> Self {
        Self { catalog, index }
    }

    pub fn query(&self, request: &QueryRequest) -> HandlerResult<QueryResponse> {
        let started = Instant::now();
        let catalog = self.catalog.load()?;
        ensure_index_current(&catalog)?;

        let trace_id = request
            .trace_id
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let index_version = format!("catalog/v{}", catalog.version);

        let aliases = catalog.active_aliases();
        let retrieval_started = Instant::now();
        let hits = self.index.search(
            &request.question,
            &aliases,
            CHUNKS_PER_SOURCE * aliases.len().max(1),
        );
        let hits = within_budget(hits, request.max_context_tokens);
        let retrieval_latency_ms = retrieval_started.elapsed().as_millis() as u64;

        for hit in &hits {
            let doc = &hit.document;
            let expected = catalog.snapshot_for(&doc.alias).map(|s| s.checksum.as_str());
            if expected != Some(doc.checksum.as_str()) {
                return Err(IndexUnavailable::stale(
                    format!("Indexed chunks for '{}' do not match the catalog snapshot.", doc.alias),
                    "Run ragadmin reindex --force to rebuild the chunk index.",
                )
                .into());
            }
        }

        tracing::debug!(
            trace_id = %trace_id,
            chunks = hits.len(),
            retrieval_latency_ms,
            "query retrieval finished"
        );

        if hits.is_empty() {
            return Ok(QueryResponse {
                summary: "No indexed documents are available for the current catalog. \
                          Run `ragadmin reindex` to populate retrieval context."
                    .to_string(),
                steps: vec!["Run `ragadmin reindex` and retry the query.".to_string()],
                references: vec![Reference {
                    label: "Catalog".to_string(),
                    url: None,
                    notes: Some("No indexed snapshots available.".to_string()),
                }],
                citations: Vec::new(),
                confidence: NO_CONTEXT_CONFIDENCE,
                trace_id,
                latency_ms: started.elapsed().as_millis() as u64,
                retrieval_latency_ms,
                index_version,
                answer: None,
                no_answer: true,
                semantic_chunk_count: 0,
            });
        }

        let summary = leading_sentence(&hits[0].document.text);
        let mut steps = Vec::new();
        let mut seen_paths = HashSet::new();
        for hit in &hits {
            let doc = &hit.document;
            if seen_paths.insert(doc.source_path.as_str()) {
                steps.push(format!("Consult {} ({}).", label(hit), doc.source_path));
            }
        }
        let references = hits
            .iter()
            .map(|hit| Reference {
                label: label(hit),
                url: None,
                notes: Some(preview(&hit.document.text)),
            })
            .collect();
        let citations = hits
            .iter()
            .map(|hit| Citation {
                alias: hit.document.alias.clone(),
                document_ref: hit.document.id.clone(),
                excerpt: Some(preview(&hit.document.text)),
            })
            .collect();

        Ok(QueryResponse {
            answer: Some(summary.clone()),
            summary,
            steps,
            references,
            citations,
            confidence: confidence(&request.question, &hits),
            trace_id,
            latency_ms: started.elapsed().as_millis() as u64,
            retrieval_latency_ms,
            index_version,
            no_answer: false,
            semantic_chunk_count: hits.len(),
        })
    }
}

/// Keep the best chunks that fit in the context budget (always at least one).
fn within_budget(hits: Vec<ScoredChunk>, max_context_tokens: u32) -> Vec<ScoredChunk> {
    let budget = max_context_tokens as usize * CHARS_PER_TOKEN;
    let mut used = 0;
    let mut kept = Vec::new();
    for hit in hits {
        let len = hit.document.text.len();
        if !kept.is_empty() && used + len > budget {
            break;
        }
        used += len;
        kept.push(hit);
    }
    kept
}

fn label(hit: &ScoredChunk) -> String {
    format!("{}:{}", hit.document.alias, hit.document.chunk_index)
}

fn collapse(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((end, _)) => format!("{}...", text[..end].trim_end()),
        None => text.to_string(),
    }
}

fn preview(text: &str) -> String {
    truncate_chars(&collapse(text), PREVIEW_CHARS)
}

fn leading_sentence(text: &str) -> String {
    let flat = collapse(text);
    let sentence = match flat.find(". ") {
        Some(end) => &flat[..=end],
        None => flat.as_str(),
    };
    truncate_chars(sentence, SUMMARY_CHARS)
}

/// `0.25 + 0.75 * (share of distinct question terms found in the context)`.
fn confidence(question: &str, hits: &[ScoredChunk]) -> f64 {
    let terms: HashSet<String> = tokenize(question).into_iter().collect();
    if terms.is_empty() {
        return NO_CONTEXT_CONFIDENCE;
    }
    let found: HashSet<String> = hits
        .iter()
        .flat_map(|hit| tokenize(&hit.document.text))
        .filter(|t| terms.contains(t))
        .collect();
    let coverage = found.len() as f64 / terms.len() as f64;
    ((NO_CONTEXT_CONFIDENCE + 0.75 * coverage) * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use chrono::Utc;
    use rag_backend_core::models::{
        IndexedDocument, SourceCatalog, SourceRecord, SourceSnapshot, SourceStatus, SourceType,
    };
    use rag_backend_core::store::memory::InMemoryCatalogStore;
    use serde_json::json;

    fn catalog(version: u64) -> SourceCatalog {
        SourceCatalog {
            version,
            updated_at: Utc::now(),
            sources: vec![SourceRecord {
                alias: "man-pages".into(),
                source_type: SourceType::Man,
                location: "/usr/share/man".into(),
                language: "en".into(),
                size_bytes: 10,
                last_updated: Utc::now(),
                status: SourceStatus::Active,
                checksum: Some("c1".into()),
                notes: None,
            }],
            snapshots: if version == 0 {
                Vec::new()
            } else {
                vec![SourceSnapshot::new("man-pages", "c1")]
            },
        }
    }

    fn doc(index: i64, checksum: &str, text: &str) -> IndexedDocument {
        IndexedDocument {
            id: format!("doc-{}", index),
            alias: "man-pages".into(),
            checksum: checksum.into(),
            source_path: "/usr/share/man/man1/ls.1".into(),
            chunk_index: index,
            text: text.into(),
        }
    }

    fn service(version: u64, docs: Vec<IndexedDocument>) -> QueryService {
        let index = Arc::new(ChunkIndex::in_memory());
        if !docs.is_empty() {
            let checksum = docs[0].checksum.clone();
            index.replace_source("man-pages", &checksum, docs).unwrap();
        }
        QueryService::new(Arc::new(InMemoryCatalogStore::new(catalog(version))), index)
    }

    fn request(question: &str) -> QueryRequest {
        QueryRequest::from_body(&json!({ "question": question, "trace_id": "t-1" })).unwrap()
    }

    fn expect_transport(err: HandlerError) -> TransportError {
        match err {
            HandlerError::Transport(e) => e,
            HandlerError::Internal(e) => panic!("unexpected internal error: {e:#}"),
        }
    }

    #[test]
    fn missing_question_is_rejected() {
        let err = QueryRequest::from_body(&json!({})).unwrap_err();
        assert_eq!(err.status, 400);
        assert_eq!(err.code, "INVALID_REQUEST");
        assert_eq!(err.message, "Missing 'question' field in query request body");
    }

    #[test]
    fn malformed_fields_are_rejected() {
        for body in [
            json!({ "question": null }),
            json!({ "question": ["ls"] }),
            json!({ "question": "q", "max_context_tokens": "many" }),
            json!({ "question": "q", "max_context_tokens": -1 }),
            json!({ "question": "q", "trace_id": 7 }),
        ] {
            let err = QueryRequest::from_body(&body).unwrap_err();
            assert_eq!(err.message, "Query request fields are malformed", "{body}");
        }
    }

    #[test]
    fn scalar_questions_are_coerced_to_text() {
        assert_eq!(QueryRequest::from_body(&json!({ "question": 5 })).unwrap().question, "5");
        assert_eq!(QueryRequest::from_body(&json!({ "question": 2.5 })).unwrap().question, "2.5");
        assert_eq!(QueryRequest::from_body(&json!({ "question": true })).unwrap().question, "true");
    }

    #[test]
    fn context_tokens_default_and_accept_numeric_strings() {
        let req = QueryRequest::from_body(&json!({ "question": "q" })).unwrap();
        assert_eq!(req.max_context_tokens, DEFAULT_MAX_CONTEXT_TOKENS);
        let req = QueryRequest::from_body(&json!({ "question": "q", "max_context_tokens": "512" })).unwrap();
        assert_eq!(req.max_context_tokens, 512);
    }

    #[test]
    fn unindexed_catalog_is_index_missing() {
        let err = expect_transport(service(0, Vec::new()).query(&request("ls")).unwrap_err());
        assert_eq!(err.status, 409);
        assert_eq!(err.code, "INDEX_MISSING");
    }

    #[test]
    fn retrieved_chunks_become_citations() {
        let svc = service(
            2,
            vec![
                doc(0, "c1", "ls lists directory contents. It sorts entries alphabetically."),
                doc(1, "c1", "Use ls -l for the long listing format."),
                doc(2, "c1", "chmod changes file modes."),
            ],
        );
        let resp = svc.query(&request("How does ls list files?")).unwrap();

        assert!(!resp.no_answer);
        assert_eq!(resp.index_version, "catalog/v2");
        assert_eq!(resp.trace_id, "t-1");
        assert_eq!(resp.semantic_chunk_count, 2);
        assert_eq!(resp.citations.len(), 2);
        assert!(resp.citations.iter().all(|c| c.alias == "man-pages"));
        assert_eq!(resp.references[0].label.split(':').next(), Some("man-pages"));
        assert_eq!(resp.answer.as_deref(), Some(resp.summary.as_str()));
        assert!(resp.summary.ends_with('.'));
        assert!(resp.confidence > NO_CONTEXT_CONFIDENCE && resp.confidence <= 1.0);
        assert_eq!(resp.steps.len(), 1);
    }

    #[test]
    fn no_matching_chunks_yields_no_answer() {
        let svc = service(2, vec![doc(0, "c1", "tar creates archives")]);
        let resp = svc.query(&request("kernel modules")).unwrap();
        assert!(resp.no_answer);
        assert_eq!(resp.confidence, 0.25);
        assert_eq!(resp.steps, vec!["Run `ragadmin reindex` and retry the query.".to_string()]);
        assert_eq!(resp.references[0].label, "Catalog");
        assert!(resp.citations.is_empty());
        assert!(resp.answer.is_none());
    }

    #[test]
    fn chunks_from_an_old_checksum_are_stale() {
        let svc = service(2, vec![doc(0, "c0", "ls lists files")]);
        let err = expect_transport(svc.query(&request("ls")).unwrap_err());
        assert_eq!(err.status, 409);
        assert_eq!(err.code, "INDEX_STALE");
        assert!(err.remediation.unwrap().contains("--force"));
    }

    #[test]
    fn budget_keeps_at_least_one_chunk() {
        let svc = service(
            2,
            vec![
                doc(0, "c1", &"grep searches text. ".repeat(20)),
                doc(1, "c1", "grep -r recurses"),
            ],
        );
        let mut req = request("grep");
        req.max_context_tokens = 1;
        let resp = svc.query(&req).unwrap();
        assert_eq!(resp.semantic_chunk_count, 1);
        assert!(resp.references[0].notes.as_ref().unwrap().ends_with("..."));
    }

    #[test]
    fn generated_trace_id_is_hex() {
        let svc = service(2, vec![doc(0, "c1", "tar")]);
        let req = QueryRequest::from_body(&json!({ "question": "tar", "trace_id": "  " })).unwrap();
        let resp = svc.query(&req).unwrap();
        assert_eq!(resp.trace_id.len(), 32);
        assert!(resp.trace_id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
