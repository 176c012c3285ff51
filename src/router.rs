//! Request routing.
//!
//! A fixed dispatch table maps request paths to handlers. Each handler
//! validates its body into a typed request, calls the domain service, and
//! returns either a single response or an accepted response plus a
//! [`JobStream`] of follow-up frames.
//!
//! # Paths
//!
//! | Path | Handler | Success |
//! |------|---------|---------|
//! | `/v1/query` | [`QueryService::query`] | `200` query response |
//! | `/v1/sources` | catalog listing | `200` `{catalog_version, updated_at, sources, snapshots}` |
//! | `/v1/index/reindex` | [`ReindexOrchestrator::begin`] | `202` `{job}`, then streamed `{job}` frames |
//! | `/v1/admin/init` | [`InitService::init`] | `200` `{catalog_version, created_directories, seeded_sources}` |
//! | `/v1/admin/health` | [`HealthService::evaluate`] | `200` `{overall_status, trace_id, generated_at, results}` |
//!
//! # Errors
//!
//! [`TransportError`]s (including index-unavailable `409`s) become response
//! bodies unchanged. Anything else is logged and answered with an opaque
//! `500` whose code names the failing route (`QUERY_FAILED`,
//! `SOURCES_FAILED`, `REINDEX_FAILED`, `INIT_FAILED`, `HEALTH_FAILED`).

use std::sync::Arc;

use anyhow::Result;
use rag_backend_core::audit::AuditEntry;
use rag_backend_core::catalog::{CatalogDeps, SourceCatalogService};
use rag_backend_core::clock::{Clock, SystemClock};
use rag_backend_core::models::IngestionTrigger;
use rag_backend_core::store::{AuditSink, CatalogStore};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::admin::InitService;
use crate::checksum::{FsSourceLocator, Sha256Checksums};
use crate::config::Config;
use crate::connector_fs::FsChunkBuilder;
use crate::error::{HandlerError, HandlerResult, TransportError};
use crate::health::{HealthService, StatvfsGauge};
use crate::job_stream::JobStream;
use crate::query::{QueryRequest, QueryService};
use crate::reindex::{ReindexDeps, ReindexOrchestrator, ReindexRequest, ReindexSettings};
use crate::search::ChunkIndex;
use crate::storage::{AuditLog, JsonCatalogStore, JsonIndexVersionStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Query,
    Sources,
    Reindex,
    AdminInit,
    AdminHealth,
}

impl Route {
    pub const ALL: [Route; 5] = [
        Route::Query,
        Route::Sources,
        Route::Reindex,
        Route::AdminInit,
        Route::AdminHealth,
    ];

    pub fn path(self) -> &'static str {
        match self {
            Route::Query => "/v1/query",
            Route::Sources => "/v1/sources",
            Route::Reindex => "/v1/index/reindex",
            Route::AdminInit => "/v1/admin/init",
            Route::AdminHealth => "/v1/admin/health",
        }
    }

    pub fn from_path(path: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|route| route.path() == path)
    }

    /// Code and client-facing message for an unexpected failure.
    fn failure(self) -> (&'static str, &'static str) {
        match self {
            Route::Query => ("QUERY_FAILED", "Query execution failed"),
            Route::Sources => ("SOURCES_FAILED", "Unable to list catalog sources"),
            Route::Reindex => ("REINDEX_FAILED", "Unable to start the reindex job"),
            Route::AdminInit => ("INIT_FAILED", "Initialization failed"),
            Route::AdminHealth => ("HEALTH_FAILED", "Health evaluation failed"),
        }
    }
}

/// What the connection writes back for one request.
pub enum RouteOutcome {
    Response {
        status: u16,
        body: Value,
    },
    /// Write `body` with `status`, then one frame per stream event.
    Stream {
        status: u16,
        body: Value,
        stream: JobStream,
    },
}

impl RouteOutcome {
    fn ok(body: Value) -> Self {
        RouteOutcome::Response { status: 200, body }
    }

    fn error(err: &TransportError) -> Self {
        RouteOutcome::Response {
            status: err.status,
            body: err.to_body(),
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            RouteOutcome::Response { status, .. } | RouteOutcome::Stream { status, .. } => *status,
        }
    }
}

/// Everything the handlers need, already wired.
pub struct Services {
    pub catalog: Arc<dyn CatalogStore>,
    pub audit: Arc<dyn AuditSink>,
    pub clock: Arc<dyn Clock>,
    pub query: QueryService,
    pub health: HealthService,
    pub init: InitService,
    pub reindex: Arc<ReindexOrchestrator>,
    pub sources: Arc<SourceCatalogService>,
}

pub struct Router {
    services: Services,
}

impl Router {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    /// Wire the file-backed collaborators rooted at the configured data dir.
    pub fn from_config(config: &Config) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let catalog: Arc<dyn CatalogStore> =
            Arc::new(JsonCatalogStore::new(config.catalog_path()?, clock.clone()));
        let audit: Arc<dyn AuditSink> = Arc::new(AuditLog::new(config.audit_log_path()?));
        let index = Arc::new(ChunkIndex::open(config.chunk_index_path()?)?);
        let chunks = Arc::new(FsChunkBuilder::new(&config.chunking, index.clone())?);

        let orchestrator = Arc::new(ReindexOrchestrator::new(
            ReindexDeps {
                catalog: catalog.clone(),
                index_versions: Arc::new(JsonIndexVersionStore::new(config.index_version_path()?)),
                audit: audit.clone(),
                checksums: Arc::new(Sha256Checksums),
                chunks,
                clock: clock.clone(),
            },
            ReindexSettings::from_config(&config.reindex),
        ));

        let sources = Arc::new(SourceCatalogService::new(CatalogDeps {
            catalog: catalog.clone(),
            audit: audit.clone(),
            checksums: Arc::new(Sha256Checksums),
            locator: Arc::new(FsSourceLocator),
            clock: clock.clone(),
        }));

        let data_dir = config.data_dir()?;
        let socket_path = config.socket_path()?;
        let mut directories = vec![data_dir.clone()];
        if let Some(parent) = socket_path.parent() {
            if !directories.iter().any(|d| d == parent) {
                directories.push(parent.to_path_buf());
            }
        }

        Ok(Self::new(Services {
            query: QueryService::new(catalog.clone(), index),
            health: HealthService::new(
                catalog.clone(),
                clock.clone(),
                Arc::new(StatvfsGauge::new(data_dir)),
                &config.health,
            ),
            init: InitService::new(
                sources.clone(),
                directories,
                config.init.seed_sources.iter().map(|s| s.to_request()).collect(),
            ),
            reindex: orchestrator,
            sources,
            catalog,
            audit,
            clock,
        }))
    }

    pub fn orchestrator(&self) -> &Arc<ReindexOrchestrator> {
        &self.services.reindex
    }

    pub fn health(&self) -> &HealthService {
        &self.services.health
    }

    pub fn catalog(&self) -> &Arc<dyn CatalogStore> {
        &self.services.catalog
    }

    /// Catalog mutations for the local `sources` subcommands.
    pub fn sources_admin(&self) -> &Arc<SourceCatalogService> {
        &self.services.sources
    }

    /// Route one request. Never fails: every error becomes a response.
    pub fn dispatch(&self, path: &str, body: &Value) -> RouteOutcome {
        let Some(route) = Route::from_path(path) else {
            tracing::debug!(path, "unknown path");
            return RouteOutcome::error(&TransportError::not_found(
                "NOT_FOUND",
                format!("Unknown path '{}'", path),
            ));
        };

        let result = match route {
            Route::Query => self.query(body),
            Route::Sources => self.sources(),
            Route::Reindex => self.reindex(body),
            Route::AdminInit => self.admin_init(),
            Route::AdminHealth => self.admin_health(body),
        };

        match result {
            Ok(outcome) => {
                tracing::debug!(path, status = outcome.status(), "request handled");
                outcome
            }
            Err(HandlerError::Transport(err)) => {
                tracing::debug!(path, status = err.status, code = %err.code, "request rejected");
                RouteOutcome::error(&err)
            }
            Err(HandlerError::Internal(err)) => {
                let (code, message) = route.failure();
                tracing::error!(path, code, error = %format!("{:#}", err), "request failed");
                RouteOutcome::error(&TransportError::new(500, code, message))
            }
        }
    }

    fn query(&self, body: &Value) -> HandlerResult<RouteOutcome> {
        let request = QueryRequest::from_body(body)?;
        let response = self.services.query.query(&request)?;
        Ok(RouteOutcome::ok(serde_json::to_value(response).map_err(anyhow::Error::from)?))
    }

    fn sources(&self) -> HandlerResult<RouteOutcome> {
        let catalog = self.services.catalog.load()?;
        Ok(RouteOutcome::ok(json!({
            "catalog_version": catalog.version,
            "updated_at": catalog.updated_at,
            "sources": catalog.sources,
            "snapshots": catalog.snapshots,
        })))
    }

    fn reindex(&self, body: &Value) -> HandlerResult<RouteOutcome> {
        let request = reindex_request(body)?;
        let (job, stream) = self.services.reindex.begin(request)?;
        Ok(RouteOutcome::Stream {
            status: 202,
            body: json!({ "job": job }),
            stream,
        })
    }

    fn admin_init(&self) -> HandlerResult<RouteOutcome> {
        let report = self.services.init.init()?;
        Ok(RouteOutcome::ok(serde_json::to_value(report).map_err(anyhow::Error::from)?))
    }

    fn admin_health(&self, body: &Value) -> HandlerResult<RouteOutcome> {
        let trace_id = trace_id(body);
        let report = self.services.health.evaluate()?;
        let payload = report.to_body(&trace_id);

        let entry = AuditEntry::new(
            self.services.clock.now(),
            "admin_health",
            report.overall_status.as_str(),
            "backend",
        )
        .with_trace_id(trace_id.as_str())
        .with_field("results", payload["results"].clone());
        if let Err(e) = self.services.audit.append(&entry) {
            tracing::warn!(error = %e, "failed to write health audit entry");
        }
        Ok(RouteOutcome::ok(payload))
    }
}

fn reindex_request(body: &Value) -> Result<ReindexRequest, TransportError> {
    let trigger = match body.get("trigger") {
        None | Some(Value::Null) => IngestionTrigger::default(),
        Some(Value::String(raw)) => raw.parse().map_err(|_| unsupported_trigger(raw))?,
        Some(other) => return Err(unsupported_trigger(&other.to_string())),
    };
    let force = body.get("force").and_then(Value::as_bool).unwrap_or(false);
    let resume_job_id = match body.get("resume_job_id") {
        None | Some(Value::Null) => None,
        Some(Value::String(id)) if !id.trim().is_empty() => Some(id.trim().to_string()),
        Some(_) => {
            return Err(TransportError::invalid_request(
                "Reindex request fields are malformed",
            ))
        }
    };
    Ok(ReindexRequest {
        trigger,
        force,
        resume_job_id,
    })
}

fn unsupported_trigger(raw: &str) -> TransportError {
    TransportError::bad_request("INVALID_TRIGGER", format!("Unsupported reindex trigger '{}'", raw))
}

/// The body's non-blank `trace_id`, or a fresh hex id.
fn trace_id(body: &Value) -> String {
    body.get("trace_id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string())
}
