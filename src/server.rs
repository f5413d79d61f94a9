//! JSON HTTP API over the [`Indexer`].
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`    | `/health` | Health check (returns version) |
//! | `GET`    | `/collections` | List collections |
//! | `POST`   | `/collections` | Create a collection |
//! | `DELETE` | `/collections/{name}` | Delete a collection, its vectors and runs |
//! | `POST`   | `/collections/associate_data_source` | Bind a data source to a collection |
//! | `POST`   | `/collections/unassociate_data_source` | Unbind a data source |
//! | `POST`   | `/collections/ingest` | Run ingestion for a collection |
//! | `POST`   | `/collections/data_ingestion_runs/list` | List runs of a collection |
//! | `GET`    | `/collections/data_ingestion_runs/{name}/status` | Status of one run |
//! | `GET`    | `/data_sources` | List data sources |
//! | `POST`   | `/data_sources` | Register a data source |
//! | `GET`    | `/components/{kind}` | `parsers`, `embedders` or `dataloaders` |
//! | `POST`   | `/retrieve` | Retrieve chunks for a query |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "not found: collection 'docs'" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `conflict` (409),
//! `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::error::{Error, ErrorKind};
use crate::indexer::Indexer;
use crate::models::{
    AssociateDataSourceWithCollection, CreateCollection, DataSource, IngestDataToCollection,
    ListDataIngestionRuns, UnassociateDataSourceWithCollection,
};
use crate::retrieval::{self, RetrieveRequest};

type AppState = Arc<Indexer>;

/// Serves the API on `bind` until the process is terminated.
pub async fn run_server(bind: &str, indexer: Arc<Indexer>) -> anyhow::Result<()> {
    let app = build_router(indexer);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(%bind, "server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn build_router(indexer: Arc<Indexer>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route(
            "/collections",
            get(handle_list_collections).post(handle_create_collection),
        )
        .route("/collections/{name}", delete(handle_delete_collection))
        .route(
            "/collections/associate_data_source",
            post(handle_associate_data_source),
        )
        .route(
            "/collections/unassociate_data_source",
            post(handle_unassociate_data_source),
        )
        .route("/collections/ingest", post(handle_ingest))
        .route("/collections/data_ingestion_runs/list", post(handle_list_runs))
        .route(
            "/collections/data_ingestion_runs/{name}/status",
            get(handle_run_status),
        )
        .route(
            "/data_sources",
            get(handle_list_data_sources).post(handle_create_data_source),
        )
        .route("/components/{kind}", get(handle_list_components))
        .route("/retrieve", post(handle_retrieve))
        .layer(cors)
        .with_state(indexer)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        let (status, code) = match Error::classify(&err) {
            ErrorKind::NotFound => (StatusCode::NOT_FOUND, "not_found"),
            ErrorKind::BadRequest => (StatusCode::BAD_REQUEST, "bad_request"),
            ErrorKind::Conflict => (StatusCode::CONFLICT, "conflict"),
            ErrorKind::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        if status.is_server_error() {
            error!(error = %format!("{:#}", err), "request failed");
        }
        AppError {
            status,
            code: code.to_string(),
            message: format!("{:#}", err),
        }
    }
}

type ApiResult<T> = Result<T, AppError>;

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Collections ============

async fn handle_list_collections(State(indexer): State<AppState>) -> ApiResult<Json<Value>> {
    let collections = indexer.metadata_store().get_collections().await?;
    Ok(Json(json!({ "collections": collections })))
}

async fn handle_create_collection(
    State(indexer): State<AppState>,
    Json(request): Json<CreateCollection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let collection = indexer.create_collection(request).await?;
    Ok((StatusCode::CREATED, Json(json!({ "collection": collection }))))
}

async fn handle_delete_collection(
    State(indexer): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    indexer.delete_collection(&name).await?;
    Ok(Json(json!({ "deleted": true })))
}

async fn handle_associate_data_source(
    State(indexer): State<AppState>,
    Json(request): Json<AssociateDataSourceWithCollection>,
) -> ApiResult<Json<Value>> {
    let collection = indexer
        .metadata_store()
        .associate_data_source_with_collection(
            &request.collection_name,
            &request.data_source_fqn,
            request.parser_config,
        )
        .await?;
    Ok(Json(json!({ "collection": collection })))
}

async fn handle_unassociate_data_source(
    State(indexer): State<AppState>,
    Json(request): Json<UnassociateDataSourceWithCollection>,
) -> ApiResult<Json<Value>> {
    let collection = indexer
        .metadata_store()
        .unassociate_data_source_with_collection(&request.collection_name, &request.data_source_fqn)
        .await?;
    Ok(Json(json!({ "collection": collection })))
}

async fn handle_ingest(
    State(indexer): State<AppState>,
    Json(request): Json<IngestDataToCollection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let run_names = indexer.ingest_data(request).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "triggered",
            "data_ingestion_run_names": run_names,
        })),
    ))
}

async fn handle_list_runs(
    State(indexer): State<AppState>,
    Json(request): Json<ListDataIngestionRuns>,
) -> ApiResult<Json<Value>> {
    let runs = indexer
        .metadata_store()
        .get_data_ingestion_runs(&request.collection_name, request.data_source_fqn.as_deref())
        .await?;
    Ok(Json(json!({ "data_ingestion_runs": runs })))
}

async fn handle_run_status(
    State(indexer): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    let run = indexer
        .metadata_store()
        .get_data_ingestion_run(&name)
        .await?
        .ok_or_else(|| Error::not_found(format!("data ingestion run '{}'", name)))?;
    Ok(Json(json!({
        "status": run.status,
        "message": format!(
            "data ingestion run {} is {}; {} error(s) recorded",
            run.name,
            run.status,
            run.errors.len()
        ),
        "errors": run.errors,
    })))
}

// ============ Data sources ============

async fn handle_list_data_sources(State(indexer): State<AppState>) -> ApiResult<Json<Value>> {
    let data_sources = indexer.metadata_store().get_data_sources().await?;
    Ok(Json(json!({ "data_sources": data_sources })))
}

async fn handle_create_data_source(
    State(indexer): State<AppState>,
    Json(data_source): Json<DataSource>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let data_source = indexer.create_data_source(data_source).await?;
    let fqn = data_source.fqn();
    Ok((
        StatusCode::CREATED,
        Json(json!({ "data_source": data_source, "fqn": fqn })),
    ))
}

// ============ Components ============

async fn handle_list_components(
    State(indexer): State<AppState>,
    Path(kind): Path<String>,
) -> ApiResult<Json<Value>> {
    let components = indexer.components();
    let listed = match kind.as_str() {
        "parsers" => components.parsers.list(),
        "embedders" => components.embedders.list(),
        "dataloaders" => components.loaders.list(),
        other => {
            return Err(Error::not_found(format!(
                "unknown component kind '{}'; use parsers, embedders or dataloaders",
                other
            ))
            .into())
        }
    };
    Ok(Json(json!({ "kind": kind, "components": listed })))
}

// ============ POST /retrieve ============

async fn handle_retrieve(
    State(indexer): State<AppState>,
    Json(request): Json<RetrieveRequest>,
) -> ApiResult<Json<Value>> {
    let docs = retrieval::retrieve(
        indexer.metadata_store().as_ref(),
        indexer.vector_db().as_ref(),
        &indexer.components().embedders,
        &request.collection_name,
        &request.query,
        &request.retriever_config,
    )
    .await?;
    Ok(Json(json!({ "docs": docs })))
}
