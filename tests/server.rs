//! HTTP API tests: the real router bound to an ephemeral port.

use serde_json::{json, Value};
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

use ragsync::indexer::{Components, Indexer};
use ragsync::loader::Fingerprint;
use ragsync::metadata_store::SqliteMetadataStore;
use ragsync::server::build_router;
use ragsync::vector_db::MemoryVectorDb;

struct TestServer {
    _dir: TempDir,
    source_dir: String,
    base: String,
    client: reqwest::Client,
}

async fn start() -> TestServer {
    let dir = TempDir::new().unwrap();
    let source_dir = dir.path().join("data");
    fs::create_dir_all(&source_dir).unwrap();
    fs::write(source_dir.join("deploy.txt"), "How to deploy the payment service").unwrap();
    fs::write(source_dir.join("rollback.txt"), "Rolling back a failed release").unwrap();

    let store = SqliteMetadataStore::open(&dir.path().join("meta.sqlite"))
        .await
        .unwrap();
    let indexer = Indexer::new(
        Arc::new(store),
        Arc::new(MemoryVectorDb::new()),
        Components::builtin(Fingerprint::Sha256),
    )
    .with_staging_root(Some(dir.path().join("staging")));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_router(Arc::new(indexer));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        source_dir: source_dir.to_string_lossy().into_owned(),
        _dir: dir,
        base: format!("http://{}", addr),
        client: reqwest::Client::new(),
    }
}

impl TestServer {
    async fn get(&self, path: &str) -> (u16, Value) {
        let resp = self
            .client
            .get(format!("{}{}", self.base, path))
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }

    async fn post(&self, path: &str, body: Value) -> (u16, Value) {
        let resp = self
            .client
            .post(format!("{}{}", self.base, path))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }

    /// Registers the test directory and a `docs` collection bound to it.
    async fn seed(&self) -> String {
        let (status, body) = self
            .post(
                "/data_sources",
                json!({"type": "localdir", "uri": self.source_dir}),
            )
            .await;
        assert_eq!(status, 201, "{}", body);
        let fqn = body["fqn"].as_str().unwrap().to_string();

        let (status, body) = self
            .post(
                "/collections",
                json!({
                    "name": "docs",
                    "embedder_config": {"provider": "hashing", "config": {"dims": 64}},
                    "associated_data_sources": [{"data_source_fqn": fqn}],
                }),
            )
            .await;
        assert_eq!(status, 201, "{}", body);
        fqn
    }
}

#[tokio::test]
async fn test_health() {
    let server = start().await;
    let (status, body) = server.get("/health").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_ingest_then_retrieve() {
    let server = start().await;
    let fqn = server.seed().await;

    let (status, body) = server
        .post(
            "/collections/ingest",
            json!({"collection_name": "docs", "data_ingestion_mode": "FULL"}),
        )
        .await;
    assert_eq!(status, 201, "{}", body);
    assert_eq!(body["message"], "triggered");
    let run_name = body["data_ingestion_run_names"][0].as_str().unwrap().to_string();

    let (status, body) = server
        .get(&format!("/collections/data_ingestion_runs/{}/status", run_name))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "COMPLETED");
    assert!(body["message"].as_str().unwrap().contains(&run_name));

    let (status, body) = server
        .post(
            "/collections/data_ingestion_runs/list",
            json!({"collection_name": "docs", "data_source_fqn": fqn}),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["data_ingestion_runs"].as_array().unwrap().len(), 1);

    let (status, body) = server
        .post(
            "/retrieve",
            json!({
                "collection_name": "docs",
                "query": "deploy payment service",
                "retriever_config": {"search_type": "similarity", "k": 1},
            }),
        )
        .await;
    assert_eq!(status, 200, "{}", body);
    let docs = body["docs"].as_array().unwrap();
    assert_eq!(docs.len(), 1);
    assert!(docs[0]["content"].as_str().unwrap().contains("deploy"));
    assert!(docs[0].get("vector").is_none());
}

#[tokio::test]
async fn test_error_contract() {
    let server = start().await;

    let (status, body) = server
        .post("/collections/ingest", json!({"collection_name": "ghost"}))
        .await;
    assert_eq!(status, 404);
    assert_eq!(body["error"]["code"], "not_found");

    let (status, body) = server
        .get("/collections/data_ingestion_runs/missing-run/status")
        .await;
    assert_eq!(status, 404);
    assert_eq!(body["error"]["code"], "not_found");

    // A collection with no associated data sources cannot be ingested.
    let (status, _) = server
        .post(
            "/collections",
            json!({"name": "empty", "embedder_config": {"provider": "hashing"}}),
        )
        .await;
    assert_eq!(status, 201);
    let (status, body) = server
        .post("/collections/ingest", json!({"collection_name": "empty"}))
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "bad_request");

    let (status, body) = server
        .post(
            "/collections",
            json!({"name": "empty", "embedder_config": {"provider": "hashing"}}),
        )
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "bad_request");

    let (status, body) = server
        .post(
            "/collections",
            json!({"name": "other", "embedder_config": {"provider": "no-such-provider"}}),
        )
        .await;
    assert_eq!(status, 400, "{}", body);

    let (status, body) = server
        .post("/data_sources", json!({"type": "ftp", "uri": "ftp://x"}))
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn test_collection_lifecycle_and_components() {
    let server = start().await;
    let fqn = server.seed().await;

    let (status, body) = server.get("/collections").await;
    assert_eq!(status, 200);
    assert_eq!(body["collections"][0]["name"], "docs");

    let (status, body) = server
        .post(
            "/collections/unassociate_data_source",
            json!({"collection_name": "docs", "data_source_fqn": fqn}),
        )
        .await;
    assert_eq!(status, 200);
    assert!(body["collection"]["associated_data_sources"]
        .as_object()
        .unwrap()
        .is_empty());

    let (status, body) = server
        .post(
            "/collections/associate_data_source",
            json!({
                "collection_name": "docs",
                "data_source_fqn": fqn,
                "parser_config": {"chunk_size": 200, "chunk_overlap": 10},
            }),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(
        body["collection"]["associated_data_sources"][&fqn]["parser_config"]["chunk_size"],
        200
    );

    let (status, body) = server.get("/data_sources").await;
    assert_eq!(status, 200);
    assert_eq!(body["data_sources"].as_array().unwrap().len(), 1);

    let (status, body) = server.get("/components/parsers").await;
    assert_eq!(status, 200);
    let names: Vec<_> = body["components"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["name"].as_str().unwrap().to_string())
        .collect();
    assert!(names.contains(&"MarkdownParser".to_string()));

    let (status, _) = server.get("/components/widgets").await;
    assert_eq!(status, 404);

    let resp = server
        .client
        .delete(format!("{}/collections/docs", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let (_, body) = server.get("/collections").await;
    assert!(body["collections"].as_array().unwrap().is_empty());
}
