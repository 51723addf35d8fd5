//! Common test utilities for E2E tests
//!
//! `TestServer` runs the real router on an ephemeral port. `FakeInstance`
//! plays a remote server: it serves scripted documents and records every
//! POST it receives.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use fedigroup::data::Group;
use fedigroup::federation::sign_request;
use fedigroup::{AppState, config};
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::TcpListener;

/// Process-wide RSA key pair for remote actors (PKCS#8 private, SPKI public)
pub fn remote_keys() -> (&'static str, &'static str) {
    static KEYS: OnceLock<(String, String)> = OnceLock::new();
    let keys = KEYS.get_or_init(|| {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let public_key = RsaPublicKey::from(&private_key);
        (
            private_key.to_pkcs8_pem(LineEnding::LF).unwrap().to_string(),
            public_key.to_public_key_pem(LineEnding::LF).unwrap(),
        )
    });
    (keys.0.as_str(), keys.1.as_str())
}

async fn spawn_router(app: axum::Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("127.0.0.1:{}", addr.port())
}

/// A POST received by the fake instance
#[derive(Debug, Clone)]
pub struct ReceivedPost {
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ReceivedPost {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }
}

#[derive(Default)]
struct FakeInstanceState {
    documents: Mutex<HashMap<String, Value>>,
    posts: Mutex<Vec<ReceivedPost>>,
}

/// A remote ActivityPub server
pub struct FakeInstance {
    pub authority: String,
    state: Arc<FakeInstanceState>,
}

async fn fake_instance_handler(
    State(state): State<Arc<FakeInstanceState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();
    if method == Method::POST {
        state.posts.lock().unwrap().push(ReceivedPost {
            path,
            headers,
            body,
        });
        return StatusCode::ACCEPTED.into_response();
    }

    match state.documents.lock().unwrap().get(&path) {
        Some(document) => (
            [(header::CONTENT_TYPE, "application/activity+json")],
            document.to_string(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

impl FakeInstance {
    pub async fn start() -> Self {
        let state = Arc::new(FakeInstanceState::default());
        let app = axum::Router::new()
            .fallback(fake_instance_handler)
            .with_state(state.clone());
        let authority = spawn_router(app).await;
        Self { authority, state }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.authority, path)
    }

    /// Serve a JSON document at `path`
    pub fn serve(&self, path: &str, document: Value) {
        self.state
            .documents
            .lock()
            .unwrap()
            .insert(path.to_string(), document);
    }

    /// Register a Person at `/users/{name}` and return its id
    pub fn add_actor(&self, name: &str) -> String {
        let id = self.url(&format!("/users/{name}"));
        let (_, public_key_pem) = remote_keys();
        self.serve(
            &format!("/users/{name}"),
            json!({
                "@context": "https://www.w3.org/ns/activitystreams",
                "id": id,
                "type": "Person",
                "preferredUsername": name,
                "inbox": format!("{id}/inbox"),
                "endpoints": { "sharedInbox": self.url("/inbox") },
                "publicKey": {
                    "id": format!("{id}#main-key"),
                    "owner": id,
                    "publicKeyPem": public_key_pem
                }
            }),
        );
        id
    }

    pub fn posts(&self) -> Vec<ReceivedPost> {
        self.state.posts.lock().unwrap().clone()
    }

    pub fn posts_to(&self, path: &str) -> Vec<ReceivedPost> {
        self.posts().into_iter().filter(|p| p.path == path).collect()
    }
}

/// Test server instance
pub struct TestServer {
    pub authority: String,
    pub state: AppState,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Create a new test server instance
    pub async fn new() -> Self {
        // Create temporary directory for test database
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        // Bind first so that the public domain carries the real port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let authority = format!("127.0.0.1:{}", addr.port());

        let config = config::AppConfig {
            server: config::ServerConfig {
                host: "127.0.0.1".to_string(),
                port: addr.port(),
                domain: authority.clone(),
                protocol: "http".to_string(),
            },
            database: config::DatabaseConfig { path: db_path },
            federation: config::FederationConfig {
                max_thread_depth: 5,
                http_timeout_seconds: 5,
                allow_private_networks: true,
                ..config::FederationConfig::default()
            },
            logging: config::LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        };

        let state = AppState::new(config).await.unwrap();
        let app = fedigroup::build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap();

        Self {
            authority,
            state,
            _temp_dir: temp_dir,
            client,
        }
    }

    /// Get full URL for a path
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.authority, path)
    }

    pub async fn create_group(&self, name: &str) -> Group {
        self.state
            .group_service()
            .create_group(name, "", "A test group", None)
            .await
            .unwrap()
    }

    /// POST an activity signed with the remote actor key
    pub async fn post_signed(&self, path: &str, actor_id: &str, activity: &Value) -> reqwest::Response {
        let (private_key_pem, _) = remote_keys();
        let body = serde_json::to_vec(activity).unwrap();
        let url = self.url(path);
        let headers = sign_request(
            "POST",
            &url,
            Some(&body),
            private_key_pem,
            &format!("{actor_id}#main-key"),
        )
        .unwrap()
        .to_header_map()
        .unwrap();

        self.client
            .post(&url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .unwrap()
    }

    /// Wait for queued deliveries to finish
    pub async fn settle(&self) {
        self.state.delivery.join_background().await;
    }
}
