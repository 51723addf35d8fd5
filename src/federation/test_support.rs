//! Shared fixtures for federation unit tests

use async_trait::async_trait;
use chrono::Utc;
use http::HeaderMap;
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use tempfile::TempDir;

use super::client::{FederationClient, HttpResponse};
use crate::config::{AppConfig, DatabaseConfig, FederationConfig, LoggingConfig, ServerConfig};
use crate::data::{Database, EntityId, Group};
use crate::error::AppError;

/// Process-wide RSA key pair (PKCS#8 private, SPKI public)
pub fn test_keys() -> (&'static str, &'static str) {
    static KEYS: OnceLock<(String, String)> = OnceLock::new();
    let keys = KEYS.get_or_init(generate_keys);
    (keys.0.as_str(), keys.1.as_str())
}

/// A second, unrelated key pair
pub fn other_test_keys() -> (&'static str, &'static str) {
    static KEYS: OnceLock<(String, String)> = OnceLock::new();
    let keys = KEYS.get_or_init(generate_keys);
    (keys.0.as_str(), keys.1.as_str())
}

fn generate_keys() -> (String, String) {
    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, 1024).expect("key generation should work");
    let public_key = RsaPublicKey::from(&private_key);
    let private_key_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .expect("private key encodes")
        .to_string();
    let public_key_pem = public_key
        .to_public_key_pem(LineEnding::LF)
        .expect("public key encodes");
    (private_key_pem, public_key_pem)
}

pub fn test_config() -> AppConfig {
    AppConfig {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            domain: "groups.example".to_string(),
            protocol: "https".to_string(),
        },
        database: DatabaseConfig {
            path: PathBuf::from("unused.db"),
        },
        federation: FederationConfig {
            max_thread_depth: 3,
            ..FederationConfig::default()
        },
        logging: LoggingConfig {
            level: "debug".to_string(),
            format: "pretty".to_string(),
        },
    }
}

pub async fn test_database() -> (Arc<Database>, TempDir) {
    let temp_dir = TempDir::new().expect("temp dir");
    let db = Database::connect(&temp_dir.path().join("test.db"))
        .await
        .expect("database");
    (Arc::new(db), temp_dir)
}

/// Store a group signed with [`test_keys`]
pub async fn create_group(db: &Database, config: &AppConfig, name: &str) -> Group {
    let (private_key_pem, public_key_pem) = test_keys();
    let actor = db
        .get_or_create_actor(&config.server.group_handle(name))
        .await
        .expect("group actor");
    let group = Group {
        id: EntityId::new().0,
        name: name.to_string(),
        actor_id: actor.id,
        display_name: name.to_string(),
        summary: String::new(),
        creator_id: None,
        discoverable: true,
        icon_url: None,
        private_key_pem: private_key_pem.to_string(),
        public_key_pem: public_key_pem.to_string(),
        created_at: Utc::now(),
    };
    db.create_group(&group).await.expect("group stored");
    group
}

/// Minimal remote actor document with a shared inbox
pub fn actor_document(id: &str, username: &str, public_key_pem: &str) -> Value {
    let base = id
        .find("/users/")
        .map(|at| &id[..at])
        .unwrap_or(id);
    json!({
        "@context": ["https://www.w3.org/ns/activitystreams", "https://w3id.org/security/v1"],
        "id": id,
        "type": "Person",
        "preferredUsername": username,
        "name": username,
        "inbox": format!("{id}/inbox"),
        "endpoints": {"sharedInbox": format!("{base}/inbox")},
        "publicKey": {
            "id": format!("{id}#main-key"),
            "owner": id,
            "publicKeyPem": public_key_pem
        }
    })
}

/// A delivered POST
#[derive(Debug, Clone)]
pub struct RecordedPost {
    pub url: String,
    pub headers: HeaderMap,
    pub body: Value,
}

/// Scripted remote web: GETs are served from a route table, POSTs are recorded
#[derive(Default)]
pub struct FakeRemote {
    documents: Mutex<HashMap<String, Value>>,
    failing: Mutex<HashSet<String>>,
    fetched: Mutex<Vec<String>>,
    posts: Mutex<Vec<RecordedPost>>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(&self, url: &str, document: Value) {
        self.documents
            .lock()
            .expect("lock")
            .insert(url.to_string(), document);
    }

    /// Make every request to `url` fail at the transport level
    pub fn fail(&self, url: &str) {
        self.failing.lock().expect("lock").insert(url.to_string());
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().expect("lock").clone()
    }

    pub fn posts(&self) -> Vec<RecordedPost> {
        self.posts.lock().expect("lock").clone()
    }

    pub fn posts_to(&self, url: &str) -> Vec<RecordedPost> {
        self.posts().into_iter().filter(|post| post.url == url).collect()
    }
}

#[async_trait]
impl FederationClient for FakeRemote {
    async fn get(&self, url: &str, _headers: HeaderMap) -> Result<HttpResponse, AppError> {
        self.fetched.lock().expect("lock").push(url.to_string());
        if self.failing.lock().expect("lock").contains(url) {
            return Err(AppError::RemoteFetch(format!("{url}: connection refused")));
        }

        let document = self.documents.lock().expect("lock").get(url).cloned();
        Ok(match document {
            Some(document) => HttpResponse {
                status: 200,
                body: serde_json::to_vec(&document).expect("json"),
            },
            None => HttpResponse {
                status: 404,
                body: Vec::new(),
            },
        })
    }

    async fn post(&self, url: &str, headers: HeaderMap, body: Vec<u8>) -> Result<HttpResponse, AppError> {
        if self.failing.lock().expect("lock").contains(url) {
            return Err(AppError::RemoteFetch(format!("{url}: connection refused")));
        }

        self.posts.lock().expect("lock").push(RecordedPost {
            url: url.to_string(),
            headers,
            body: serde_json::from_slice(&body).unwrap_or(Value::Null),
        });
        Ok(HttpResponse {
            status: 202,
            body: Vec::new(),
        })
    }
}
