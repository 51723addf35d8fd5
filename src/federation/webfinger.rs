//! WebFinger and remote actor directory
//!
//! Resolves `user@host` handles to actor documents and actor URLs back
//! to handles. Also generates the JRD documents served for local groups.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use super::activity::NoteObject;
use super::client::FederationClient;
use super::profile_cache::ProfileCache;
use super::signature::ACTIVITY_CONTENT_TYPE;
use crate::config::AppConfig;
use crate::data::Actor;
use crate::error::AppError;
use crate::metrics::REMOTE_FETCHES;

/// Public addressing collection
pub const PUBLIC_COLLECTION: &str = "https://www.w3.org/ns/activitystreams#Public";

/// Whether a recipient URL is the public collection in any of its spellings
pub fn is_public_collection(url: &str) -> bool {
    url.starts_with("https://www.w3.org/ns/activitystreams") || url == "as:Public" || url == "Public"
}

/// The parts of a remote actor document we use
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteProfile {
    /// Canonical actor URL
    pub id: String,
    /// Actor `type` (Person, Group, Service, OrderedCollection, ...)
    pub kind: String,
    pub preferred_username: Option<String>,
    pub name: Option<String>,
    pub inbox: Option<String>,
    pub shared_inbox: Option<String>,
    pub public_key_id: Option<String>,
    pub public_key_pem: Option<String>,
    pub icon_url: Option<String>,
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

/// `host[:port]` authority of a URL, lowercased
pub fn url_authority(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    Some(match parsed.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host,
    })
}

impl RemoteProfile {
    /// Extract profile fields from an actor document
    pub fn from_document(document: &Value, fetched_from: &str) -> Result<Self, AppError> {
        let id = string_field(document, "id").unwrap_or_else(|| fetched_from.to_string());
        let kind = match document.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            Some(Value::Array(kinds)) => kinds
                .iter()
                .filter_map(Value::as_str)
                .next()
                .unwrap_or_default()
                .to_string(),
            _ => String::new(),
        };

        let public_key = document.get("publicKey").map(|key| match key {
            // Some servers publish a list of keys; the first is the main key
            Value::Array(keys) => keys.first().cloned().unwrap_or(Value::Null),
            other => other.clone(),
        });

        let icon_url = match document.get("icon") {
            Some(Value::String(url)) => Some(url.clone()),
            Some(icon @ Value::Object(_)) => string_field(icon, "url"),
            Some(Value::Array(icons)) => icons.first().and_then(|icon| string_field(icon, "url")),
            _ => None,
        };

        Ok(Self {
            id,
            kind,
            preferred_username: string_field(document, "preferredUsername"),
            name: string_field(document, "name"),
            inbox: string_field(document, "inbox"),
            shared_inbox: document
                .get("endpoints")
                .and_then(|endpoints| string_field(endpoints, "sharedInbox")),
            public_key_id: public_key.as_ref().and_then(|key| string_field(key, "id")),
            public_key_pem: public_key
                .as_ref()
                .and_then(|key| string_field(key, "publicKeyPem")),
            icon_url,
        })
    }

    pub fn is_collection(&self) -> bool {
        self.kind.contains("Collection")
    }

    /// `preferredUsername@host[:port]`, lowercased
    pub fn handle(&self) -> Option<String> {
        let username = self.preferred_username.as_deref()?;
        let authority = url_authority(&self.id)?;
        Some(format!("{}@{}", username, authority).to_ascii_lowercase())
    }

    /// Inbox used for delivery: the shared inbox when advertised
    pub fn delivery_inbox(&self) -> Option<&str> {
        self.shared_inbox.as_deref().or(self.inbox.as_deref())
    }

    /// The actor's own inbox, falling back to the shared one
    pub fn personal_inbox(&self) -> Option<&str> {
        self.inbox.as_deref().or(self.shared_inbox.as_deref())
    }
}

/// WebFinger JRD response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerResponse {
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
    #[serde(default)]
    pub links: Vec<WebFingerLink>,
}

/// WebFinger link
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerLink {
    pub rel: String,
    #[serde(rename = "type")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

impl WebFingerResponse {
    /// The ActivityPub actor URL advertised by a `self` link
    pub fn actor_url(&self) -> Option<&str> {
        self.links
            .iter()
            .find(|link| {
                link.rel == "self"
                    && link.link_type.as_deref().is_some_and(|t| {
                        t == ACTIVITY_CONTENT_TYPE || t.starts_with("application/ld+json")
                    })
            })
            .and_then(|link| link.href.as_deref())
    }
}

/// Generate WebFinger response for a local group.
///
/// # Arguments
/// * `name` - Local group name
/// * `config` - Instance configuration
///
/// # Returns
/// JRD response for the group
pub fn generate_webfinger_response(name: &str, config: &AppConfig) -> WebFingerResponse {
    let subject = format!("acct:{}", config.server.group_handle(name));
    let actor_url = config.server.group_url(name);

    WebFingerResponse {
        subject,
        aliases: Some(vec![actor_url.clone()]),
        links: vec![
            WebFingerLink {
                rel: "self".to_string(),
                link_type: Some(ACTIVITY_CONTENT_TYPE.to_string()),
                href: Some(actor_url.clone()),
                template: None,
            },
            WebFingerLink {
                rel: "http://webfinger.net/rel/profile-page".to_string(),
                link_type: Some("text/html".to_string()),
                href: Some(actor_url),
                template: None,
            },
            WebFingerLink {
                rel: "http://ostatus.org/schema/1.0/subscribe".to_string(),
                link_type: None,
                href: None,
                template: Some(format!(
                    "{}/ostatus_subscribe?acct={{uri}}",
                    config.server.base_url()
                )),
            },
        ],
    }
}

/// Resolves remote actors and objects
pub struct RemoteDirectory {
    config: Arc<AppConfig>,
    client: Arc<dyn FederationClient>,
    cache: ProfileCache,
}

impl RemoteDirectory {
    pub fn new(config: Arc<AppConfig>, client: Arc<dyn FederationClient>) -> Self {
        let ttl = Duration::from_secs(config.federation.profile_cache_ttl_seconds);
        Self {
            config,
            client,
            cache: ProfileCache::new(ttl),
        }
    }

    pub fn cache(&self) -> &ProfileCache {
        &self.cache
    }

    /// GET a JSON document with ActivityPub content negotiation
    pub async fn fetch_document(&self, url: &str, kind: &'static str) -> Result<Value, AppError> {
        let mut headers = http::HeaderMap::new();
        headers.insert(
            http::header::ACCEPT,
            http::HeaderValue::from_static("application/activity+json, application/ld+json, application/json"),
        );

        let result = match self.client.get(url, headers).await {
            Ok(response) => response.json(url),
            Err(error) => Err(AppError::RemoteFetch(format!("{url}: {error}"))),
        };

        let label = if result.is_ok() { "success" } else { "error" };
        REMOTE_FETCHES.with_label_values(&[kind, label]).inc();
        if let Err(error) = &result {
            tracing::warn!(url = %url, kind, %error, "Remote fetch failed");
        }
        result
    }

    /// Fetch and cache an actor (or collection) document
    pub async fn fetch_profile(&self, url: &str) -> Result<RemoteProfile, AppError> {
        let url = url.split('#').next().unwrap_or(url);
        if let Some(profile) = self.cache.get(url).await {
            return Ok(profile);
        }

        let document = self.fetch_document(url, "actor").await?;
        let profile = RemoteProfile::from_document(&document, url)?;

        // An actor is only trusted under the id it was fetched from
        let profile_id = profile.id.split('#').next().unwrap_or(&profile.id);
        if profile_id != url {
            return Err(AppError::RemoteFetch(format!(
                "{url} returned an actor with id {}",
                profile.id
            )));
        }
        self.cache.insert(url, &profile).await;
        Ok(profile)
    }

    /// Resolve `user@host` to an actor URL via WebFinger
    pub async fn webfinger(&self, handle: &str) -> Result<String, AppError> {
        let handle = handle.trim().trim_start_matches('@');
        let (_, host) = handle
            .split_once('@')
            .ok_or_else(|| AppError::Validation(format!("Invalid handle: {handle}")))?;

        let url = format!(
            "https://{}/.well-known/webfinger?resource=acct:{}",
            host,
            urlencoding::encode(handle)
        );
        let document = self.fetch_document(&url, "webfinger").await?;
        let jrd: WebFingerResponse = serde_json::from_value(document)
            .map_err(|e| AppError::RemoteFetch(format!("Invalid WebFinger response from {host}: {e}")))?;

        jrd.actor_url()
            .map(str::to_string)
            .ok_or_else(|| AppError::RemoteFetch(format!("No ActivityPub actor link for {handle}")))
    }

    /// Profile of an actor row: the cached actor URL when known, WebFinger otherwise
    pub async fn profile_for_actor(&self, actor: &Actor) -> Result<RemoteProfile, AppError> {
        let actor_url = match &actor.actor_url {
            Some(url) => url.clone(),
            None => self.webfinger(&actor.handle).await?,
        };
        self.fetch_profile(&actor_url).await
    }

    /// Map a URL to a `user@host` handle.
    ///
    /// Local group URLs map without a network call. The public
    /// collection, other local URLs and remote collections map to `None`.
    pub async fn handle_from_url(&self, url: &str) -> Result<Option<String>, AppError> {
        if is_public_collection(url) {
            return Ok(None);
        }

        let server = &self.config.server;
        if let Some(name) = server.group_name_from_url(url) {
            return Ok(Some(server.group_handle(&name)));
        }
        if server.is_local_url(url) {
            return Ok(None);
        }

        let profile = self.fetch_profile(url).await?;
        if profile.is_collection() {
            return Ok(None);
        }

        profile
            .handle()
            .map(Some)
            .ok_or_else(|| AppError::RemoteFetch(format!("{url} has no preferredUsername")))
    }

    /// Dereference a remote note
    pub async fn fetch_note(&self, id: &str) -> Result<NoteObject, AppError> {
        let document = self.fetch_document(id, "note").await?;
        let note: NoteObject = serde_json::from_value(document)
            .map_err(|e| AppError::RemoteFetch(format!("{id} is not a note: {e}")))?;

        // A note is only trusted under the id it was fetched from
        if note.id != id {
            return Err(AppError::RemoteFetch(format!(
                "{id} returned an object with id {}",
                note.id
            )));
        }
        Ok(note)
    }
}
