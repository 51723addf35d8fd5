//! HTTP Signatures for ActivityPub
//!
//! Implements signing and verification of both header formats seen in
//! the fediverse:
//! - the draft-cavage `Signature` header used by Mastodon
//!   (https://docs.joinmastodon.org/spec/security/)
//! - the `Signature-Input` / `Signature` pair of RFC 9421
//!
//! The signing string is hashed and signed with RSASSA-PKCS1-v1_5.
//! Verification reconstructs every signed value from the live request
//! rather than trusting the values a sender claims it signed.

use crate::error::AppError;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use http::HeaderMap;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;

/// Content type of every activity we send
pub const ACTIVITY_CONTENT_TYPE: &str = "application/activity+json";

/// `Date` header format (IMF-fixdate)
pub const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Label used for RFC 9421 signatures we produce
const RFC9421_LABEL: &str = "sig1";

/// Reasons a signature does not verify
#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("no signature header present")]
    Unsigned,
    #[error("malformed signature header: {0}")]
    Malformed(String),
    #[error("signed components must include {0}")]
    MissingComponent(&'static str),
    #[error("signed header {0} is absent from the request")]
    MissingHeader(String),
    #[error("unsupported signed component {0}")]
    UnsupportedComponent(String),
    #[error("date {0} is outside the accepted window")]
    Stale(String),
    #[error("signature expired")]
    Expired,
    #[error("invalid public key: {0}")]
    InvalidKey(String),
    #[error("signature does not match")]
    Mismatch,
}

/// Headers to add for signed request
#[derive(Debug, Clone)]
pub struct SignatureHeaders {
    /// Signature header value
    pub signature: String,
    /// Signature-Input header value (RFC 9421 only)
    pub signature_input: Option<String>,
    /// Host header value the signature covers
    pub host: String,
    /// Date header value (RFC 2616)
    pub date: String,
    /// Digest header value (if body present)
    pub digest: Option<String>,
}

impl SignatureHeaders {
    /// All headers of the signed request, ready for the HTTP client
    pub fn to_header_map(&self) -> Result<HeaderMap, AppError> {
        let mut headers = HeaderMap::new();
        insert_header(&mut headers, "host", &self.host)?;
        insert_header(&mut headers, "date", &self.date)?;
        insert_header(&mut headers, "signature", &self.signature)?;
        if let Some(input) = &self.signature_input {
            insert_header(&mut headers, "signature-input", input)?;
        }
        match &self.digest {
            Some(digest) => {
                insert_header(&mut headers, "digest", digest)?;
                insert_header(&mut headers, "content-type", ACTIVITY_CONTENT_TYPE)?;
            }
            None => insert_header(&mut headers, "accept", ACTIVITY_CONTENT_TYPE)?,
        }
        Ok(headers)
    }
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) -> Result<(), AppError> {
    let value = http::HeaderValue::from_str(value)
        .map_err(|e| AppError::Validation(format!("Invalid {name} header value: {e}")))?;
    headers.insert(name, value);
    Ok(())
}

/// The request a signature is verified against
#[derive(Debug, Clone, Copy)]
pub struct RequestParts<'a> {
    pub method: &'a str,
    /// Path and query as received
    pub path: &'a str,
    pub headers: &'a HeaderMap,
    pub body: &'a [u8],
    /// Precomputed `SHA-256=...` digest of `body`, if the caller has one
    pub body_digest: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignatureFormat {
    Cavage,
    Rfc9421,
}

/// Parsed signature parameters, either header format
#[derive(Debug, Clone)]
pub struct ParsedSignature {
    format: SignatureFormat,
    /// Key ID (URL to public key)
    pub key_id: String,
    /// Declared algorithm (`algorithm` or `alg`)
    pub algorithm: Option<String>,
    /// Signed component names, lowercased, in signing order
    pub components: Vec<String>,
    /// Base64-encoded signature
    pub signature: String,
    pub created: Option<i64>,
    pub expires: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HashAlgorithm {
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    fn from_declared(algorithm: Option<&str>) -> Self {
        match algorithm.map(|a| a.to_ascii_lowercase()).as_deref() {
            Some("rsa-sha512") | Some("rsa-pss-sha512") => Self::Sha512,
            // rsa-sha256, rsa-v1_5-sha256, hs2019 and anything unrecognised
            _ => Self::Sha256,
        }
    }

    fn hash(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha256 => Sha256::digest(data).to_vec(),
            Self::Sha512 => Sha512::digest(data).to_vec(),
        }
    }

    fn scheme(self) -> Pkcs1v15Sign {
        match self {
            Self::Sha256 => Pkcs1v15Sign::new::<Sha256>(),
            Self::Sha512 => Pkcs1v15Sign::new::<Sha512>(),
        }
    }
}

/// Generate SHA-256 digest for body
///
/// # Returns
/// `SHA-256=base64(hash)`
pub fn generate_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    let hash = hasher.finalize();
    format!("SHA-256={}", BASE64.encode(hash))
}

/// Current time formatted for the `Date` header
pub fn http_date_now() -> String {
    Utc::now().format(HTTP_DATE_FORMAT).to_string()
}

/// Header set covered by our signatures: GET requests sign `accept`,
/// requests with a body sign `digest` and `content-type`.
fn signed_header_set(
    method: &str,
    path: &str,
    host: &str,
    date: &str,
    digest: Option<&str>,
) -> Vec<(&'static str, String)> {
    let mut pairs = vec![
        ("(request-target)", format!("{} {}", method.to_lowercase(), path)),
        ("host", host.to_string()),
        ("date", date.to_string()),
    ];
    match digest {
        Some(digest) => {
            pairs.push(("digest", digest.to_string()));
            pairs.push(("content-type", ACTIVITY_CONTENT_TYPE.to_string()));
        }
        None => pairs.push(("accept", ACTIVITY_CONTENT_TYPE.to_string())),
    }
    pairs
}

fn load_private_key(private_key_pem: &str) -> Result<RsaPrivateKey, AppError> {
    RsaPrivateKey::from_pkcs8_pem(private_key_pem)
        .map_err(|e| AppError::Key(format!("Invalid private key: {}", e)))
}

fn load_public_key(public_key_pem: &str) -> Result<RsaPublicKey, SignatureError> {
    RsaPublicKey::from_public_key_pem(public_key_pem.trim())
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(public_key_pem.trim()))
        .map_err(|e| SignatureError::InvalidKey(e.to_string()))
}

fn sign_string(private_key: &RsaPrivateKey, signing_string: &str) -> Result<String, AppError> {
    let hashed = HashAlgorithm::Sha256.hash(signing_string.as_bytes());
    let signature = private_key
        .sign(HashAlgorithm::Sha256.scheme(), &hashed)
        .map_err(|e| AppError::Key(format!("Signing failed: {}", e)))?;
    Ok(BASE64.encode(signature))
}

/// Sign request metadata with the draft-cavage `Signature` header.
///
/// # Arguments
/// * `method` - HTTP method (e.g., "POST")
/// * `path` - Path and query of the request
/// * `host` - Host header value, including any explicit port
/// * `date` - Date header value
/// * `body` - Request body; `None` signs the GET header set
/// * `key_id` - Full URL to the public key (actor#main-key)
/// * `private_key_pem` - RSA private key in PKCS#8 PEM format
pub fn sign_headers(
    method: &str,
    path: &str,
    host: &str,
    date: &str,
    body: Option<&[u8]>,
    key_id: &str,
    private_key_pem: &str,
) -> Result<SignatureHeaders, AppError> {
    let digest = body.map(generate_digest);
    let pairs = signed_header_set(method, path, host, date, digest.as_deref());

    let signing_string = pairs
        .iter()
        .map(|(name, value)| format!("{}: {}", name, value))
        .collect::<Vec<_>>()
        .join("\n");
    let header_names = pairs
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(" ");

    let private_key = load_private_key(private_key_pem)?;
    let signature_b64 = sign_string(&private_key, &signing_string)?;

    let signature_header = format!(
        "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
        key_id, header_names, signature_b64
    );

    Ok(SignatureHeaders {
        signature: signature_header,
        signature_input: None,
        host: host.to_string(),
        date: date.to_string(),
        digest,
    })
}

fn split_target(url: &str) -> Result<(String, String), AppError> {
    let parsed_url =
        url::Url::parse(url).map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;

    let host = parsed_url
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in URL".to_string()))?;
    let host = match parsed_url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };

    let path_and_query = match parsed_url.query() {
        Some(q) => format!("{}?{}", parsed_url.path(), q),
        None => parsed_url.path().to_string(),
    };

    Ok((host, path_and_query))
}

/// Sign an outgoing request to `url`, stamping the current date.
///
/// # Example
/// ```ignore
/// let headers = sign_request(
///     "POST",
///     "https://remote.server/inbox",
///     Some(&body),
///     &private_key,
///     "https://my.server/group/cats#main-key",
/// )?;
/// ```
pub fn sign_request(
    method: &str,
    url: &str,
    body: Option<&[u8]>,
    private_key_pem: &str,
    key_id: &str,
) -> Result<SignatureHeaders, AppError> {
    let (host, path_and_query) = split_target(url)?;
    sign_headers(
        method,
        &path_and_query,
        &host,
        &http_date_now(),
        body,
        key_id,
        private_key_pem,
    )
}

/// Sign an outgoing request with an RFC 9421 `Signature-Input` / `Signature` pair.
///
/// Covers the same header set as [`sign_request`], with `@request-target`
/// in place of `(request-target)`.
pub fn sign_request_rfc9421(
    method: &str,
    url: &str,
    body: Option<&[u8]>,
    private_key_pem: &str,
    key_id: &str,
) -> Result<SignatureHeaders, AppError> {
    let (host, path_and_query) = split_target(url)?;
    let date = http_date_now();
    let digest = body.map(generate_digest);
    let pairs = signed_header_set(method, &path_and_query, &host, &date, digest.as_deref());

    let mut names = Vec::with_capacity(pairs.len());
    let mut lines = Vec::with_capacity(pairs.len());
    for (name, value) in &pairs {
        let name = if *name == "(request-target)" {
            "@request-target"
        } else {
            name
        };
        names.push(format!("\"{}\"", name));
        lines.push(format!("{}: {}", name, value));
    }

    let private_key = load_private_key(private_key_pem)?;
    let signature_b64 = sign_string(&private_key, &lines.join("\n"))?;

    let signature_input = format!(
        "{}=({});keyid=\"{}\";alg=\"rsa-sha256\";created={}",
        RFC9421_LABEL,
        names.join(" "),
        key_id,
        Utc::now().timestamp()
    );

    Ok(SignatureHeaders {
        signature: format!("{}=:{}:", RFC9421_LABEL, signature_b64),
        signature_input: Some(signature_input),
        host,
        date,
        digest,
    })
}

/// Verify an HTTP request signature
///
/// Verification failures are an ordinary outcome: any parse failure,
/// missing signed header, stale date or cryptographic mismatch yields
/// `false`. The reason is logged at debug level.
pub fn verify_signature(public_key_pem: &str, request: &RequestParts<'_>, max_age_seconds: i64) -> bool {
    match verify_request_at(public_key_pem, request, max_age_seconds, Utc::now()) {
        Ok(()) => true,
        Err(error) => {
            tracing::debug!(%error, method = %request.method, path = %request.path, "Signature rejected");
            false
        }
    }
}

/// Verify a request as of `now`, returning the reason on failure.
pub fn verify_request_at(
    public_key_pem: &str,
    request: &RequestParts<'_>,
    max_age_seconds: i64,
    now: DateTime<Utc>,
) -> Result<(), SignatureError> {
    let parsed = parse_request_signature(request.headers)?;
    check_required_components(&parsed, request.body)?;

    if let Some(expires) = parsed.expires {
        if expires < now.timestamp() {
            return Err(SignatureError::Expired);
        }
    }

    let mut lines = Vec::with_capacity(parsed.components.len());
    for component in &parsed.components {
        let value = component_value(component, &parsed, request, max_age_seconds, now)?;
        lines.push(format!("{}: {}", component, value));
    }
    let signing_string = lines.join("\n");

    let signature = BASE64
        .decode(parsed.signature.as_bytes())
        .map_err(|e| SignatureError::Malformed(format!("signature is not base64: {}", e)))?;
    let public_key = load_public_key(public_key_pem)?;

    let algorithm = HashAlgorithm::from_declared(parsed.algorithm.as_deref());
    let hashed = algorithm.hash(signing_string.as_bytes());
    public_key
        .verify(algorithm.scheme(), &hashed, &signature)
        .map_err(|_| SignatureError::Mismatch)
}

fn check_required_components(parsed: &ParsedSignature, body: &[u8]) -> Result<(), SignatureError> {
    let has = |name: &str| parsed.components.iter().any(|c| c == name);

    if !(has("(request-target)") || has("@request-target") || has("@path")) {
        return Err(SignatureError::MissingComponent("(request-target)"));
    }

    match parsed.format {
        SignatureFormat::Cavage => {
            if !has("date") {
                return Err(SignatureError::MissingComponent("date"));
            }
        }
        SignatureFormat::Rfc9421 => {
            if !(has("date") || has("@created")) {
                return Err(SignatureError::MissingComponent("date"));
            }
        }
    }

    if !body.is_empty() && !has("digest") {
        return Err(SignatureError::MissingComponent("digest"));
    }

    Ok(())
}

/// Value of a signed component, taken from the live request.
fn component_value(
    component: &str,
    parsed: &ParsedSignature,
    request: &RequestParts<'_>,
    max_age_seconds: i64,
    now: DateTime<Utc>,
) -> Result<String, SignatureError> {
    let value = match component {
        "(request-target)" | "@request-target" => {
            format!("{} {}", request.method.to_lowercase(), request.path)
        }
        "@method" => request.method.to_uppercase(),
        "@path" => request
            .path
            .split('?')
            .next()
            .unwrap_or(request.path)
            .to_string(),
        "@authority" => header_value(request.headers, "host")?.to_ascii_lowercase(),
        "@created" | "(created)" => {
            let created = parsed
                .created
                .ok_or_else(|| SignatureError::Malformed("created parameter missing".to_string()))?;
            check_timestamp_window(created, max_age_seconds, now)?;
            created.to_string()
        }
        "@expires" | "(expires)" => parsed
            .expires
            .ok_or_else(|| SignatureError::Malformed("expires parameter missing".to_string()))?
            .to_string(),
        "digest" => match request.body_digest {
            Some(digest) => digest.to_string(),
            None => generate_digest(request.body),
        },
        "date" => {
            let date = header_value(request.headers, "date")?;
            check_date_window(&date, max_age_seconds, now)?;
            date
        }
        other if other.starts_with('@') || other.starts_with('(') => {
            return Err(SignatureError::UnsupportedComponent(other.to_string()));
        }
        other => header_value(request.headers, other)?,
    };
    Ok(value)
}

fn header_value(headers: &HeaderMap, name: &str) -> Result<String, SignatureError> {
    let values = headers
        .get_all(name)
        .iter()
        .map(|value| value.to_str().map(str::trim))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| SignatureError::Malformed(format!("{name} header is not valid text")))?;

    if values.is_empty() {
        return Err(SignatureError::MissingHeader(name.to_string()));
    }
    Ok(values.join(", "))
}

fn check_date_window(date: &str, max_age_seconds: i64, now: DateTime<Utc>) -> Result<(), SignatureError> {
    let signed_at = DateTime::parse_from_rfc2822(date)
        .map_err(|_| SignatureError::Stale(date.to_string()))?;
    check_timestamp_window(signed_at.timestamp(), max_age_seconds, now)
        .map_err(|_| SignatureError::Stale(date.to_string()))
}

fn check_timestamp_window(
    timestamp: i64,
    max_age_seconds: i64,
    now: DateTime<Utc>,
) -> Result<(), SignatureError> {
    match now.timestamp().checked_sub(timestamp) {
        Some(age) if (0..=max_age_seconds).contains(&age) => Ok(()),
        _ => Err(SignatureError::Stale(timestamp.to_string())),
    }
}

/// Parse whichever signature format the request carries.
///
/// `Signature-Input` takes precedence over a legacy `Signature` header.
pub fn parse_request_signature(headers: &HeaderMap) -> Result<ParsedSignature, SignatureError> {
    let text = |name: &str| -> Result<Option<String>, SignatureError> {
        headers
            .get(name)
            .map(|value| {
                value
                    .to_str()
                    .map(str::to_string)
                    .map_err(|_| SignatureError::Malformed(format!("{name} header is not valid text")))
            })
            .transpose()
    };

    match (text("signature-input")?, text("signature")?) {
        (Some(input), Some(signature)) => parse_rfc9421(&input, &signature),
        (Some(_), None) => Err(SignatureError::MissingHeader("signature".to_string())),
        (None, Some(signature)) => parse_signature_header(&signature),
        (None, None) => Err(SignatureError::Unsigned),
    }
}

/// Extract the key id from either signature format
pub fn extract_key_id(headers: &HeaderMap) -> Option<String> {
    parse_request_signature(headers).ok().map(|parsed| parsed.key_id)
}

/// Validate that signature keyId points to the same actor as the activity actor.
pub fn key_id_matches_actor(key_id: &str, actor_id: &str) -> bool {
    let key_actor = key_id.split('#').next().unwrap_or(key_id);
    let actor = actor_id.split('#').next().unwrap_or(actor_id);
    key_actor == actor
}

/// Split on `separator` outside of double quotes and parentheses.
fn split_top_level(input: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut depth = 0usize;
    let mut start = 0;

    for (index, ch) in input.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            '(' if !in_quotes => depth += 1,
            ')' if !in_quotes => depth = depth.saturating_sub(1),
            c if c == separator && !in_quotes && depth == 0 => {
                parts.push(&input[start..index]);
                start = index + ch.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);
    parts
}

fn unquote(value: &str) -> &str {
    let value = value.trim();
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

/// Parse Signature header value
///
/// # Format
/// ```text
/// keyId="...",algorithm="...",headers="...",signature="..."
/// ```
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, SignatureError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut components = None;
    let mut signature = None;
    let mut created = None;
    let mut expires = None;

    for part in split_top_level(header, ',') {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        let value = unquote(value);

        match key.trim() {
            "keyId" => key_id = Some(value.to_string()),
            "algorithm" => algorithm = Some(value.to_string()),
            "headers" => {
                components = Some(
                    value
                        .split_whitespace()
                        .map(|s| s.to_ascii_lowercase())
                        .collect::<Vec<_>>(),
                )
            }
            "signature" => signature = Some(value.to_string()),
            "created" => created = value.parse().ok(),
            "expires" => expires = value.parse().ok(),
            _ => {} // Ignore unknown fields
        }
    }

    Ok(ParsedSignature {
        format: SignatureFormat::Cavage,
        key_id: key_id.ok_or_else(|| SignatureError::Malformed("missing keyId".to_string()))?,
        algorithm,
        // Without a headers list only the date is signed
        components: components.unwrap_or_else(|| vec!["date".to_string()]),
        signature: signature
            .ok_or_else(|| SignatureError::Malformed("missing signature".to_string()))?,
        created,
        expires,
    })
}

/// Parse an RFC 9421 `Signature-Input` / `Signature` pair.
///
/// Only the first signature label of `Signature-Input` is considered.
fn parse_rfc9421(input: &str, signature_header: &str) -> Result<ParsedSignature, SignatureError> {
    let first = split_top_level(input, ',')
        .into_iter()
        .next()
        .unwrap_or_default();
    let (label, definition) = first
        .split_once('=')
        .ok_or_else(|| SignatureError::Malformed("signature-input has no label".to_string()))?;
    let label = label.trim();

    let mut params = split_top_level(definition, ';').into_iter();
    let component_list = params.next().unwrap_or_default().trim();
    let inner = component_list
        .strip_prefix('(')
        .and_then(|v| v.strip_suffix(')'))
        .ok_or_else(|| SignatureError::Malformed("component list must be parenthesised".to_string()))?;
    let components = inner
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|c| !c.is_empty())
        .map(|c| unquote(c).to_ascii_lowercase())
        .collect::<Vec<_>>();

    let mut key_id = None;
    let mut algorithm = None;
    let mut created = None;
    let mut expires = None;
    for param in params {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        let value = unquote(value);
        match key.trim() {
            "keyid" => key_id = Some(value.to_string()),
            "alg" => algorithm = Some(value.to_string()),
            "created" => created = value.parse().ok(),
            "expires" => expires = value.parse().ok(),
            _ => {}
        }
    }

    let signature = split_top_level(signature_header, ',')
        .into_iter()
        .find_map(|entry| {
            let (entry_label, value) = entry.split_once('=')?;
            if entry_label.trim() != label {
                return None;
            }
            let value = value.trim();
            value
                .strip_prefix(':')
                .and_then(|v| v.strip_suffix(':'))
                .map(str::to_string)
        })
        .ok_or_else(|| SignatureError::Malformed(format!("no signature for label {label}")))?;

    Ok(ParsedSignature {
        format: SignatureFormat::Rfc9421,
        key_id: key_id.ok_or_else(|| SignatureError::Malformed("missing keyid".to_string()))?,
        algorithm,
        components,
        signature,
        created,
        expires,
    })
}
