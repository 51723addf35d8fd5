//! ActivityPub federation module
//!
//! Handles:
//! - Inbox processing (Follow, Undo, Create)
//! - Activity delivery to group followers
//! - HTTP Signatures
//! - WebFinger and remote actor lookup
//! - Reply thread resolution
//! - Remote profile caching

mod activity;
mod client;
mod delivery;
mod membership;
mod mention;
mod profile_cache;
mod signature;
mod tasks;
mod thread;
mod webfinger;

#[cfg(test)]
pub(crate) mod test_support;

pub use activity::{Activity, ActivityEnvelope, ActivityRouter, InboxOutcome, NoteObject, ObjectRef};
pub use client::{FederationClient, HttpResponse, ReqwestFederationClient, validate_remote_url};
pub use delivery::{DeliveryFanout, DeliveryResult, builder};
pub use membership::MembershipGate;
pub use mention::MentionResolver;
pub use profile_cache::ProfileCache;
pub use signature::{
    ACTIVITY_CONTENT_TYPE, RequestParts, SignatureError, SignatureHeaders, extract_key_id,
    generate_digest, key_id_matches_actor, parse_request_signature, parse_signature_header,
    sign_headers, sign_request, sign_request_rfc9421, verify_request_at, verify_signature,
};
pub use tasks::BackgroundTasks;
pub use thread::ThreadResolver;
pub use webfinger::{
    PUBLIC_COLLECTION, RemoteDirectory, RemoteProfile, WebFingerLink, WebFingerResponse,
    generate_webfinger_response, is_public_collection,
};
