//! Identity derivation for every entity kind.
//!
//! All functions here are pure: the same raw object always yields the same
//! identity, independent of field order. Identities are what deduplicates
//! entities across fetches, so every textual component is lower-cased.

use crate::error::{Result, SyncError};
use crate::types::{EntityKind, Params};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};

static REPO_FULL_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)github\.com/(?:repos/)?([a-z0-9\-._]+/[a-z0-9\-._]+)")
        .expect("valid repo url regex")
});

static ISSUE_NUMBER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/(?:issues|pulls|pull)/([0-9]+)(?:[?#].*)?$").expect("valid issue url regex")
});

static COMMIT_SHA_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/commits?/([a-zA-Z0-9]+)(?:[?#].*)?$").expect("valid commit url regex")
});

static COMMENT_ID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/comments/([0-9]+)(?:[?#].*)?$").expect("valid comment url regex")
});

/// `owner/repo` from an API or HTML url, as written in the url.
pub fn repo_full_name_from_url(url: &str) -> Option<String> {
    REPO_FULL_NAME_RE
        .captures(url)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim_end_matches(".git").to_string())
}

pub fn issue_or_pull_request_number_from_url(url: &str) -> Option<u64> {
    ISSUE_NUMBER_RE
        .captures(url)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

pub fn commit_sha_from_url(url: &str) -> Option<String> {
    COMMIT_SHA_RE
        .captures(url)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

pub fn comment_id_from_url(url: &str) -> Option<u64> {
    COMMENT_ID_RE
        .captures(url)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Deterministic subscription identity: SHA-256 over the resource type and
/// its parameters, sorted by key, with keys and values lower-cased.
pub fn subscription_identity(resource_type: &str, params: &Params) -> String {
    let mut canonical: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (k.trim().to_lowercase(), v.trim().to_lowercase()))
        .collect();
    canonical.sort();

    let mut hasher = Sha256::new();
    hasher.update(resource_type.to_lowercase().as_bytes());
    for (key, value) in canonical {
        hasher.update(b"\n");
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Derive the identity of `raw`, declared to be of `kind`.
///
/// Fails with [`SyncError::IdentityUnresolvable`] when no rule applies; the
/// caller drops the object.
pub fn resolve(kind: EntityKind, raw: &Value) -> Result<String> {
    let obj = raw.as_object().ok_or_else(|| unresolvable(kind, "not an object"))?;

    let identity = match kind {
        EntityKind::User | EntityKind::Organization => {
            text_field(raw, "login").map(|login| login.to_lowercase())
        }
        EntityKind::Repository => text_field(raw, "full_name")
            .or_else(|| text_field(raw, "name"))
            .map(|name| name.to_lowercase())
            .or_else(|| {
                text_field(raw, "html_url")
                    .or_else(|| text_field(raw, "url"))
                    .and_then(|url| repo_full_name_from_url(&url))
                    .map(|name| name.to_lowercase())
            }),
        EntityKind::Issue | EntityKind::PullRequest => issue_identity(raw),
        EntityKind::Commit => text_field(raw, "sha")
            .or_else(|| text_field(raw, "commit_id"))
            .or_else(|| text_field(raw, "url").and_then(|url| commit_sha_from_url(&url))),
        EntityKind::Subscription => {
            let resource = text_field(raw, "resource_type").or_else(|| text_field(raw, "type"));
            match (resource, obj.get("params").and_then(Value::as_object)) {
                (Some(resource), Some(params)) => {
                    let params: Params = params
                        .iter()
                        .filter_map(|(k, v)| scalar_text(v).map(|v| (k.clone(), v)))
                        .collect();
                    Some(subscription_identity(&resource, &params))
                }
                _ => None,
            }
        }
        EntityKind::Event
        | EntityKind::Notification
        | EntityKind::Comment
        | EntityKind::Column => None,
    };

    identity
        .or_else(|| id_attribute(raw))
        .ok_or_else(|| unresolvable(kind, "no identifying field"))
}

/// Lower-cased `id` field, numeric or textual.
pub fn id_attribute(raw: &Value) -> Option<String> {
    raw.get("id")
        .and_then(scalar_text)
        .map(|id| id.to_lowercase())
}

fn issue_identity(raw: &Value) -> Option<String> {
    let url = text_field(raw, "url").or_else(|| text_field(raw, "repository_url"))?;
    let number = raw
        .get("number")
        .and_then(Value::as_u64)
        .or_else(|| issue_or_pull_request_number_from_url(&url))?;
    let repo = repo_full_name_from_url(&url)?;
    Some(format!("{}#{}", repo.to_lowercase(), number))
}

fn text_field(raw: &Value, field: &str) -> Option<String> {
    raw.get(field).and_then(scalar_text)
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn unresolvable(kind: EntityKind, reason: &str) -> SyncError {
    SyncError::IdentityUnresolvable {
        kind,
        reason: reason.to_string(),
    }
}
