//! Action metadata — the read-only view of actions and credentials the pool
//! keys its cache on.
//!
//! The metadata store itself lives elsewhere; these types mirror what a
//! lookup returns. Keys are deterministic strings: a single action revision
//! is never aliased with another, and raw-image invocations get their own
//! partition.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use std::fmt;

/// Namespace all invoker-managed images live under. Images outside it are
/// treated as user-supplied and pulled before use.
pub const STOCK_IMAGE_PREFIX: &str = "whisk/";

/// An authenticated subject, as returned by the auth store.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthKey {
    pub uuid: String,
    pub key: String,
}

impl AuthKey {
    /// Compact `uuid:key` form, as passed into containers.
    pub fn compact(&self) -> String {
        format!("{}:{}", self.uuid, self.key)
    }
}

/// Executable part of an action: a stock runtime kind or a blackbox image.
#[derive(Debug, Clone, Deserialize)]
pub struct Exec {
    pub kind: String,
    /// Blackbox image reference; required when `kind == "blackbox"`.
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub main: Option<String>,
}

/// An action document, as returned by the action store.
#[derive(Debug, Clone, Deserialize)]
pub struct Action {
    pub namespace: String,
    pub name: String,
    /// Document revision; part of the cache key so stale containers are
    /// never reused across updates.
    pub rev: String,
    pub exec: Exec,
}

impl Action {
    /// Fully-qualified name, `namespace/name`.
    pub fn fqn(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Resolve the container image for this action and whether it must be
    /// pulled. Stock runtime kinds map to images under `whisk/`, which are
    /// assumed present on the host; anything else is pulled.
    pub fn container_image(&self, registry: &str, tag: &str) -> (String, bool) {
        let base = match self.exec.kind.as_str() {
            "nodejs" => "whisk/nodejsaction",
            "python" => "whisk/pythonaction",
            "swift" => "whisk/swiftaction",
            "java" => "whisk/javaaction",
            _ => {
                // Blackbox: the image reference is used verbatim.
                let image = self.exec.image.as_deref().unwrap_or("whisk/dockerskeleton");
                return (image.to_string(), !image.starts_with(STOCK_IMAGE_PREFIX));
            }
        };
        (format!("{registry}{base}:{tag}"), false)
    }

    /// Payload for the in-container init call. The protocol is opaque to the
    /// pool; we only assemble what the runtime expects.
    pub fn init_payload(&self) -> Value {
        json!({
            "value": {
                "name": self.fqn(),
                "main": self.exec.main.as_deref().unwrap_or("main"),
                "code": self.exec.code,
            }
        })
    }
}

// ─── Pool keys ──────────────────────────────────────────────────────────────

/// Cache-partition key. Containers under the same key are interchangeable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey(String);

impl PoolKey {
    /// Key for action execution: one partition per (subject, action, revision).
    pub fn for_action(auth: &AuthKey, action: &Action) -> Self {
        Self(format!(
            "instantiated.{}.{}.{}",
            auth.uuid,
            action.fqn(),
            action.rev
        ))
    }

    /// Key for raw image invocation.
    pub fn for_image(image: &str, args: &[String]) -> Self {
        Self(format!("instantiated.{}{}", image, args.join("_")))
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ─── Run results ────────────────────────────────────────────────────────────

/// Timestamped result of an in-container call (init or run).
/// `response` is `None` when the container produced no answer at all.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub response: Option<(i64, String)>,
}

impl RunResult {
    pub fn ok(&self) -> bool {
        matches!(self.response, Some((code, _)) if code == 0)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
