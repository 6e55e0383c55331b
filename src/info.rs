//! Resource metadata and the persisted sidecar record.

use std::{
    collections::{HashMap, HashSet},
    sync::RwLock,
};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::policy::CachePolicy;

/// The MIME type assumed when the origin did not declare one.
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

// Response headers worth keeping are a process-wide decision; everything else
// is dropped at ingestion so stored records stay small and comparable.
static HEADER_WHITELIST: Lazy<RwLock<HashSet<String>>> =
    Lazy::new(|| RwLock::new(HashSet::from(["etag".to_string()])));

/// Whether the given response header is kept when building [`ResourceInfo`].
///
/// Matching is case-insensitive. The initial whitelist is `{ETag}`.
pub fn is_whitelisted_header(name: &str) -> bool {
    let set = match HEADER_WHITELIST.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    set.contains(&name.to_ascii_lowercase())
}

/// Adds a header to the process-wide whitelist.
pub fn add_whitelisted_header(name: &str) {
    let mut set = match HEADER_WHITELIST.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    set.insert(name.to_ascii_lowercase());
}

/// Replaces the process-wide header whitelist.
pub fn set_whitelisted_headers<I, S>(names: I)
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut set = match HEADER_WHITELIST.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    *set = names.into_iter().map(|n| n.into().to_ascii_lowercase()).collect();
}

/// The current process-wide header whitelist, lowercased.
pub fn whitelisted_headers() -> Vec<String> {
    let set = match HEADER_WHITELIST.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    set.iter().cloned().collect()
}

/// Metadata describing a cached byte resource.
///
/// `total_length` counts the complete resource, which may be longer than the
/// segment currently being delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    /// The resource MIME type.
    pub mime_type: String,
    /// The declared text encoding, if any.
    pub text_encoding: Option<String>,
    /// Length of the complete resource in bytes, when known.
    pub total_length: Option<u64>,
    /// Whitelisted response headers, keyed by lowercase name.
    pub headers: HashMap<String, String>,
}

impl ResourceInfo {
    /// Metadata with the default MIME type and nothing else.
    pub fn new() -> Self {
        Self::default()
    }

    /// Metadata with the given MIME type.
    pub fn with_mime(mime_type: impl Into<String>) -> Self {
        Self { mime_type: mime_type.into(), ..Self::default() }
    }
}

impl Default for ResourceInfo {
    fn default() -> Self {
        Self {
            mime_type: DEFAULT_MIME_TYPE.to_string(),
            text_encoding: None,
            total_length: None,
            headers: HashMap::new(),
        }
    }
}

/// The on-disk metadata record: [`ResourceInfo`] plus the entry's policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageInfo {
    /// The resource metadata.
    pub info: ResourceInfo,
    /// The policy the entry was stored under.
    pub policy: CachePolicy,
}

// The sidecar wire format. Key names are part of the on-disk contract.
#[derive(Debug, Serialize, Deserialize)]
struct SidecarRecord {
    m: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    t: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    l: Option<u64>,
    p: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    h: HashMap<String, String>,
}

impl StorageInfo {
    /// Bundles metadata with a policy.
    pub fn new(info: ResourceInfo, policy: CachePolicy) -> Self {
        Self { info, policy }
    }

    /// Whether two records describe the same resource bytes.
    ///
    /// The policy does not participate: a policy change must not invalidate a
    /// resumed write.
    pub fn same_resource(&self, other: &StorageInfo) -> bool {
        self.info == other.info
    }

    /// Encodes the record as the sidecar JSON object.
    pub fn to_sidecar_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&SidecarRecord {
            m: self.info.mime_type.clone(),
            t: self.info.text_encoding.clone(),
            l: self.info.total_length,
            p: self.policy.to_string(),
            h: self.info.headers.clone(),
        })
    }

    /// Decodes a sidecar JSON object.
    pub fn from_sidecar_json(bytes: &[u8]) -> serde_json::Result<Self> {
        let record: SidecarRecord = serde_json::from_slice(bytes)?;
        Ok(Self {
            info: ResourceInfo {
                mime_type: record.m,
                text_encoding: record.t,
                total_length: record.l,
                headers: record.h,
            },
            policy: record.p.parse().unwrap_or(CachePolicy::Keep),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sidecar_round_trip() {
        let mut info = ResourceInfo::with_mime("image/png");
        info.text_encoding = Some("utf-8".to_string());
        info.total_length = Some(1000);
        info.headers.insert("etag".to_string(), "\"abc\"".to_string());
        let meta = StorageInfo::new(info, CachePolicy::ExpiredAt(1700000000));

        let bytes = meta.to_sidecar_json().unwrap();
        let decoded = StorageInfo::from_sidecar_json(&bytes).unwrap();
        assert_eq!(decoded, meta);

        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["m"], "image/png");
        assert_eq!(json["t"], "utf-8");
        assert_eq!(json["l"], 1000);
        assert_eq!(json["p"], "1700000000");
        assert_eq!(json["h"]["etag"], "\"abc\"");
    }

    #[test]
    fn sidecar_omits_absent_fields() {
        let meta = StorageInfo::new(ResourceInfo::new(), CachePolicy::Keep);
        let bytes = meta.to_sidecar_json().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["m"], DEFAULT_MIME_TYPE);
        assert_eq!(json["p"], "keep");
        assert!(json.get("t").is_none());
        assert!(json.get("l").is_none());
        assert!(json.get("h").is_none());
    }

    #[test]
    fn same_resource_ignores_policy() {
        let a = StorageInfo::new(ResourceInfo::with_mime("text/css"), CachePolicy::Keep);
        let b = StorageInfo::new(ResourceInfo::with_mime("text/css"), CachePolicy::in_days(7));
        assert!(a.same_resource(&b));
        let c = StorageInfo::new(ResourceInfo::with_mime("text/html"), CachePolicy::Keep);
        assert!(!a.same_resource(&c));
    }

    #[test]
    fn whitelist_defaults_to_etag() {
        assert!(is_whitelisted_header("ETag"));
        assert!(is_whitelisted_header("etag"));
        assert!(!is_whitelisted_header("content-length"));
    }
}
