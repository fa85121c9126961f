//! Signal payload construction
//!
//! Every signal carries a set of common environment fields (platform, app
//! version, ...) merged with whatever extra fields the caller passes. The
//! merged map is flattened into "key:value" strings, the format the
//! ingestion service stores as a multi-value dimension.

use std::collections::{BTreeMap, HashMap};

/// Version string reported in `telemetryClientVersion`
pub const CLIENT_VERSION: &str = concat!("signalpost ", env!("CARGO_PKG_VERSION"));

/// Environment fields attached to every signal
///
/// `detect()` fills this from what the standard library exposes. Callers
/// embedding the pipeline in an application usually override `app_version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub platform: String,
    pub architecture: String,
    pub operating_system_family: String,
    pub app_version: String,
    pub is_debug: bool,
    pub locale: String,
}

impl Environment {
    /// Gather environment fields for the current process
    pub fn detect() -> Self {
        Self {
            platform: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            operating_system_family: std::env::consts::FAMILY.to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            is_debug: cfg!(debug_assertions),
            locale: detect_locale(),
        }
    }

    /// Common fields as a flat map
    fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("platform".to_string(), self.platform.clone());
        map.insert("architecture".to_string(), self.architecture.clone());
        map.insert(
            "operatingSystemFamily".to_string(),
            self.operating_system_family.clone(),
        );
        map.insert("appVersion".to_string(), self.app_version.clone());
        map.insert("isDebug".to_string(), self.is_debug.to_string());
        map.insert("locale".to_string(), self.locale.clone());
        map.insert(
            "telemetryClientVersion".to_string(),
            CLIENT_VERSION.to_string(),
        );
        map
    }
}

/// Locale from the usual POSIX variables, e.g. `en_US.UTF-8` -> `en_US`
fn detect_locale() -> String {
    ["LC_ALL", "LC_MESSAGES", "LANG"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .find(|value| !value.is_empty())
        .map(|value| value.split('.').next().unwrap_or_default().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Merge environment and extra fields and encode them as "key:value" tags
///
/// Keys are deduplicated with last-wins, so an extra field overrides the
/// environment field of the same name. Colons inside keys become
/// underscores so the first colon always separates key from value. Output
/// is sorted by key.
pub fn encode_payload(
    environment: &Environment,
    extra: Option<&HashMap<String, String>>,
) -> Vec<String> {
    let mut merged = environment.to_map();
    if let Some(extra) = extra {
        for (key, value) in extra {
            merged.insert(key.clone(), value.clone());
        }
    }

    let mut encoded: BTreeMap<String, String> = BTreeMap::new();
    for (key, value) in merged {
        encoded.insert(key.replace(':', "_"), value);
    }

    encoded
        .into_iter()
        .map(|(key, value)| format!("{}:{}", key, value))
        .collect()
}
