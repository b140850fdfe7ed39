//! Recorder configuration models
//!
//! `FilterConfig` is swapped as a whole by the recorder, so readers always see
//! a flag together with its companion set.

use super::ToolSource;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Image extensions excluded when image filtering is enabled and no override is configured
pub const DEFAULT_IMAGE_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "bmp", "ico", "svg", "webp", "tif", "tiff",
];

/// Storage backend family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BackendKind {
    /// Single local SQLite file
    #[default]
    Embedded,
    /// Network PostgreSQL database
    Remote,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Embedded => "embedded",
            BackendKind::Remote => "remote",
        }
    }

    /// Convert from a stored preference value (lossy, defaults to Embedded)
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "remote" | "postgres" | "postgresql" => BackendKind::Remote,
            _ => BackendKind::Embedded,
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection parameters for the remote backend, supplied once at construction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConnectionParams {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
}

impl Default for RemoteConnectionParams {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5432,
            database: "proxy_activity".to_string(),
            username: String::new(),
            password: String::new(),
        }
    }
}

impl RemoteConnectionParams {
    /// Returns the first problem that makes these parameters unusable
    pub fn validate(&self) -> Result<(), String> {
        if self.host.trim().is_empty() {
            return Err("remote database host is empty".to_string());
        }
        if self.port == 0 {
            return Err("remote database port must be greater than zero".to_string());
        }
        if self.database.trim().is_empty() {
            return Err("remote database name is empty".to_string());
        }
        Ok(())
    }
}

/// Live filtering configuration read by every event on the hot path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// When set, no event reaches storage
    pub paused: bool,
    /// Only record requests whose target is in scope
    pub scope_only: bool,
    /// Drop requests for image resources
    pub exclude_images: bool,
    /// Lower-cased extensions treated as image resources
    pub image_extensions: BTreeSet<String>,
    /// Keep response bodies in persisted events
    pub include_response_content: bool,
    /// Drop requests from the tools in `excluded_tools`
    pub tool_filter_enabled: bool,
    pub excluded_tools: BTreeSet<ToolSource>,
    /// Backend preference; the running recorder keeps the backend it started with
    pub backend: BackendKind,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            paused: false,
            scope_only: false,
            exclude_images: false,
            image_extensions: normalize_extensions(DEFAULT_IMAGE_EXTENSIONS.iter().copied()),
            include_response_content: false,
            tool_filter_enabled: false,
            excluded_tools: BTreeSet::new(),
            backend: BackendKind::Embedded,
        }
    }
}

impl FilterConfig {
    /// Replace the image extension set, normalizing each entry
    pub fn with_image_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.image_extensions = normalize_extensions(extensions);
        self
    }

    pub fn with_excluded_tools<I>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = ToolSource>,
    {
        self.excluded_tools = tools.into_iter().collect();
        self
    }
}

/// Lower-case, strip whitespace and leading dots, and drop empty entries
pub fn normalize_extensions<I, S>(extensions: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    extensions
        .into_iter()
        .map(|ext| {
            ext.as_ref()
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect::<String>()
                .trim_start_matches('.')
                .to_ascii_lowercase()
        })
        .filter(|ext| !ext.is_empty())
        .collect()
}
