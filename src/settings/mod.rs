//! Persisted recorder settings
//!
//! Settings live in the host's preference storage under stable keys so that
//! they survive restarts of the host application.

mod preferences;

pub use preferences::{JsonFilePreferences, MemoryPreferences, PreferenceStore};

use crate::models::{
    normalize_extensions, BackendKind, FilterConfig, RemoteConnectionParams, ToolSource,
};
use std::collections::BTreeSet;
use std::path::PathBuf;

pub const ONLY_INCLUDE_REQUESTS_FROM_SCOPE: &str = "ONLY_INCLUDE_REQUESTS_FROM_SCOPE";
pub const EXCLUDE_IMAGE_RESOURCE_REQUESTS: &str = "EXCLUDE_IMAGE_RESOURCE_REQUESTS";
pub const INCLUDE_HTTP_RESPONSE_CONTENT: &str = "INCLUDE_HTTP_RESPONSE_CONTENT";
pub const PAUSE_LOGGING: &str = "PAUSE_LOGGING";
pub const FILTER_BY_TOOL_SOURCE: &str = "FILTER_BY_TOOL_SOURCE";
pub const EXCLUDED_TOOL_SOURCES: &str = "EXCLUDED_TOOL_SOURCES";
pub const IMAGE_EXTENSIONS: &str = "IMAGE_EXTENSIONS";
pub const DB_FILE_CUSTOM_LOCATION: &str = "DB_FILE_CUSTOM_LOCATION";
pub const STORE_BACKEND_KIND: &str = "STORE_BACKEND_KIND";
pub const REMOTE_DB_HOST: &str = "REMOTE_DB_HOST";
pub const REMOTE_DB_PORT: &str = "REMOTE_DB_PORT";
pub const REMOTE_DB_NAME: &str = "REMOTE_DB_NAME";
pub const REMOTE_DB_USER: &str = "REMOTE_DB_USER";
pub const REMOTE_DB_PASSWORD: &str = "REMOTE_DB_PASSWORD";

/// Everything the recorder reads from preferences at startup
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RecorderSettings {
    pub filter: FilterConfig,
    pub store_location: Option<PathBuf>,
    pub remote: RemoteConnectionParams,
}

impl RecorderSettings {
    /// Read settings, falling back to defaults for missing or malformed keys.
    pub fn load(prefs: &dyn PreferenceStore) -> Self {
        let flag = |key: &str| prefs.get_bool(key).unwrap_or(false);

        let mut filter = FilterConfig {
            paused: flag(PAUSE_LOGGING),
            scope_only: flag(ONLY_INCLUDE_REQUESTS_FROM_SCOPE),
            exclude_images: flag(EXCLUDE_IMAGE_RESOURCE_REQUESTS),
            include_response_content: flag(INCLUDE_HTTP_RESPONSE_CONTENT),
            tool_filter_enabled: flag(FILTER_BY_TOOL_SOURCE),
            excluded_tools: prefs
                .get_string(EXCLUDED_TOOL_SOURCES)
                .map(|value| parse_tool_list(&value))
                .unwrap_or_default(),
            backend: prefs
                .get_string(STORE_BACKEND_KIND)
                .map(|value| BackendKind::from_str_lossy(&value))
                .unwrap_or_default(),
            ..FilterConfig::default()
        };
        if let Some(extensions) = prefs.get_string(IMAGE_EXTENSIONS) {
            let extensions = normalize_extensions(extensions.split(','));
            if !extensions.is_empty() {
                filter.image_extensions = extensions;
            }
        }

        let store_location = prefs
            .get_string(DB_FILE_CUSTOM_LOCATION)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .map(PathBuf::from);

        let defaults = RemoteConnectionParams::default();
        let text = |key: &str, fallback: String| {
            prefs
                .get_string(key)
                .filter(|value| !value.trim().is_empty())
                .unwrap_or(fallback)
        };
        let port = match prefs.get_string(REMOTE_DB_PORT) {
            Some(value) => value.trim().parse().unwrap_or_else(|_| {
                tracing::warn!("Ignoring invalid {} value '{}'", REMOTE_DB_PORT, value);
                defaults.port
            }),
            None => defaults.port,
        };
        let remote = RemoteConnectionParams {
            host: text(REMOTE_DB_HOST, defaults.host),
            port,
            database: text(REMOTE_DB_NAME, defaults.database),
            username: prefs.get_string(REMOTE_DB_USER).unwrap_or_default(),
            password: prefs.get_string(REMOTE_DB_PASSWORD).unwrap_or_default(),
        };

        Self {
            filter,
            store_location,
            remote,
        }
    }

    pub fn save(&self, prefs: &dyn PreferenceStore) {
        let filter = &self.filter;
        prefs.set_bool(PAUSE_LOGGING, filter.paused);
        prefs.set_bool(ONLY_INCLUDE_REQUESTS_FROM_SCOPE, filter.scope_only);
        prefs.set_bool(EXCLUDE_IMAGE_RESOURCE_REQUESTS, filter.exclude_images);
        prefs.set_bool(INCLUDE_HTTP_RESPONSE_CONTENT, filter.include_response_content);
        prefs.set_bool(FILTER_BY_TOOL_SOURCE, filter.tool_filter_enabled);
        prefs.set_string(EXCLUDED_TOOL_SOURCES, &join_tools(&filter.excluded_tools));
        prefs.set_string(IMAGE_EXTENSIONS, &join(&filter.image_extensions));
        if let Some(location) = &self.store_location {
            prefs.set_string(DB_FILE_CUSTOM_LOCATION, &location.to_string_lossy());
        }
        save_backend_selection(prefs, filter.backend, &self.remote);
    }
}

/// Write only the backend choice and remote connection parameters.
pub fn save_backend_selection(
    prefs: &dyn PreferenceStore,
    kind: BackendKind,
    remote: &RemoteConnectionParams,
) {
    prefs.set_string(STORE_BACKEND_KIND, kind.as_str());
    prefs.set_string(REMOTE_DB_HOST, &remote.host);
    prefs.set_string(REMOTE_DB_PORT, &remote.port.to_string());
    prefs.set_string(REMOTE_DB_NAME, &remote.database);
    prefs.set_string(REMOTE_DB_USER, &remote.username);
    prefs.set_string(REMOTE_DB_PASSWORD, &remote.password);
}

/// Persist the subset of `config` that the user toggles at runtime.
pub fn save_filter_config(prefs: &dyn PreferenceStore, config: &FilterConfig) {
    prefs.set_bool(PAUSE_LOGGING, config.paused);
    prefs.set_bool(ONLY_INCLUDE_REQUESTS_FROM_SCOPE, config.scope_only);
    prefs.set_bool(EXCLUDE_IMAGE_RESOURCE_REQUESTS, config.exclude_images);
    prefs.set_bool(INCLUDE_HTTP_RESPONSE_CONTENT, config.include_response_content);
    prefs.set_bool(FILTER_BY_TOOL_SOURCE, config.tool_filter_enabled);
    prefs.set_string(EXCLUDED_TOOL_SOURCES, &join_tools(&config.excluded_tools));
    prefs.set_string(IMAGE_EXTENSIONS, &join(&config.image_extensions));
}

/// Comma separated tool names; items are trimmed and empty ones skipped.
pub fn parse_tool_list(value: &str) -> BTreeSet<ToolSource> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToolSource::from_str_lossy)
        .collect()
}

fn join_tools(tools: &BTreeSet<ToolSource>) -> String {
    tools
        .iter()
        .map(ToolSource::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

fn join(items: &BTreeSet<String>) -> String {
    items.iter().map(String::as_str).collect::<Vec<_>>().join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_preferences_give_defaults() {
        let prefs = MemoryPreferences::new();
        let settings = RecorderSettings::load(&prefs);
        assert_eq!(settings, RecorderSettings::default());
        assert!(settings.store_location.is_none());
    }

    #[test]
    fn reads_filter_flags_and_tool_list() {
        let prefs = MemoryPreferences::new();
        prefs.set_bool(ONLY_INCLUDE_REQUESTS_FROM_SCOPE, true);
        prefs.set_bool(FILTER_BY_TOOL_SOURCE, true);
        prefs.set_string(EXCLUDED_TOOL_SOURCES, " Scanner, ,Intruder,");
        prefs.set_string(DB_FILE_CUSTOM_LOCATION, "  ");

        let settings = RecorderSettings::load(&prefs);
        assert!(settings.filter.scope_only);
        assert!(settings.filter.tool_filter_enabled);
        assert!(!settings.filter.paused);
        let tools: Vec<_> = settings.filter.excluded_tools.into_iter().collect();
        assert_eq!(tools, vec![ToolSource::Scanner, ToolSource::Intruder]);
        assert!(settings.store_location.is_none());
    }

    #[test]
    fn image_extension_override_replaces_defaults() {
        let prefs = MemoryPreferences::new();
        prefs.set_string(IMAGE_EXTENSIONS, "PNG, avif");
        let settings = RecorderSettings::load(&prefs);
        let items: Vec<_> = settings.filter.image_extensions.into_iter().collect();
        assert_eq!(items, vec!["avif", "png"]);

        prefs.set_string(IMAGE_EXTENSIONS, " , ");
        let settings = RecorderSettings::load(&prefs);
        assert!(settings.filter.image_extensions.contains("webp"));
    }

    #[test]
    fn invalid_remote_port_falls_back_to_default() {
        let prefs = MemoryPreferences::new();
        prefs.set_string(STORE_BACKEND_KIND, "remote");
        prefs.set_string(REMOTE_DB_HOST, "db.internal");
        prefs.set_string(REMOTE_DB_PORT, "not-a-port");

        let settings = RecorderSettings::load(&prefs);
        assert_eq!(settings.filter.backend, BackendKind::Remote);
        assert_eq!(settings.remote.host, "db.internal");
        assert_eq!(settings.remote.port, 5432);
    }

    #[test]
    fn save_then_load_preserves_settings() {
        let prefs = MemoryPreferences::new();
        let settings = RecorderSettings {
            filter: FilterConfig {
                paused: true,
                exclude_images: true,
                include_response_content: true,
                backend: BackendKind::Remote,
                ..FilterConfig::default()
            }
            .with_excluded_tools([ToolSource::Repeater, ToolSource::Proxy]),
            store_location: Some(PathBuf::from("/var/log/activity.db")),
            remote: RemoteConnectionParams {
                host: "10.0.0.5".into(),
                port: 6543,
                database: "audit".into(),
                username: "logger".into(),
                password: "secret".into(),
            },
        };
        settings.save(&prefs);
        assert_eq!(
            prefs.get_string(EXCLUDED_TOOL_SOURCES).as_deref(),
            Some("Proxy,Repeater")
        );
        assert_eq!(RecorderSettings::load(&prefs), settings);
    }
}
