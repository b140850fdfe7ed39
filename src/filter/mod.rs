//! Filtering pipeline applied to every observed event
//!
//! Pure decisions over an event and a configuration snapshot. Checks run
//! cheapest first and short-circuit, so noise is rejected without touching
//! storage.

use crate::models::{ActivityEvent, FilterConfig};

/// Why an event was not recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Paused,
    OutOfScope,
    ImageResource,
    ExcludedTool,
}

impl Rejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::Paused => "logging paused",
            Rejection::OutOfScope => "target out of scope",
            Rejection::ImageResource => "image resource",
            Rejection::ExcludedTool => "excluded tool source",
        }
    }
}

/// Returns the first rule that rejects `event`, or `None` when it should be recorded.
pub fn evaluate(event: &ActivityEvent, config: &FilterConfig) -> Option<Rejection> {
    if config.paused {
        return Some(Rejection::Paused);
    }
    if config.scope_only && !event.in_scope {
        return Some(Rejection::OutOfScope);
    }
    if config.exclude_images {
        if let Some(ext) = event.path_extension() {
            if config.image_extensions.contains(&ext) {
                return Some(Rejection::ImageResource);
            }
        }
    }
    if config.tool_filter_enabled && config.excluded_tools.contains(&event.tool) {
        return Some(Rejection::ExcludedTool);
    }
    None
}

pub fn accepts(event: &ActivityEvent, config: &FilterConfig) -> bool {
    evaluate(event, config).is_none()
}

/// Shape an accepted event for persistence.
///
/// Response bodies are dropped unless response content is enabled; request
/// bodies are always kept.
pub fn prepare_for_storage(mut event: ActivityEvent, config: &FilterConfig) -> ActivityEvent {
    if !config.include_response_content {
        if let Some(response) = event.response.as_mut() {
            response.body = None;
        }
    }
    event
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{sample_event, ResponseFields, ToolSource};

    #[test]
    fn default_config_accepts() {
        let event = sample_event("tx", "/index.html");
        assert!(accepts(&event, &FilterConfig::default()));
    }

    #[test]
    fn paused_rejects_before_anything_else() {
        let mut event = sample_event("tx", "/logo.png");
        event.in_scope = false;
        let config = FilterConfig {
            paused: true,
            scope_only: true,
            exclude_images: true,
            ..Default::default()
        };
        assert_eq!(evaluate(&event, &config), Some(Rejection::Paused));
    }

    #[test]
    fn scope_only_rejects_out_of_scope_targets() {
        let mut event = sample_event("tx", "/");
        let config = FilterConfig {
            scope_only: true,
            ..Default::default()
        };
        assert!(accepts(&event, &config));
        event.in_scope = false;
        assert_eq!(evaluate(&event, &config), Some(Rejection::OutOfScope));
    }

    #[test]
    fn image_extensions_are_case_insensitive() {
        let event = sample_event("tx", "/assets/Banner.JPG");
        let config = FilterConfig {
            exclude_images: true,
            ..Default::default()
        };
        assert_eq!(evaluate(&event, &config), Some(Rejection::ImageResource));

        let disabled = FilterConfig::default();
        assert!(accepts(&event, &disabled));
    }

    #[test]
    fn image_set_changes_apply_to_next_event() {
        let event = sample_event("tx", "/report.pdf");
        let config = FilterConfig {
            exclude_images: true,
            ..Default::default()
        };
        assert!(accepts(&event, &config));

        let config = config.with_image_extensions(["PDF"]);
        assert!(!accepts(&event, &config));
        assert!(accepts(&sample_event("tx2", "/logo.png"), &config));
    }

    #[test]
    fn tool_filter_only_applies_when_enabled() {
        let mut event = sample_event("tx", "/api");
        event.tool = ToolSource::Repeater;
        let config = FilterConfig::default()
            .with_excluded_tools([ToolSource::Repeater, ToolSource::Intruder]);
        assert!(accepts(&event, &config));

        let config = FilterConfig {
            tool_filter_enabled: true,
            ..config
        };
        assert_eq!(evaluate(&event, &config), Some(Rejection::ExcludedTool));

        event.tool = ToolSource::Proxy;
        assert!(accepts(&event, &config));
    }

    #[test]
    fn response_body_stripped_unless_enabled() {
        let mut event = sample_event("tx", "/");
        event.response = Some(ResponseFields {
            status_code: 200,
            size: 42,
            body: Some(b"secret".to_vec()),
        });

        let stripped = prepare_for_storage(event.clone(), &FilterConfig::default());
        let response = stripped.response.unwrap();
        assert_eq!(response.body, None);
        assert_eq!(response.size, 42);
        assert_eq!(stripped.request_body.as_deref(), Some(&b"user=alice"[..]));

        let config = FilterConfig {
            include_response_content: true,
            ..Default::default()
        };
        let kept = prepare_for_storage(event, &config);
        assert_eq!(kept.response.unwrap().body.as_deref(), Some(&b"secret"[..]));
    }
}
