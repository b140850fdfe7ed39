//! Activity event model
//!
//! Represents a single HTTP request (and, when observed, its response) captured
//! from the host proxy.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Proxy sub-tool that originated a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ToolSource {
    Proxy,
    Scanner,
    Repeater,
    Intruder,
    Sequencer,
    Extender,
    Other,
}

impl ToolSource {
    /// Convert from a host tool label (lossy, defaults to Other)
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "proxy" => ToolSource::Proxy,
            "scanner" => ToolSource::Scanner,
            "repeater" => ToolSource::Repeater,
            "intruder" => ToolSource::Intruder,
            "sequencer" => ToolSource::Sequencer,
            "extender" | "extensions" => ToolSource::Extender,
            _ => ToolSource::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolSource::Proxy => "Proxy",
            ToolSource::Scanner => "Scanner",
            ToolSource::Repeater => "Repeater",
            ToolSource::Intruder => "Intruder",
            ToolSource::Sequencer => "Sequencer",
            ToolSource::Extender => "Extender",
            ToolSource::Other => "Other",
        }
    }
}

impl std::fmt::Display for ToolSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ToolSource {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(ToolSource::from_str_lossy(s))
    }
}

/// Request-side data handed over by the host when a request is observed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestDescriptor {
    /// Tool that generated the request
    pub tool: ToolSource,
    /// HTTP method as sent on the wire
    pub method: String,
    /// Request scheme (http or https)
    pub scheme: String,
    /// Target host name
    pub host: String,
    /// Target port
    pub port: u16,
    /// Request path (including query string)
    pub path: String,
    /// Size of the request line and headers in bytes
    pub header_size: u64,
    /// Request body (if any)
    pub body: Option<Vec<u8>>,
}

/// Response-side data handed over by the host when a response is observed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseFields {
    /// HTTP status code
    pub status_code: u16,
    /// Full response size in bytes
    pub size: u64,
    /// Response body (if any)
    pub body: Option<Vec<u8>>,
}

/// A captured request/response pair, the unit persisted by every backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEvent {
    /// Host-assigned transaction identifier
    pub transaction_id: String,
    /// Tool that generated the request
    pub tool: ToolSource,
    /// HTTP method
    pub method: String,
    /// Request scheme (http or https)
    pub scheme: String,
    /// Target host name
    pub host: String,
    /// Target port
    pub port: u16,
    /// Request path (including query string)
    pub path: String,
    /// Capture time in milliseconds since epoch
    pub captured_at_ms: i64,
    /// Size of the request line and headers in bytes
    pub request_header_size: u64,
    /// Size of the request body in bytes
    pub request_body_size: u64,
    /// Request body, always retained when the host provided one
    pub request_body: Option<Vec<u8>>,
    /// Response data, absent when no response was observed
    pub response: Option<ResponseFields>,
    /// Whether the target was in the user-defined scope at capture time
    pub in_scope: bool,
}

impl ActivityEvent {
    /// Build the request-side event for a freshly observed request
    pub fn from_request(transaction_id: &str, request: RequestDescriptor, in_scope: bool) -> Self {
        let request_body_size = request.body.as_ref().map_or(0, |b| b.len() as u64);
        Self {
            transaction_id: transaction_id.to_string(),
            tool: request.tool,
            method: request.method,
            scheme: request.scheme,
            host: request.host,
            port: request.port,
            path: request.path,
            captured_at_ms: Utc::now().timestamp_millis(),
            request_header_size: request.header_size,
            request_body_size,
            request_body: request.body,
            response: None,
            in_scope,
        }
    }

    /// Total bytes sent for the request (headers plus body)
    pub fn request_size(&self) -> u64 {
        self.request_header_size
            .saturating_add(self.request_body_size)
    }

    /// Capture time truncated to the second, used for throughput buckets
    pub fn capture_second(&self) -> i64 {
        self.captured_at_ms.div_euclid(1000)
    }

    /// Lower-cased file extension of the last path segment, ignoring query and fragment
    pub fn path_extension(&self) -> Option<String> {
        let path = self
            .path
            .split(['?', '#'])
            .next()
            .unwrap_or_default();
        let segment = path.rsplit('/').next().unwrap_or_default();
        let (_, ext) = segment.rsplit_once('.')?;
        if ext.is_empty() {
            None
        } else {
            Some(ext.to_ascii_lowercase())
        }
    }

    /// Get the full URL
    pub fn full_url(&self) -> String {
        let port_str = if (self.scheme == "https" && self.port == 443)
            || (self.scheme == "http" && self.port == 80)
        {
            String::new()
        } else {
            format!(":{}", self.port)
        };
        format!("{}://{}{}{}", self.scheme, self.host, port_str, self.path)
    }
}

#[cfg(test)]
pub(crate) fn sample_event(transaction_id: &str, path: &str) -> ActivityEvent {
    ActivityEvent::from_request(
        transaction_id,
        RequestDescriptor {
            tool: ToolSource::Proxy,
            method: "GET".to_string(),
            scheme: "https".to_string(),
            host: "app.example.com".to_string(),
            port: 443,
            path: path.to_string(),
            header_size: 120,
            body: Some(b"user=alice".to_vec()),
        },
        true,
    )
}
