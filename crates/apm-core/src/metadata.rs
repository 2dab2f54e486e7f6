//! Inbound request metadata supplied by the transport layer
//!
//! Server variables follow CGI naming (`REQUEST_URI`, `HTTP_HOST`,
//! `HTTP_X_QUEUE_START`, ...). Nothing here reads process-global state;
//! integrations build a [`RequestMetadata`] and hand it to the request.

use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Snapshot of what the transport layer knows about the current request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestMetadata {
    /// CGI-style server variables
    pub server: BTreeMap<String, String>,
    /// Decoded request parameters
    pub params: Map<String, Value>,
    /// Session contents
    pub session: Map<String, Value>,
    /// Environment variables worth reporting
    pub environment: Map<String, Value>,
}

impl RequestMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a server variable
    pub fn with_server_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.server.insert(name.into(), value.into());
        self
    }

    /// Set a request header, stored as its `HTTP_*` server variable
    pub fn with_header(self, name: &str, value: impl Into<String>) -> Self {
        let var = format!("HTTP_{}", name.to_uppercase().replace('-', "_"));
        self.with_server_var(var, value)
    }

    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params = params;
        self
    }

    pub fn with_session(mut self, session: Map<String, Value>) -> Self {
        self.session = session;
        self
    }

    pub fn with_environment(mut self, environment: Map<String, Value>) -> Self {
        self.environment = environment;
        self
    }

    pub fn server_var(&self, name: &str) -> Option<&str> {
        self.server.get(name).map(String::as_str)
    }

    /// Request path: `REQUEST_URI`, then `ORIG_PATH_INFO`, then `/`
    pub fn request_path(&self) -> &str {
        self.server_var("REQUEST_URI")
            .or_else(|| self.server_var("ORIG_PATH_INFO"))
            .unwrap_or("/")
    }

    /// Look up a header case-insensitively in the `HTTP_*` variables, e.g.
    /// `X-Queue-Start` reads `HTTP_X_QUEUE_START`
    pub fn header(&self, name: &str) -> Option<&str> {
        let var = format!("HTTP_{}", name.to_uppercase().replace('-', "_"));
        self.server_var(&var)
    }

    /// `scheme://host` followed by `path`, or `path` alone when no host is known
    pub fn absolute_uri(&self, path: &str) -> String {
        let host = self
            .server_var("HTTP_HOST")
            .or_else(|| self.server_var("SERVER_NAME"));

        match host {
            Some(host) => {
                let secure = self
                    .server_var("HTTPS")
                    .map(|v| !v.is_empty() && !v.eq_ignore_ascii_case("off"))
                    .unwrap_or(false);
                let scheme = if secure { "https" } else { "http" };
                format!("{}://{}{}", scheme, host, path)
            }
            None => path.to_string(),
        }
    }
}
