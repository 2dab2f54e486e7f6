//! Request path formatting for the `path` tag

use crate::config::{
    Config, ConfigKey, URI_REPORTING_FILTERED, URI_REPORTING_FULL_PATH, URI_REPORTING_PATH_ONLY,
};
use tracing::debug;
use url::form_urlencoded;

const FILTERED_VALUE: &str = "[FILTERED]";

/// How much of the request URI is reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UriReporting {
    PathOnly,
    FullPath,
    #[default]
    FilteredParams,
}

impl UriReporting {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            URI_REPORTING_PATH_ONLY => Some(UriReporting::PathOnly),
            URI_REPORTING_FULL_PATH => Some(UriReporting::FullPath),
            URI_REPORTING_FILTERED => Some(UriReporting::FilteredParams),
            _ => None,
        }
    }
}

/// URI reporting settings captured when a request starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UriSettings {
    pub reporting: UriReporting,
    pub filtered_parameters: Vec<String>,
}

impl Default for UriSettings {
    fn default() -> Self {
        Self {
            reporting: UriReporting::default(),
            filtered_parameters: crate::config::DEFAULT_FILTERED_PARAMETERS
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}

impl UriSettings {
    /// Read settings, falling back to defaults for invalid values
    pub fn from_config(config: &Config) -> Self {
        let defaults = Self::default();

        let reporting = match config.get_as::<String>(ConfigKey::UriReporting) {
            Some(value) => UriReporting::parse(&value).unwrap_or_else(|| {
                debug!("Unknown uri_reporting value {:?}, using default", value);
                defaults.reporting
            }),
            None => defaults.reporting,
        };

        let filtered_parameters = config
            .get_or_default::<Vec<String>>(ConfigKey::UriFilteredParameters)
            .unwrap_or(defaults.filtered_parameters);

        Self {
            reporting,
            filtered_parameters,
        }
    }

    /// Format a raw request URI according to these settings
    pub fn format(&self, uri: &str) -> String {
        if self.reporting == UriReporting::FullPath {
            return uri.to_string();
        }

        let without_fragment = uri.split('#').next().unwrap_or_default();
        let (path, query) = match without_fragment.split_once('?') {
            Some((path, query)) => (path, query),
            None => (without_fragment, ""),
        };

        if self.reporting == UriReporting::PathOnly || query.is_empty() {
            return path.to_string();
        }

        let mut serializer = form_urlencoded::Serializer::new(String::new());
        for (name, value) in form_urlencoded::parse(query.as_bytes()) {
            if self.filtered_parameters.iter().any(|p| *p == name) {
                serializer.append_pair(&name, FILTERED_VALUE);
            } else {
                serializer.append_pair(&name, &value);
            }
        }

        format!("{}?{}", path, serializer.finish())
    }
}
