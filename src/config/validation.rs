//! Configuration validation utilities.

use thiserror::Error;

/// Sentinel endpoint meaning "publish self-metrics into the local write pipeline".
pub const METRIC_ENDPOINT_LOCAL: &str = "local";

/// Placeholder in `common.metric-prefix` replaced with the local hostname.
pub const HOST_PLACEHOLDER: &str = "{host}";

/// Hostname substituted when the lookup fails.
const FALLBACK_HOSTNAME: &str = "localhost";

/// Configuration error types.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse YAML configuration.
    #[error("failed to parse YAML config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// `common.metric-endpoint` is not a valid URI.
    #[error("common.metric-endpoint parse error: {endpoint:?}: {source}")]
    EndpointParse {
        endpoint: String,
        #[source]
        source: url::ParseError,
    },

    /// `common.metric-endpoint` uses a scheme other than tcp or udp.
    #[error(
        "common.metric-endpoint supports only tcp and udp protocols. {scheme:?} is unsupported (endpoint {endpoint:?})"
    )]
    UnsupportedEndpointScheme { endpoint: String, scheme: String },

    /// Configuration validation failed.
    #[error("config validation error: {0}")]
    ValidationError(String),
}

/// Substitute `{host}` in a metric prefix.
///
/// Dots in the hostname are replaced with underscores so the hostname stays a
/// single metric path node. `None` means the lookup failed.
pub fn apply_host_template(prefix: &str, hostname: Option<&str>) -> String {
    let host = match hostname {
        Some(name) => name.replace('.', "_"),
        None => FALLBACK_HOSTNAME.to_string(),
    };
    prefix.replace(HOST_PLACEHOLDER, &host)
}

/// Look up the local hostname, `None` on failure.
pub fn local_hostname() -> Option<String> {
    match hostname::get() {
        Ok(name) => Some(name.to_string_lossy().into_owned()),
        Err(e) => {
            tracing::warn!(error = %e, "Hostname lookup failed, using {FALLBACK_HOSTNAME}");
            None
        }
    }
}

/// Normalize and validate `common.metric-endpoint`.
///
/// An empty endpoint becomes [`METRIC_ENDPOINT_LOCAL`]. Anything else must be a
/// `tcp://` or `udp://` URI.
pub fn normalize_metric_endpoint(endpoint: &str) -> Result<String, ConfigError> {
    if endpoint.is_empty() || endpoint == METRIC_ENDPOINT_LOCAL {
        return Ok(METRIC_ENDPOINT_LOCAL.to_string());
    }

    let url = url::Url::parse(endpoint).map_err(|source| ConfigError::EndpointParse {
        endpoint: endpoint.to_string(),
        source,
    })?;

    if !matches!(url.scheme(), "tcp" | "udp") {
        return Err(ConfigError::UnsupportedEndpointScheme {
            endpoint: endpoint.to_string(),
            scheme: url.scheme().to_string(),
        });
    }
    if url.host_str().is_none_or(str::is_empty) || url.port().is_none() {
        return Err(ConfigError::ValidationError(format!(
            "common.metric-endpoint {endpoint:?} must include host and port"
        )));
    }

    Ok(endpoint.to_string())
}

/// Expand environment variables in a string.
/// Supports ${VAR} and ${VAR:-default} syntax.
pub fn expand_env_vars(input: &str) -> String {
    static ENV_VAR_REGEX: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();

    let regex = ENV_VAR_REGEX.get_or_init(|| {
        regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .expect("failed to compile env var regex")
    });

    regex
        .replace_all(input, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default_value = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default_value.to_string())
        })
        .into_owned()
}
