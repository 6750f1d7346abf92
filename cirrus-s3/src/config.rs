//! Client configuration from the environment.
//!
//! The environment is read once, at first client construction; later changes
//! are ignored. `S3_ENDPOINT` points the adapter at any S3-compatible
//! service; the remaining knobs cover region selection, TLS, and timeouts.

use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_REGION: &str = "us-east-1";

/// Static credentials for request signing.
#[derive(Clone)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

#[derive(Clone)]
pub struct ClientConfig {
    /// Endpoint override (host:port or full URL). None means AWS proper.
    pub endpoint: Option<String>,
    pub region: String,
    pub use_https: bool,
    pub verify_ssl: bool,
    pub connect_timeout: Option<Duration>,
    pub request_timeout: Option<Duration>,
    pub ca_file: Option<PathBuf>,
    pub ca_path: Option<PathBuf>,
    /// None sends unsigned (anonymous) requests.
    pub credentials: Option<Credentials>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: DEFAULT_REGION.to_string(),
            use_https: true,
            verify_ssl: true,
            connect_timeout: None,
            request_timeout: None,
            ca_file: None,
            ca_path: None,
            credentials: None,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(env: impl Fn(&str) -> Option<String>) -> Self {
        let endpoint = env("S3_ENDPOINT").filter(|v| !v.is_empty());

        // AWS_REGION wins; S3_REGION is the deprecated fallback.
        let region = env("AWS_REGION")
            .or_else(|| env("S3_REGION"))
            .filter(|v| !v.is_empty())
            .or_else(|| region_from_config_file(&env))
            .unwrap_or_else(|| DEFAULT_REGION.to_string());

        // "0" selects the insecure choice; anything else (or unset) the default.
        let use_https = env("S3_USE_HTTPS").map_or(true, |v| !v.starts_with('0'));
        let verify_ssl = env("S3_VERIFY_SSL").map_or(true, |v| !v.starts_with('0'));

        let millis = |name: &str| {
            env(name)
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
        };

        let credentials = match (env("AWS_ACCESS_KEY_ID"), env("AWS_SECRET_ACCESS_KEY")) {
            (Some(id), Some(secret)) if !id.is_empty() && !secret.is_empty() => Some(Credentials {
                access_key_id: id,
                secret_access_key: secret,
                session_token: env("AWS_SESSION_TOKEN").filter(|v| !v.is_empty()),
            }),
            _ => None,
        };

        Self {
            endpoint,
            region,
            use_https,
            verify_ssl,
            connect_timeout: millis("S3_CONNECT_TIMEOUT_MSEC"),
            request_timeout: millis("S3_REQUEST_TIMEOUT_MSEC"),
            ca_file: env("S3_CA_FILE").filter(|v| !v.is_empty()).map(PathBuf::from),
            ca_path: env("S3_CA_PATH").filter(|v| !v.is_empty()).map(PathBuf::from),
            credentials,
        }
    }

    fn scheme(&self) -> &'static str {
        if self.use_https {
            "https"
        } else {
            "http"
        }
    }

    /// Service base URL, without bucket or key. Requests always address the
    /// bucket in the path (path-style), since bucket names containing `.`
    /// fail TLS hostname validation under virtual-hosted addressing.
    pub fn base_url(&self) -> String {
        match &self.endpoint {
            Some(ep) if ep.contains("://") => ep.trim_end_matches('/').to_string(),
            Some(ep) => format!("{}://{}", self.scheme(), ep.trim_end_matches('/')),
            None => format!("{}://s3.{}.amazonaws.com", self.scheme(), self.region),
        }
    }
}

/// Region from the AWS config file's `[default]` profile, consulted only
/// when `AWS_SDK_LOAD_CONFIG` is truthy and no region variable is set.
fn region_from_config_file(env: &impl Fn(&str) -> Option<String>) -> Option<String> {
    let load = env("AWS_SDK_LOAD_CONFIG")?.to_lowercase();
    if load != "true" && load != "1" {
        return None;
    }
    let config_file = env("AWS_CONFIG_FILE")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| env("HOME").map(|home| Path::new(&home).join(".aws").join("config")))?;
    let text = std::fs::read_to_string(config_file).ok()?;
    default_profile_region(&text)
}

fn default_profile_region(text: &str) -> Option<String> {
    let mut in_default = false;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if line.starts_with('[') {
            in_default = line == "[default]";
            continue;
        }
        if !in_default {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            if key.trim() == "region" && !value.trim().is_empty() {
                return Some(value.trim().to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        let map: HashMap<&str, &str> = vars.iter().copied().collect();
        move |name| map.get(name).map(|v| v.to_string())
    }

    #[test]
    fn test_defaults() {
        let config = ClientConfig::from_lookup(lookup(&[]));
        assert_eq!(config.region, "us-east-1");
        assert!(config.use_https);
        assert!(config.verify_ssl);
        assert!(config.endpoint.is_none());
        assert!(config.credentials.is_none());
        assert_eq!(config.base_url(), "https://s3.us-east-1.amazonaws.com");
    }

    #[test]
    fn test_aws_region_wins_over_s3_region() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("AWS_REGION", "eu-west-1"),
            ("S3_REGION", "us-west-2"),
        ]));
        assert_eq!(config.region, "eu-west-1");

        let config = ClientConfig::from_lookup(lookup(&[("S3_REGION", "us-west-2")]));
        assert_eq!(config.region, "us-west-2");
    }

    #[test]
    fn test_endpoint_override_and_scheme() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("S3_ENDPOINT", "localhost:9000"),
            ("S3_USE_HTTPS", "0"),
        ]));
        assert_eq!(config.base_url(), "http://localhost:9000");

        let config =
            ClientConfig::from_lookup(lookup(&[("S3_ENDPOINT", "https://minio.example.com/")]));
        assert_eq!(config.base_url(), "https://minio.example.com");
    }

    #[test]
    fn test_timeouts_parse_milliseconds() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("S3_CONNECT_TIMEOUT_MSEC", "1500"),
            ("S3_REQUEST_TIMEOUT_MSEC", "not-a-number"),
        ]));
        assert_eq!(config.connect_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.request_timeout, None);
    }

    #[test]
    fn test_credentials_require_both_halves() {
        let config = ClientConfig::from_lookup(lookup(&[("AWS_ACCESS_KEY_ID", "AKID")]));
        assert!(config.credentials.is_none());

        let config = ClientConfig::from_lookup(lookup(&[
            ("AWS_ACCESS_KEY_ID", "AKID"),
            ("AWS_SECRET_ACCESS_KEY", "secret"),
            ("AWS_SESSION_TOKEN", "token"),
        ]));
        let creds = config.credentials.unwrap();
        assert_eq!(creds.access_key_id, "AKID");
        assert_eq!(creds.session_token.as_deref(), Some("token"));
    }

    #[test]
    fn test_default_profile_region() {
        let text = "\
# comment
[profile other]
region = eu-central-1

[default]
output = json
region = ap-southeast-2
";
        assert_eq!(
            default_profile_region(text),
            Some("ap-southeast-2".to_string())
        );
        assert_eq!(default_profile_region("[other]\nregion = x\n"), None);
    }
}
