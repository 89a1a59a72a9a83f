//! Credential ingestion
//!
//! Parses raw credential lists (`ip[:port]:user:pass` with any of the
//! usual separators) and fetches fresh batches from the external
//! marketplace when the pool runs dry.

use std::net::Ipv4Addr;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;

use crate::store::{CredentialSeed, DEFAULT_SSH_PORT};

#[derive(Debug, Error)]
pub enum SupplierError {
    #[error("marketplace request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// External source of raw credential tuples.
#[async_trait]
pub trait CredentialSupplier: Send + Sync {
    async fn fetch_credentials(&self, country: &str) -> Result<Vec<CredentialSeed>, SupplierError>;
}

/// Client for the autossh.top credential marketplace.
pub struct SshStoreSupplier {
    api_key: String,
    client: reqwest::Client,
}

impl SshStoreSupplier {
    pub fn new(api_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client with static settings");
        Self {
            api_key: api_key.into(),
            client,
        }
    }
}

#[async_trait]
impl CredentialSupplier for SshStoreSupplier {
    async fn fetch_credentials(&self, country: &str) -> Result<Vec<CredentialSeed>, SupplierError> {
        let url = format!("http://autossh.top/api/txt/{}/{}/", self.api_key, country);
        let body = self.client.get(&url).send().await?.text().await?;
        Ok(parse_credential_lines(&body))
    }
}

fn line_pattern() -> &'static Regex {
    static LINE: OnceLock<Regex> = OnceLock::new();
    LINE.get_or_init(|| {
        // ip [sep port] sep user sep pass, separators ; , | :
        Regex::new(
            r"(?x)
            (?P<ip>(?:\d{1,3}\.){3}\d{1,3})
            [;,|:]
            (?:(?P<port>\d{1,5})[;,|:])?
            (?P<user>[^\s;,|:]+)
            [;,|:]
            (?P<pass>[^\s;,|:]+)",
        )
        .expect("hardcoded credential-line pattern")
    })
}

/// Extract credential seeds from arbitrary text, one candidate per line.
/// Lines that do not contain a parseable tuple are skipped.
pub fn parse_credential_lines(content: &str) -> Vec<CredentialSeed> {
    content.lines().filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<CredentialSeed> {
    let caps = line_pattern().captures(line)?;
    // the regex allows octets above 255; Ipv4Addr is the real validator
    let host: Ipv4Addr = caps["ip"].parse().ok()?;
    let ssh_port = match caps.name("port") {
        Some(p) => p.as_str().parse().ok()?,
        None => DEFAULT_SSH_PORT,
    };
    Some(CredentialSeed {
        host: host.to_string(),
        username: caps["user"].to_string(),
        password: caps["pass"].to_string(),
        ssh_port,
    })
}
