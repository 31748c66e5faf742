// # Public Address Lookup
//
// Fetches the host's public (WAN) address from a plain-text HTTP service such
// as `https://api.ipify.org`. Used for the endpoint written into client
// profiles when no DDNS name is configured.

use std::net::IpAddr;
use std::time::Duration;

use vpn_core::{Error, Result};

/// Request timeout for the lookup service
const REQUEST_TIMEOUT_SECS: u64 = 10;

/// HTTP public address lookup
#[derive(Debug, Clone)]
pub struct PublicIpLookup {
    url: String,
    client: reqwest::Client,
}

impl PublicIpLookup {
    /// Create a lookup against `url`
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .unwrap_or_default(),
        }
    }

    /// Lookup service URL
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Fetch the current public address
    pub async fn fetch(&self) -> Result<IpAddr> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| Error::host_network(format!("Public IP request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::host_network(format!(
                "Public IP service returned HTTP {}",
                response.status()
            )));
        }

        let body = response.text().await.map_err(|e| {
            Error::host_network(format!("Failed to read public IP response: {}", e))
        })?;

        parse_address(&body)
    }
}

/// Parse a lookup service body (`"203.0.113.7\n"`)
pub fn parse_address(body: &str) -> Result<IpAddr> {
    let text = body.trim();
    text.parse()
        .map_err(|_| Error::host_network(format!("Invalid public IP address: '{}'", text)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        assert_eq!(
            parse_address("203.0.113.7\n").unwrap(),
            IpAddr::from([203, 0, 113, 7])
        );
        assert!(parse_address("2001:db8::1").unwrap().is_ipv6());
        assert!(parse_address("<html>rate limited</html>").is_err());
        assert!(parse_address("").is_err());
    }
}
