//! HTTP client construction shared across providers.

use std::time::Duration;

/// Build the HTTP client used by the streaming providers.
///
/// A connect timeout is applied, but no overall request timeout: chat
/// streams are long-lived and are cancelled by dropping them instead.
pub(crate) fn build_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds() {
        let _client = build_client();
    }
}
