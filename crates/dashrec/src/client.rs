use std::sync::OnceLock;

use reqwest::Client;
use tracing::debug;

use crate::config::HttpConfig;
use crate::error::LiveError;

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Builds the single client shared by the manifest source and the chunk fetcher.
///
/// Per-request timeouts are applied by the callers, since they differ between
/// manifest polls and chunk fetches and grow with the retry count.
pub fn create_client(config: &HttpConfig) -> Result<Client, LiveError> {
    install_rustls_provider();

    let redirect = if config.follow_redirects {
        reqwest::redirect::Policy::limited(10)
    } else {
        reqwest::redirect::Policy::none()
    };

    let client = Client::builder()
        .user_agent(&config.user_agent)
        .default_headers(config.headers.clone())
        .connect_timeout(config.connect_timeout)
        .redirect(redirect)
        .danger_accept_invalid_certs(config.danger_accept_invalid_certs)
        .build()?;

    Ok(client)
}
