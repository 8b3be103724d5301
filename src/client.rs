//! HTTP client wrapper: build reqwest client with timeouts and the auth header from sink config.

use crate::config::{AuthConfig, SinkConfig, read_secret};
use anyhow::Context;
use base64::Engine;
use reqwest::Client;
use reqwest::header::HeaderValue;
use std::time::Duration;

/// Build a reqwest client with timeouts from sink config.
pub fn build_client(sink: &SinkConfig) -> anyhow::Result<Client> {
    let timeout = Duration::from_secs(sink.timeout_secs);
    let client = Client::builder()
        .connect_timeout(Duration::from_secs(std::cmp::min(10, sink.timeout_secs)))
        .timeout(timeout)
        .user_agent(concat!("xlogd/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("build reqwest client")?;
    Ok(client)
}

/// Resolve the Authorization header once at startup. Secrets come from file or env.
pub fn auth_header(auth: Option<&AuthConfig>) -> anyhow::Result<Option<HeaderValue>> {
    let Some(auth) = auth else {
        return Ok(None);
    };
    let value = match auth {
        AuthConfig::Bearer {
            token_env,
            token_file,
        } => {
            let token = read_secret(token_file.as_deref(), token_env)
                .context("bearer auth token")?;
            format!("Bearer {}", token)
        }
        AuthConfig::Basic {
            user_env,
            user_file,
            password_env,
            password_file,
        } => {
            let user =
                read_secret(user_file.as_deref(), user_env).context("basic auth user")?;
            let password = read_secret(password_file.as_deref(), password_env)
                .context("basic auth password")?;
            let encoded = base64::engine::general_purpose::STANDARD
                .encode(format!("{}:{}", user, password).as_bytes());
            format!("Basic {}", encoded)
        }
    };
    let mut hv = HeaderValue::try_from(value).context("invalid auth header")?;
    hv.set_sensitive(true);
    Ok(Some(hv))
}
