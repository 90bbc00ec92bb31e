use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use ping_core::error::SendError;
use ping_core::ping::{PingMessage, SendResult, Sender};
use ping_core::scheduler::Constraint;
use reqwest::Url;
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Error body returned by the ping server on non-2xx responses.
#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

/// `POST {server}/ping` with a JSON `{"device_id": ...}` body.
pub struct HttpSender {
    client: reqwest::Client,
    url: Url,
}

impl HttpSender {
    pub fn new(server_url: &str, request_timeout: Duration) -> Result<Self> {
        let url = ping_url(server_url)?;
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("build http client")?;
        Ok(Self { client, url })
    }
}

fn ping_url(server_url: &str) -> Result<Url> {
    let base = format!("{}/", server_url.trim_end_matches('/'));
    let base = Url::parse(&base).with_context(|| format!("parse server_url {server_url}"))?;
    base.join("ping").context("build ping url")
}

#[async_trait]
impl Sender for HttpSender {
    async fn send(&self, message: &PingMessage) -> SendResult {
        let resp = self
            .client
            .post(self.url.clone())
            .json(message)
            .send()
            .await
            .map_err(classify)?;

        let status = resp.status();
        if status.is_success() {
            debug!(%status, "ping accepted");
            return Ok(());
        }
        let reason = match resp.json::<ErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => status.canonical_reason().unwrap_or("no reason").to_string(),
        };
        Err(SendError::Recoverable(format!("HTTP {}: {}", status.as_u16(), reason)))
    }
}

fn classify(e: reqwest::Error) -> SendError {
    if e.is_builder() || e.is_decode() {
        SendError::Unexpected(e.to_string())
    } else {
        // connect, timeout, reset, ...
        SendError::Recoverable(e.to_string())
    }
}

/// Holds while the ping server accepts TCP connections.
pub struct NetworkReachable {
    host: String,
    port: u16,
    probe_timeout: Duration,
}

impl NetworkReachable {
    pub fn for_server(server_url: &str, probe_timeout: Duration) -> Result<Self> {
        let url = ping_url(server_url)?;
        let host = url
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("server_url {server_url} has no host"))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| anyhow::anyhow!("server_url {server_url} has no port"))?;
        Ok(Self { host, port, probe_timeout })
    }
}

#[async_trait]
impl Constraint for NetworkReachable {
    fn name(&self) -> &str { "network" }

    async fn satisfied(&self) -> bool {
        let addr = (self.host.as_str(), self.port);
        matches!(timeout(self.probe_timeout, TcpStream::connect(addr)).await, Ok(Ok(_)))
    }
}
