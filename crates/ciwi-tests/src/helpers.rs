//! Test helper functions and utilities.

use ciwi_api::{AppState, ServerLifecycle, create_router};
use reqwest::Client;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;

/// Start the API server on an ephemeral port and return its address.
pub async fn start_test_server(
    state: Arc<AppState>,
) -> anyhow::Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let app = create_router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "test server failed");
        }
    });

    Ok((addr, handle))
}

/// Lifecycle that counts exit and restart requests instead of acting.
#[derive(Default)]
pub struct RecordingLifecycle {
    exits: AtomicUsize,
    restarts: AtomicUsize,
}

impl RecordingLifecycle {
    pub fn exits(&self) -> usize {
        self.exits.load(Ordering::SeqCst)
    }

    pub fn restarts(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }
}

impl ServerLifecycle for RecordingLifecycle {
    fn exit_after(&self, _delay: Duration) {
        self.exits.fetch_add(1, Ordering::SeqCst);
    }

    fn restart_after(&self, _delay: Duration) {
        self.restarts.fetch_add(1, Ordering::SeqCst);
    }
}

/// Create an HTTP client for testing.
pub fn test_client() -> Client {
    Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .expect("Failed to create test client")
}

/// API test client with base URL.
pub struct ApiTestClient {
    client: Client,
    base_url: String,
}

impl ApiTestClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            client: test_client(),
            base_url: format!("http://{}", addr),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn inner(&self) -> &Client {
        &self.client
    }

    pub async fn get(&self, path: &str) -> reqwest::Result<reqwest::Response> {
        self.client.get(self.url(path)).send().await
    }

    pub async fn post<T: Serialize>(
        &self,
        path: &str,
        body: &T,
    ) -> reqwest::Result<reqwest::Response> {
        self.client.post(self.url(path)).json(body).send().await
    }

    /// POST without a body.
    pub async fn post_empty(&self, path: &str) -> reqwest::Result<reqwest::Response> {
        self.client.post(self.url(path)).send().await
    }

    /// POST a raw body with a JSON content type.
    pub async fn post_raw(&self, path: &str, body: &str) -> reqwest::Result<reqwest::Response> {
        self.client
            .post(self.url(path))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_string())
            .send()
            .await
    }

    pub async fn put<T: Serialize>(
        &self,
        path: &str,
        body: &T,
    ) -> reqwest::Result<reqwest::Response> {
        self.client.put(self.url(path)).json(body).send().await
    }

    pub async fn delete(&self, path: &str) -> reqwest::Result<reqwest::Response> {
        self.client.delete(self.url(path)).send().await
    }

    /// GET and decode a JSON body, asserting a 2xx status.
    pub async fn get_json(&self, path: &str) -> anyhow::Result<serde_json::Value> {
        let resp = self.get(path).await?.error_for_status()?;
        Ok(resp.json().await?)
    }

    /// POST and decode a JSON body, asserting a 2xx status.
    pub async fn post_json<T: Serialize>(
        &self,
        path: &str,
        body: &T,
    ) -> anyhow::Result<serde_json::Value> {
        let resp = self.post(path, body).await?.error_for_status()?;
        Ok(resp.json().await?)
    }

    /// Check the liveness endpoint.
    pub async fn health(&self) -> anyhow::Result<bool> {
        let resp = self.get("/api/v1/healthz").await?;
        Ok(resp.status().is_success())
    }
}

/// Wait for a condition with timeout.
pub async fn wait_for<F, Fut>(timeout: Duration, interval: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition().await {
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_for_immediate() {
        let result = wait_for(Duration::from_secs(1), Duration::from_millis(10), || async {
            true
        })
        .await;
        assert!(result);
    }

    #[tokio::test]
    async fn test_wait_for_timeout() {
        let result = wait_for(
            Duration::from_millis(100),
            Duration::from_millis(10),
            || async { false },
        )
        .await;
        assert!(!result);
    }

    #[test]
    fn test_recording_lifecycle() {
        let lifecycle = RecordingLifecycle::default();
        lifecycle.restart_after(Duration::from_millis(1));
        lifecycle.exit_after(Duration::from_millis(1));
        lifecycle.exit_after(Duration::from_millis(1));
        assert_eq!(lifecycle.restarts(), 1);
        assert_eq!(lifecycle.exits(), 2);
    }
}
