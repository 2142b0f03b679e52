use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::{Client, Response};
use tokio::io::AsyncWriteExt;

use crate::atomic::{persist_over, sibling_temp_path};
use crate::ffmpeg::last_n_chars;

pub fn build_client(timeout_secs: u64) -> Result<Client> {
    Client::builder()
        .user_agent(concat!("clipbatch/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .context("failed to build HTTP client")
}

/// Passes successful responses through; otherwise fails with the status and the tail of
/// the body, which is where these APIs put their error message.
pub async fn ensure_success(response: Response, what: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    bail!("{what} returned {status}: {}", last_n_chars(&body, 300));
}

/// Streams a response body into a temporary file beside `target`, then renames it over
/// `target`. A failed transfer leaves nothing behind.
pub async fn download_to(mut response: Response, target: &Path) -> Result<u64> {
    let temp = sibling_temp_path(target)?;
    let mut file = tokio::fs::File::create(&temp)
        .await
        .with_context(|| format!("failed to create {}", temp.display()))?;
    let mut written = 0_u64;
    while let Some(chunk) = response
        .chunk()
        .await
        .with_context(|| format!("download of {} was interrupted", target.display()))?
    {
        file.write_all(&chunk)
            .await
            .with_context(|| format!("failed to write {}", temp.display()))?;
        written += chunk.len() as u64;
    }
    file.flush()
        .await
        .with_context(|| format!("failed to flush {}", temp.display()))?;
    drop(file);
    persist_over(temp, target)?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::{build_client, download_to, ensure_success};

    #[tokio::test]
    async fn download_writes_body_to_target() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/clip.mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7_u8; 4096]))
            .mount(&server)
            .await;

        let dir = tempdir().expect("tempdir should be created");
        let target = dir.path().join("clip.mp4");
        let client = build_client(10).expect("client should build");
        let response = client
            .get(format!("{}/clip.mp4", server.uri()))
            .send()
            .await
            .expect("request should succeed");
        let written = download_to(response, &target)
            .await
            .expect("download should succeed");

        assert_eq!(written, 4096);
        assert_eq!(fs::read(&target).expect("target should exist").len(), 4096);
        assert_eq!(fs::read_dir(dir.path()).expect("dir should be readable").count(), 1);
    }

    #[tokio::test]
    async fn error_status_includes_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_string("token expired"))
            .mount(&server)
            .await;

        let client = build_client(10).expect("client should build");
        let response = client
            .get(server.uri())
            .send()
            .await
            .expect("request should complete");
        let error = ensure_success(response, "listing")
            .await
            .expect_err("403 should fail");
        let message = error.to_string();
        assert!(message.contains("403"));
        assert!(message.contains("token expired"));
    }
}
