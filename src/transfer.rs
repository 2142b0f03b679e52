use std::path::Path;

use anyhow::{anyhow, Context, Result};
use reqwest::header::ACCEPT;
use reqwest::Client;
use serde::Deserialize;
use url::Url;

use crate::config::{api_key, Config};
use crate::error_codes::{CodedError, MISSING_INPUT};
use crate::http::{build_client, download_to, ensure_success};
use crate::report::BatchReport;
use crate::walk::{files_with_extension, has_extension, SkipPattern};

const ODATA_JSON: &str = "application/json;odata=nometadata";

/// SharePoint's server-relative URLs go inside `'...'` literals, where quotes are doubled.
pub fn odata_quote(value: &str) -> String {
    value.replace('\'', "''")
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteFile {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "ServerRelativeUrl")]
    pub server_relative_url: String,
}

#[derive(Debug, Deserialize)]
struct FileListing {
    value: Vec<RemoteFile>,
}

/// SharePoint REST client authenticated with a bearer token.
#[derive(Debug, Clone)]
pub struct SharePointClient {
    http: Client,
    site_url: String,
    token: String,
}

impl SharePointClient {
    pub fn new(http: Client, site_url: &str, token: String) -> Result<Self> {
        Url::parse(site_url).with_context(|| format!("invalid SharePoint site URL '{site_url}'"))?;
        Ok(Self {
            http,
            site_url: site_url.trim_end_matches('/').to_owned(),
            token,
        })
    }

    /// `site` overrides `sharepoint.site_url`.
    pub fn from_config(config: &Config, site: Option<&str>) -> Result<Self> {
        let settings = &config.sharepoint;
        let site_url = site.or(settings.site_url.as_deref()).ok_or_else(|| {
            anyhow!(CodedError::usage(
                MISSING_INPUT,
                "no SharePoint site; pass --site or set sharepoint.site_url",
            ))
        })?;
        let token = api_key(&settings.token_env)?;
        Self::new(build_client(settings.timeout_secs)?, site_url, token)
    }

    /// `{site}/_api/web/{call}`. Each `/`-separated piece of `call` is percent-encoded as
    /// a path segment, so `?` and `#` in folder names stay in the path.
    fn api_url(&self, call: &str) -> Result<Url> {
        let base = format!("{}/_api/web", self.site_url);
        let mut url = Url::parse(&base).with_context(|| format!("invalid SharePoint URL '{base}'"))?;
        url.path_segments_mut()
            .map_err(|()| anyhow!("SharePoint URL '{base}' cannot take a path"))?
            .extend(call.split('/'));
        Ok(url)
    }

    pub async fn list_files(&self, folder: &str) -> Result<Vec<RemoteFile>> {
        let url = self.api_url(&format!(
            "GetFolderByServerRelativeUrl('{}')/Files",
            odata_quote(folder)
        ))?;
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .header(ACCEPT, ODATA_JSON)
            .send()
            .await
            .with_context(|| format!("failed to list SharePoint folder {folder}"))?;
        let listing: FileListing = ensure_success(response, "SharePoint folder listing")
            .await?
            .json()
            .await
            .context("failed to decode SharePoint folder listing")?;
        Ok(listing.value)
    }

    pub async fn download(&self, file: &RemoteFile, target: &Path) -> Result<u64> {
        let url = self.api_url(&format!(
            "GetFileByServerRelativeUrl('{}')/$value",
            odata_quote(&file.server_relative_url)
        ))?;
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .with_context(|| format!("failed to download {}", file.server_relative_url))?;
        let response = ensure_success(response, "SharePoint file download").await?;
        download_to(response, target).await
    }
}

/// Downloads files with `extension` from a SharePoint folder into `dest`, skipping names
/// that already exist locally.
pub async fn fetch_folder(
    client: &SharePointClient,
    folder: &str,
    dest: &Path,
    extension: &str,
) -> Result<BatchReport> {
    tokio::fs::create_dir_all(dest)
        .await
        .with_context(|| format!("failed to create {}", dest.display()))?;
    let files = client.list_files(folder).await?;
    tracing::info!(count = files.len(), folder, "listed SharePoint folder");

    let mut report = BatchReport::new("fetch");
    for file in files {
        let target = dest.join(&file.name);
        if !has_extension(Path::new(&file.name), &[extension]) {
            tracing::debug!(name = %file.name, "skipping file with other extension");
            continue;
        }
        if target.exists() {
            report.skipped(&target, "already downloaded");
            continue;
        }
        match client.download(&file, &target).await {
            Ok(bytes) => report.ok(&target, format!("{bytes} bytes")),
            Err(error) => report.failed(&target, &error),
        }
    }
    Ok(report)
}

/// `{base}/{file name}`, with the name percent-encoded as one path segment.
pub fn upload_url(base: &str, file_name: &str) -> Result<Url> {
    let mut url = Url::parse(base).with_context(|| format!("invalid upload URL '{base}'"))?;
    url.path_segments_mut()
        .map_err(|()| anyhow!("upload URL '{base}' cannot take a path"))?
        .pop_if_empty()
        .push(file_name);
    Ok(url)
}

pub async fn upload_dir(
    http: &Client,
    config: &Config,
    dir: &Path,
    base: &str,
    token: Option<&str>,
    extension: Option<&str>,
) -> Result<BatchReport> {
    let skip = SkipPattern::new(&config.walk.skip_dir_pattern);
    let files = match extension {
        Some(extension) => files_with_extension(dir, &[extension], false, &skip)?,
        None => {
            let mut files = Vec::new();
            let mut entries = tokio::fs::read_dir(dir)
                .await
                .with_context(|| format!("failed to read {}", dir.display()))?;
            while let Some(entry) = entries.next_entry().await? {
                if entry.file_type().await?.is_file() {
                    files.push(entry.path());
                }
            }
            files.sort();
            files
        }
    };

    let mut report = BatchReport::new("upload");
    for file in files {
        let result = upload_file(http, base, &file, token).await;
        match result {
            Ok(url) => report.ok(&file, url.to_string()),
            Err(error) => report.failed(&file, &error),
        }
    }
    Ok(report)
}

async fn upload_file(http: &Client, base: &str, file: &Path, token: Option<&str>) -> Result<Url> {
    let name = file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .with_context(|| format!("path has no file name: {}", file.display()))?;
    let url = upload_url(base, &name)?;
    let bytes = tokio::fs::read(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;

    let mut request = http.put(url.clone()).body(bytes);
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }
    let response = request
        .send()
        .await
        .with_context(|| format!("failed to upload {}", file.display()))?;
    ensure_success(response, "upload").await?;
    Ok(url)
}
