//! Pull request patches
//!
//! Downloads a pull request diff and builds the `patch` command that applies it.

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use super::runner::CommandSpec;
use crate::error::CommandError;
use crate::tools::tools;
use crate::ui;

/// Fetches patch text from a URL
#[async_trait]
pub trait PatchFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String, CommandError>;
}

/// Fetches patches over HTTPS
pub struct HttpPatchFetcher {
    client: reqwest::Client,
}

impl HttpPatchFetcher {
    pub fn new() -> Result<Self, CommandError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("deploy-centralvm/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| CommandError::DownloadFailed {
                url: String::new(),
                message: e.to_string(),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PatchFetcher for HttpPatchFetcher {
    async fn fetch(&self, url: &str) -> Result<String, CommandError> {
        let failed = |e: reqwest::Error| CommandError::DownloadFailed {
            url: url.to_string(),
            message: e.to_string(),
        };

        let spinner = ui::spinner(format!("Downloading {}", url));
        let result = async {
            self.client
                .get(url)
                .send()
                .await
                .map_err(failed)?
                .error_for_status()
                .map_err(failed)?
                .text()
                .await
                .map_err(failed)
        }
        .await;
        spinner.finish_and_clear();

        result
    }
}

/// Where and how a patch is applied
#[derive(Debug, Clone, Copy)]
pub struct PatchTarget<'t> {
    /// Directory handed to `patch -d`
    pub dir: &'t Path,
    /// Path components stripped (`-p`)
    pub strip: u32,
    /// Run `patch` through sudo (installed trees are not ours)
    pub sudo: bool,
}

/// Downloads patches and builds the `patch` invocation for them
pub struct PatchClient<'a> {
    fetcher: &'a dyn PatchFetcher,
}

impl<'a> PatchClient<'a> {
    pub fn new(fetcher: &'a dyn PatchFetcher) -> Self {
        Self { fetcher }
    }

    /// Download `url` and return the command that applies it to `target`
    pub async fn prepare(&self, url: &str, target: PatchTarget<'_>) -> Result<CommandSpec, CommandError> {
        let diff = self.fetcher.fetch(url).await?;
        info!("Applying {} to {}", url, target.dir.display());
        Ok(Self::apply_spec(target, diff))
    }

    pub fn apply_spec(target: PatchTarget<'_>, diff: String) -> CommandSpec {
        let spec = if target.sudo {
            CommandSpec::sudo(tools::PATCH)
        } else {
            CommandSpec::new(tools::PATCH)
        };
        spec.arg("-d")
            .path_arg(target.dir)
            .arg(format!("-p{}", target.strip))
            .stdin(diff)
    }
}
