//! Working copy driven through the `git` command line.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use cq_core::{Checkout, CheckoutError, CheckoutResult};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{IntegrationError, Result};
use crate::retry::{retry_if, RetryPolicy};

/// `[checkout]` section of the daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitCheckoutConfig {
    pub path: PathBuf,
    /// Remote commits are pushed to. Local-only when unset.
    #[serde(default)]
    pub remote: Option<String>,
    #[serde(default = "default_branch")]
    pub branch: String,
    /// The repository runs no commit hooks that close reviews.
    #[serde(default)]
    pub server_hooks_missing: bool,
    /// Backoff for pushes the remote refuses.
    #[serde(default)]
    pub push_retry: RetryPolicy,
}

fn default_branch() -> String {
    "main".to_string()
}

impl GitCheckoutConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            remote: None,
            branch: default_branch(),
            server_hooks_missing: false,
            push_retry: RetryPolicy::default(),
        }
    }
}

/// A git working copy the queue applies patches to and commits from.
#[derive(Debug, Clone)]
pub struct GitCheckout {
    config: GitCheckoutConfig,
}

impl GitCheckout {
    /// Wrap a path without touching it.
    pub fn new(config: GitCheckoutConfig) -> Self {
        Self { config }
    }

    /// Open an existing work tree.
    pub async fn open(config: GitCheckoutConfig) -> Result<Self> {
        let checkout = Self::new(config);
        let inside = checkout
            .git(&["rev-parse", "--is-inside-work-tree"], None)
            .await?;
        if inside != "true" {
            return Err(IntegrationError::Git {
                command: "rev-parse --is-inside-work-tree".to_string(),
                stderr: format!("{} is not a work tree", checkout.config.path.display()),
            });
        }
        Ok(checkout)
    }

    pub fn config(&self) -> &GitCheckoutConfig {
        &self.config
    }

    /// Current HEAD commit.
    pub async fn head(&self) -> Result<String> {
        self.git(&["rev-parse", "HEAD"], None).await
    }

    /// Run git in the work tree, returning trimmed stdout.
    async fn git(&self, args: &[&str], stdin: Option<&str>) -> Result<String> {
        let command = args.join(" ");
        debug!(command = %command, "Running git");
        let mut child = Command::new("git")
            .args(args)
            .current_dir(&self.config.path)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(input) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input.as_bytes()).await?;
                // Closing stdin lets git see EOF.
                drop(pipe);
            }
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(IntegrationError::Git {
                command,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// `git commit --author` wants `Name <email>`.
fn author_ident(author: &str) -> String {
    if author.contains('<') {
        author.to_string()
    } else {
        format!("{author} <{author}>")
    }
}

#[async_trait]
impl Checkout for GitCheckout {
    async fn apply_patch(&self, patch: &str) -> CheckoutResult<()> {
        // `git apply` is all-or-nothing; the reset covers a partially
        // updated index.
        if let Err(e) = self
            .git(&["apply", "--index", "--whitespace=nowarn", "-"], Some(patch))
            .await
        {
            warn!(error = %e, "Patch did not apply");
            if let Err(reset) = self.git(&["reset", "--hard", "--quiet"], None).await {
                return Err(CheckoutError::RevertFailed(reset.to_string()));
            }
            return Err(CheckoutError::PatchFailed(e.to_string()));
        }
        Ok(())
    }

    async fn commit(&self, message: &str, author: &str) -> CheckoutResult<String> {
        let ident = author_ident(author);
        self.git(
            &["commit", "--quiet", "--author", &ident, "--file", "-"],
            Some(message),
        )
        .await
        .map_err(|e| CheckoutError::CommitFailed(e.to_string()))?;

        let revision = self
            .head()
            .await
            .map_err(|e| CheckoutError::CommitFailed(e.to_string()))?;

        if let Some(remote) = &self.config.remote {
            let refspec = format!("HEAD:refs/heads/{}", self.config.branch);
            let args = ["push", "--quiet", remote.as_str(), refspec.as_str()];
            let pushed = retry_if(
                &self.config.push_retry,
                "push",
                |_: &IntegrationError| true,
                || self.git(&args, None),
            )
            .await;
            if let Err(e) = pushed {
                // Drop the unpushed commit so the next change starts clean.
                if let Err(undo) = self.git(&["reset", "--hard", "--quiet", "HEAD~1"], None).await
                {
                    warn!(error = %undo, "Could not drop unpushed commit");
                }
                return Err(CheckoutError::PushFailed(e.to_string()));
            }
        }

        info!(revision = %revision, author = %ident, "Committed");
        Ok(revision)
    }

    async fn revert(&self) -> CheckoutResult<()> {
        self.git(&["reset", "--hard", "--quiet"], None)
            .await
            .map_err(|e| CheckoutError::RevertFailed(e.to_string()))?;
        self.git(&["clean", "-fdxq"], None)
            .await
            .map_err(|e| CheckoutError::RevertFailed(e.to_string()))?;
        Ok(())
    }

    fn project_path(&self) -> &Path {
        &self.config.path
    }
}
