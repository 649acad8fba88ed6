//! File staging between the local host and a session's endpoint.
//!
//! The default strategy pushes base64 through the session itself: uploads
//! feed a here-document into `base64 -d`, downloads read `base64 < file`.
//! This needs nothing but a POSIX shell and `base64` on the remote side.
//! With [`StagingMode::Scp`] the transfer instead runs out of band, from a
//! throwaway local session, using the launcher's copy tool.

use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::{debug, info};

use super::session::ShellSession;
use super::transport::{ConnectParams, CopyPath, Endpoint};
use crate::config::StagingMode;
use crate::error::{Error, Result};
use crate::utils::quote::{join, quote_path};

const STAGE_DELIMITER: &str = "RJ_STAGE_EOF";
const BASE64_LINE: usize = 76;
/// Extra allowance on top of the command timeout, per 64 KiB moved.
const PER_CHUNK_ALLOWANCE: Duration = Duration::from_secs(1);

impl ShellSession {
    /// Copies `local` to `remote` on the session's endpoint. Directories
    /// require `recursive`.
    pub async fn stage_to_remote(&self, local: &Path, remote: &str, recursive: bool) -> Result<()> {
        let local_str = local.to_string_lossy();
        if let Some(argv) = self.copy_argv(CopyPath::Local(&local_str), CopyPath::Remote(remote), recursive) {
            return self.copy_out_of_band(argv).await;
        }

        let meta = tokio::fs::metadata(local).await?;
        if !meta.is_dir() {
            return self.upload_file(local, remote).await;
        }
        if !recursive {
            return Err(Error::BadParameter(format!(
                "{} is a directory; stage it recursively",
                local.display()
            )));
        }

        let mut pending = vec![(local.to_path_buf(), remote.trim_end_matches('/').to_string())];
        while let Some((dir, target)) = pending.pop() {
            self.expect_success(&format!("mkdir -p {}", quote_path(&target)), None, &target)
                .await?;
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                let child_target = format!("{}/{}", target, name);
                if entry.file_type().await?.is_dir() {
                    pending.push((entry.path(), child_target));
                } else {
                    self.upload_file(&entry.path(), &child_target).await?;
                }
            }
        }
        Ok(())
    }

    /// Copies `remote` from the session's endpoint to `local`. Directories
    /// require `recursive`.
    pub async fn stage_from_remote(&self, remote: &str, local: &Path, recursive: bool) -> Result<()> {
        let local_str = local.to_string_lossy();
        if let Some(argv) = self.copy_argv(CopyPath::Remote(remote), CopyPath::Local(&local_str), recursive) {
            return self.copy_out_of_band(argv).await;
        }

        let is_dir = self
            .run_sync(&format!("test -d {}", quote_path(remote)), None)
            .await?
            .success();
        if !is_dir {
            return self.download_file(remote, local).await;
        }
        if !recursive {
            return Err(Error::BadParameter(format!(
                "{} is a directory; stage it recursively",
                remote
            )));
        }

        let root = remote.trim_end_matches('/');
        tokio::fs::create_dir_all(local).await?;
        for dir in self.remote_listing(root, "d").await? {
            tokio::fs::create_dir_all(local.join(&dir)).await?;
        }
        for file in self.remote_listing(root, "f").await? {
            self.download_file(&format!("{}/{}", root, file.display()), &local.join(&file))
                .await?;
        }
        Ok(())
    }

    fn copy_argv(&self, source: CopyPath<'_>, target: CopyPath<'_>, recursive: bool) -> Option<Vec<String>> {
        if self.config().staging != StagingMode::Scp {
            return None;
        }
        self.launcher()
            .copy_command(self.endpoint(), self.connect_params(), source, target, recursive)
    }

    async fn copy_out_of_band(&self, argv: Vec<String>) -> Result<()> {
        let cmdline = join(&argv);
        info!(session = self.id(), "staging out of band: {}", cmdline);
        let local = ShellSession::open(Endpoint::local(), ConnectParams::default(), self.config().clone()).await?;
        let output = local.run_sync(&cmdline, None).await;
        local.finalize(true).await;
        let output = output?;
        if !output.success() {
            return Err(Error::RemoteIo(format!(
                "{} failed: {}",
                argv.first().map(String::as_str).unwrap_or("copy"),
                output.stdout.trim()
            )));
        }
        Ok(())
    }

    async fn upload_file(&self, local: &Path, remote: &str) -> Result<()> {
        let data = tokio::fs::read(local).await?;
        let encoded = BASE64.encode(&data);
        debug!(session = self.id(), "upload {} -> {} ({} bytes)", local.display(), remote, data.len());

        let mut body = String::with_capacity(encoded.len() + encoded.len() / BASE64_LINE + 32);
        let mut start = 0;
        while start < encoded.len() {
            let end = (start + BASE64_LINE).min(encoded.len());
            // base64 output is ASCII, every index is a char boundary
            body.push_str(&encoded[start..end]);
            body.push('\n');
            start = end;
        }
        body.push_str(STAGE_DELIMITER);
        body.push('\n');

        let target = quote_path(remote);
        let mut pending = self
            .run_async(&format!(
                "mkdir -p \"$(dirname {t})\" && base64 -d > {t} <<'{d}'",
                t = target,
                d = STAGE_DELIMITER
            ))
            .await?;
        pending.send(&body)?;
        let output = pending.find_prompt(Some(self.transfer_timeout(data.len()))).await?;
        if !output.success() {
            return Err(Error::RemoteIo(format!(
                "upload to {} failed: {}",
                remote,
                output.stdout.trim()
            )));
        }
        Ok(())
    }

    async fn download_file(&self, remote: &str, local: &Path) -> Result<()> {
        let size_hint = self
            .run_sync(&format!("wc -c < {}", quote_path(remote)), None)
            .await?
            .stdout
            .trim()
            .parse::<usize>()
            .unwrap_or(0);
        let output = self
            .run_sync(
                &format!("base64 < {}", quote_path(remote)),
                Some(self.transfer_timeout(size_hint)),
            )
            .await?;
        if !output.success() {
            return Err(Error::RemoteIo(format!(
                "download of {} failed: {}",
                remote,
                output.stdout.trim()
            )));
        }

        let compact: String = output.stdout.chars().filter(|c| !c.is_whitespace()).collect();
        let data = BASE64
            .decode(compact.as_bytes())
            .map_err(|e| Error::protocol(format!("bad base64 for {}: {}", remote, e), output.stdout.clone()))?;

        if let Some(parent) = local.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(local, &data).await?;
        debug!(session = self.id(), "download {} -> {} ({} bytes)", remote, local.display(), data.len());
        Ok(())
    }

    /// Relative paths below `root` of the given `find -type`.
    async fn remote_listing(&self, root: &str, kind: &str) -> Result<Vec<PathBuf>> {
        let output = self
            .run_sync(
                &format!("cd {} && find . -type {}", quote_path(root), kind),
                None,
            )
            .await?;
        if !output.success() {
            return Err(Error::RemoteIo(format!(
                "cannot list {}: {}",
                root,
                output.stdout.trim()
            )));
        }
        Ok(output
            .stdout
            .lines()
            .filter_map(|line| line.strip_prefix("./"))
            .filter(|rel| !rel.is_empty())
            .map(PathBuf::from)
            .collect())
    }

    async fn expect_success(&self, cmdline: &str, timeout: Option<Duration>, what: &str) -> Result<()> {
        let output = self.run_sync(cmdline, timeout).await?;
        if output.success() {
            Ok(())
        } else {
            Err(Error::RemoteIo(format!("{}: {}", what, output.stdout.trim())))
        }
    }

    fn transfer_timeout(&self, bytes: usize) -> Duration {
        let chunks = u32::try_from(bytes / 65536).unwrap_or(u32::MAX);
        self.config().command_timeout() + PER_CHUNK_ALLOWANCE.saturating_mul(chunks)
    }
}
