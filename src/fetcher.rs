//! External Fetcher Module
//!
//! The fetch coordinator treats content retrieval as an opaque, slow operation
//! behind the [`ContentFetcher`] trait. The production implementation runs
//! `yt-dlp` as a subprocess.
//!
//! On Unix the downloader is started in its own process group. Dropping an
//! unfinished fetch kills the whole group, including the ffmpeg process
//! yt-dlp spawns for merging, so nothing keeps writing into the partial
//! directory after the attempt is abandoned.

use crate::config::FetchConfig;
use crate::{ProxyError, Result};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Capability that populates `destination` with the artifact for `source`.
///
/// Implementations must either leave a complete file at `destination` and
/// return `Ok(())`, or return an error. They never publish into the cache
/// themselves; the coordinator hands them a private partial path.
///
/// Dropping the returned future must abort the fetch (the coordinator drops
/// it when the fetch deadline expires).
pub trait ContentFetcher: Send + Sync + 'static {
    fn fetch(
        &self,
        source: &str,
        destination: &Path,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Runs `yt-dlp` (or a compatible downloader) for each fetch.
#[derive(Debug, Clone)]
pub struct YtDlpFetcher {
    program: PathBuf,
    format_selector: String,
    merge_output_format: String,
    extra_args: Vec<String>,
}

impl YtDlpFetcher {
    pub fn new(
        program: impl Into<PathBuf>,
        format_selector: impl Into<String>,
        merge_output_format: impl Into<String>,
    ) -> Self {
        Self {
            program: program.into(),
            format_selector: format_selector.into(),
            merge_output_format: merge_output_format.into(),
            extra_args: Vec::new(),
        }
    }

    /// Builds a fetcher from configuration; the merge format follows the
    /// storage file extension so the published file matches its name.
    pub fn from_config(config: &FetchConfig, file_extension: &str) -> Self {
        Self {
            program: config.downloader_path.clone(),
            format_selector: config.format_selector.clone(),
            merge_output_format: file_extension.trim_start_matches('.').to_string(),
            extra_args: config.extra_args.clone(),
        }
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    /// Arguments passed to the downloader, in order.
    pub fn build_args(&self, source: &str, destination: &Path) -> Vec<String> {
        let mut args = vec![
            "-f".to_string(),
            self.format_selector.clone(),
            "--merge-output-format".to_string(),
            self.merge_output_format.clone(),
            "--no-playlist".to_string(),
            "--no-part".to_string(),
        ];
        args.extend(self.extra_args.iter().cloned());
        args.push("-o".to_string());
        args.push(destination.to_string_lossy().into_owned());
        args.push(source.to_string());
        args
    }
}

impl ContentFetcher for YtDlpFetcher {
    async fn fetch(&self, source: &str, destination: &Path) -> Result<()> {
        let program = self.program.display().to_string();
        info!("Starting download for URL: {}", source);

        let mut command = Command::new(&self.program);
        command
            .args(self.build_args(source, destination))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|e| ProxyError::FetchError(format!("failed to start {}: {}", program, e)))?;
        #[cfg(unix)]
        let mut process_group = child.id().map(ProcessGroupGuard::new);

        let stdout_task = child
            .stdout
            .take()
            .map(|out| tokio::spawn(forward_output(out, source.to_string(), "stdout")));
        let stderr_task = child
            .stderr
            .take()
            .map(|err| tokio::spawn(forward_output(err, source.to_string(), "stderr")));

        let status = child
            .wait()
            .await
            .map_err(|e| ProxyError::FetchError(format!("failed to wait for {}: {}", program, e)))?;
        #[cfg(unix)]
        if let Some(group) = process_group.as_mut() {
            group.disarm();
        }

        if let Some(task) = stdout_task {
            let _ = task.await;
        }
        let last_stderr_line = match stderr_task {
            Some(task) => task.await.ok().flatten(),
            None => None,
        };

        if !status.success() {
            let detail = last_stderr_line.unwrap_or_else(|| "no diagnostic output".to_string());
            warn!("{} failed for {}: {} ({})", program, source, status, detail);
            return Err(ProxyError::FetchError(format!(
                "{} exited with {}: {}",
                program, status, detail
            )));
        }

        info!("Download completed: {}", destination.display());
        Ok(())
    }
}

/// Kills a process group with SIGKILL when dropped while armed.
#[cfg(unix)]
struct ProcessGroupGuard {
    pgid: Option<libc::pid_t>,
}

#[cfg(unix)]
impl ProcessGroupGuard {
    fn new(leader_pid: u32) -> Self {
        Self {
            pgid: libc::pid_t::try_from(leader_pid).ok(),
        }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

#[cfg(unix)]
impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            // SAFETY: killpg only sends a signal; it takes no pointers.
            let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
            if rc == 0 {
                debug!("Killed downloader process group {}", pgid);
            }
        }
    }
}

/// Logs every line of a downloader stream and returns the last non-empty one.
async fn forward_output<R>(stream: R, source: String, name: &'static str) -> Option<String>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    let mut last = None;
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                debug!(source = %source, stream = name, "yt-dlp: {}", line);
                if !line.trim().is_empty() {
                    last = Some(line);
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("Stopped reading downloader {} for {}: {}", name, source, e);
                break;
            }
        }
    }
    last
}
