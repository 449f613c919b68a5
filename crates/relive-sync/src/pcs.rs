//! PCS command-line client wrapper.
//!
//! All cloud-storage operations shell out to the PCS CLI. Upload
//! progress is scraped from its interactive output, which redraws a
//! `↑ uploaded/total speed` line with carriage returns and ANSI color.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};

/// Minimum time between automatic relogin attempts.
const RELOGIN_THROTTLE: Duration = Duration::from_secs(600);

/// Collision policy for uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPolicy {
    Skip,
    Overwrite,
    Rsync,
}

impl UploadPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadPolicy::Skip => "skip",
            UploadPolicy::Overwrite => "overwrite",
            UploadPolicy::Rsync => "rsync",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "skip" => Some(UploadPolicy::Skip),
            "overwrite" => Some(UploadPolicy::Overwrite),
            "rsync" => Some(UploadPolicy::Rsync),
            _ => None,
        }
    }
}

pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Handle to the PCS CLI binary.
#[derive(Debug, Clone)]
pub struct PcsCli {
    exec_path: String,
}

impl PcsCli {
    /// Resolve the CLI, preferring an explicit path over PATH lookup.
    pub fn resolve(exec_path: Option<&str>) -> SyncResult<Self> {
        if let Some(path) = exec_path.filter(|p| !p.trim().is_empty()) {
            if !Path::new(path).exists() {
                return Err(SyncError::CliNotFound(path.to_string()));
            }
            return Ok(Self {
                exec_path: path.to_string(),
            });
        }
        let found = which::which("BaiduPCS-Go")
            .map_err(|_| SyncError::CliNotFound("BaiduPCS-Go".to_string()))?;
        Ok(Self {
            exec_path: found.to_string_lossy().to_string(),
        })
    }

    /// Run a non-interactive subcommand to completion.
    pub async fn run(&self, args: &[&str]) -> SyncResult<CommandOutput> {
        debug!(exec = %self.exec_path, ?args, "pcs command");
        let output = Command::new(&self.exec_path)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            return Err(SyncError::CliFailed(stderr.trim().to_string()));
        }
        Ok(CommandOutput { stdout, stderr })
    }

    /// Upload a local file into a remote directory, streaming progress
    /// percentages (capped at 99; 100 is reported by the caller after
    /// verification). The child is killed when `cancel` flips true.
    pub async fn upload(
        &self,
        local_path: &str,
        remote_dir: &str,
        policy: UploadPolicy,
        progress_tx: mpsc::Sender<f64>,
        mut cancel: watch::Receiver<bool>,
    ) -> SyncResult<CommandOutput> {
        let policy_arg = format!("-policy={}", policy.as_str());
        let mut child = Command::new(&self.exec_path)
            .args(["upload", &policy_arg, local_path, remote_dir])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| SyncError::CliFailed("stdout not captured".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| SyncError::CliFailed("stderr not captured".to_string()))?;

        let stderr_handle = tokio::spawn(async move {
            let mut buffer = String::new();
            let _ = stderr.read_to_string(&mut buffer).await;
            buffer
        });

        // The progress line is redrawn with \r, so split on both \r and \n
        let mut stdout_buf = String::new();
        let mut pending: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 4096];
        let exit = loop {
            tokio::select! {
                read = stdout.read(&mut chunk) => {
                    let n = read?;
                    if n == 0 {
                        break None;
                    }
                    let slice = &chunk[..n];
                    stdout_buf.push_str(&String::from_utf8_lossy(slice));
                    pending.extend_from_slice(slice);

                    while let Some(pos) = pending.iter().position(|b| matches!(b, b'\n' | b'\r')) {
                        let mut line: Vec<u8> = pending.drain(..=pos).collect();
                        while matches!(line.last(), Some(b'\n' | b'\r')) {
                            line.pop();
                        }
                        if line.is_empty() {
                            continue;
                        }
                        if let Some(progress) = parse_progress_line(&String::from_utf8_lossy(&line)) {
                            let _ = progress_tx.try_send(progress);
                        }
                    }
                }
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        break Some(SyncError::Paused);
                    }
                }
            }
        };
        if !pending.is_empty() {
            if let Some(progress) = parse_progress_line(&String::from_utf8_lossy(&pending)) {
                let _ = progress_tx.try_send(progress);
            }
        }

        if let Some(err) = exit {
            let _ = child.kill().await;
            return Err(err);
        }

        let status = child.wait().await?;
        let stderr_output = stderr_handle.await.unwrap_or_default();

        if !status.success() {
            return Err(SyncError::CliFailed(stderr_output.trim().to_string()));
        }
        // Exit code 0 can still mean a failed transfer
        if stdout_buf.contains("文件上传失败") {
            return Err(SyncError::CliFailed(stdout_buf.trim().to_string()));
        }
        Ok(CommandOutput {
            stdout: stdout_buf,
            stderr: stderr_output,
        })
    }

    /// Remote file size via `meta`.
    pub async fn remote_size(&self, remote_path: &str) -> SyncResult<u64> {
        let output = self.run(&["meta", remote_path]).await?;
        parse_meta_size(&output.stdout)
            .ok_or_else(|| SyncError::CliFailed("meta output had no size".to_string()))
    }

    pub async fn rename(&self, from: &str, to: &str) -> SyncResult<()> {
        self.run(&["mv", from, to]).await.map(|_| ())
    }

    pub async fn mkdir(&self, remote_dir: &str) -> SyncResult<()> {
        self.run(&["mkdir", remote_dir]).await.map(|_| ())
    }

    pub async fn list(&self, remote_dir: &str) -> SyncResult<String> {
        self.run(&["ls", remote_dir]).await.map(|o| o.stdout)
    }

    /// Check login state via `who`.
    pub async fn is_logged_in(&self) -> SyncResult<bool> {
        let output = self.run(&["who"]).await?;
        Ok(parse_who_output(&output.stdout))
    }

    /// Log in with a stored BDUSS token.
    pub async fn login_with_bduss(&self, bduss: &str) -> SyncResult<()> {
        let arg = format!("-bduss={}", bduss);
        let output = self.run(&["login", &arg]).await?;
        if parse_who_output(&output.stdout) || output.stdout.contains("登录成功") {
            Ok(())
        } else {
            Err(SyncError::NotLoggedIn)
        }
    }
}

/// Whether a failure means the stored login is no longer valid.
pub fn is_auth_expired(err: &SyncError) -> bool {
    match err {
        SyncError::NotLoggedIn => true,
        SyncError::CliFailed(message) => {
            message.contains("请先登录")
                || message.contains("登录失效")
                || message.contains("user not login")
        }
        _ => false,
    }
}

/// Whether enough time has passed since the last relogin attempt.
pub fn should_attempt_relogin(last_attempt: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match last_attempt {
        None => true,
        Some(last) => {
            let elapsed = now.signed_duration_since(last);
            elapsed.num_seconds() >= RELOGIN_THROTTLE.as_secs() as i64
        }
    }
}

/// Join a remote directory and file name with exactly one slash.
pub fn join_remote_path(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name.trim_start_matches('/'))
}

/// Parse one redrawn progress line, e.g. `↑ 12.50MB/100.00MB 3.2MB/s`.
/// Capped at 99 so only verified completion reports 100.
fn parse_progress_line(line: &str) -> Option<f64> {
    let cleaned = strip_ansi(line);
    let after = cleaned.split_once('↑')?.1.trim_start();
    let size_part = after.split_whitespace().find(|v| v.contains('/'))?;
    let (uploaded, total) = size_part.split_once('/')?;
    let uploaded = parse_size(uploaded)?;
    let total = parse_size(total)?;
    if total == 0 {
        return None;
    }
    Some(((uploaded as f64 / total as f64) * 100.0).min(99.0))
}

fn strip_ansi(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\u{1b}' {
            if matches!(chars.peek(), Some('[')) {
                chars.next();
                for value in chars.by_ref() {
                    if value.is_ascii_alphabetic() {
                        break;
                    }
                }
            }
            continue;
        }
        output.push(ch);
    }
    output
}

fn parse_size(value: &str) -> Option<u64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let split = value.find(|c: char| !c.is_ascii_digit() && c != '.')?;
    let (digits, unit) = value.split_at(split);
    let number: f64 = digits.parse().ok()?;
    let bytes = match unit {
        "B" => number,
        "KB" => number * 1024.0,
        "MB" => number * 1024.0 * 1024.0,
        "GB" => number * 1024.0 * 1024.0 * 1024.0,
        "TB" => number * 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some(bytes.round() as u64)
}

fn parse_meta_size(output: &str) -> Option<u64> {
    for line in output.lines() {
        if line.contains("文件大小") {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if let Some(size) = parts.get(1) {
                if let Ok(value) = size.trim_end_matches(',').parse::<u64>() {
                    return Some(value);
                }
            }
        }
    }
    None
}

fn parse_who_output(output: &str) -> bool {
    if output.contains("请先登录") || output.contains("uid: 0") {
        return false;
    }
    output.contains("uid:")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_progress_line() {
        let progress = parse_progress_line("[1] ↑ 50.00MB/100.00MB 3.20MB/s in 15s").unwrap();
        assert!((progress - 50.0).abs() < 0.1);
    }

    #[test]
    fn test_progress_capped_at_99() {
        let progress = parse_progress_line("↑ 100.00MB/100.00MB 3.20MB/s").unwrap();
        assert!((progress - 99.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_progress_with_ansi_and_cr() {
        let progress = parse_progress_line("\u{1b}[32m↑ 1.00KB/4.00KB\u{1b}[0m").unwrap();
        assert!((progress - 25.0).abs() < 0.1);
    }

    #[test]
    fn test_non_progress_line() {
        assert!(parse_progress_line("uploading /rec/a.flv").is_none());
        assert!(parse_progress_line("↑ garbage").is_none());
    }

    #[test]
    fn test_parse_size_units() {
        assert_eq!(parse_size("512B"), Some(512));
        assert_eq!(parse_size("1.5KB"), Some(1536));
        assert_eq!(parse_size("2MB"), Some(2 * 1024 * 1024));
        assert_eq!(parse_size("nonsense"), None);
    }

    #[test]
    fn test_parse_meta_size() {
        let output = "文件路径: /录播/a.flv\n文件大小 1048576, 创建时间 ...";
        assert_eq!(parse_meta_size(output), Some(1048576));
        assert_eq!(parse_meta_size("no size here"), None);
    }

    #[test]
    fn test_who_output() {
        assert!(parse_who_output("当前帐号 uid: 12345, 用户名: alice,"));
        assert!(!parse_who_output("请先登录"));
        assert!(!parse_who_output("uid: 0"));
    }

    #[test]
    fn test_auth_expiry_detection() {
        assert!(is_auth_expired(&SyncError::NotLoggedIn));
        assert!(is_auth_expired(&SyncError::CliFailed(
            "文件上传失败: 请先登录".to_string()
        )));
        assert!(!is_auth_expired(&SyncError::CliFailed(
            "network unreachable".to_string()
        )));
        assert!(!is_auth_expired(&SyncError::EmptyRemoteFile));
    }

    #[test]
    fn test_relogin_throttle() {
        let now = Utc::now();
        assert!(should_attempt_relogin(None, now));
        assert!(!should_attempt_relogin(
            Some(now - chrono::Duration::seconds(300)),
            now
        ));
        assert!(should_attempt_relogin(
            Some(now - chrono::Duration::seconds(601)),
            now
        ));
    }

    #[test]
    fn test_join_remote_path() {
        assert_eq!(join_remote_path("/录播/", "a.flv"), "/录播/a.flv");
        assert_eq!(join_remote_path("/录播", "a.flv"), "/录播/a.flv");
    }
}
