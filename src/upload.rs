use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::{TargetConfig, UploadConfig};

const COPY_CHUNK: usize = 64 * 1024;
const LOCAL_HOST: &str = "local";

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("no upload target could be connected")]
    NoTargets,
    #[error("connect {target}: {reason}")]
    Connect { target: String, reason: String },
    #[error("upload {file} to {target} failed after {attempts} attempts: {source}")]
    Exhausted {
        target: String,
        file: String,
        attempts: u32,
        #[source]
        source: io::Error,
    },
    #[error("upload task aborted: {0}")]
    Join(String),
}

/// Remote side of a transfer. Writes go to a temp name first, then `rename`
/// publishes them.
pub trait Transport: Send + Sync {
    fn label(&self) -> &str;
    fn remote_dir(&self) -> &str;
    fn open_write(&self, remote: &str) -> io::Result<Box<dyn Write + '_>>;
    fn rename(&self, from: &str, to: &str) -> io::Result<()>;
}

/// SFTP target over an `ssh2` session with password auth.
pub struct SftpTransport {
    label: String,
    dir: String,
    // 每次操作单独开 sftp 通道，session 串行使用
    session: Mutex<ssh2::Session>,
}

impl SftpTransport {
    pub fn connect(target: &TargetConfig, connect_timeout: Duration, io_timeout: Duration) -> Result<Self, UploadError> {
        let label = target.label();
        let fail = |reason: String| UploadError::Connect {
            target: label.clone(),
            reason,
        };
        let addr = (target.host.as_str(), target.port)
            .to_socket_addrs()
            .map_err(|e| fail(format!("resolve: {e}")))?
            .next()
            .ok_or_else(|| fail("resolve: no address".to_string()))?;
        let tcp = TcpStream::connect_timeout(&addr, connect_timeout)
            .map_err(|e| fail(format!("tcp: {e}")))?;

        let mut session = ssh2::Session::new().map_err(|e| fail(format!("session: {e}")))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(io_timeout.as_millis().min(u32::MAX as u128) as u32);
        session
            .handshake()
            .map_err(|e| fail(format!("handshake: {e}")))?;
        session
            .userauth_password(&target.user, &target.password)
            .map_err(|e| fail(format!("auth: {e}")))?;
        // 提前验证 sftp 子系统可用
        session.sftp().map_err(|e| fail(format!("sftp: {e}")))?;

        Ok(Self {
            label: label.clone(),
            dir: target.path.clone(),
            session: Mutex::new(session),
        })
    }
}

impl Transport for SftpTransport {
    fn label(&self) -> &str {
        &self.label
    }

    fn remote_dir(&self) -> &str {
        &self.dir
    }

    fn open_write(&self, remote: &str) -> io::Result<Box<dyn Write + '_>> {
        let sftp = self.session.lock().sftp().map_err(io::Error::from)?;
        let file = sftp.create(Path::new(remote)).map_err(io::Error::from)?;
        Ok(Box::new(file))
    }

    fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        let flags = ssh2::RenameFlags::OVERWRITE | ssh2::RenameFlags::ATOMIC | ssh2::RenameFlags::NATIVE;
        let sftp = self.session.lock().sftp().map_err(io::Error::from)?;
        sftp.rename(Path::new(from), Path::new(to), Some(flags))
            .map_err(io::Error::from)
    }
}

/// Target that is a locally mounted directory.
pub struct LocalTransport {
    label: String,
    dir: String,
}

impl LocalTransport {
    pub fn new(dir: impl Into<String>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            label: format!("{LOCAL_HOST}:{dir}"),
            dir,
        })
    }
}

impl Transport for LocalTransport {
    fn label(&self) -> &str {
        &self.label
    }

    fn remote_dir(&self) -> &str {
        &self.dir
    }

    fn open_write(&self, remote: &str) -> io::Result<Box<dyn Write + '_>> {
        Ok(Box::new(File::create(remote)?))
    }

    fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        fs::rename(from, to)
    }
}

/// Byte token bucket; capacity and refill rate are the same number of bytes per second.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    /// `bytes_per_sec == 0` disables limiting.
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            rate: bytes_per_sec as f64,
            tokens: bytes_per_sec as f64,
            last: Instant::now(),
        }
    }

    pub fn unlimited(&self) -> bool {
        self.rate <= 0.0
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.rate).min(self.rate);
    }

    /// Blocks until `n` bytes may be sent. Fails with `TimedOut` instead of sleeping
    /// past `deadline`.
    pub fn acquire(&mut self, n: usize, deadline: Instant) -> io::Result<()> {
        if self.unlimited() {
            return Ok(());
        }
        let need = (n as f64).min(self.rate);
        loop {
            self.refill();
            if self.tokens >= need {
                self.tokens -= need;
                return Ok(());
            }
            let wait = Duration::from_secs_f64((need - self.tokens) / self.rate);
            if Instant::now() + wait > deadline {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "rate limited past deadline"));
            }
            thread::sleep(wait);
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub timeout: Duration,
    pub rate_limit_bytes: u64,
}

impl RetryPolicy {
    pub fn from_config(cfg: &UploadConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            retry_delay: Duration::from_millis(cfg.retry_delay_ms),
            timeout: Duration::from_secs(cfg.timeout_secs.max(1)),
            rate_limit_bytes: cfg.rate_limit_kbps.saturating_mul(1024),
        }
    }
}

fn remote_join(dir: &str, name: &str) -> String {
    let dir = dir.trim_end_matches('/');
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

/// One attempt: stream to `<final>.tmp`, then rename over `<final>`.
fn upload_once(transport: &dyn Transport, local: &Path, temp: &str, target: &str, policy: &RetryPolicy) -> io::Result<()> {
    let deadline = Instant::now() + policy.timeout;
    let mut bucket = TokenBucket::new(policy.rate_limit_bytes);
    let mut src = File::open(local)?;
    {
        let mut dst = transport.open_write(temp)?;
        let mut buf = vec![0u8; COPY_CHUNK];
        loop {
            let n = src.read(&mut buf)?;
            if n == 0 {
                break;
            }
            let mut sent = 0;
            while sent < n {
                let chunk = if bucket.unlimited() {
                    n - sent
                } else {
                    (n - sent).min(policy.rate_limit_bytes.max(1) as usize)
                };
                bucket.acquire(chunk, deadline)?;
                dst.write_all(&buf[sent..sent + chunk])?;
                sent += chunk;
            }
            if Instant::now() > deadline {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "transfer timed out"));
            }
        }
        dst.flush()?;
    }
    transport.rename(temp, target)
}

/// Uploads `local` to one target, retrying with a fixed delay.
pub fn upload_with_retry(transport: &dyn Transport, local: &Path, policy: &RetryPolicy) -> Result<(), UploadError> {
    let name = local
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| UploadError::Exhausted {
            target: transport.label().to_string(),
            file: local.display().to_string(),
            attempts: 0,
            source: io::Error::new(io::ErrorKind::InvalidInput, "file name is not valid utf-8"),
        })?;
    let target = remote_join(transport.remote_dir(), name);
    let temp = format!("{target}.tmp");
    let attempts = policy.max_retries + 1;

    let mut last_err = None;
    for attempt in 1..=attempts {
        let started = Instant::now();
        match upload_once(transport, local, &temp, &target, policy) {
            Ok(()) => {
                info!(
                    target = "upload",
                    remote = transport.label(),
                    file = %local.display(),
                    attempt,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "upload done"
                );
                return Ok(());
            }
            Err(err) => {
                warn!(target = "upload", remote = transport.label(), file = %local.display(), attempt, attempts, error = %err, "upload attempt failed");
                last_err = Some(err);
                if attempt < attempts {
                    thread::sleep(policy.retry_delay);
                }
            }
        }
    }
    Err(UploadError::Exhausted {
        target: transport.label().to_string(),
        file: local.display().to_string(),
        attempts,
        source: last_err.unwrap_or_else(|| io::Error::other("no attempt made")),
    })
}

/// Fan-out uploader for one policy.
pub struct UploadManager {
    targets: Vec<Arc<dyn Transport>>,
    retry: RetryPolicy,
}

impl UploadManager {
    /// Connects every configured target. Unreachable targets are logged and left
    /// out; it is an error only when none connect. Blocking.
    pub fn connect(cfg: &UploadConfig) -> Result<Self, UploadError> {
        let connect_timeout = Duration::from_secs(cfg.connect_timeout_secs.max(1));
        let io_timeout = Duration::from_secs(cfg.timeout_secs.max(1));
        let mut targets: Vec<Arc<dyn Transport>> = Vec::new();
        for target in &cfg.targets {
            let connected: Result<Arc<dyn Transport>, UploadError> = if target.host == LOCAL_HOST {
                LocalTransport::new(target.path.clone())
                    .map(|t| Arc::new(t) as Arc<dyn Transport>)
                    .map_err(|e| UploadError::Connect {
                        target: target.label(),
                        reason: e.to_string(),
                    })
            } else {
                SftpTransport::connect(target, connect_timeout, io_timeout)
                    .map(|t| Arc::new(t) as Arc<dyn Transport>)
            };
            match connected {
                Ok(t) => {
                    info!(target = "upload", remote = t.label(), "upload target connected");
                    targets.push(t);
                }
                Err(err) => {
                    error!(target = "upload", error = %err, "upload target excluded");
                }
            }
        }
        Self::with_transports(targets, RetryPolicy::from_config(cfg))
    }

    pub fn with_transports(targets: Vec<Arc<dyn Transport>>, retry: RetryPolicy) -> Result<Self, UploadError> {
        if targets.is_empty() {
            return Err(UploadError::NoTargets);
        }
        Ok(Self { targets, retry })
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    /// Sends `local` to every target concurrently. Returns the first failure seen;
    /// the other transfers still run to completion.
    pub async fn upload_to_all(&self, local: &Path) -> Result<(), UploadError> {
        let mut set = JoinSet::new();
        for transport in &self.targets {
            let transport = transport.clone();
            let local: PathBuf = local.to_path_buf();
            let retry = self.retry.clone();
            set.spawn_blocking(move || upload_with_retry(transport.as_ref(), &local, &retry));
        }

        let mut first_err = None;
        while let Some(joined) = set.join_next().await {
            let result = joined.unwrap_or_else(|e| Err(UploadError::Join(e.to_string())));
            if let Err(err) = result {
                error!(target = "upload", file = %local.display(), error = %err, "upload failed");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Uploads, then deletes the local copy once every target confirmed.
    pub async fn upload_and_remove(&self, local: &Path) -> Result<(), UploadError> {
        self.upload_to_all(local).await?;
        if let Err(err) = fs::remove_file(local) {
            warn!(target = "upload", file = %local.display(), error = %err, "remove uploaded file failed");
        }
        Ok(())
    }
}
