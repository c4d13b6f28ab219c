use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::matcher::RuntimePolicy;

const DEFAULT_NAME_TEMPLATE: &str = "250_ip_time";
const TIME_FORMAT: &str = "%Y%m%d%H%M%S";
const TEMP_EXTENSION: &str = "tmp";
/// Output files always carry `.gz`; `compress` only decides the content.
const OUTPUT_EXTENSION: &str = "gz";
/// Name token used when no host address can be determined.
const FALLBACK_HOST_IP: Ipv4Addr = Ipv4Addr::UNSPECIFIED;

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("create output directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("write output file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl OutputError {
    /// 输出目录无法创建时 worker 无法继续。
    pub fn is_fatal(&self) -> bool {
        matches!(self, OutputError::CreateDir { .. })
    }
}

/// Size / age thresholds for one policy's output files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rotation {
    pub max_size: u64,
    /// `None` means files never age out.
    pub max_age: Option<Duration>,
}

impl Rotation {
    #[inline]
    pub fn should_rotate(&self, size: u64, age: Duration) -> bool {
        size >= self.max_size || self.max_age.is_some_and(|max| age >= max)
    }
}

#[derive(Debug, Clone)]
pub struct CurrentFile {
    pub path: PathBuf,
    pub created: Instant,
}

/// Output shard of one (policy, worker) pair. Only its worker ever touches it.
#[derive(Debug)]
pub struct ShardWriter {
    policy: Arc<str>,
    dir: PathBuf,
    template: String,
    compress: bool,
    rotation: Rotation,
    worker_id: usize,
    host_ip: Arc<str>,
    current: Option<CurrentFile>,
}

impl ShardWriter {
    pub fn new(policy: &RuntimePolicy, worker_id: usize, host_ip: Arc<str>) -> Self {
        Self {
            policy: policy.name.clone(),
            dir: policy.output_dir.clone(),
            template: policy.file_name_template.clone(),
            compress: policy.compress,
            rotation: policy.rotation,
            worker_id,
            host_ip,
            current: None,
        }
    }

    #[cfg(test)]
    pub fn current(&self) -> Option<&CurrentFile> {
        self.current.as_ref()
    }

    /// Checks rotation on the open file, then appends `data`.
    ///
    /// Returns the published path when the previous file was rotated out.
    pub fn persist(&mut self, data: &[u8]) -> Result<Option<PathBuf>, OutputError> {
        ensure_dir(&self.dir)?;

        let mut published = None;
        if let Some(cur) = self.current.as_ref() {
            match fs::metadata(&cur.path) {
                Ok(meta) => {
                    if self.rotation.should_rotate(meta.len(), cur.created.elapsed()) {
                        let path = cur.path.clone();
                        self.current = None;
                        match publish(&path) {
                            Ok(done) => {
                                info!(target = "output", policy = %self.policy, worker_id = self.worker_id, from = %path.display(), to = %done.display(), "output rotated");
                                published = Some(done);
                            }
                            Err(err) => {
                                error!(target = "output", policy = %self.policy, file = %path.display(), error = %err, "rotate rename failed");
                            }
                        }
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(target = "output", policy = %self.policy, file = %cur.path.display(), error = %err, "stat output file failed");
                }
            }
        }

        if data.is_empty() {
            return Ok(published);
        }

        if self.current.is_none() {
            let path = self.next_path();
            debug!(target = "output", policy = %self.policy, worker_id = self.worker_id, file = %path.display(), "output file opened");
            self.current = Some(CurrentFile {
                path,
                created: Instant::now(),
            });
        }
        if let Some(cur) = self.current.as_ref() {
            if let Err(source) = append_chunk(&cur.path, data, self.compress) {
                let path = cur.path.clone();
                // 路径已不是普通文件，下一轮换新文件
                if path.exists() && !path.is_file() {
                    self.current = None;
                }
                return Err(OutputError::Write { path, source });
            }
        }
        Ok(published)
    }

    /// Publishes the open file, if any.
    pub fn close(&mut self) -> Option<PathBuf> {
        let cur = self.current.take()?;
        if !cur.path.exists() {
            return None;
        }
        match publish(&cur.path) {
            Ok(done) => Some(done),
            Err(err) => {
                error!(target = "output", policy = %self.policy, file = %cur.path.display(), error = %err, "publish on close failed");
                None
            }
        }
    }

    fn next_path(&self) -> PathBuf {
        let stamp = Local::now().format(TIME_FORMAT).to_string();
        let base = format!(
            "{}_{}",
            generate_base_name(&self.template, &self.host_ip, &stamp),
            self.worker_id
        );
        unique_temp_path(&self.dir, &base, OUTPUT_EXTENSION)
    }
}

/// Expands the `ip` / `time` tokens of a '_'-separated name template.
pub fn generate_base_name(template: &str, host_ip: &str, stamp: &str) -> String {
    let template = if template.trim().is_empty() {
        DEFAULT_NAME_TEMPLATE
    } else {
        template.trim()
    };
    template
        .split('_')
        .map(|part| match part {
            "ip" => host_ip,
            "time" => stamp,
            other => other,
        })
        .collect::<Vec<_>>()
        .join("_")
}

/// `<dir>/<base>.<ext>.tmp`, suffixed `-<n>` while the name clashes with an open or
/// already published file.
pub fn unique_temp_path(dir: &Path, base: &str, ext: &str) -> PathBuf {
    let mut n = 0usize;
    loop {
        let stem = if n == 0 {
            base.to_string()
        } else {
            format!("{base}-{n}")
        };
        let published = dir.join(format!("{stem}.{ext}"));
        let temp = dir.join(format!("{stem}.{ext}.{TEMP_EXTENSION}"));
        if !published.exists() && !temp.exists() {
            return temp;
        }
        n += 1;
    }
}

pub fn ensure_dir(dir: &Path) -> Result<(), OutputError> {
    fs::create_dir_all(dir).map_err(|source| OutputError::CreateDir {
        path: dir.to_path_buf(),
        source,
    })
}

/// Appends one chunk. Compressed files get one complete gzip member per call.
pub fn append_chunk(path: &Path, data: &[u8], compress: bool) -> io::Result<()> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    if compress {
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(data)?;
        encoder.finish()?;
    } else {
        let mut writer = BufWriter::new(file);
        writer.write_all(data)?;
        writer.flush()?;
    }
    Ok(())
}

/// Renames `<name>.tmp` to `<name>`.
pub fn publish(temp: &Path) -> io::Result<PathBuf> {
    if temp.extension().and_then(|e| e.to_str()) != Some(TEMP_EXTENSION) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("not a temp file: {}", temp.display()),
        ));
    }
    let target = temp.with_extension("");
    fs::rename(temp, &target)?;
    Ok(target)
}

/// Publishes every `*.tmp` leftover in `dir`. A missing directory yields nothing.
pub fn recover_temp_files(dir: &Path) -> Vec<PathBuf> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Vec::new(),
        Err(err) => {
            warn!(target = "output", dir = %dir.display(), error = %err, "scan for temp files failed");
            return Vec::new();
        }
    };
    let mut recovered = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(TEMP_EXTENSION) {
            continue;
        }
        match publish(&path) {
            Ok(done) => {
                info!(target = "output", file = %done.display(), "recovered temp file");
                recovered.push(done);
            }
            Err(err) => {
                warn!(target = "output", file = %path.display(), error = %err, "recover temp file failed");
            }
        }
    }
    recovered.sort();
    recovered
}

/// Published (non-temp) files left in `dir`, oldest name first. Uploaded files are
/// removed, so for an uploading policy these are the ones still owed to a target.
pub fn pending_uploads(dir: &Path) -> Vec<PathBuf> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Vec::new(),
        Err(err) => {
            warn!(target = "output", dir = %dir.display(), error = %err, "scan for pending uploads failed");
            return Vec::new();
        }
    };
    let mut pending: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path.extension().and_then(|e| e.to_str()) != Some(TEMP_EXTENSION)
                && !path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with('.'))
        })
        .collect();
    pending.sort();
    pending
}

/// Reads a source log; `.gz` inputs may hold several gzip members.
pub fn read_source(path: &Path) -> io::Result<String> {
    let mut raw = Vec::new();
    if path.extension().and_then(|e| e.to_str()) == Some("gz") {
        MultiGzDecoder::new(File::open(path)?).read_to_end(&mut raw)?;
    } else {
        File::open(path)?.read_to_end(&mut raw)?;
    }
    Ok(match String::from_utf8(raw) {
        Ok(text) => text,
        Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
    })
}

/// Moves a processed source file into `backup_dir`, or deletes it.
pub fn dispose_source(path: &Path, backup_dir: Option<&Path>) -> io::Result<()> {
    let Some(backup) = backup_dir else {
        return fs::remove_file(path);
    };
    fs::create_dir_all(backup)?;
    let name = path.file_name().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("no file name: {}", path.display()))
    })?;
    let target = backup.join(name);
    if fs::rename(path, &target).is_err() {
        // 跨设备时 rename 失败，退化为复制后删除
        fs::copy(path, &target)?;
        fs::remove_file(path)?;
    }
    Ok(())
}

/// Host identity used by the `ip` name token: configured value or the address of
/// the default route, octets zero-padded to three digits.
pub fn resolve_host_ip(configured: Option<&str>) -> String {
    let raw = configured
        .map(str::to_string)
        .or_else(detect_local_ipv4)
        .unwrap_or_else(|| FALLBACK_HOST_IP.to_string());
    format_host_ip(&raw)
}

pub fn format_host_ip(ip: &str) -> String {
    match ip.trim().parse::<Ipv4Addr>() {
        Ok(v4) => v4.octets().iter().map(|o| format!("{o:03}")).collect(),
        Err(_) => ip.chars().filter(|c| c.is_ascii_alphanumeric()).collect(),
    }
}

fn detect_local_ipv4() -> Option<String> {
    // connect 只确定路由，不发送报文
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:53").ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(v4) if !v4.is_unspecified() => Some(v4.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writer(dir: &Path, compress: bool, max_size: u64) -> ShardWriter {
        ShardWriter {
            policy: Arc::from("p"),
            dir: dir.to_path_buf(),
            template: String::new(),
            compress,
            rotation: Rotation {
                max_size,
                max_age: None,
            },
            worker_id: 3,
            host_ip: Arc::from("010000000001"),
            current: None,
        }
    }

    fn files_with_suffix(dir: &Path, suffix: &str) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = fs::read_dir(dir)
            .unwrap()
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.to_string_lossy().ends_with(suffix))
            .collect();
        out.sort();
        out
    }

    #[test]
    fn rotation_threshold_is_inclusive() {
        let r = Rotation {
            max_size: 100,
            max_age: Some(Duration::from_secs(60)),
        };
        assert!(!r.should_rotate(99, Duration::from_secs(59)));
        assert!(r.should_rotate(100, Duration::ZERO));
        assert!(r.should_rotate(0, Duration::from_secs(60)));
        let no_age = Rotation {
            max_size: 100,
            max_age: None,
        };
        assert!(!no_age.should_rotate(1, Duration::from_secs(86_400 * 365)));
    }

    #[test]
    fn name_template_tokens() {
        assert_eq!(
            generate_base_name("", "010000000001", "20240101120000"),
            "250_010000000001_20240101120000"
        );
        assert_eq!(
            generate_base_name("dns_ip_x_time", "1", "2"),
            "dns_1_x_2"
        );
        assert_eq!(generate_base_name("plain", "1", "2"), "plain");
    }

    #[test]
    fn host_ip_formatting() {
        assert_eq!(format_host_ip("10.0.0.1"), "010000000001");
        assert_eq!(format_host_ip("192.168.100.7"), "192168100007");
        assert_eq!(resolve_host_ip(Some("1.2.3.4")), "001002003004");
        assert_eq!(format_host_ip(&FALLBACK_HOST_IP.to_string()), "000000000000");
    }

    #[test]
    fn size_rotation_happens_on_next_pass_at_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = writer(dir.path(), false, 10);

        assert!(w.persist(b"abcd").unwrap().is_none());
        assert!(w.persist(b"efghi").unwrap().is_none());
        // 9 bytes on disk: still below the threshold
        assert!(w.persist(b"j").unwrap().is_none());
        let first = w.current().unwrap().path.clone();
        assert_eq!(fs::metadata(&first).unwrap().len(), 10);

        let published = w.persist(b"k").unwrap().expect("rotated");
        assert_eq!(fs::read_to_string(&published).unwrap(), "abcdefghij");
        assert!(published.to_string_lossy().ends_with("_3.gz"));
        assert!(!first.exists());

        let second = w.current().unwrap().path.clone();
        assert_ne!(second, first);
        assert_eq!(fs::read_to_string(&second).unwrap(), "k");
    }

    #[test]
    fn age_rotation_publishes_without_new_data() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = writer(dir.path(), false, u64::MAX);
        w.rotation.max_age = Some(Duration::ZERO);
        w.persist(b"line\n").unwrap();
        let published = w.persist(b"").unwrap().expect("aged out");
        assert!(published.exists());
        assert!(w.current().is_none());
    }

    #[test]
    fn compressed_chunks_are_gzip_members() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = writer(dir.path(), true, u64::MAX);
        w.persist(b"one\n").unwrap();
        w.persist(b"two\n").unwrap();
        let temp = w.current().unwrap().path.clone();
        assert!(temp.to_string_lossy().ends_with("_3.gz.tmp"));
        let published = publish(&temp).unwrap();
        assert_eq!(read_source(&published).unwrap(), "one\ntwo\n");
    }

    #[test]
    fn raw_output_keeps_gz_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = writer(dir.path(), false, u64::MAX);
        w.persist(b"plain\n").unwrap();
        let temp = w.current().unwrap().path.clone();
        assert!(temp.to_string_lossy().ends_with("_3.gz.tmp"));
        assert_eq!(fs::read_to_string(&temp).unwrap(), "plain\n");
    }

    #[test]
    fn unwritable_shard_path_is_replaced_on_next_pass() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = writer(dir.path(), false, u64::MAX);
        w.persist(b"one\n").unwrap();
        let first = w.current().unwrap().path.clone();
        fs::remove_file(&first).unwrap();
        fs::create_dir(&first).unwrap();

        let err = w.persist(b"two\n").unwrap_err();
        assert!(!err.is_fatal());
        assert!(w.current().is_none());

        w.persist(b"three\n").unwrap();
        let second = w.current().unwrap().path.clone();
        assert_ne!(second, first);
        assert_eq!(fs::read_to_string(&second).unwrap(), "three\n");
    }

    #[test]
    fn pending_uploads_lists_published_files_only() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b_1.gz"), b"y").unwrap();
        fs::write(dir.path().join("a_0.gz"), b"x").unwrap();
        fs::write(dir.path().join("c_2.gz.tmp"), b"z").unwrap();
        fs::write(dir.path().join(".hidden"), b"h").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        assert_eq!(
            pending_uploads(dir.path()),
            vec![dir.path().join("a_0.gz"), dir.path().join("b_1.gz")]
        );
        assert!(pending_uploads(&dir.path().join("absent")).is_empty());
    }

    #[test]
    fn close_publishes_open_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = writer(dir.path(), false, u64::MAX);
        assert!(w.close().is_none());
        w.persist(b"tail\n").unwrap();
        let done = w.close().expect("published");
        assert_eq!(fs::read_to_string(done).unwrap(), "tail\n");
        assert!(w.current().is_none());
    }

    #[test]
    fn temp_names_avoid_published_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("base_0.gz"), b"").unwrap();
        let p = unique_temp_path(dir.path(), "base_0", "gz");
        assert_eq!(p, dir.path().join("base_0-1.gz.tmp"));
        fs::write(&p, b"").unwrap();
        let q = unique_temp_path(dir.path(), "base_0", "gz");
        assert_eq!(q, dir.path().join("base_0-2.gz.tmp"));
    }

    #[test]
    fn recovery_publishes_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a_0.gz.tmp"), b"x").unwrap();
        fs::write(dir.path().join("b_1.txt.tmp"), b"y").unwrap();
        fs::write(dir.path().join("c_2.gz"), b"z").unwrap();
        let recovered = recover_temp_files(dir.path());
        assert_eq!(
            recovered,
            vec![dir.path().join("a_0.gz"), dir.path().join("b_1.txt")]
        );
        assert!(files_with_suffix(dir.path(), ".tmp").is_empty());
        assert!(recover_temp_files(&dir.path().join("absent")).is_empty());
    }

    #[test]
    fn unusable_output_dir_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"").unwrap();
        let mut w = writer(&blocker.join("sub"), false, 10);
        let err = w.persist(b"x").unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn dispose_moves_or_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("in.log");
        fs::write(&src, b"data").unwrap();
        let backup = dir.path().join("backup");
        dispose_source(&src, Some(&backup)).unwrap();
        assert!(!src.exists());
        assert_eq!(fs::read(backup.join("in.log")).unwrap(), b"data");

        fs::write(&src, b"again").unwrap();
        dispose_source(&src, None).unwrap();
        assert!(!src.exists());
    }

    #[test]
    fn plain_and_gz_sources_are_read() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("a.log");
        fs::write(&plain, "x|y\n").unwrap();
        assert_eq!(read_source(&plain).unwrap(), "x|y\n");

        let gz = dir.path().join("b.log.gz");
        append_chunk(&gz, b"first\n", true).unwrap();
        append_chunk(&gz, b"second\n", true).unwrap();
        assert_eq!(read_source(&gz).unwrap(), "first\nsecond\n");
        assert!(read_source(&dir.path().join("missing.log")).is_err());
    }
}
