use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub version: Option<String>,
    pub settings: GlobalSettings,
    /// 分流策略，按配置顺序评估。
    #[serde(default)]
    pub policies: Vec<PolicyConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GlobalSettings {
    /// 分析线程数，0 表示使用 CPU 核心数。
    #[serde(default)]
    pub analyze_threads: usize,
    /// 待分析日志所在目录。
    pub input_dir: PathBuf,
    /// 文件名过滤正则，缺省匹配 .log / .log.gz / .txt / .gz。
    #[serde(default = "default_input_pattern")]
    pub input_pattern: String,
    /// 输入字段编码，逗号分隔，位置即列号。
    #[serde(default = "default_input_format")]
    pub input_format: String,
    /// 最少字段数，缺省为 input_format 的列数。
    #[serde(default)]
    pub min_fields: Option<usize>,
    /// 任意字段等于该值时丢弃整行。
    #[serde(default)]
    pub invalid_marker: Option<String>,
    /// 处理完成的源文件移动到此目录；为空则直接删除。
    #[serde(default)]
    pub backup_dir: Option<PathBuf>,
    /// 在线模式持续监听目录；离线模式处理完存量文件后退出。
    #[serde(default = "default_true")]
    pub online_mode: bool,
    /// 输出文件名中的 ip 占位符，缺省自动探测。
    #[serde(default)]
    pub host_ip: Option<String>,
    /// 规则文件检查周期（秒）。
    #[serde(default = "default_reload_interval_secs")]
    pub reload_interval_secs: u64,
    /// 文件最后修改时间超过该毫秒数才开始分析。
    #[serde(default = "default_stable_after_ms")]
    pub stable_after_ms: u64,
    /// 启动时发布遗留的 .tmp 输出文件。
    #[serde(default = "default_true")]
    pub recover_temp_files: bool,
    /// 状态日志周期（秒），0 关闭。
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,
    #[serde(default)]
    pub domain_counter: DomainCounterConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DomainCounterConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_counter_output")]
    pub output: PathBuf,
    #[serde(default = "default_counter_flush_secs")]
    pub flush_interval_secs: u64,
    #[serde(default = "default_counter_queue")]
    pub queue_capacity: usize,
}

impl Default for DomainCounterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            output: default_counter_output(),
            flush_interval_secs: default_counter_flush_secs(),
            queue_capacity: default_counter_queue(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enable: bool,
    /// IP 清单文件（支持单 IP、CIDR、ip1-ip2、IPv6）。
    #[serde(default)]
    pub filter_ip_rules: Vec<PathBuf>,
    /// 域名清单文件（后缀匹配）。
    #[serde(default)]
    pub filter_domain_rules: Vec<PathBuf>,
    /// IP 清单匹配解析结果而不是请求 IP。
    #[serde(default)]
    pub match_resolve_ip: bool,
    /// 显式指定过滤标记（1/10/20/11/21），缺省按清单推导。
    #[serde(default)]
    pub filter_tag: Option<u8>,
    pub output_dir: PathBuf,
    /// full / legacy / 字段编码列表。
    #[serde(default = "default_output_format")]
    pub output_format: String,
    /// 输出文件名模板，ip 与 time 为占位符。
    #[serde(default)]
    pub output_file_name: String,
    #[serde(default = "default_true")]
    pub compress: bool,
    /// 单文件最大尺寸，如 200M / 1G / 512k。
    #[serde(default)]
    pub file_max_size: String,
    /// 单文件最长写入时间（秒），0 表示不限。
    #[serde(default)]
    pub file_max_age_secs: u64,
    #[serde(default)]
    pub upload: UploadConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// 限速 KB/s，0 表示不限速。
    #[serde(default)]
    pub rate_limit_kbps: u64,
    /// 单次传输超时（秒）。
    #[serde(default = "default_upload_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            targets: Vec::new(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            rate_limit_kbps: 0,
            timeout_secs: default_upload_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    /// 远端主机；"local" 表示写入本地挂载目录。
    pub host: String,
    #[serde(default = "default_sftp_port")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// 远端目录。
    pub path: String,
}

impl TargetConfig {
    pub fn label(&self) -> String {
        format!("{}:{}{}", self.host, self.port, self.path)
    }
}

pub const DEFAULT_FILE_MAX_SIZE: u64 = 200 << 20;

/// Parses `<n>[k|m|g]` into bytes. An empty string is the 200 MiB default; a bare
/// number is taken as bytes.
pub fn parse_size(raw: &str) -> Result<u64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(DEFAULT_FILE_MAX_SIZE);
    }
    let (digits, shift) = match raw.chars().last().map(|c| c.to_ascii_lowercase()) {
        Some('k') => (&raw[..raw.len() - 1], 10),
        Some('m') => (&raw[..raw.len() - 1], 20),
        Some('g') => (&raw[..raw.len() - 1], 30),
        _ => (raw, 0),
    };
    let value: u64 = digits
        .trim()
        .parse()
        .with_context(|| format!("invalid size: {raw}"))?;
    value
        .checked_mul(1u64 << shift)
        .with_context(|| format!("size overflows: {raw}"))
}

pub fn load_config(path: &Path) -> Result<AppConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let cfg: AppConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;

    if let Some(version) = cfg.version.as_ref() {
        info!(target = "config", version = %version, "config loaded");
    }

    validate(&cfg)?;
    Ok(cfg)
}

/// 轻量校验：目录、规则文件是否存在，尺寸格式，策略名唯一。
pub fn validate(cfg: &AppConfig) -> Result<()> {
    if !cfg.settings.input_dir.is_dir() {
        anyhow::bail!(
            "input_dir does not exist: {}",
            cfg.settings.input_dir.display()
        );
    }
    regex::Regex::new(&cfg.settings.input_pattern)
        .with_context(|| format!("invalid input_pattern: {}", cfg.settings.input_pattern))?;

    let mut names = HashSet::new();
    for policy in &cfg.policies {
        if !names.insert(policy.name.as_str()) {
            anyhow::bail!("duplicate policy name: {}", policy.name);
        }
        if !policy.enable {
            continue;
        }
        if policy.match_resolve_ip && policy.filter_ip_rules.is_empty() {
            anyhow::bail!(
                "policy {}: match_resolve_ip requires filter_ip_rules",
                policy.name
            );
        }
        for file in policy
            .filter_ip_rules
            .iter()
            .chain(policy.filter_domain_rules.iter())
        {
            if !file.exists() {
                anyhow::bail!("policy {}: rule file not found: {}", policy.name, file.display());
            }
        }
        parse_size(&policy.file_max_size)
            .with_context(|| format!("policy {}: file_max_size", policy.name))?;
        if policy.upload.enabled && policy.upload.targets.is_empty() {
            anyhow::bail!("policy {}: upload enabled without targets", policy.name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal(dir: &Path) -> serde_json::Value {
        json!({
            "settings": { "input_dir": dir },
            "policies": [
                { "name": "p1", "output_dir": dir.join("out") }
            ]
        })
    }

    #[test]
    fn defaults_are_filled_in() {
        let dir = tempfile::tempdir().unwrap();
        let cfg: AppConfig = serde_json::from_value(minimal(dir.path())).expect("parse config");
        assert_eq!(cfg.settings.analyze_threads, 0);
        assert!(cfg.settings.online_mode);
        assert_eq!(cfg.settings.reload_interval_secs, 60);
        assert!(!cfg.settings.domain_counter.enabled);
        let p = &cfg.policies[0];
        assert!(p.enable);
        assert!(p.compress);
        assert_eq!(p.output_format, "full");
        assert!(!p.upload.enabled);
        assert_eq!(p.upload.max_retries, 3);
        validate(&cfg).expect("valid");
    }

    #[test]
    fn size_strings() {
        assert_eq!(parse_size("").unwrap(), 200 << 20);
        assert_eq!(parse_size("10k").unwrap(), 10 << 10);
        assert_eq!(parse_size("3M").unwrap(), 3 << 20);
        assert_eq!(parse_size("2g").unwrap(), 2u64 << 30);
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert!(parse_size("abcM").is_err());
    }

    #[test]
    fn missing_rule_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut raw = minimal(dir.path());
        raw["policies"][0]["filter_domain_rules"] = json!([dir.path().join("nope.list")]);
        let cfg: AppConfig = serde_json::from_value(raw).unwrap();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn disabled_policy_skips_file_checks() {
        let dir = tempfile::tempdir().unwrap();
        let mut raw = minimal(dir.path());
        raw["policies"][0]["enable"] = json!(false);
        raw["policies"][0]["filter_domain_rules"] = json!([dir.path().join("nope.list")]);
        let cfg: AppConfig = serde_json::from_value(raw).unwrap();
        assert!(validate(&cfg).is_ok());
    }

    #[test]
    fn resolve_ip_requires_ip_rules() {
        let dir = tempfile::tempdir().unwrap();
        let mut raw = minimal(dir.path());
        raw["policies"][0]["match_resolve_ip"] = json!(true);
        let cfg: AppConfig = serde_json::from_value(raw).unwrap();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn duplicate_policy_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let raw = json!({
            "settings": { "input_dir": dir.path() },
            "policies": [
                { "name": "dup", "output_dir": dir.path() },
                { "name": "dup", "output_dir": dir.path() }
            ]
        });
        let cfg: AppConfig = serde_json::from_value(raw).unwrap();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn missing_input_dir_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let raw = minimal(&dir.path().join("absent"));
        let cfg: AppConfig = serde_json::from_value(raw).unwrap();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn load_config_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kixlog.json");
        fs::write(&path, minimal(dir.path()).to_string()).unwrap();
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.policies.len(), 1);
        assert!(load_config(&dir.path().join("missing.json")).is_err());
    }
}

fn default_true() -> bool {
    true
}

fn default_input_pattern() -> String {
    r"\.(log|txt)(\.gz)?$|\.gz$".to_string()
}

fn default_input_format() -> String {
    "0,1,2,3,4,5,6,7,8,9,14,15".to_string()
}

fn default_reload_interval_secs() -> u64 {
    60
}

fn default_stable_after_ms() -> u64 {
    1000
}

fn default_status_interval_secs() -> u64 {
    60
}

fn default_counter_output() -> PathBuf {
    PathBuf::from("domain_counts.txt")
}

fn default_counter_flush_secs() -> u64 {
    3600
}

fn default_counter_queue() -> usize {
    10_000
}

fn default_output_format() -> String {
    "full".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    5000
}

fn default_upload_timeout_secs() -> u64 {
    300
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_sftp_port() -> u16 {
    22
}
