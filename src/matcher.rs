use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use crate::config::{self, AppConfig, GlobalSettings, PolicyConfig};
use crate::format::{InputLayout, OutputFormat};
use crate::ipset::Ipv4Set;
use crate::output::Rotation;
use crate::rules::RuleHandle;
use crate::trie::{DomainTrie, Ipv6Trie};
use crate::upload::UploadManager;

/// Which address families an IP rule set can answer for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IpFilterMode {
    #[default]
    None,
    V4,
    V6,
    V4orV6,
}

impl IpFilterMode {
    pub fn from_counts(v4: usize, v6: usize) -> Self {
        match (v4 > 0, v6 > 0) {
            (true, true) => IpFilterMode::V4orV6,
            (true, false) => IpFilterMode::V4,
            (false, true) => IpFilterMode::V6,
            (false, false) => IpFilterMode::None,
        }
    }
}

/// Criteria combination a policy requires. Codes follow the operator-facing
/// configuration: 1 domain, 10 request ip, 20 resolve ip, sums for the combinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterTag {
    DomainOnly,
    RequestIp,
    ResolveIp,
    DomainAndRequestIp,
    DomainAndResolveIp,
    /// Nothing configured or an unknown code; never matches.
    Unknown,
}

impl FilterTag {
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => FilterTag::DomainOnly,
            10 => FilterTag::RequestIp,
            20 => FilterTag::ResolveIp,
            11 => FilterTag::DomainAndRequestIp,
            21 => FilterTag::DomainAndResolveIp,
            _ => FilterTag::Unknown,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            FilterTag::DomainOnly => 1,
            FilterTag::RequestIp => 10,
            FilterTag::ResolveIp => 20,
            FilterTag::DomainAndRequestIp => 11,
            FilterTag::DomainAndResolveIp => 21,
            FilterTag::Unknown => 0,
        }
    }

    /// Derives the tag from which rule lists a policy carries.
    pub fn derive(has_domain_rules: bool, has_ip_rules: bool, resolve_ip: bool) -> Self {
        match (has_domain_rules, has_ip_rules, resolve_ip) {
            (true, false, _) => FilterTag::DomainOnly,
            (false, true, false) => FilterTag::RequestIp,
            (false, true, true) => FilterTag::ResolveIp,
            (true, true, false) => FilterTag::DomainAndRequestIp,
            (true, true, true) => FilterTag::DomainAndResolveIp,
            (false, false, _) => FilterTag::Unknown,
        }
    }
}

/// The three rule structures of one policy, built together and swapped together.
#[derive(Debug, Default, Clone)]
pub struct RuleSet {
    pub v4: Ipv4Set,
    pub v6: Ipv6Trie,
    pub domains: DomainTrie,
    pub ip_mode: IpFilterMode,
}

impl RuleSet {
    /// Membership of one address, dispatched on its syntax and gated by the filter mode.
    #[inline]
    pub fn ip_member(&self, ip: &str) -> bool {
        let ip = ip.trim();
        let is_v6 = ip.contains(':');
        match self.ip_mode {
            IpFilterMode::None => false,
            IpFilterMode::V4 => !is_v6 && self.v4.contains_str(ip),
            IpFilterMode::V6 => is_v6 && self.v6.search(ip),
            IpFilterMode::V4orV6 => {
                if is_v6 {
                    self.v6.search(ip)
                } else {
                    self.v4.contains_str(ip)
                }
            }
        }
    }

    /// `resolved` is a ';'-separated list; any member address is a match.
    #[inline]
    pub fn any_resolved_member(&self, resolved: &str) -> bool {
        resolved
            .split(';')
            .filter(|s| !s.trim().is_empty())
            .any(|ip| self.ip_member(ip))
    }

    #[inline]
    pub fn matches(&self, request_ip: &str, domain: &str, resolved: &str, tag: FilterTag) -> bool {
        match tag {
            FilterTag::DomainOnly => self.domains.search(domain),
            FilterTag::RequestIp => self.ip_member(request_ip),
            FilterTag::ResolveIp => self.any_resolved_member(resolved),
            FilterTag::DomainAndRequestIp => {
                self.domains.search(domain) && self.ip_member(request_ip)
            }
            FilterTag::DomainAndResolveIp => {
                self.domains.search(domain) && self.any_resolved_member(resolved)
            }
            FilterTag::Unknown => false,
        }
    }
}

/// One compiled, enabled policy.
pub struct RuntimePolicy {
    pub name: Arc<str>,
    pub tag: FilterTag,
    pub rules: Arc<RuleHandle>,
    pub output_dir: PathBuf,
    pub format: OutputFormat,
    pub file_name_template: String,
    pub compress: bool,
    pub rotation: Rotation,
    pub uploader: Option<Arc<UploadManager>>,
}

impl std::fmt::Debug for RuntimePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimePolicy")
            .field("name", &self.name)
            .field("tag", &self.tag)
            .field("output_dir", &self.output_dir)
            .field("format", &self.format)
            .field("compress", &self.compress)
            .field("rotation", &self.rotation)
            .field("upload", &self.uploader.is_some())
            .finish()
    }
}

#[derive(Debug)]
pub struct RuntimeConfig {
    pub settings: GlobalSettings,
    pub layout: InputLayout,
    pub min_fields: usize,
    pub policies: Vec<Arc<RuntimePolicy>>,
}

impl RuntimeConfig {
    /// Compiles the configuration: loads rule files, resolves formats and connects
    /// upload targets. Blocking; call from a blocking context.
    pub fn from_config(cfg: AppConfig) -> anyhow::Result<Self> {
        let layout = InputLayout::parse(&cfg.settings.input_format)?;
        let mut policies = Vec::new();
        let mut widest = layout.request_ip.max(layout.domain);
        for p in cfg.policies {
            if !p.enable {
                info!(target = "config", policy = %p.name, "policy disabled, skipped");
                continue;
            }
            let policy = RuntimePolicy::from_config(p, &layout)?;
            if let Some(max) = policy.format.max_position(&layout) {
                widest = widest.max(max);
            }
            if matches!(
                policy.tag,
                FilterTag::ResolveIp | FilterTag::DomainAndResolveIp
            ) {
                widest = widest.max(layout.result.unwrap_or(layout.answer));
            }
            policies.push(Arc::new(policy));
        }
        let min_fields = cfg
            .settings
            .min_fields
            .unwrap_or_else(|| layout.field_count().max(widest + 1));
        Ok(Self {
            settings: cfg.settings,
            layout,
            min_fields,
            policies,
        })
    }

    pub fn stable_after(&self) -> Duration {
        Duration::from_millis(self.settings.stable_after_ms)
    }

    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.settings.reload_interval_secs.max(1))
    }

    /// Policies whose rule lists include `path`.
    pub fn policies_using(&self, path: &Path) -> Vec<Arc<RuntimePolicy>> {
        self.policies
            .iter()
            .filter(|p| p.rules.sources().references(path))
            .cloned()
            .collect()
    }
}

impl RuntimePolicy {
    fn from_config(p: PolicyConfig, layout: &InputLayout) -> anyhow::Result<Self> {
        let derived = FilterTag::derive(
            !p.filter_domain_rules.is_empty(),
            !p.filter_ip_rules.is_empty(),
            p.match_resolve_ip,
        );
        let tag = match p.filter_tag {
            Some(code) => {
                let explicit = FilterTag::from_code(code);
                if explicit == FilterTag::Unknown {
                    warn!(target = "config", policy = %p.name, code, "unknown filter_tag, policy will match nothing");
                }
                explicit
            }
            None => derived,
        };
        if tag == FilterTag::Unknown && p.filter_tag.is_none() {
            warn!(target = "config", policy = %p.name, "policy has no rule files, it will match nothing");
        }
        if matches!(tag, FilterTag::ResolveIp | FilterTag::DomainAndResolveIp)
            && layout.result.is_none()
        {
            anyhow::bail!(
                "policy {}: resolve-ip matching needs the result code (15) in input_format",
                p.name
            );
        }

        let format = OutputFormat::compile(&p.output_format, layout)
            .with_context(|| format!("policy {}: output_format", p.name))?;
        let max_size = config::parse_size(&p.file_max_size)
            .with_context(|| format!("policy {}: file_max_size", p.name))?;
        let rotation = Rotation {
            max_size,
            max_age: (p.file_max_age_secs > 0).then(|| Duration::from_secs(p.file_max_age_secs)),
        };

        let rules = Arc::new(RuleHandle::load(
            &p.name,
            p.filter_ip_rules.clone(),
            p.filter_domain_rules.clone(),
        ));

        let uploader = if p.upload.enabled {
            let manager = UploadManager::connect(&p.upload)
                .with_context(|| format!("policy {}: upload targets", p.name))?;
            Some(Arc::new(manager))
        } else {
            None
        };

        info!(
            target = "config",
            policy = %p.name,
            tag = tag.code(),
            output_dir = %p.output_dir.display(),
            compress = p.compress,
            max_size,
            "policy compiled"
        );

        Ok(Self {
            name: Arc::from(p.name.as_str()),
            tag,
            rules,
            output_dir: p.output_dir,
            format,
            file_name_template: p.output_file_name,
            compress: p.compress,
            rotation,
            uploader,
        })
    }
}
