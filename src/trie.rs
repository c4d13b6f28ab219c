use std::net::Ipv6Addr;

use rustc_hash::FxHashMap;

/// Label trie with suffix semantics: a terminal node matches itself and every
/// key that extends it. Keys are fed in as already-ordered label sequences.
#[derive(Debug, Default, Clone)]
pub struct LabelTrie {
    root: TrieNode,
    len: usize,
}

#[derive(Debug, Default, Clone)]
struct TrieNode {
    children: FxHashMap<Box<str>, TrieNode>,
    terminal: bool,
}

impl LabelTrie {
    pub fn insert_labels<'a>(&mut self, labels: impl IntoIterator<Item = &'a str>) {
        let mut node = &mut self.root;
        let mut depth = 0usize;
        for label in labels {
            node = node.children.entry(Box::from(label)).or_default();
            depth += 1;
        }
        // 空 key 不登记，避免根节点变成“全匹配”
        if depth > 0 && !node.terminal {
            node.terminal = true;
            self.len += 1;
        }
    }

    pub fn search_labels<'a>(&self, labels: impl IntoIterator<Item = &'a str>) -> bool {
        let mut node = &self.root;
        for label in labels {
            match node.children.get(label) {
                Some(child) => {
                    if child.terminal {
                        return true;
                    }
                    node = child;
                }
                None => return false,
            }
        }
        false
    }

    /// Number of distinct terminal entries.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Domain suffix trie keyed by dot-separated labels, walked from the TLD down.
///
/// Registering `example.com` matches `example.com` and every subdomain of it.
/// A leading `*.` on an entry is accepted and treated the same as the bare suffix.
#[derive(Debug, Default, Clone)]
pub struct DomainTrie {
    inner: LabelTrie,
}

impl DomainTrie {
    pub fn insert(&mut self, domain: &str) {
        let normalized = normalize_domain(domain);
        let normalized = normalized.strip_prefix("*.").unwrap_or(&normalized);
        if normalized.is_empty() {
            return;
        }
        self.inner.insert_labels(normalized.rsplit('.'));
    }

    pub fn search(&self, domain: &str) -> bool {
        if domain.is_empty() {
            return false;
        }
        let trimmed = domain.strip_suffix('.').unwrap_or(domain);
        if trimmed.bytes().any(|b| b.is_ascii_uppercase()) {
            let lowered = trimmed.to_ascii_lowercase();
            self.inner.search_labels(lowered.rsplit('.'))
        } else {
            self.inner.search_labels(trimmed.rsplit('.'))
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

fn normalize_domain(domain: &str) -> String {
    let trimmed = domain.trim();
    trimmed
        .strip_suffix('.')
        .unwrap_or(trimmed)
        .to_ascii_lowercase()
}

/// IPv6 trie keyed by colon-separated hextets, walked from the leftmost hextet.
///
/// Full addresses are canonicalized to eight hextets before insertion and lookup, so
/// `2001:db8::1` and `2001:0db8:0:0:0:0:0:1` are the same key. Partial entries such as
/// `2409:8720` or `2409:8720::/32` register a prefix that matches every address under it.
#[derive(Debug, Default, Clone)]
pub struct Ipv6Trie {
    inner: LabelTrie,
}

impl Ipv6Trie {
    /// Inserts one rule line. Returns `false` when the line is not a usable IPv6 rule.
    pub fn insert(&mut self, entry: &str) -> bool {
        match ipv6_rule_segments(entry) {
            Some(segments) if !segments.is_empty() => {
                self.inner.insert_labels(segments.iter().map(String::as_str));
                true
            }
            _ => false,
        }
    }

    pub fn search(&self, addr: &str) -> bool {
        match addr.trim().parse::<Ipv6Addr>() {
            Ok(ip) => {
                let segments = canonical_hextets(&ip);
                self.inner.search_labels(segments.iter().map(String::as_str))
            }
            Err(_) => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

fn canonical_hextets(ip: &Ipv6Addr) -> Vec<String> {
    ip.segments().iter().map(|s| format!("{s:x}")).collect()
}

fn ipv6_rule_segments(entry: &str) -> Option<Vec<String>> {
    let entry = entry.trim();
    if let Some((addr, prefix)) = entry.split_once('/') {
        let ip: Ipv6Addr = addr.trim().parse().ok()?;
        let prefix: usize = prefix.trim().parse().ok()?;
        if prefix == 0 || prefix > 128 || prefix % 16 != 0 {
            return None;
        }
        let mut segments = canonical_hextets(&ip);
        segments.truncate(prefix / 16);
        return Some(segments);
    }
    if let Ok(ip) = entry.parse::<Ipv6Addr>() {
        return Some(canonical_hextets(&ip));
    }
    // 部分前缀，例如 2409:8720 或 2409:8720:
    let trimmed = entry.trim_end_matches(':');
    if trimmed.is_empty() || trimmed.contains("::") {
        return None;
    }
    let mut segments = Vec::new();
    for part in trimmed.split(':') {
        let value = u16::from_str_radix(part, 16).ok()?;
        segments.push(format!("{value:x}"));
    }
    if segments.len() >= 8 {
        return None;
    }
    Some(segments)
}
