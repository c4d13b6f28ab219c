use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use rustc_hash::FxHashSet;

/// One parsed IPv4 rule line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ipv4Rule {
    Single(Ipv4Addr),
    /// Inclusive range, produced by both `a.b.c.d/n` and `ip1-ip2`.
    Range(Ipv4Addr, Ipv4Addr),
}

impl Ipv4Rule {
    /// Number of addresses the rule covers.
    pub fn address_count(&self) -> u64 {
        match self {
            Ipv4Rule::Single(_) => 1,
            Ipv4Rule::Range(start, end) => u64::from(u32::from(*end)) - u64::from(u32::from(*start)) + 1,
        }
    }
}

/// Parses a bare address, a CIDR block or an `ip1-ip2` range.
pub fn parse_ipv4_rule(line: &str) -> anyhow::Result<Ipv4Rule> {
    let line = line.trim();
    if line.contains('/') {
        let net: Ipv4Net = line
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid cidr {line}: {e}"))?;
        // 主机位不为 0 时按网络地址截断
        let net = net.trunc();
        return Ok(Ipv4Rule::Range(net.network(), net.broadcast()));
    }
    if let Some((start, end)) = line.split_once('-') {
        let start: Ipv4Addr = start
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid range start in {line}: {e}"))?;
        let end: Ipv4Addr = end
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid range end in {line}: {e}"))?;
        if u32::from(start) > u32::from(end) {
            anyhow::bail!("range start after end: {line}");
        }
        return Ok(Ipv4Rule::Range(start, end));
    }
    let ip: Ipv4Addr = line
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid ipv4 address {line}: {e}"))?;
    Ok(Ipv4Rule::Single(ip))
}

/// IPv4 membership set.
///
/// Bare addresses go into a hash set; CIDR blocks and ranges are kept as sorted,
/// merged intervals instead of being enumerated address by address. Membership is
/// identical to expanding every block into individual entries.
#[derive(Debug, Default, Clone)]
pub struct Ipv4Set {
    singles: FxHashSet<u32>,
    ranges: Vec<(u32, u32)>,
    pending: Vec<(u32, u32)>,
}

impl Ipv4Set {
    pub fn insert(&mut self, rule: Ipv4Rule) {
        match rule {
            Ipv4Rule::Single(ip) => {
                self.singles.insert(u32::from(ip));
            }
            Ipv4Rule::Range(start, end) => {
                let (start, end) = (u32::from(start), u32::from(end));
                if start == end {
                    self.singles.insert(start);
                } else {
                    self.pending.push((start, end));
                }
            }
        }
    }

    /// Merges pending intervals. Must be called once loading is done; lookups on an
    /// unfinished set still work but pay a linear scan over the pending blocks.
    pub fn finish(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let mut all = std::mem::take(&mut self.ranges);
        all.append(&mut self.pending);
        all.sort_unstable();
        let mut merged: Vec<(u32, u32)> = Vec::with_capacity(all.len());
        for (start, end) in all {
            match merged.last_mut() {
                Some(last) if start <= last.1.saturating_add(1) => {
                    last.1 = last.1.max(end);
                }
                _ => merged.push((start, end)),
            }
        }
        self.ranges = merged;
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let v = u32::from(ip);
        if self.singles.contains(&v) {
            return true;
        }
        let idx = self.ranges.partition_point(|&(start, _)| start <= v);
        if idx > 0 && self.ranges[idx - 1].1 >= v {
            return true;
        }
        self.pending.iter().any(|&(s, e)| s <= v && v <= e)
    }

    /// Exact lookup of a dotted-quad string; anything that is not an IPv4 literal misses.
    pub fn contains_str(&self, ip: &str) -> bool {
        ip.trim()
            .parse::<Ipv4Addr>()
            .map(|ip| self.contains(ip))
            .unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.singles.is_empty() && self.ranges.is_empty() && self.pending.is_empty()
    }

    /// Number of interval blocks plus single addresses held.
    pub fn entry_count(&self) -> usize {
        self.singles.len() + self.ranges.len() + self.pending.len()
    }
}
