//! Domain-matching table
//!
//! Ordered set of match rules mapping a queried name to a spoofed address.
//! Pure data, built once at configuration time and read-only afterwards.

use std::fs;
use std::net::IpAddr;
use std::path::Path;

use regex::Regex;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum HostsFileError {
    #[error("cannot read hosts file {path}: {source}")]
    Unreadable {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid address {address:?} on line {line}")]
    InvalidAddress { address: String, line: usize },
}

/// One match rule: exact name, suffix or glob, mapped to an address.
#[derive(Debug, Clone)]
pub struct DomainEntry {
    pub pattern: String,
    pub suffix: String,
    pub glob: Option<Regex>,
    pub address: IpAddr,
}

impl DomainEntry {
    pub fn new(pattern: &str, address: IpAddr) -> Self {
        let pattern = pattern.trim().to_lowercase();
        let suffix = if pattern.starts_with('.') {
            pattern.clone()
        } else {
            format!(".{}", pattern)
        };
        let glob = compile_glob(&pattern);

        Self {
            pattern,
            suffix,
            glob,
            address,
        }
    }

    /// Case-insensitive match by exact equality, suffix, or glob.
    pub fn matches(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        if name == self.pattern || name.ends_with(&self.suffix) {
            return true;
        }
        self.glob.as_ref().map_or(false, |re| re.is_match(&name))
    }
}

/// Compile a `*`/`?` wildcard pattern into an anchored regex. Patterns
/// without wildcard characters match through the exact/suffix paths instead.
pub(crate) fn compile_glob(pattern: &str) -> Option<Regex> {
    if !pattern.contains('*') && !pattern.contains('?') {
        return None;
    }

    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            _ => expr.push_str(&regex::escape(&ch.to_string())),
        }
    }
    expr.push('$');

    match Regex::new(&expr) {
        Ok(re) => Some(re),
        Err(e) => {
            debug!(pattern = %pattern, error = %e, "Unusable glob pattern, keeping exact/suffix matching only");
            None
        }
    }
}

/// Ordered sequence of [`DomainEntry`]; first match wins, in load order.
#[derive(Debug, Clone, Default)]
pub struct DomainTable {
    entries: Vec<DomainEntry>,
}

impl DomainTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, pattern: &str, address: IpAddr) {
        self.entries.push(DomainEntry::new(pattern, address));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Address of the first entry matching `name`, if any.
    pub fn resolve(&self, name: &str) -> Option<IpAddr> {
        let name = name.trim_end_matches('.');
        self.entries
            .iter()
            .find(|e| e.matches(name))
            .map(|e| e.address)
    }

    /// Append entries from a hosts file. Lines are `# comment`, blank, or
    /// `<ip> <domain-or-glob>`; a bare `<domain-or-glob>` maps to
    /// `default_address`.
    pub fn load_hosts_file(
        &mut self,
        path: &Path,
        default_address: IpAddr,
    ) -> Result<(), HostsFileError> {
        let text = fs::read_to_string(path).map_err(|source| HostsFileError::Unreadable {
            path: path.display().to_string(),
            source,
        })?;

        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut parts = line.split_whitespace();
            let first = parts.next().unwrap_or_default();
            match parts.next() {
                Some(domain) => {
                    let address: IpAddr =
                        first.parse().map_err(|_| HostsFileError::InvalidAddress {
                            address: first.to_string(),
                            line: idx + 1,
                        })?;
                    self.push(domain, address);
                }
                None => self.push(first, default_address),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::Ipv4Addr;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn exact_match_is_case_insensitive() {
        let mut table = DomainTable::new();
        table.push("Example.COM", ip("10.0.0.1"));

        assert_eq!(table.resolve("example.com"), Some(ip("10.0.0.1")));
        assert_eq!(table.resolve("EXAMPLE.com"), Some(ip("10.0.0.1")));
        assert_eq!(table.resolve("notexample.com"), None);
    }

    #[test]
    fn suffix_match_covers_subdomains() {
        let mut table = DomainTable::new();
        table.push("evil.com", ip("10.0.0.5"));

        assert_eq!(table.resolve("www.evil.com"), Some(ip("10.0.0.5")));
        assert_eq!(table.resolve("deep.sub.evil.com"), Some(ip("10.0.0.5")));
        // Suffix is "." + pattern, so lookalikes don't match
        assert_eq!(table.resolve("notevil.com"), None);
    }

    #[test]
    fn leading_dot_pattern_matches_subdomains_only() {
        let mut table = DomainTable::new();
        table.push(".corp.local", ip("10.0.0.9"));

        assert_eq!(table.resolve("git.corp.local"), Some(ip("10.0.0.9")));
        assert_eq!(table.resolve("corp.local"), None);
    }

    #[test]
    fn glob_match() {
        let mut table = DomainTable::new();
        table.push("*.cdn.example.com", ip("10.0.0.7"));

        assert_eq!(table.resolve("a.cdn.example.com"), Some(ip("10.0.0.7")));
        assert_eq!(table.resolve("cdn.example.com"), None);
    }

    #[test]
    fn first_match_wins_in_insertion_order() {
        let mut table = DomainTable::new();
        table.push("a.example.com", ip("10.0.0.1"));
        table.push("*.example.com", ip("10.0.0.2"));

        assert_eq!(table.resolve("a.example.com"), Some(ip("10.0.0.1")));
        assert_eq!(table.resolve("b.example.com"), Some(ip("10.0.0.2")));
    }

    #[test]
    fn trailing_dot_queries_resolve() {
        let mut table = DomainTable::new();
        table.push("evil.com", ip("10.0.0.5"));

        assert_eq!(table.resolve("evil.com."), Some(ip("10.0.0.5")));
    }

    #[test]
    fn hosts_file_round_trip() {
        let mut file = tempfile_path();
        writeln!(file.1, "# spoof targets").unwrap();
        writeln!(file.1).unwrap();
        writeln!(file.1, "10.0.0.5 evil.com").unwrap();
        writeln!(file.1, "bare-domain.com").unwrap();
        file.1.flush().unwrap();

        let mut table = DomainTable::new();
        table
            .load_hosts_file(&file.0, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 2)))
            .unwrap();

        assert_eq!(table.len(), 2);
        assert_eq!(table.resolve("evil.com"), Some(ip("10.0.0.5")));
        assert_eq!(table.resolve("www.evil.com"), Some(ip("10.0.0.5")));
        assert_eq!(table.resolve("notevil.com"), None);
        assert_eq!(table.resolve("bare-domain.com"), Some(ip("192.168.1.2")));
    }

    #[test]
    fn hosts_file_rejects_bad_address() {
        let mut file = tempfile_path();
        writeln!(file.1, "10.0.0.999 evil.com").unwrap();
        file.1.flush().unwrap();

        let mut table = DomainTable::new();
        let err = table
            .load_hosts_file(&file.0, ip("10.0.0.1"))
            .unwrap_err();
        assert!(matches!(err, HostsFileError::InvalidAddress { line: 1, .. }));
    }

    fn tempfile_path() -> (std::path::PathBuf, std::fs::File) {
        let path = std::env::temp_dir().join(format!(
            "netsnare-hosts-{}-{}",
            std::process::id(),
            rand::random::<u32>()
        ));
        let file = std::fs::File::create(&path).unwrap();
        (path, file)
    }
}
