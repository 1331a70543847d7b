//! Method allowlist matching.
//!
//! # Responsibilities
//! - Parse allowlist patterns into tagged matchers
//! - Expand capability packs into patterns
//! - Answer whether a method is allowlisted
//!
//! # Design Decisions
//! - Matching is case-insensitive (methods are normalised to lowercase)
//! - Exact matchers are checked first, then prefixes longest-first, then globs
//! - No regex to guarantee linear matching

use std::collections::BTreeSet;
use std::fmt;

use thiserror::Error;

/// Capability packs and the patterns each one allows.
pub const PACKS: &[(&str, &[&str])] = &[
    (
        "core",
        &["batch", "user.*", "department.*", "crm.*", "tasks.task.*", "task.*", "event.*"],
    ),
    (
        "comms",
        &[
            "im.*",
            "imbot.*",
            "imopenlines.*",
            "imconnector.*",
            "messageservice.*",
            "mailservice.*",
            "telephony.*",
        ],
    ),
    ("automation", &["bizproc.*", "crm.automation.*", "lists.*"]),
    (
        "collab",
        &["sonet_group.*", "socialnetwork.*", "log.*", "calendar.*", "vote.*"],
    ),
    ("content", &["disk.*", "file.*", "files.*", "documentgenerator.*"]),
    ("boards", &["tasks.api.scrum.*", "tasks.scrum.*"]),
    ("commerce", &["sale.*", "catalog.*"]),
    ("services", &["booking.*", "calendar.*", "timeman.*"]),
    ("platform", &["entity.*", "biconnector.*", "ai.*"]),
    ("sites", &["landing.*"]),
    ("compliance", &["userconsent.*", "sign.*"]),
    (
        "diagnostics",
        &["method.get", "methods", "events", "feature.get", "scope", "server.time"],
    ),
];

/// Packs enabled when none are configured.
pub const DEFAULT_PACKS: &[&str] = &["core"];

/// Explicit patterns used when none are configured.
pub const DEFAULT_ALLOWLIST: &[&str] = &["batch"];

/// A pack name that does not exist.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown pack '{name}', available packs: {available}")]
pub struct UnknownPack {
    pub name: String,
    pub available: String,
}

/// Patterns of a pack, if it exists.
pub fn pack_patterns(name: &str) -> Option<&'static [&'static str]> {
    PACKS
        .iter()
        .find(|(pack, _)| *pack == name)
        .map(|(_, patterns)| *patterns)
}

/// Normalise a pack selection: lowercase, dedupe, reject unknown names.
///
/// An empty selection means the default packs; `["none"]` means no packs.
pub fn parse_pack_list<S: AsRef<str>>(raw: &[S]) -> Result<Vec<String>, UnknownPack> {
    let names: Vec<String> = raw
        .iter()
        .map(|s| s.as_ref().trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect();
    if names.is_empty() {
        return Ok(DEFAULT_PACKS.iter().map(|s| s.to_string()).collect());
    }
    if names == ["none"] {
        return Ok(Vec::new());
    }

    let mut seen = BTreeSet::new();
    let mut packs = Vec::new();
    for name in names {
        if pack_patterns(&name).is_none() {
            let mut available: Vec<&str> = PACKS.iter().map(|(p, _)| *p).collect();
            available.sort_unstable();
            return Err(UnknownPack {
                name,
                available: available.join(", "),
            });
        }
        if seen.insert(name.clone()) {
            packs.push(name);
        }
    }
    Ok(packs)
}

/// One parsed allowlist pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodMatcher {
    /// The whole method name.
    Exact(String),
    /// `crm.*`: anything below a namespace. Stores `crm.`.
    Prefix(String),
    /// `*` matches any run of characters, `?` exactly one.
    Glob(String),
}

impl MethodMatcher {
    pub fn parse(pattern: &str) -> Self {
        let pattern = pattern.trim().to_ascii_lowercase();
        if let Some(stem) = pattern.strip_suffix('*') {
            if stem.ends_with('.') && !has_wildcard(stem) {
                return MethodMatcher::Prefix(stem.to_string());
            }
        }
        if has_wildcard(&pattern) {
            MethodMatcher::Glob(pattern)
        } else {
            MethodMatcher::Exact(pattern)
        }
    }

    pub fn matches(&self, method: &str) -> bool {
        match self {
            MethodMatcher::Exact(name) => method == name,
            MethodMatcher::Prefix(prefix) => {
                method.len() > prefix.len() && method.starts_with(prefix.as_str())
            }
            MethodMatcher::Glob(pattern) => glob_match(pattern.as_bytes(), method.as_bytes()),
        }
    }

    fn rank(&self) -> (u8, usize) {
        match self {
            MethodMatcher::Exact(_) => (0, 0),
            MethodMatcher::Prefix(p) => (1, usize::MAX - p.len()),
            MethodMatcher::Glob(_) => (2, 0),
        }
    }
}

impl fmt::Display for MethodMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodMatcher::Exact(name) => f.write_str(name),
            MethodMatcher::Prefix(prefix) => write!(f, "{prefix}*"),
            MethodMatcher::Glob(pattern) => f.write_str(pattern),
        }
    }
}

fn has_wildcard(pattern: &str) -> bool {
    pattern.contains(['*', '?'])
}

fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while t < text.len() {
        match pattern.get(p) {
            Some(b'*') => {
                backtrack = Some((p, t));
                p += 1;
            }
            Some(&c) if c == b'?' || c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match backtrack {
                Some((star_p, star_t)) => {
                    p = star_p + 1;
                    t = star_t + 1;
                    backtrack = Some((star_p, star_t + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|&c| c == b'*')
}

/// The compiled allowlist: explicit patterns plus enabled packs.
#[derive(Debug, Clone, Default)]
pub struct Allowlist {
    matchers: Vec<MethodMatcher>,
}

impl Allowlist {
    /// Merge explicit patterns with the patterns of `packs` (already parsed).
    pub fn build<S: AsRef<str>>(patterns: &[S], packs: &[String]) -> Self {
        let explicit: Vec<&str> = if patterns.is_empty() {
            DEFAULT_ALLOWLIST.to_vec()
        } else {
            patterns.iter().map(|p| p.as_ref()).collect()
        };
        let from_packs = packs
            .iter()
            .filter_map(|p| pack_patterns(p))
            .flat_map(|patterns| patterns.iter().copied());

        let mut seen = BTreeSet::new();
        let mut matchers: Vec<MethodMatcher> = explicit
            .into_iter()
            .chain(from_packs)
            .map(MethodMatcher::parse)
            .filter(|m| seen.insert(m.to_string()))
            .collect();
        matchers.sort_by_key(MethodMatcher::rank);
        Self { matchers }
    }

    /// First matcher admitting `method`, in priority order.
    pub fn matched_by(&self, method: &str) -> Option<&MethodMatcher> {
        let method = method.to_ascii_lowercase();
        self.matchers.iter().find(|m| m.matches(&method))
    }

    pub fn allows(&self, method: &str) -> bool {
        self.matched_by(method).is_some()
    }

    pub fn matchers(&self) -> &[MethodMatcher] {
        &self.matchers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_parsing() {
        assert_eq!(MethodMatcher::parse("batch"), MethodMatcher::Exact("batch".into()));
        assert_eq!(MethodMatcher::parse("CRM.*"), MethodMatcher::Prefix("crm.".into()));
        assert_eq!(
            MethodMatcher::parse("crm.*.list"),
            MethodMatcher::Glob("crm.*.list".into())
        );
        assert_eq!(MethodMatcher::parse("user*"), MethodMatcher::Glob("user*".into()));
    }

    #[test]
    fn test_matching() {
        let prefix = MethodMatcher::parse("crm.*");
        assert!(prefix.matches("crm.lead.add"));
        assert!(!prefix.matches("crm"));
        assert!(!prefix.matches("crmx.lead"));

        let glob = MethodMatcher::parse("crm.*.list");
        assert!(glob.matches("crm.lead.list"));
        assert!(glob.matches("crm.deal.product.list"));
        assert!(!glob.matches("crm.lead.get"));

        let single = MethodMatcher::parse("task?.get");
        assert!(single.matches("tasks.get"));
        assert!(!single.matches("task.get"));
    }

    #[test]
    fn test_pack_list() {
        assert_eq!(parse_pack_list::<&str>(&[]).unwrap(), vec!["core"]);
        assert!(parse_pack_list(&["none"]).unwrap().is_empty());
        assert_eq!(
            parse_pack_list(&["Core", "comms", "core"]).unwrap(),
            vec!["core", "comms"]
        );
        let err = parse_pack_list(&["core", "warp"]).unwrap_err();
        assert_eq!(err.name, "warp");
        assert!(err.available.starts_with("automation, boards"));
    }

    #[test]
    fn test_allowlist_union_and_priority() {
        let allowlist = Allowlist::build(&["im.notify", "crm.lead.*"], &["core".to_string()]);
        assert!(allowlist.allows("crm.deal.list"));
        assert!(allowlist.allows("IM.Notify"));
        assert!(!allowlist.allows("im.message.add"));
        assert!(!allowlist.allows("disk.folder.get"));
        assert!(allowlist.allows("batch"));

        // The longer prefix wins over the pack's crm.*
        assert_eq!(
            allowlist.matched_by("crm.lead.add"),
            Some(&MethodMatcher::Prefix("crm.lead.".into()))
        );
        assert_eq!(
            allowlist.matched_by("im.notify"),
            Some(&MethodMatcher::Exact("im.notify".into()))
        );
    }

    #[test]
    fn test_empty_patterns_fall_back_to_default() {
        let allowlist = Allowlist::build::<&str>(&[], &[]);
        assert!(allowlist.allows("batch"));
        assert!(!allowlist.allows("user.get"));
    }
}
