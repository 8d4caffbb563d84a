//! Backend name translation
//!
//! Every path is rewritten before a backend-specific call through an
//! ordered chain of prefix rules: the first registered rule whose
//! `from` prefix matches wins, and an empty chain is the identity.
//! Content-addressed backends additionally carry hashed rules that
//! insert a two-level hash-bucket segment before the final path
//! element; when no hashed rule matches, control falls through to the
//! plain chain.

use metafed_common::config::XlatRule;
use metafed_common::path;
use sha2::{Digest, Sha256};

/// The translation chain owned by one backend
#[derive(Clone, Debug, Default)]
pub struct NameXlation {
    rules: Vec<XlatRule>,
    hashed: Vec<XlatRule>,
}

/// Two 2-hex-char directory components derived from the content hash
/// of a path element
#[must_use]
pub fn hash_buckets(name: &str) -> (String, String) {
    let digest = Sha256::digest(name.as_bytes());
    let hex = format!("{:02x}{:02x}", digest[0], digest[1]);
    (hex[..2].to_string(), hex[2..4].to_string())
}

fn match_rule<'a>(rules: &'a [XlatRule], lfn: &str) -> Option<(&'a XlatRule, usize)> {
    // First registered rule wins; ties are resolved by declaration
    // order, not by longest match.
    rules
        .iter()
        .find(|r| lfn == r.from || (lfn.starts_with(&r.from) && lfn.as_bytes().get(r.from.len()) == Some(&b'/')))
        .map(|r| (r, r.from.len()))
}

impl NameXlation {
    #[must_use]
    pub fn new(rules: Vec<XlatRule>, hashed: Vec<XlatRule>) -> Self {
        Self { rules, hashed }
    }

    /// True when the chain has no rules at all and acts as the identity
    #[must_use]
    pub fn is_identity(&self) -> bool {
        self.rules.is_empty() && self.hashed.is_empty()
    }

    /// Rewrite `lfn` for this backend. Returns `None` when rules are
    /// registered but none of them matches, which means the path is not
    /// served by this backend.
    #[must_use]
    pub fn xlate(&self, lfn: &str) -> Option<String> {
        if self.is_identity() {
            return Some(lfn.to_string());
        }

        if let Some((rule, skip)) = match_rule(&self.hashed, lfn) {
            let rest = &lfn[skip..];
            if let Some((parent, leaf)) = path::split_parent(rest) {
                let (b1, b2) = hash_buckets(leaf);
                let parent = if parent == "/" { "" } else { parent };
                return Some(format!("{}{parent}/{b1}/{b2}/{leaf}", rule.to));
            }
            // A bare root has no leaf to bucket; fall through.
        }

        match_rule(&self.rules, lfn).map(|(rule, skip)| format!("{}{}", rule.to, &lfn[skip..]))
    }

    /// Rewrite `lfn`, treating "no rule matched" as the identity. This
    /// is the public name-translation surface; serving decisions use
    /// [`Self::xlate`].
    #[must_use]
    pub fn xlate_or_identity(&self, lfn: &str) -> String {
        self.xlate(lfn).unwrap_or_else(|| lfn.to_string())
    }

    /// If `lfn` is a strict ancestor of one of the rewrite roots,
    /// return the single child component to synthesize, so that deep
    /// rewrite targets appear as traversable ancestors.
    #[must_use]
    pub fn synthesized_child(&self, lfn: &str) -> Option<String> {
        self.rules
            .iter()
            .chain(self.hashed.iter())
            .find_map(|r| path::next_component(lfn, &r.from))
            .map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(from: &str, to: &str) -> XlatRule {
        XlatRule {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    #[test]
    fn test_empty_chain_is_identity() {
        let x = NameXlation::default();
        assert_eq!(x.xlate("/any/path").as_deref(), Some("/any/path"));
        assert_eq!(x.xlate_or_identity("/any/path"), "/any/path");
    }

    #[test]
    fn test_first_registered_rule_wins() {
        let x = NameXlation::new(
            vec![rule("/fed", "/short"), rule("/fed/deep", "/long")],
            vec![],
        );
        // Declaration order, not longest match.
        assert_eq!(x.xlate("/fed/deep/f").as_deref(), Some("/short/deep/f"));
    }

    #[test]
    fn test_no_match_with_rules() {
        let x = NameXlation::new(vec![rule("/fed", "/data")], vec![]);
        assert_eq!(x.xlate("/other/f"), None);
        // The public surface keeps the path unchanged.
        assert_eq!(x.xlate_or_identity("/other/f"), "/other/f");
        // Prefix match is component-wise.
        assert_eq!(x.xlate("/federation/f"), None);
    }

    #[test]
    fn test_hashed_rewrite_buckets_the_leaf() {
        let x = NameXlation::new(vec![], vec![rule("/fed", "/cas")]);
        let out = x.xlate("/fed/a/b/file1").unwrap();
        let (b1, b2) = hash_buckets("file1");
        assert_eq!(out, format!("/cas/a/b/{b1}/{b2}/file1"));

        let out = x.xlate("/fed/file1").unwrap();
        assert_eq!(out, format!("/cas/{b1}/{b2}/file1"));
    }

    #[test]
    fn test_hashed_falls_through_to_plain() {
        let x = NameXlation::new(vec![rule("/plain", "/p")], vec![rule("/cas", "/c")]);
        assert_eq!(x.xlate("/plain/x").as_deref(), Some("/p/x"));
    }

    #[test]
    fn test_hash_buckets_are_stable() {
        let (a1, a2) = hash_buckets("file1");
        let (b1, b2) = hash_buckets("file1");
        assert_eq!((a1.as_str(), a2.as_str()), (b1.as_str(), b2.as_str()));
        assert_eq!(a1.len(), 2);
        assert_eq!(a2.len(), 2);
    }

    #[test]
    fn test_parent_directory_synthesis() {
        let x = NameXlation::new(vec![rule("/fed/atlas/data", "/data")], vec![]);
        assert_eq!(x.synthesized_child("/fed").as_deref(), Some("atlas"));
        assert_eq!(x.synthesized_child("/fed/atlas").as_deref(), Some("data"));
        // The root itself is not an ancestor of itself, and deeper
        // paths are served normally.
        assert_eq!(x.synthesized_child("/fed/atlas/data"), None);
        assert_eq!(x.synthesized_child("/elsewhere"), None);
    }
}
