//! Source-category classification for evidence URLs.
//!
//! A hand-maintained domain table, not a guarantee — misclassification is
//! acceptable noise. Kept behind a trait so a smarter classifier can be
//! swapped in without touching the ingest path.

use regex::Regex;

use crate::model::SourceCategory;

/// Classifies an evidence URL into a source category.
pub trait SourceClassifier: Send + Sync {
    fn classify(&self, url: &str) -> SourceCategory;
}

/// Fixed domain-table classifier with a NEWS fallback.
pub struct DomainTableClassifier {
    host_re: Regex,
}

/// Domain suffixes mapped to categories. First match wins.
const DOMAIN_TABLE: &[(&str, SourceCategory)] = &[
    ("reddit.com", SourceCategory::Community),
    ("news.ycombinator.com", SourceCategory::Community),
    ("stackoverflow.com", SourceCategory::Community),
    ("dcinside.com", SourceCategory::Community),
    ("clien.net", SourceCategory::Community),
    ("medium.com", SourceCategory::Blog),
    ("substack.com", SourceCategory::Blog),
    ("wordpress.com", SourceCategory::Blog),
    ("tistory.com", SourceCategory::Blog),
    ("blog.naver.com", SourceCategory::Blog),
    ("arxiv.org", SourceCategory::Academic),
    ("nature.com", SourceCategory::Academic),
    ("sciencedirect.com", SourceCategory::Academic),
];

/// Host suffixes (TLD-ish) mapped to categories, checked after the table.
const SUFFIX_TABLE: &[(&str, SourceCategory)] = &[
    (".gov", SourceCategory::Official),
    (".go.kr", SourceCategory::Official),
    (".or.kr", SourceCategory::Official),
    (".edu", SourceCategory::Academic),
    (".ac.kr", SourceCategory::Academic),
    (".ac.uk", SourceCategory::Academic),
];

impl DomainTableClassifier {
    pub fn new() -> Self {
        Self {
            // Scheme and optional credentials up to the host, host is everything
            // before the first / : ? or #.
            host_re: Regex::new(r"^[a-zA-Z][a-zA-Z0-9+.-]*://(?:[^/@]*@)?([^/:?#]+)")
                .expect("host regex is valid"),
        }
    }

    /// Extract the lowercased host from a URL. Bare hosts without a scheme
    /// are accepted too.
    fn host(&self, url: &str) -> Option<String> {
        let trimmed = url.trim();
        if trimmed.is_empty() {
            return None;
        }
        if let Some(caps) = self.host_re.captures(trimmed) {
            return Some(caps[1].to_ascii_lowercase());
        }
        // No scheme: treat the leading segment as the host.
        let bare = trimmed
            .split(['/', '?', '#'])
            .next()
            .unwrap_or(trimmed)
            .to_ascii_lowercase();
        if bare.contains('.') { Some(bare) } else { None }
    }
}

impl Default for DomainTableClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceClassifier for DomainTableClassifier {
    fn classify(&self, url: &str) -> SourceCategory {
        let Some(host) = self.host(url) else {
            return SourceCategory::News;
        };

        for (domain, category) in DOMAIN_TABLE {
            if host == *domain || host.ends_with(&format!(".{domain}")) {
                return *category;
            }
        }
        for (suffix, category) in SUFFIX_TABLE {
            if host.ends_with(suffix) {
                return *category;
            }
        }
        SourceCategory::News
    }
}
