//! Request filtering installed on every pooled session.
//!
//! Sessions render full pages, so each one carries a filter that aborts
//! sub-requests we never need for metadata: analytics beacons, ad networks,
//! audio/video, and optionally images.

use std::fmt;
use std::str::FromStr;

/// Hosts matched by substring against the lower-cased request URL.
pub const DEFAULT_BLOCKED_DOMAINS: &[&str] = &[
    "google-analytics",
    "googletagmanager",
    "doubleclick",
    "googlesyndication",
    "adsystem",
    "analytics",
];

/// Kind of sub-request issued by a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Document,
    Stylesheet,
    Script,
    Image,
    Media,
    Font,
    Xhr,
    Fetch,
    Other,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Document => "document",
            ResourceKind::Stylesheet => "stylesheet",
            ResourceKind::Script => "script",
            ResourceKind::Image => "image",
            ResourceKind::Media => "media",
            ResourceKind::Font => "font",
            ResourceKind::Xhr => "xhr",
            ResourceKind::Fetch => "fetch",
            ResourceKind::Other => "other",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    /// Unknown kinds map to [`ResourceKind::Other`] so new browser resource
    /// types are let through rather than rejected.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "document" => ResourceKind::Document,
            "stylesheet" => ResourceKind::Stylesheet,
            "script" => ResourceKind::Script,
            "image" => ResourceKind::Image,
            "media" => ResourceKind::Media,
            "font" => ResourceKind::Font,
            "xhr" => ResourceKind::Xhr,
            "fetch" => ResourceKind::Fetch,
            _ => ResourceKind::Other,
        })
    }
}

/// Decides which sub-requests a session may issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceFilter {
    blocked_kinds: Vec<ResourceKind>,
    blocked_domains: Vec<String>,
}

impl Default for ResourceFilter {
    fn default() -> Self {
        Self::new(false)
    }
}

impl ResourceFilter {
    /// Media and fonts are always blocked; images only when `enable_images` is false.
    pub fn new(enable_images: bool) -> Self {
        let mut blocked_kinds = vec![ResourceKind::Media, ResourceKind::Font];
        if !enable_images {
            blocked_kinds.push(ResourceKind::Image);
        }
        Self {
            blocked_kinds,
            blocked_domains: DEFAULT_BLOCKED_DOMAINS
                .iter()
                .map(|d| d.to_string())
                .collect(),
        }
    }

    pub fn with_blocked_domain(mut self, domain: impl Into<String>) -> Self {
        self.blocked_domains.push(domain.into().to_lowercase());
        self
    }

    pub fn blocks_images(&self) -> bool {
        self.blocked_kinds.contains(&ResourceKind::Image)
    }

    pub fn blocked_kinds(&self) -> &[ResourceKind] {
        &self.blocked_kinds
    }

    pub fn blocked_domains(&self) -> &[String] {
        &self.blocked_domains
    }

    /// Returns true if the sub-request should be allowed to proceed.
    pub fn allows(&self, url: &str, kind: ResourceKind) -> bool {
        if self.blocked_kinds.contains(&kind) {
            return false;
        }
        let url = url.to_lowercase();
        !self
            .blocked_domains
            .iter()
            .any(|domain| url.contains(domain.as_str()))
    }
}
