//! Instagram URL recognition and classification.

// lazy_regex! statics are validated at compile time
#![allow(clippy::non_std_lazy_statics)]

use lazy_regex::lazy_regex;
use std::fmt;

/// Instagram links anywhere in free text
static RE_INSTAGRAM_LINK: lazy_regex::Lazy<regex::Regex> =
    lazy_regex!(r#"(?i)https?://(?:www\.|m\.)?(?:instagram\.com|instagr\.am)/[^\s<>"']*"#);

/// Scheme and host of a single candidate URL; captures the path
static RE_INSTAGRAM_HOST: lazy_regex::Lazy<regex::Regex> =
    lazy_regex!(r"(?i)^https?://(?:www\.|m\.)?(?:instagram\.com|instagr\.am)(/.*)?$");

static RE_NUMERIC: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r"^\d+$");

static RE_SHORTCODE: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r"^[A-Za-z0-9_-]+$");

static RE_USERNAME: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r"^[A-Za-z0-9_.]+$");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentKind {
    Post,
    Reel,
    Story,
    Highlight,
    Tv,
    Profile,
    Unknown,
}

impl ContentKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Post => "post",
            Self::Reel => "reel",
            Self::Story => "story",
            Self::Highlight => "highlight",
            Self::Tv => "tv",
            Self::Profile => "profile",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalised, classified Instagram URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstagramUrl {
    url: String,
    kind: ContentKind,
    /// Shortcode, username or highlight id, depending on `kind`
    identifier: Option<String>,
}

impl InstagramUrl {
    /// Normalise and classify `input`.
    ///
    /// Query string, fragment and trailing slashes are dropped. Returns `None`
    /// for anything that is not an Instagram URL.
    #[must_use]
    pub fn parse(input: &str) -> Option<Self> {
        let trimmed = input
            .trim()
            .trim_end_matches(|c: char| matches!(c, '.' | ',' | ';' | ':' | '!' | ')'));
        let without_query = trimmed
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .trim_end_matches('/');

        let caps = RE_INSTAGRAM_HOST.captures(without_query)?;
        let path = caps.get(1).map_or("", |m| m.as_str());
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let (kind, identifier) = classify(&segments);

        Some(Self {
            url: without_query.to_string(),
            kind,
            identifier,
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub const fn kind(&self) -> ContentKind {
        self.kind
    }

    #[must_use]
    pub fn identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
    }
}

impl fmt::Display for InstagramUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

fn classify(segments: &[&str]) -> (ContentKind, Option<String>) {
    match segments {
        [] => (ContentKind::Unknown, None),
        ["stories", "highlights", id, ..] if RE_NUMERIC.is_match(id) => {
            (ContentKind::Highlight, Some((*id).to_string()))
        }
        ["stories", user, ..] if *user != "highlights" && RE_USERNAME.is_match(user) => {
            (ContentKind::Story, Some((*user).to_string()))
        }
        [user] if RE_USERNAME.is_match(user) && !is_reserved_path(user) => {
            (ContentKind::Profile, Some((*user).to_string()))
        }
        _ => segments
            .windows(2)
            .find_map(|pair| {
                let kind = match pair[0] {
                    "p" => ContentKind::Post,
                    "reel" | "reels" => ContentKind::Reel,
                    "tv" => ContentKind::Tv,
                    _ => return None,
                };
                RE_SHORTCODE
                    .is_match(pair[1])
                    .then(|| (kind, Some(pair[1].to_string())))
            })
            .unwrap_or((ContentKind::Unknown, None)),
    }
}

fn is_reserved_path(segment: &str) -> bool {
    matches!(
        segment,
        "explore" | "accounts" | "direct" | "stories" | "reels" | "reel" | "p" | "tv" | "about"
    )
}

/// Every Instagram URL in `text`, in order of appearance.
#[must_use]
pub fn extract_instagram_urls(text: &str) -> Vec<InstagramUrl> {
    RE_INSTAGRAM_LINK
        .find_iter(text)
        .filter_map(|m| InstagramUrl::parse(m.as_str()))
        .collect()
}
