//! Post metadata from the JSON sidecars the download tools write, and the
//! captions built from it.

use crate::config::TELEGRAM_CAPTION_LIMIT;
use crate::utils::truncate_graphemes;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// What we show about a post.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostMetadata {
    pub username: Option<String>,
    pub description: Option<String>,
    pub likes: Option<u64>,
    pub comments: Option<u64>,
    pub url: Option<String>,
}

impl PostMetadata {
    /// Extract fields from either a gallery-dl or a yt-dlp JSON document.
    #[must_use]
    pub fn from_json(value: &Value) -> Self {
        Self {
            username: first_str(value, &["username", "uploader_id", "uploader", "owner_username"]),
            description: first_str(value, &["description", "caption", "title"])
                .filter(|s| !s.trim().is_empty()),
            likes: first_u64(value, &["likes", "like_count"]),
            comments: first_u64(value, &["comments", "comment_count"]),
            url: first_str(value, &["post_url", "webpage_url"]),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

fn first_str(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| value.get(*k).and_then(Value::as_str))
        .map(ToString::to_string)
}

fn first_u64(value: &Value, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|k| value.get(*k).and_then(Value::as_u64))
}

/// Sidecar paths to try for `file`, most specific first.
fn sidecar_candidates(file: &Path) -> Vec<PathBuf> {
    let mut candidates = Vec::with_capacity(3);
    if let Some(name) = file.file_name() {
        let mut with_json = name.to_os_string();
        with_json.push(".json");
        candidates.push(file.with_file_name(with_json));
    }
    if let Some(stem) = file.file_stem() {
        let mut info = stem.to_os_string();
        info.push(".info.json");
        candidates.push(file.with_file_name(info));
        candidates.push(file.with_extension("json"));
    }
    candidates
}

async fn read_json(path: &Path) -> Option<Value> {
    let raw = tokio::fs::read_to_string(path).await.ok()?;
    match serde_json::from_str(&raw) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring unreadable metadata file");
            None
        }
    }
}

/// Load metadata for a download, looking next to `first_file` and then at
/// any JSON file in the same directory.
pub async fn load_metadata(first_file: &Path) -> Option<PostMetadata> {
    for candidate in sidecar_candidates(first_file) {
        if let Some(value) = read_json(&candidate).await {
            debug!(path = %candidate.display(), "Using metadata sidecar");
            return Some(PostMetadata::from_json(&value)).filter(|m| !m.is_empty());
        }
    }

    let dir = first_file.parent()?;
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    let mut json_files = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().is_some_and(|e| e == "json") {
            json_files.push(path);
        }
    }
    json_files.sort();

    for path in json_files {
        if let Some(value) = read_json(&path).await {
            let meta = PostMetadata::from_json(&value);
            if !meta.is_empty() {
                return Some(meta);
            }
        }
    }
    None
}

/// HTML caption for file `index` (0-based) of `total`.
///
/// The first file carries the post details; the rest only get their
/// position. A lone file without metadata gets no caption.
#[must_use]
pub fn build_caption(meta: Option<&PostMetadata>, index: usize, total: usize) -> Option<String> {
    let counter = (total > 1).then(|| format!("Media {}/{}", index + 1, total));
    let details = meta.filter(|_| index == 0).and_then(render_details);

    match (details, counter) {
        (Some(details), Some(counter)) => Some(format!("{details}\n\n{counter}")),
        (Some(details), None) => Some(details),
        (None, counter) => counter,
    }
}

fn render_details(meta: &PostMetadata) -> Option<String> {
    let mut header = Vec::new();
    if let Some(user) = &meta.username {
        header.push(format!("👤 <b>@{}</b>", html_escape::encode_text(user)));
    }
    let mut counts = Vec::new();
    if let Some(likes) = meta.likes {
        counts.push(format!("❤️ {likes}"));
    }
    if let Some(comments) = meta.comments {
        counts.push(format!("💬 {comments}"));
    }
    if !counts.is_empty() {
        header.push(counts.join("  "));
    }
    if let Some(url) = &meta.url {
        header.push(format!(
            "<a href=\"{}\">Original post</a>",
            html_escape::encode_double_quoted_attribute(url)
        ));
    }

    // Visible length of everything but the description, plus separators and
    // room for the media counter
    let fixed: usize = header.iter().map(|h| visible_len(h)).sum::<usize>() + header.len() * 2 + 20;
    let budget = TELEGRAM_CAPTION_LIMIT.saturating_sub(fixed);

    let mut parts = Vec::new();
    if let Some(user) = header.first().filter(|_| meta.username.is_some()) {
        parts.push(user.clone());
    }
    if let Some(desc) = meta.description.as_deref().filter(|_| budget > 0) {
        parts.push(html_escape::encode_text(&truncate_graphemes(desc.trim(), budget)).into_owned());
    }
    let rest = if meta.username.is_some() {
        &header[1..]
    } else {
        &header[..]
    };
    parts.extend(rest.iter().cloned());

    (!parts.is_empty()).then(|| parts.join("\n\n"))
}

/// Length of `html` as Telegram counts it: tags removed, entities as one char.
fn visible_len(html: &str) -> usize {
    let mut len = 0;
    let mut in_tag = false;
    let mut in_entity = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            '&' if !in_tag => {
                in_entity = true;
                len += 1;
            }
            ';' if in_entity => in_entity = false,
            _ if in_tag || in_entity => {}
            _ => len += 1,
        }
    }
    len
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> PostMetadata {
        PostMetadata {
            username: Some("nasa".into()),
            description: Some("Look <up> & wonder".into()),
            likes: Some(10),
            comments: Some(2),
            url: Some("https://www.instagram.com/p/Cabc".into()),
        }
    }

    #[test]
    fn reads_gallery_dl_and_yt_dlp_fields() {
        let gdl = PostMetadata::from_json(&json!({
            "username": "nasa", "description": "hi", "likes": 5,
            "post_url": "https://www.instagram.com/p/X"
        }));
        assert_eq!(gdl.username.as_deref(), Some("nasa"));
        assert_eq!(gdl.likes, Some(5));

        let ytdlp = PostMetadata::from_json(&json!({
            "uploader": "nasa", "title": "Story", "like_count": 7,
            "comment_count": 1, "webpage_url": "https://www.instagram.com/stories/nasa/1"
        }));
        assert_eq!(ytdlp.username.as_deref(), Some("nasa"));
        assert_eq!(ytdlp.description.as_deref(), Some("Story"));
        assert_eq!(ytdlp.comments, Some(1));
        assert!(PostMetadata::from_json(&json!({"other": 1})).is_empty());
    }

    #[test]
    fn first_caption_has_details_and_counter() {
        let caption = build_caption(Some(&sample()), 0, 3).expect("caption");
        assert!(caption.starts_with("👤 <b>@nasa</b>"));
        assert!(caption.contains("Look &lt;up&gt; &amp; wonder"));
        assert!(caption.contains("❤️ 10  💬 2"));
        assert!(caption.contains("<a href=\"https://www.instagram.com/p/Cabc\">"));
        assert!(caption.ends_with("Media 1/3"));
    }

    #[test]
    fn later_captions_only_count() {
        assert_eq!(
            build_caption(Some(&sample()), 2, 3).as_deref(),
            Some("Media 3/3")
        );
        assert_eq!(build_caption(None, 0, 1), None);
        assert!(build_caption(Some(&sample()), 0, 1)
            .expect("caption")
            .contains("@nasa"));
    }

    #[test]
    fn long_descriptions_fit_the_caption_limit() {
        let meta = PostMetadata {
            description: Some("x".repeat(5000)),
            ..sample()
        };
        let caption = build_caption(Some(&meta), 0, 10).expect("caption");
        assert!(visible_len(&caption) <= TELEGRAM_CAPTION_LIMIT);
        assert!(caption.contains('…'));
    }

    #[test]
    fn visible_len_ignores_markup() {
        assert_eq!(visible_len("<b>ab</b> &amp; c"), 6);
    }

    #[tokio::test]
    async fn loads_sidecar_next_to_file() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let media = dir.path().join("123_abc.jpg");
        std::fs::write(&media, b"img").expect("write");
        std::fs::write(
            dir.path().join("123_abc.jpg.json"),
            r#"{"username": "nasa", "likes": 3}"#,
        )
        .expect("write");

        let meta = load_metadata(&media).await.expect("metadata");
        assert_eq!(meta.username.as_deref(), Some("nasa"));
        assert_eq!(meta.likes, Some(3));
    }

    #[tokio::test]
    async fn falls_back_to_any_json_in_directory() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let media = dir.path().join("clip.mp4");
        std::fs::write(&media, b"vid").expect("write");
        std::fs::write(dir.path().join("broken.json"), "{not json").expect("write");
        std::fs::write(
            dir.path().join("story.info.json"),
            r#"{"uploader": "nasa"}"#,
        )
        .expect("write");

        let meta = load_metadata(&media).await.expect("metadata");
        assert_eq!(meta.username.as_deref(), Some("nasa"));
    }
}
