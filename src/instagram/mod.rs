//! Everything Instagram-specific: link parsing, the external download tools
//! and the metadata they leave behind.

pub mod downloader;
pub mod metadata;
pub mod url;

pub use downloader::{
    CookieSource, DownloadError, ExternalDownloader, MediaDownloader, SessionCheck,
};
pub use metadata::{build_caption, load_metadata, PostMetadata};
pub use url::{extract_instagram_urls, ContentKind, InstagramUrl};
