//! Signed media preview links
//!
//! The media server recomputes the token from the path and `t` parameter, so
//! the token inputs and their textual form must stay stable:
//! `base64(sha1(mediaId ‖ fileId ‖ t ‖ salt))` with every non-alphanumeric
//! character of the base64 text removed.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha1::{Digest, Sha1};

/// Characters left unescaped in a path component (`encodeURIComponent` set)
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Image,
}

impl MediaKind {
    fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Image => "image",
        }
    }
}

/// Shortest decimal form, `12` rather than `12.0`
pub fn format_time(t: f64) -> String {
    t.to_string()
}

pub fn encode_component(value: &str) -> String {
    utf8_percent_encode(value, COMPONENT).to_string()
}

#[derive(Debug, Clone)]
pub struct MediaSigner {
    base_url: String,
    salt: String,
}

impl MediaSigner {
    pub fn new(base_url: impl Into<String>, salt: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            salt: salt.into(),
        }
    }

    pub fn token(&self, media_id: u64, file_id: &str, t: f64) -> String {
        let mut hasher = Sha1::new();
        hasher.update(media_id.to_string().as_bytes());
        hasher.update(file_id.as_bytes());
        hasher.update(format_time(t).as_bytes());
        hasher.update(self.salt.as_bytes());
        let encoded = STANDARD.encode(hasher.finalize());
        encoded.chars().filter(char::is_ascii_alphanumeric).collect()
    }

    pub fn link(&self, kind: MediaKind, media_id: u64, file_id: &str, t: f64) -> String {
        format!(
            "{}/{}/{}/{}?t={}&token={}",
            self.base_url,
            kind.as_str(),
            media_id,
            encode_component(file_id),
            format_time(t),
            self.token(media_id, file_id, t)
        )
    }
}
