//! Resource identification for image loads.

use std::fmt;

use crate::types::TextureId;

/// Scheme classification for a [`VisualUrl`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UrlProtocol {
    /// Local filesystem path (optionally `file://`-prefixed).
    File,
    /// Remote resource fetched over the network.
    Remote,
    /// Synthetic `texture:<id>` URL addressing an externally supplied GPU
    /// texture; bypasses the load pipeline entirely.
    Texture,
}

/// An image resource location plus its scheme classification.
///
/// Equality and hashing use the full string form, so two spellings of the
/// same file are distinct cache entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VisualUrl {
    url: String,
    protocol: UrlProtocol,
}

const TEXTURE_SCHEME: &str = "texture:";

fn classify(url: &str) -> UrlProtocol {
    let lower_prefix = |prefix: &str| {
        url.len() >= prefix.len() && url[..prefix.len()].eq_ignore_ascii_case(prefix)
    };
    if lower_prefix(TEXTURE_SCHEME) {
        UrlProtocol::Texture
    } else if lower_prefix("http://") || lower_prefix("https://") || lower_prefix("ftp://") {
        UrlProtocol::Remote
    } else {
        UrlProtocol::File
    }
}

impl VisualUrl {
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        let protocol = classify(&url);
        Self { url, protocol }
    }

    /// Synthetic URL for an externally supplied texture.
    pub fn for_texture(id: TextureId) -> Self {
        Self::new(format!("{TEXTURE_SCHEME}{id}"))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn protocol(&self) -> UrlProtocol {
        self.protocol
    }

    /// Local resources are dispatched to the local loader pool, everything
    /// else to the remote pool.
    pub fn is_local(&self) -> bool {
        self.protocol == UrlProtocol::File
    }

    /// The part after the scheme for `texture:` URLs, or the whole string
    /// otherwise.
    pub fn location(&self) -> &str {
        match self.protocol {
            UrlProtocol::Texture => &self.url[TEXTURE_SCHEME.len()..],
            _ => &self.url,
        }
    }

    /// Parses the texture id out of a `texture:<id>` URL.
    pub fn texture_id(&self) -> Option<TextureId> {
        if self.protocol != UrlProtocol::Texture {
            return None;
        }
        self.location().parse::<u32>().ok().map(TextureId)
    }

    /// Filesystem path for local resources, with any `file://` prefix
    /// stripped.
    pub fn file_path(&self) -> &str {
        self.url
            .strip_prefix("file://")
            .unwrap_or(self.url.as_str())
    }
}

impl fmt::Display for VisualUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

impl From<&str> for VisualUrl {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}
