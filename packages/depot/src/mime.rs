// Best-effort content type detection
use crate::config::LimitsConfig;

/// Classifies uploads by magic bytes, then filename, then declared type
#[derive(Debug, Clone)]
pub struct MimeSniffer {
    prefix_len: usize,
    default_type: String,
}

impl MimeSniffer {
    pub fn new(prefix_len: usize, default_type: impl Into<String>) -> Self {
        Self {
            prefix_len,
            default_type: default_type.into(),
        }
    }

    pub fn from_limits(limits: &LimitsConfig) -> Self {
        Self::new(limits.sniff_prefix_len, limits.default_content_type.clone())
    }

    /// How many leading bytes `detect` looks at
    pub fn prefix_len(&self) -> usize {
        self.prefix_len
    }

    /// Pure and bounded: only the first `prefix_len` bytes are inspected
    pub fn detect(&self, prefix: &[u8], filename: Option<&str>, declared: Option<&str>) -> String {
        let prefix = &prefix[..prefix.len().min(self.prefix_len)];

        if let Some(kind) = infer::get(prefix) {
            return kind.mime_type().to_string();
        }

        if let Some(guess) = filename.and_then(|name| mime_guess::from_path(name).first()) {
            return guess.essence_str().to_string();
        }

        if let Some(declared) = declared.map(str::trim).filter(|d| is_usable_declared(d)) {
            return declared.to_string();
        }

        if looks_like_text(prefix) {
            return "text/plain".to_string();
        }

        self.default_type.clone()
    }
}

fn is_usable_declared(declared: &str) -> bool {
    !declared.is_empty()
        && declared.contains('/')
        && !declared.eq_ignore_ascii_case("application/octet-stream")
}

fn looks_like_text(prefix: &[u8]) -> bool {
    if prefix.is_empty() || prefix.contains(&0) {
        return false;
    }
    match std::str::from_utf8(prefix) {
        Ok(_) => true,
        // A multi-byte sequence cut off at the end of the prefix is still text
        Err(e) => e.error_len().is_none() && e.valid_up_to() + 4 > prefix.len(),
    }
}
