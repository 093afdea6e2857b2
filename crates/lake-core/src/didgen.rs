//! Deterministic domain identifiers.
//!
//! An id is the entity tag followed by every key part as `:<byte-length>:<text>`,
//! e.g. `GithubPullRequest:1:7:2:42`. Tags never contain `:` and every part is
//! length-prefixed, so the encoding is injective and [`DomainIdGenerator::parse`]
//! recovers the exact tuple.

use std::fmt::{self, Write as _};

use crate::PipelineError;

/// One component of a native key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyPart {
    Unsigned(u64),
    Signed(i64),
    Text(String),
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Unsigned(v) => write!(f, "{v}"),
            KeyPart::Signed(v) => write!(f, "{v}"),
            KeyPart::Text(v) => f.write_str(v),
        }
    }
}

macro_rules! key_part_from {
    ($variant:ident as $target:ty: $($t:ty),+) => {
        $(
            impl From<$t> for KeyPart {
                fn from(value: $t) -> Self {
                    KeyPart::$variant(value as $target)
                }
            }
        )+
    };
}

key_part_from!(Unsigned as u64: u64, u32, u16, u8, usize);
key_part_from!(Signed as i64: i64, i32, i16, i8);

impl From<&str> for KeyPart {
    fn from(value: &str) -> Self {
        KeyPart::Text(value.to_string())
    }
}

impl From<String> for KeyPart {
    fn from(value: String) -> Self {
        KeyPart::Text(value)
    }
}

impl From<&String> for KeyPart {
    fn from(value: &String) -> Self {
        KeyPart::Text(value.clone())
    }
}

const fn is_valid_tag(tag: &str) -> bool {
    let bytes = tag.as_bytes();
    if bytes.is_empty() {
        return false;
    }
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if !(c.is_ascii_alphanumeric() || c == b'_' || c == b'.' || c == b'-') {
            return false;
        }
        i += 1;
    }
    true
}

/// Id generator bound to one entity type tag.
///
/// Construct generators as constants so an invalid tag fails the build:
///
/// ```
/// use lake_core::DomainIdGenerator;
///
/// const PR_IDS: DomainIdGenerator = DomainIdGenerator::new("GithubPullRequest");
/// assert_eq!(PR_IDS.generate(&[7u64.into(), 42u64.into()]), "GithubPullRequest:1:7:2:42");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainIdGenerator {
    tag: &'static str,
}

impl DomainIdGenerator {
    /// # Panics
    ///
    /// Panics when `tag` is empty or contains characters outside `[A-Za-z0-9_.-]`.
    pub const fn new(tag: &'static str) -> Self {
        assert!(is_valid_tag(tag), "domain id tag must match [A-Za-z0-9_.-]+");
        Self { tag }
    }

    pub fn tag(&self) -> &'static str {
        self.tag
    }

    pub fn generate(&self, parts: &[KeyPart]) -> String {
        encode(self.tag, parts)
    }

    pub fn parse(id: &str) -> Result<ParsedDomainId, PipelineError> {
        parse(id)
    }
}

/// Generate an id for an ad-hoc tag.
///
/// # Panics
///
/// Panics when `tag` is not a valid tag; see [`DomainIdGenerator::new`].
pub fn generate(tag: &str, parts: &[KeyPart]) -> String {
    assert!(is_valid_tag(tag), "invalid domain id tag {tag:?}");
    encode(tag, parts)
}

fn encode(tag: &str, parts: &[KeyPart]) -> String {
    let mut out = String::with_capacity(tag.len() + parts.len() * 8);
    out.push_str(tag);
    for part in parts {
        let text = part.to_string();
        let _ = write!(out, ":{}:{}", text.len(), text);
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDomainId {
    pub tag: String,
    pub parts: Vec<String>,
}

fn parse(id: &str) -> Result<ParsedDomainId, PipelineError> {
    let invalid = |why: &str| PipelineError::conversion(format!("invalid domain id {id:?}: {why}"));

    let (tag, mut rest) = match id.split_once(':') {
        Some((tag, rest)) => (tag, Some(rest)),
        None => (id, None),
    };
    if !is_valid_tag(tag) {
        return Err(invalid("bad tag"));
    }

    let mut parts = Vec::new();
    while let Some(remaining) = rest {
        let (len_text, tail) = remaining
            .split_once(':')
            .ok_or_else(|| invalid("missing length separator"))?;
        let len: usize = len_text.parse().map_err(|_| invalid("bad length prefix"))?;
        let part = tail.get(..len).ok_or_else(|| invalid("truncated part"))?;
        parts.push(part.to_string());
        let after = &tail[len..];
        rest = if after.is_empty() {
            None
        } else {
            Some(after.strip_prefix(':').ok_or_else(|| invalid("trailing bytes"))?)
        };
    }

    Ok(ParsedDomainId {
        tag: tag.to_string(),
        parts,
    })
}
