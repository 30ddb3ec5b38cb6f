//! Purpose: Model validated locations inside the remote document tree.
//! Exports: `DbPath`.
//! Role: Shared addressing type for stores, collections, and change events.
//! Invariants: Segments are non-empty and never contain `.`, `$`, `#`, `[`, `]`, `/`,
//! or ASCII control characters.
//! Invariants: The empty segment list is the root; display form is `/a/b` (root: `/`).
use std::fmt;

use super::error::{ApiResult, Error, ErrorKind};

const MAX_SEGMENT_BYTES: usize = 768;
const FORBIDDEN: [char; 5] = ['.', '$', '#', '[', ']'];

#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct DbPath {
    segments: Vec<String>,
}

impl DbPath {
    pub fn root() -> Self {
        Self::default()
    }

    /// Parses a slash-separated location; empty components are ignored.
    pub fn parse(raw: &str) -> ApiResult<Self> {
        let mut segments = Vec::new();
        for segment in raw.split('/').filter(|segment| !segment.is_empty()) {
            validate_segment(segment).map_err(|err| err.with_path(raw))?;
            segments.push(segment.to_string());
        }
        Ok(Self { segments })
    }

    pub fn child(&self, key: &str) -> ApiResult<Self> {
        let mut child = self.clone();
        for segment in key.split('/').filter(|segment| !segment.is_empty()) {
            validate_segment(segment).map_err(|err| err.with_path(self).with_key(key))?;
            child.segments.push(segment.to_string());
        }
        if child.segments.len() == self.segments.len() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("child key must not be empty")
                .with_path(self));
        }
        Ok(child)
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn leaf(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn starts_with(&self, prefix: &DbPath) -> bool {
        self.segments.starts_with(&prefix.segments)
    }

    /// Remaining segments below `prefix`, or `None` when `prefix` is not an ancestor.
    pub fn strip_prefix(&self, prefix: &DbPath) -> Option<&[String]> {
        self.segments.strip_prefix(prefix.segments.as_slice())
    }
}

impl fmt::Display for DbPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return write!(f, "/");
        }
        for segment in &self.segments {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

fn validate_segment(segment: &str) -> ApiResult<()> {
    if segment.len() > MAX_SEGMENT_BYTES {
        return Err(Error::new(ErrorKind::Usage)
            .with_message(format!("path segment exceeds {MAX_SEGMENT_BYTES} bytes")));
    }
    if let Some(ch) = segment
        .chars()
        .find(|ch| FORBIDDEN.contains(ch) || ch.is_ascii_control())
    {
        return Err(Error::new(ErrorKind::Usage)
            .with_message(format!("path segment contains forbidden character {ch:?}"))
            .with_hint("Keys must not contain '.', '$', '#', '[', ']' or control characters."));
    }
    Ok(())
}
