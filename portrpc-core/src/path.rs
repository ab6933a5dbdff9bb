// Paths name a position inside an envelope: a sequence of string keys
// (mapping members) and integer indices (sequence positions).

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl PathSegment {
    pub fn as_key(&self) -> Option<&str> {
        match self {
            PathSegment::Key(key) => Some(key),
            PathSegment::Index(_) => None,
        }
    }
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        PathSegment::Key(key.to_string())
    }
}

impl From<String> for PathSegment {
    fn from(key: String) -> Self {
        PathSegment::Key(key)
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        PathSegment::Index(index)
    }
}

/// An owned path from the envelope root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Path(Vec<PathSegment>);

impl Path {
    pub fn new(segments: Vec<PathSegment>) -> Self {
        Path(segments)
    }

    pub fn root() -> Self {
        Path(Vec::new())
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn first(&self) -> Option<&PathSegment> {
        self.0.first()
    }

    /// True if the first segment is the string key `key`.
    pub fn starts_with_key(&self, key: &str) -> bool {
        matches!(self.0.first(), Some(PathSegment::Key(k)) if k == key)
    }

    pub fn child(&self, segment: impl Into<PathSegment>) -> Path {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Path(segments)
    }

    pub fn into_segments(self) -> Vec<PathSegment> {
        self.0
    }
}

impl From<Vec<PathSegment>> for Path {
    fn from(segments: Vec<PathSegment>) -> Self {
        Path(segments)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "<root>");
        }
        for segment in &self.0 {
            match segment {
                PathSegment::Key(key) => write!(f, "[{:?}]", key)?,
                PathSegment::Index(index) => write!(f, "[{}]", index)?,
            }
        }
        Ok(())
    }
}

/// Mutable stack of segments maintained while walking a value graph.
#[derive(Debug, Clone, Default)]
pub struct PathTracker {
    segments: Vec<PathSegment>,
}

impl PathTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the tracker below an existing prefix, e.g. `["vt_global"]`.
    pub fn with_prefix(prefix: Vec<PathSegment>) -> Self {
        Self { segments: prefix }
    }

    pub fn push(&mut self, segment: impl Into<PathSegment>) {
        self.segments.push(segment.into());
    }

    pub fn push_key(&mut self, key: &str) {
        self.segments.push(PathSegment::Key(key.to_string()));
    }

    pub fn push_index(&mut self, index: usize) {
        self.segments.push(PathSegment::Index(index));
    }

    pub fn pop(&mut self) -> Option<PathSegment> {
        self.segments.pop()
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    pub fn current(&self) -> Path {
        Path(self.segments.clone())
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }
}
