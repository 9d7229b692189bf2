//! Structured gNMI path helpers.
//!
//! The cache and the matcher work on [`Elem`] sequences rather than the wire
//! [`Path`]: an elem is a name plus an ordered key map, which makes it usable
//! as a map key. An elem named `*` or a key valued `*` acts as a wildcard when
//! the elem is used as a pattern.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::gnmi::{Path, PathElem};

/// Wildcard name or key value.
pub const WILDCARD: &str = "*";

/// One segment of a structured path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Elem {
    pub name: String,
    pub keys: BTreeMap<String, String>,
}

impl Elem {
    /// Elem without keys.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            keys: BTreeMap::new(),
        }
    }

    /// Elem matching anything at its level.
    pub fn wildcard() -> Self {
        Self::new(WILDCARD)
    }

    /// Add a key constraint.
    pub fn with_key(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.keys.insert(key.into(), value.into());
        self
    }

    /// Whether this elem, read as a pattern, selects `other`.
    ///
    /// Keys present in the pattern must match; keys the pattern leaves out
    /// never disqualify.
    pub fn matches(&self, other: &Elem) -> bool {
        if self.name != WILDCARD && self.name != other.name {
            return false;
        }
        self.keys_match(&other.keys)
    }

    /// Key constraints only, ignoring the name.
    pub fn keys_match(&self, keys: &BTreeMap<String, String>) -> bool {
        self.keys
            .iter()
            .all(|(k, v)| v == WILDCARD || keys.get(k) == Some(v))
    }

    /// Drop keys valued `*`: they constrain nothing.
    pub fn normalized(&self) -> Self {
        Self {
            name: self.name.clone(),
            keys: self
                .keys
                .iter()
                .filter(|(_, v)| v.as_str() != WILDCARD)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

impl fmt::Display for Elem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for (k, v) in &self.keys {
            write!(f, "[{}={}]", k, v)?;
        }
        Ok(())
    }
}

impl From<&PathElem> for Elem {
    fn from(elem: &PathElem) -> Self {
        Self {
            name: elem.name.clone(),
            keys: elem
                .key
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

impl From<&Elem> for PathElem {
    fn from(elem: &Elem) -> Self {
        PathElem {
            name: elem.name.clone(),
            key: elem
                .keys
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<HashMap<_, _>>(),
        }
    }
}

/// Structured elems of a wire path.
///
/// Falls back to the deprecated string `element` form when `elem` is empty.
pub fn elems(path: &Path) -> Vec<Elem> {
    if !path.elem.is_empty() {
        return path.elem.iter().map(Elem::from).collect();
    }

    #[allow(deprecated)]
    let element = &path.element;
    element
        .iter()
        .flat_map(|segment| parse(segment))
        .collect()
}

/// Concatenate an optional prefix and an optional path.
pub fn join(prefix: Option<&Path>, path: Option<&Path>) -> Vec<Elem> {
    let mut joined = prefix.map(elems).unwrap_or_default();
    if let Some(path) = path {
        joined.extend(elems(path));
    }
    joined
}

/// Build a wire path from elems.
pub fn to_proto(elems: &[Elem]) -> Path {
    Path {
        elem: elems.iter().map(PathElem::from).collect(),
        ..Default::default()
    }
}

/// Render elems as `/a/b[k=v]/c`.
pub fn to_string(elems: &[Elem]) -> String {
    let mut out = String::new();
    for elem in elems {
        out.push('/');
        out.push_str(&elem.to_string());
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// Parse an XPath-like string into elems.
///
/// e.g. `/interfaces/interface[name=eth0]/state` yields three elems, the
/// second keyed by `name=eth0`. Multiple keys may be given either as
/// `[a=1][b=2]` or `[a=1,b=2]`.
pub fn parse(path: &str) -> Vec<Elem> {
    split_segments(path)
        .into_iter()
        .filter(|s| !s.is_empty())
        .map(parse_segment)
        .collect()
}

// Split on '/' outside of brackets so key values may contain slashes.
fn split_segments(path: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in path.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            '/' if depth == 0 => {
                segments.push(&path[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    segments.push(&path[start..]);
    segments
}

fn parse_segment(segment: &str) -> Elem {
    let Some(bracket_pos) = segment.find('[') else {
        return Elem::new(segment);
    };

    let mut elem = Elem::new(&segment[..bracket_pos]);
    for group in segment[bracket_pos..].split(']') {
        let group = group.trim_start_matches('[');
        for key_val in group.split(',') {
            if let Some((k, v)) = key_val.split_once('=') {
                elem.keys.insert(k.trim().to_string(), v.trim().to_string());
            }
        }
    }
    elem
}
