//! Domain newtypes with validation
//!
//! Strongly-typed wrappers for paths and identifiers. Each newtype ensures
//! data validity at construction time.

use std::borrow::Cow;
use std::fmt::{self, Display, Formatter};
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::DomainError;

// ============================================================================
// Path handling
// ============================================================================

/// How path keys are compared inside the index and the debounce queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathCase {
    /// Byte-for-byte comparison (Linux filesystems)
    #[default]
    Sensitive,
    /// Unicode lowercase folding before comparison
    Insensitive,
}

impl PathCase {
    /// Fold a path string into its comparison key
    #[must_use]
    pub fn fold<'a>(&self, value: &'a str) -> Cow<'a, str> {
        match self {
            Self::Sensitive => Cow::Borrowed(value),
            Self::Insensitive => Cow::Owned(value.to_lowercase()),
        }
    }
}

/// A path relative to the watched root
///
/// Stored as `/`-separated components without a leading slash. The empty
/// path denotes the root itself. `.` components are dropped and `..` is
/// rejected, so every `LocalPath` stays inside the root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LocalPath(String);

impl LocalPath {
    /// The watched root
    #[must_use]
    pub fn root() -> Self {
        Self(String::new())
    }

    /// Parse a `/`-separated relative path
    pub fn new(path: impl AsRef<str>) -> Result<Self, DomainError> {
        let raw = path.as_ref();
        if raw.contains('\0') {
            return Err(DomainError::InvalidPath(raw.to_string()));
        }

        let mut parts = Vec::new();
        for segment in raw.split('/') {
            match segment {
                "" | "." => continue,
                ".." => return Err(DomainError::InvalidPath(raw.to_string())),
                other => parts.push(other),
            }
        }
        Ok(Self(parts.join("/")))
    }

    /// Build a relative path from an absolute filesystem path under `root`
    pub fn from_absolute(root: &Path, absolute: &Path) -> Result<Self, DomainError> {
        let relative = absolute
            .strip_prefix(root)
            .map_err(|_| DomainError::PathNotInRoot(absolute.display().to_string()))?;

        let mut parts = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => {
                    let part = part.to_str().ok_or_else(|| {
                        DomainError::InvalidPath(absolute.display().to_string())
                    })?;
                    parts.push(part);
                }
                Component::CurDir => {}
                _ => return Err(DomainError::InvalidPath(absolute.display().to_string())),
            }
        }
        Ok(Self(parts.join("/")))
    }

    /// Resolve this path against the watched root
    #[must_use]
    pub fn to_absolute(&self, root: &Path) -> PathBuf {
        let mut absolute = root.to_path_buf();
        for part in self.components() {
            absolute.push(part);
        }
        absolute
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Path segments from the root down
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|part| !part.is_empty())
    }

    /// Number of segments; the root has depth 0
    #[must_use]
    pub fn depth(&self) -> usize {
        self.components().count()
    }

    /// Final segment, `None` for the root
    #[must_use]
    pub fn file_name(&self) -> Option<&str> {
        self.components().last()
    }

    /// Parent path, `None` for the root
    #[must_use]
    pub fn parent(&self) -> Option<LocalPath> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(index) => Some(Self(self.0[..index].to_string())),
            None => Some(Self::root()),
        }
    }

    /// Strict ancestors, nearest first, ending with the root
    #[must_use]
    pub fn ancestors(&self) -> Vec<LocalPath> {
        let mut ancestors = Vec::new();
        let mut current = self.parent();
        while let Some(path) = current {
            current = path.parent();
            ancestors.push(path);
        }
        ancestors
    }

    /// Append a single segment
    pub fn join(&self, name: &str) -> Result<Self, DomainError> {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(DomainError::InvalidPath(name.to_string()));
        }
        if self.is_root() {
            Ok(Self(name.to_string()))
        } else {
            Ok(Self(format!("{}/{}", self.0, name)))
        }
    }

    /// Comparison key under the given case rule
    #[must_use]
    pub fn key(&self, case: PathCase) -> String {
        case.fold(&self.0).into_owned()
    }

    /// Whether both paths name the same entry
    #[must_use]
    pub fn same(&self, other: &LocalPath, case: PathCase) -> bool {
        case.fold(&self.0) == case.fold(&other.0)
    }

    /// Whether `other` is this path or lies beneath it
    #[must_use]
    pub fn contains(&self, other: &LocalPath, case: PathCase) -> bool {
        if self.is_root() {
            return true;
        }
        let outer = case.fold(&self.0);
        let inner = case.fold(&other.0);
        inner.starts_with(outer.as_ref())
            && (inner.len() == outer.len() || inner.as_bytes()[outer.len()] == b'/')
    }

    /// Whether `other` lies beneath this path
    #[must_use]
    pub fn strictly_contains(&self, other: &LocalPath, case: PathCase) -> bool {
        self.contains(other, case) && !self.same(other, case)
    }

    /// Whether one of the two paths contains the other
    #[must_use]
    pub fn overlaps(&self, other: &LocalPath, case: PathCase) -> bool {
        self.contains(other, case) || other.contains(self, case)
    }

    /// Move this path from under `from` to under `to`
    ///
    /// Returns `None` when the path is not at or below `from`.
    #[must_use]
    pub fn rebase(&self, from: &LocalPath, to: &LocalPath, case: PathCase) -> Option<LocalPath> {
        if !from.contains(self, case) {
            return None;
        }
        let mut parts: Vec<&str> = to.components().collect();
        parts.extend(self.components().skip(from.depth()));
        Some(Self(parts.join("/")))
    }
}

impl Display for LocalPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.0)
    }
}

impl FromStr for LocalPath {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for LocalPath {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<LocalPath> for String {
    fn from(path: LocalPath) -> Self {
        path.0
    }
}

// ============================================================================
// Identifiers
// ============================================================================

/// Monotonic identity of a pending change
///
/// Allocation order is causal order: a smaller id was observed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeId(u64);

impl ChangeId {
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl Display for ChangeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifier of an in-flight upload or download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(Uuid);

impl TransferId {
    /// Create a new random TransferId
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a TransferId from an existing UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for TransferId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TransferId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| DomainError::InvalidId(format!("Invalid TransferId: {e}")))
    }
}

/// Opaque server-side identifier of an entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RemoteId(String);

impl RemoteId {
    pub fn new(id: impl Into<String>) -> Result<Self, DomainError> {
        let id = id.into();
        if id.trim().is_empty() || id.chars().any(char::is_control) {
            return Err(DomainError::InvalidRemoteId(id));
        }
        Ok(Self(id))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RemoteId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for RemoteId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RemoteId> for String {
    fn from(id: RemoteId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> LocalPath {
        LocalPath::new(s).unwrap()
    }

    #[test]
    fn test_local_path_normalizes_separators() {
        assert_eq!(path("/a//b/./c/").as_str(), "a/b/c");
        assert!(path("/").is_root());
        assert!(path("").is_root());
        assert!(LocalPath::new("a/../b").is_err());
    }

    #[test]
    fn test_local_path_display_has_leading_slash() {
        assert_eq!(path("docs/report.txt").to_string(), "/docs/report.txt");
        assert_eq!(LocalPath::root().to_string(), "/");
    }

    #[test]
    fn test_parent_and_ancestors() {
        let p = path("a/b/c.txt");
        assert_eq!(p.parent(), Some(path("a/b")));
        assert_eq!(path("a").parent(), Some(LocalPath::root()));
        assert_eq!(LocalPath::root().parent(), None);
        assert_eq!(
            p.ancestors(),
            vec![path("a/b"), path("a"), LocalPath::root()]
        );
        assert_eq!(p.file_name(), Some("c.txt"));
        assert_eq!(p.depth(), 3);
    }

    #[test]
    fn test_contains_respects_segment_boundaries() {
        let case = PathCase::Sensitive;
        assert!(path("a").contains(&path("a/b"), case));
        assert!(path("a").contains(&path("a"), case));
        assert!(!path("a").contains(&path("ab"), case));
        assert!(!path("a/b").contains(&path("a"), case));
        assert!(LocalPath::root().contains(&path("x/y"), case));
        assert!(path("a").strictly_contains(&path("a/b"), case));
        assert!(!path("a").strictly_contains(&path("a"), case));
        assert!(path("a/b").overlaps(&path("a"), case));
        assert!(!path("a/b").overlaps(&path("a/c"), case));
    }

    #[test]
    fn test_insensitive_comparison() {
        let case = PathCase::Insensitive;
        assert!(path("Docs").contains(&path("docs/File.txt"), case));
        assert!(path("Docs/A").same(&path("docs/a"), case));
        assert!(!path("Docs/A").same(&path("docs/a"), PathCase::Sensitive));
        assert_eq!(path("Docs/A").key(case), "docs/a");
    }

    #[test]
    fn test_rebase() {
        let case = PathCase::Sensitive;
        assert_eq!(
            path("f/sub/child.txt").rebase(&path("f"), &path("g/h"), case),
            Some(path("g/h/sub/child.txt"))
        );
        assert_eq!(path("f").rebase(&path("f"), &path("g"), case), Some(path("g")));
        assert_eq!(path("other").rebase(&path("f"), &path("g"), case), None);
    }

    #[test]
    fn test_from_absolute_and_back() {
        let root = Path::new("/srv/sync");
        let p = LocalPath::from_absolute(root, Path::new("/srv/sync/a/b.txt")).unwrap();
        assert_eq!(p, path("a/b.txt"));
        assert_eq!(p.to_absolute(root), PathBuf::from("/srv/sync/a/b.txt"));
        assert!(LocalPath::from_absolute(root, Path::new("/srv/sync")).unwrap().is_root());
        assert!(matches!(
            LocalPath::from_absolute(root, Path::new("/etc/passwd")),
            Err(DomainError::PathNotInRoot(_))
        ));
    }

    #[test]
    fn test_join_rejects_separators() {
        assert_eq!(LocalPath::root().join("a").unwrap(), path("a"));
        assert_eq!(path("a").join("b").unwrap(), path("a/b"));
        assert!(path("a").join("b/c").is_err());
        assert!(path("a").join("..").is_err());
    }

    #[test]
    fn test_change_id_ordering() {
        assert!(ChangeId::new(1) < ChangeId::new(2));
        assert_eq!(ChangeId::new(7).to_string(), "#7");
    }

    #[test]
    fn test_transfer_id_parse() {
        let id = TransferId::new();
        let parsed: TransferId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<TransferId>().is_err());
    }

    #[test]
    fn test_remote_id_validation() {
        assert!(RemoteId::new("01ABCDEF!123").is_ok());
        assert!(RemoteId::new("  ").is_err());
        assert!(RemoteId::new("bad\nid").is_err());
    }

    #[test]
    fn test_local_path_serde_as_string() {
        let p = path("a/b");
        let yaml = serde_yaml::to_string(&p).unwrap();
        assert_eq!(yaml.trim(), "a/b");
        let back: LocalPath = serde_yaml::from_str("/a//b").unwrap();
        assert_eq!(back, p);
        assert!(serde_yaml::from_str::<LocalPath>("x/../y").is_err());
    }
}
