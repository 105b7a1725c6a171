//! Maps request URI tails onto file paths inside the cache root.
//!
//! The layout mirrors the upstream hierarchy: `/org/example/lib/1.0/lib.jar`
//! is stored at `{root}/org/example/lib/1.0/lib.jar`.  The query string, if
//! any, stays part of the final path component.

use std::path::{Component, Path, PathBuf};

use tracing::warn;

use super::TEMP_SUFFIX;

/// Why a URI tail has no cache location.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LocateError {
    /// The tail would resolve outside the cache root.
    #[error("request path escapes the cache root: {0:?}")]
    Traversal(String),
    /// The tail names a directory (the root itself or a trailing `/`) or an
    /// in-progress cache file.
    #[error("request path cannot be cached: {0:?}")]
    Uncacheable(String),
}

/// Computes cache paths under a fixed root directory.
#[derive(Debug, Clone)]
pub struct CacheLocator {
    root: PathBuf,
}

impl CacheLocator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Return `{root}/{uri_tail}` for a tail upstream would resolve to the
    /// same resource.
    ///
    /// Pure: touches nothing on disk.  Tails that climb above the root or
    /// contain segments the platform would not treat as a plain file name
    /// are rejected.  Tails with empty, `.` or `..` segments, or a `/` in the
    /// query, are proxied verbatim and so are never given a cache path: the
    /// file they would be stored under is not the resource upstream serves.
    /// The query string, if any, stays part of the final file name.
    pub fn locate(&self, uri_tail: &str) -> Result<PathBuf, LocateError> {
        let (path, query) = match uri_tail.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (uri_tail, None),
        };
        let path = path.strip_prefix('/').unwrap_or(path);

        let mut segments: Vec<&str> = Vec::new();
        let mut verbatim = true;
        for segment in path.split('/') {
            match segment {
                "" | "." => verbatim = false,
                ".." => {
                    verbatim = false;
                    if segments.pop().is_none() {
                        return Err(LocateError::Traversal(uri_tail.to_string()));
                    }
                }
                other => {
                    if !is_plain_file_name(other) {
                        return Err(LocateError::Traversal(uri_tail.to_string()));
                    }
                    segments.push(other);
                }
            }
        }

        let uncacheable = || LocateError::Uncacheable(uri_tail.to_string());
        if !verbatim {
            return Err(uncacheable());
        }
        let Some(last) = segments.pop() else {
            return Err(uncacheable());
        };

        let file_name = match query {
            Some(query) if query.contains(['/', '\\', '\0']) => return Err(uncacheable()),
            Some(query) => format!("{last}?{query}"),
            None => last.to_string(),
        };
        if file_name.ends_with(TEMP_SUFFIX) {
            return Err(uncacheable());
        }

        let mut path = self.root.clone();
        path.extend(segments);
        path.push(file_name);
        Ok(path)
    }
}

/// Recursively create the parent directories of `path`.
///
/// Failure is only logged: the caller goes on and the following file create
/// reports the real problem.
pub async fn ensure_parent(path: &Path) {
    let Some(parent) = path.parent() else {
        return;
    };
    if let Err(e) = tokio::fs::create_dir_all(parent).await {
        warn!(
            error = %e,
            dir = %parent.display(),
            "failed to create cache directory"
        );
    }
}

fn is_plain_file_name(segment: &str) -> bool {
    if segment.contains('\\') || segment.contains('\0') {
        return false;
    }
    let mut components = Path::new(segment).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}
