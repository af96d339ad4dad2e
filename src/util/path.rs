use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// A path could not be mapped between the local and remote trees.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("{path} is not under {root}")]
    OutsideRoot { path: String, root: String },
    #[error("invalid path {0}: traversal or absolute segment")]
    InvalidPath(String),
}

/// Compute the relative path from `base` to `full`.
/// Returns a forward-slash separated string suitable for log fields and
/// platform-independent comparisons.
pub fn relative_path(base: &Path, full: &Path) -> Result<String, PathError> {
    let rel = full.strip_prefix(base).map_err(|_| outside(full, base))?;
    Ok(normal_segments(rel, full)?.join("/"))
}

/// Map a local path under `local_root` onto `remote_root`.
///
/// The result always uses `/` separators. `.` segments are dropped and `..`
/// segments are rejected, so the output can never escape `remote_root`.
pub fn to_remote(local_path: &Path, local_root: &Path, remote_root: &str) -> Result<String, PathError> {
    let rel = local_path
        .strip_prefix(local_root)
        .map_err(|_| outside(local_path, local_root))?;
    let segments = normal_segments(rel, local_path)?;
    Ok(join_remote(remote_root, &segments))
}

/// Inverse of [`to_remote`]: map a remote path under `remote_root` back onto
/// `local_root`.
pub fn to_local(remote_path: &str, remote_root: &str, local_root: &Path) -> Result<PathBuf, PathError> {
    let root = normalize_remote_root(remote_root);
    let remote = remote_path.replace('\\', "/");

    let rest = if root == "/" {
        remote.strip_prefix('/')
    } else if root.is_empty() {
        (!remote.starts_with('/')).then_some(remote.as_str())
    } else {
        remote
            .strip_prefix(root.as_str())
            .and_then(|r| if r.is_empty() { Some(r) } else { r.strip_prefix('/') })
    }
    .ok_or_else(|| PathError::OutsideRoot {
        path: remote_path.to_string(),
        root: remote_root.to_string(),
    })?;

    let mut local = local_root.to_path_buf();
    for segment in rest.split('/') {
        match segment {
            "" | "." => {}
            ".." => return Err(PathError::InvalidPath(remote_path.to_string())),
            s => local.push(s),
        }
    }
    Ok(local)
}

/// Parent directory of a remote path. `None` for the root or a bare name.
pub fn remote_parent(remote: &str) -> Option<&str> {
    let trimmed = remote.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some(("", _)) => Some("/"),
        Some((parent, _)) => Some(parent),
        None => None,
    }
}

/// Every directory from the top of `remote` down to `remote` itself.
///
/// `"/srv/www/app"` → `["/srv", "/srv/www", "/srv/www/app"]`
pub fn remote_ancestors(remote: &str) -> Vec<&str> {
    let trimmed = remote.trim_end_matches('/');
    let mut dirs: Vec<&str> = trimmed
        .match_indices('/')
        .map(|(i, _)| &trimmed[..i])
        .filter(|d| !d.is_empty())
        .collect();
    if !trimmed.is_empty() {
        dirs.push(trimmed);
    }
    dirs
}

/// Join one name onto a remote directory.
pub fn remote_child(dir: &str, name: &str) -> String {
    match dir.trim_end_matches('/') {
        "" if dir.starts_with('/') => format!("/{name}"),
        "" => name.to_string(),
        d => format!("{d}/{name}"),
    }
}

/// Remote directory as handed to a server listing call: no trailing slash,
/// except for the filesystem root itself.
pub fn remote_dir(remote: &str) -> &str {
    match remote.trim_end_matches('/') {
        "" if remote.starts_with('/') => "/",
        d => d,
    }
}

fn normal_segments(rel: &Path, original: &Path) -> Result<Vec<String>, PathError> {
    let mut segments = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(s) => segments.push(s.to_string_lossy().into_owned()),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(PathError::InvalidPath(original.display().to_string()));
            }
        }
    }
    Ok(segments)
}

fn normalize_remote_root(remote_root: &str) -> String {
    let root = remote_root.replace('\\', "/");
    if root.starts_with('/') && root.trim_matches('/').is_empty() {
        return "/".to_string();
    }
    root.trim_end_matches('/').to_string()
}

fn join_remote(remote_root: &str, segments: &[String]) -> String {
    let root = normalize_remote_root(remote_root);
    if segments.is_empty() {
        return root;
    }
    let rel = segments.join("/");
    match root.as_str() {
        "" => rel,
        "/" => format!("/{rel}"),
        r => format!("{r}/{rel}"),
    }
}

fn outside(path: &Path, root: &Path) -> PathError {
    PathError::OutsideRoot {
        path: path.display().to_string(),
        root: root.display().to_string(),
    }
}
