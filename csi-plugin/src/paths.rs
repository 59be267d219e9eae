//! Filesystem layout for CSI plugin containers.
//!
//! Every plugin container owns a directory under the CSI root:
//!
//! ```text
//! <root>/<plugin type>/<plugin name>/containers/<container id>/
//!     endpoint -> <tmp>/rp-csi-<uuid>    (real endpoint directory)
//!     pid
//! ```
//!
//! The endpoint socket lives in the real directory, outside the root, so that
//! the socket path stays short enough for `sun_path`. The `endpoint` symlink
//! is the only record of where it is, so cleanup must resolve the symlink
//! before deleting anything.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use regex::Regex;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CONTAINERS_DIR: &str = "containers";
pub const ENDPOINT_DIR_SYMLINK: &str = "endpoint";
pub const ENDPOINT_SOCKET_FILE: &str = "endpoint.sock";
pub const PID_FILE: &str = "pid";

const ENDPOINT_DIR_PREFIX: &str = "rp-csi-";

#[derive(Debug, Error)]
pub enum PathError {
    #[error("invalid {what} '{value}': {reason}")]
    InvalidComponent {
        what: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("'{path}' is not a container path under '{root}'")]
    NotAContainerPath { path: String, root: String },

    #[error("invalid pattern '{0}'")]
    InvalidPattern(String, #[source] regex::Error),

    #[error("invalid pid file '{0}'")]
    InvalidPidFile(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, PathError>;

/// A container path parsed back into its components.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerPath {
    pub plugin_type: String,
    pub plugin_name: String,
    pub container_id: String,
}

impl fmt::Display for ContainerPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.plugin_type, self.plugin_name, self.container_id
        )
    }
}

/// Check that a value can be used as a single path component.
fn validate_component(what: &'static str, value: &str) -> Result<()> {
    let reason = if value.is_empty() {
        "must not be empty"
    } else if value == "." || value == ".." {
        "must not be a relative directory reference"
    } else if value.contains('/') || value.contains('\0') {
        "must not contain '/' or NUL"
    } else {
        return Ok(());
    };

    Err(PathError::InvalidComponent {
        what,
        value: value.to_string(),
        reason,
    })
}

/// Directory owned by one plugin container.
pub fn container_path(
    root: &Path,
    plugin_type: &str,
    plugin_name: &str,
    container_id: &str,
) -> Result<PathBuf> {
    validate_component("plugin type", plugin_type)?;
    validate_component("plugin name", plugin_name)?;
    validate_component("container id", container_id)?;

    Ok(root
        .join(plugin_type)
        .join(plugin_name)
        .join(CONTAINERS_DIR)
        .join(container_id))
}

/// Well-known symlink the agent uses to find the real endpoint directory.
pub fn endpoint_dir_symlink_path(
    root: &Path,
    plugin_type: &str,
    plugin_name: &str,
    container_id: &str,
) -> Result<PathBuf> {
    Ok(container_path(root, plugin_type, plugin_name, container_id)?.join(ENDPOINT_DIR_SYMLINK))
}

/// Socket inside a (real) endpoint directory.
pub fn endpoint_socket_path(endpoint_dir: &Path) -> PathBuf {
    endpoint_dir.join(ENDPOINT_SOCKET_FILE)
}

pub fn pid_path(
    root: &Path,
    plugin_type: &str,
    plugin_name: &str,
    container_id: &str,
) -> Result<PathBuf> {
    Ok(container_path(root, plugin_type, plugin_name, container_id)?.join(PID_FILE))
}

/// Translate a shell-style wildcard (`*`, `?`) into an anchored regex.
fn wildcard_regex(pattern: &str) -> Result<Regex> {
    let mut expr = String::with_capacity(pattern.len() + 2);
    expr.push('^');
    for c in pattern.chars() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');

    Regex::new(&expr).map_err(|e| PathError::InvalidPattern(pattern.to_string(), e))
}

/// Subdirectories of `dir` with UTF-8 names; a missing `dir` yields nothing.
fn subdirectories(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            dirs.push((name.to_string(), entry.path()));
        }
    }
    Ok(dirs)
}

/// List existing container directories whose plugin type and name match the
/// given wildcard patterns. The result is sorted.
pub fn list_container_paths(
    root: &Path,
    type_pattern: &str,
    name_pattern: &str,
) -> Result<Vec<PathBuf>> {
    let type_re = wildcard_regex(type_pattern)?;
    let name_re = wildcard_regex(name_pattern)?;

    let mut paths = Vec::new();
    for (plugin_type, type_dir) in subdirectories(root)? {
        if !type_re.is_match(&plugin_type) {
            continue;
        }
        for (plugin_name, name_dir) in subdirectories(&type_dir)? {
            if !name_re.is_match(&plugin_name) {
                continue;
            }
            for (_, container_dir) in subdirectories(&name_dir.join(CONTAINERS_DIR))? {
                paths.push(container_dir);
            }
        }
    }

    paths.sort();
    Ok(paths)
}

/// Parse a container directory back into (type, name, container id).
pub fn parse_container_path(root: &Path, path: &Path) -> Result<ContainerPath> {
    let not_a_container_path = || PathError::NotAContainerPath {
        path: path.display().to_string(),
        root: root.display().to_string(),
    };

    let relative = path.strip_prefix(root).map_err(|_| not_a_container_path())?;
    let parts = relative
        .components()
        .map(|component| match component {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()
        .ok_or_else(not_a_container_path)?;

    match parts.as_slice() {
        [plugin_type, plugin_name, containers, container_id] if *containers == CONTAINERS_DIR => {
            validate_component("plugin type", plugin_type)?;
            validate_component("plugin name", plugin_name)?;
            validate_component("container id", container_id)?;
            Ok(ContainerPath {
                plugin_type: plugin_type.to_string(),
                plugin_name: plugin_name.to_string(),
                container_id: container_id.to_string(),
            })
        }
        _ => Err(not_a_container_path()),
    }
}

/// Resolve the endpoint symlink of a container, if there is one.
pub fn resolve_endpoint_dir(
    root: &Path,
    plugin_type: &str,
    plugin_name: &str,
    container_id: &str,
) -> Result<Option<PathBuf>> {
    let symlink = endpoint_dir_symlink_path(root, plugin_type, plugin_name, container_id)?;
    read_symlink(&symlink)
}

fn read_symlink(symlink: &Path) -> Result<Option<PathBuf>> {
    match fs::read_link(symlink) {
        Ok(target) if target.is_relative() => {
            let base = symlink.parent().unwrap_or(Path::new("/"));
            Ok(Some(base.join(target)))
        }
        Ok(target) => Ok(Some(target)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Create a fresh endpoint directory under `tmp_base` and point the
/// container's endpoint symlink at it. Any previous endpoint is removed.
pub fn prepare_endpoint_dir(
    root: &Path,
    plugin_type: &str,
    plugin_name: &str,
    container_id: &str,
    tmp_base: &Path,
) -> Result<PathBuf> {
    let container_dir = container_path(root, plugin_type, plugin_name, container_id)?;
    fs::create_dir_all(&container_dir)?;

    let symlink = container_dir.join(ENDPOINT_DIR_SYMLINK);
    remove_endpoint(&symlink)?;

    let endpoint_dir = tmp_base.join(format!(
        "{}{}",
        ENDPOINT_DIR_PREFIX,
        Uuid::new_v4().simple()
    ));
    fs::create_dir_all(tmp_base)?;
    fs::create_dir(&endpoint_dir)?;
    std::os::unix::fs::symlink(&endpoint_dir, &symlink)?;

    debug!(
        symlink = %symlink.display(),
        endpoint_dir = %endpoint_dir.display(),
        "Prepared endpoint directory"
    );
    Ok(endpoint_dir)
}

/// Delete the real endpoint directory behind `symlink`, then the symlink.
fn remove_endpoint(symlink: &Path) -> Result<()> {
    let metadata = match fs::symlink_metadata(symlink) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    if !metadata.file_type().is_symlink() {
        // Not ours to resolve; just clear the slot.
        if metadata.is_dir() {
            fs::remove_dir_all(symlink)?;
        } else {
            fs::remove_file(symlink)?;
        }
        return Ok(());
    }

    if let Some(endpoint_dir) = read_symlink(symlink)? {
        match fs::remove_dir_all(&endpoint_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    match fs::remove_file(symlink) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Remove everything a container left on disk: the real endpoint directory,
/// the endpoint symlink and the container directory. Empty parent
/// directories are pruned. Removing a container that is already gone is fine.
pub fn remove_container(
    root: &Path,
    plugin_type: &str,
    plugin_name: &str,
    container_id: &str,
) -> Result<()> {
    let container_dir = container_path(root, plugin_type, plugin_name, container_id)?;

    remove_endpoint(&container_dir.join(ENDPOINT_DIR_SYMLINK))?;

    match fs::remove_dir_all(&container_dir) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    // Prune containers/, <name>/ and <type>/ if they are now empty.
    let mut parent = container_dir.parent();
    while let Some(dir) = parent {
        if dir == root || fs::remove_dir(dir).is_err() {
            break;
        }
        parent = dir.parent();
    }

    Ok(())
}

pub fn write_pid(
    root: &Path,
    plugin_type: &str,
    plugin_name: &str,
    container_id: &str,
    pid: u32,
) -> Result<()> {
    let path = pid_path(root, plugin_type, plugin_name, container_id)?;
    fs::write(path, pid.to_string())?;
    Ok(())
}

pub fn read_pid(
    root: &Path,
    plugin_type: &str,
    plugin_name: &str,
    container_id: &str,
) -> Result<Option<u32>> {
    let path = pid_path(root, plugin_type, plugin_name, container_id)?;
    match fs::read_to_string(&path) {
        Ok(content) => content
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| PathError::InvalidPidFile(path.display().to_string())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
