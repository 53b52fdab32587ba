//! Mount specifications: `host[:container]` pairs.
//!
//! Host paths are resolved through the filesystem (symlinks followed, missing
//! tails tolerated). Container paths are normalized lexically only, so a
//! symlinked workspace root survives unchanged in the mount target.

use crate::error::LlmboxError;
use dirs::home_dir;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

pub const WORKSPACE_ROOT: &str = "/home/llm/workspace";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VolumeMount {
    host: PathBuf,
    container: PathBuf,
}

impl VolumeMount {
    pub fn host(&self) -> &Path {
        &self.host
    }

    pub fn container(&self) -> &Path {
        &self.container
    }

    /// The `host:container` form used on disk and on the runtime command line.
    pub fn spec(&self) -> String {
        format!("{}:{}", self.host().display(), self.container().display())
    }
}

impl fmt::Display for VolumeMount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.spec())
    }
}

pub fn parse_mount_spec(
    spec: &str,
    cwd: &Path,
    allow_missing: bool,
) -> Result<VolumeMount, LlmboxError> {
    parse_mount_spec_with_root(spec, cwd, allow_missing, Path::new(WORKSPACE_ROOT))
}

pub fn parse_mount_spec_with_root(
    spec: &str,
    cwd: &Path,
    allow_missing: bool,
    workspace_root: &Path,
) -> Result<VolumeMount, LlmboxError> {
    let (host_part, container_part) = match spec.split_once(':') {
        Some((host, container)) => (host, Some(container)),
        None => (spec, None),
    };
    if host_part.is_empty() {
        return Err(LlmboxError::InvalidSpec(format!(
            "'{spec}' must include a host path"
        )));
    }

    let host = normalize_host_path(host_part, cwd)?;
    if !allow_missing && !host.exists() {
        return Err(LlmboxError::NotFound(format!(
            "host path does not exist: {}",
            host.display()
        )));
    }

    let container =
        normalize_container_path(container_part.filter(|c| !c.is_empty()), &host, workspace_root);
    Ok(VolumeMount { host, container })
}

/// Expands `~`, anchors relative paths at `cwd` and resolves symlinks for the
/// part of the path that exists. Missing trailing components are kept as-is.
pub fn normalize_host_path(path: &str, cwd: &Path) -> Result<PathBuf, LlmboxError> {
    let expanded = expand_home(path)?;
    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        cwd.join(expanded)
    };
    Ok(resolve_lenient(&absolute)?)
}

fn expand_home(path: &str) -> Result<PathBuf, LlmboxError> {
    if path != "~" && !path.starts_with("~/") {
        return Ok(PathBuf::from(path));
    }
    let home = home_dir().ok_or_else(|| {
        LlmboxError::InvalidSpec(format!(
            "unable to resolve $HOME while expanding '{path}'"
        ))
    })?;
    match path.strip_prefix("~/") {
        Some(rest) => Ok(home.join(rest)),
        None => Ok(home),
    }
}

const MAX_SYMLINK_HOPS: u32 = 40;

fn resolve_lenient(path: &Path) -> io::Result<PathBuf> {
    let mut hops = MAX_SYMLINK_HOPS;
    resolve_with_budget(path, &mut hops)
}

fn resolve_with_budget(path: &Path, hops: &mut u32) -> io::Result<PathBuf> {
    let mut resolved = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => resolved.push(prefix.as_os_str()),
            Component::RootDir => resolved.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            Component::Normal(name) => {
                let candidate = resolved.join(name);
                resolved = match fs::symlink_metadata(&candidate) {
                    Ok(meta) => match fs::canonicalize(&candidate) {
                        Ok(real) => real,
                        Err(err)
                            if err.kind() == io::ErrorKind::NotFound
                                && meta.file_type().is_symlink() =>
                        {
                            follow_dangling_link(&resolved, &candidate, hops)?
                        }
                        Err(err) if err.kind() == io::ErrorKind::NotFound => candidate,
                        Err(err) => return Err(err),
                    },
                    Err(err) if err.kind() == io::ErrorKind::NotFound => candidate,
                    Err(err) => return Err(err),
                };
            }
        }
    }
    Ok(resolved)
}

/// Resolves where a link with a missing target points. Relative targets are
/// taken from the link's own directory.
fn follow_dangling_link(parent: &Path, link: &Path, hops: &mut u32) -> io::Result<PathBuf> {
    if *hops == 0 {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("too many levels of symbolic links: {}", link.display()),
        ));
    }
    *hops -= 1;
    let target = fs::read_link(link)?;
    let absolute = if target.is_absolute() {
        target
    } else {
        parent.join(target)
    };
    resolve_with_budget(&absolute, hops)
}

fn normalize_container_path(path: Option<&str>, host: &Path, workspace_root: &Path) -> PathBuf {
    let target = match path {
        None => match host.file_name() {
            Some(name) => workspace_root.join(name),
            None => workspace_root.to_path_buf(),
        },
        Some(raw) => {
            let container = Path::new(raw);
            if container.is_absolute() {
                container.to_path_buf()
            } else {
                workspace_root.join(container)
            }
        }
    };
    normalize_lexically(&target)
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() && !out.has_root() {
                    out.push(component.as_os_str());
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Drops the mounts named by `targets` and returns the rest in order. A target
/// is a 1-based index, a full `host:container` spec, or a bare host path
/// (which removes every mount of that host directory).
pub fn remove_volume_targets<S: AsRef<str>>(
    volumes: &[VolumeMount],
    targets: &[S],
    cwd: &Path,
) -> Result<Vec<VolumeMount>, LlmboxError> {
    let mut doomed = vec![false; volumes.len()];
    for target in targets {
        let target = target.as_ref();
        if !target.is_empty() && target.chars().all(|c| c.is_ascii_digit()) {
            let index = target
                .parse::<usize>()
                .ok()
                .and_then(|n| n.checked_sub(1))
                .filter(|idx| *idx < volumes.len())
                .ok_or_else(|| {
                    LlmboxError::InvalidArgument(format!("volume number {target} is out of range"))
                })?;
            doomed[index] = true;
            continue;
        }

        let matches: Vec<usize> = if target.contains(':') {
            let mount = parse_mount_spec(target, cwd, true)?;
            positions(volumes, |volume| *volume == mount)
        } else {
            let host = normalize_host_path(target, cwd)?;
            positions(volumes, |volume| volume.host() == host)
        };
        if matches.is_empty() {
            return Err(LlmboxError::NotFound(format!("volume {target} not found")));
        }
        for idx in matches {
            doomed[idx] = true;
        }
    }
    Ok(volumes
        .iter()
        .zip(doomed)
        .filter(|(_, doomed)| !doomed)
        .map(|(volume, _)| volume.clone())
        .collect())
}

fn positions(volumes: &[VolumeMount], pred: impl Fn(&VolumeMount) -> bool) -> Vec<usize> {
    volumes
        .iter()
        .enumerate()
        .filter(|(_, volume)| pred(volume))
        .map(|(idx, _)| idx)
        .collect()
}
