//! Named profiles stored one YAML file each under `<config_dir>/profiles`,
//! and the rules that keep the persisted default pointing at one of them.

use crate::error::LlmboxError;
use crate::settings::{write_atomic_text_file, State};
use crate::volumes::{parse_mount_spec, VolumeMount};
use serde::Serialize;
use serde_yaml::Value;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_PROFILE_NAME: &str = "default";
/// Stands for "the current default profile" wherever a profile is expected.
pub const CURRENT_DEFAULT_TOKEN: &str = "-";

pub fn validate_profile_name(name: &str) -> Result<&str, LlmboxError> {
    if name == CURRENT_DEFAULT_TOKEN {
        return Err(LlmboxError::InvalidName(
            "'-' is reserved for the current default profile".to_string(),
        ));
    }
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-');
    if name.is_empty() || !name.chars().all(allowed) {
        return Err(LlmboxError::InvalidName(format!(
            "'{name}': profile names must match [A-Za-z0-9._-]+"
        )));
    }
    if is_index_token(name) {
        return Err(LlmboxError::InvalidName(format!(
            "'{name}': profile names must contain at least one non-digit character"
        )));
    }
    Ok(name)
}

fn is_index_token(token: &str) -> bool {
    !token.is_empty() && token.chars().all(|c| c.is_ascii_digit())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileData {
    pub volumes: Vec<VolumeMount>,
}

#[derive(Serialize)]
struct StoredProfile {
    volumes: Vec<String>,
}

impl ProfileData {
    fn from_yaml(value: Value, path: &Path) -> Result<Self, LlmboxError> {
        let malformed = |detail: String| {
            LlmboxError::Malformed(format!("{}: {detail}", path.display()))
        };
        let mapping = match value {
            Value::Null => return Ok(Self::default()),
            Value::Mapping(mapping) => mapping,
            _ => return Err(malformed("profile must contain a mapping".to_string())),
        };

        let mut volumes = Vec::new();
        for (key, entry) in mapping {
            match key.as_str() {
                Some("volumes") => volumes = parse_stored_volumes(entry).map_err(malformed)?,
                Some(other) => return Err(malformed(format!("unknown field `{other}`"))),
                None => return Err(malformed("profile keys must be strings".to_string())),
            }
        }
        Ok(Self { volumes })
    }

    fn to_yaml(&self) -> Result<String, LlmboxError> {
        let stored = StoredProfile {
            volumes: self.volumes.iter().map(VolumeMount::spec).collect(),
        };
        Ok(serde_yaml::to_string(&stored)?)
    }
}

fn parse_stored_volumes(value: Value) -> Result<Vec<VolumeMount>, String> {
    let entries = match value {
        Value::Null => return Ok(Vec::new()),
        Value::Sequence(entries) => entries,
        _ => return Err("volumes must be a list".to_string()),
    };
    entries
        .into_iter()
        .map(|entry| match entry {
            Value::String(spec) => {
                parse_mount_spec(&spec, Path::new("/"), true).map_err(|err| err.to_string())
            }
            _ => Err("volume entries must be strings".to_string()),
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct ProfileStore {
    profiles_dir: PathBuf,
}

impl ProfileStore {
    pub fn new(profiles_dir: PathBuf) -> Self {
        Self { profiles_dir }
    }

    fn profile_path(&self, name: &str) -> Result<PathBuf, LlmboxError> {
        let name = validate_profile_name(name)?;
        Ok(self.profiles_dir.join(format!("{name}.yaml")))
    }

    pub fn list_profiles(&self) -> Result<Vec<String>, LlmboxError> {
        let mut names = Vec::new();
        if !self.profiles_dir.exists() {
            return Ok(names);
        }
        for entry in fs::read_dir(&self.profiles_dir)? {
            let path = entry?.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if validate_profile_name(stem).is_ok() {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn exists(&self, name: &str) -> Result<bool, LlmboxError> {
        Ok(self.profile_path(name)?.exists())
    }

    pub fn load(&self, name: &str) -> Result<ProfileData, LlmboxError> {
        let path = self.profile_path(name)?;
        if !path.exists() {
            return Err(not_found(name));
        }
        tracing::debug!(path = %path.display(), "loading profile");
        let content = fs::read_to_string(&path)?;
        let value: Value = if content.trim().is_empty() {
            Value::Null
        } else {
            serde_yaml::from_str(&content)
                .map_err(|err| LlmboxError::Malformed(format!("{}: {err}", path.display())))?
        };
        ProfileData::from_yaml(value, &path)
    }

    pub fn save(&self, name: &str, data: &ProfileData) -> Result<(), LlmboxError> {
        let path = self.profile_path(name)?;
        tracing::debug!(path = %path.display(), volumes = data.volumes.len(), "saving profile");
        write_atomic_text_file(&path, &data.to_yaml()?)
    }

    pub fn create(&self, name: &str) -> Result<ProfileData, LlmboxError> {
        if self.exists(name)? {
            return Err(already_exists(name));
        }
        let data = ProfileData::default();
        self.save(name, &data)?;
        Ok(data)
    }

    /// Loads the profile, creating an empty one first if it does not exist.
    /// The flag reports whether it was created.
    pub fn ensure(&self, name: &str) -> Result<(ProfileData, bool), LlmboxError> {
        if self.exists(name)? {
            return Ok((self.load(name)?, false));
        }
        Ok((self.create(name)?, true))
    }

    /// Stops at the first missing profile; earlier deletions are kept.
    pub fn delete<S: AsRef<str>>(&self, names: &[S]) -> Result<(), LlmboxError> {
        for name in names {
            let name = name.as_ref();
            let path = self.profile_path(name)?;
            if !path.exists() {
                return Err(not_found(name));
            }
            fs::remove_file(&path)?;
            tracing::debug!(path = %path.display(), "deleted profile");
        }
        Ok(())
    }

    pub fn rename(&self, old: &str, new: &str) -> Result<(), LlmboxError> {
        let old_path = self.profile_path(old)?;
        if !old_path.exists() {
            return Err(not_found(old));
        }
        let new_path = self.profile_path(new)?;
        if new_path.exists() {
            return Err(already_exists(new));
        }
        fs::rename(&old_path, &new_path)?;
        Ok(())
    }

    pub fn copy(&self, source: &str, destination: &str) -> Result<(), LlmboxError> {
        if source == destination {
            return Err(LlmboxError::InvalidArgument(
                "source and destination profiles must differ".to_string(),
            ));
        }
        let data = self.load(source)?;
        if self.exists(destination)? {
            return Err(already_exists(destination));
        }
        self.save(destination, &data)
    }
}

fn not_found(name: &str) -> LlmboxError {
    LlmboxError::NotFound(format!("profile {name} does not exist"))
}

fn already_exists(name: &str) -> LlmboxError {
    LlmboxError::AlreadyExists(format!("profile {name} already exists"))
}

/// The recorded default if it still exists, else the only profile, else none.
pub fn choose_existing_default(profiles: &[String], recorded: Option<&str>) -> Option<String> {
    if let Some(recorded) = recorded {
        if profiles.iter().any(|p| p == recorded) {
            return Some(recorded.to_string());
        }
    }
    match profiles {
        [only] => Some(only.clone()),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSelection {
    pub name: String,
    pub created: bool,
    /// Persist this as the new default when set.
    pub new_default: Option<String>,
    pub reassigned: bool,
}

impl RunSelection {
    fn existing(name: String) -> Self {
        Self {
            name,
            created: false,
            new_default: None,
            reassigned: false,
        }
    }

    fn reassigned(name: String) -> Self {
        Self {
            new_default: Some(name.clone()),
            name,
            created: false,
            reassigned: true,
        }
    }

    fn created(name: String) -> Self {
        Self {
            new_default: Some(name.clone()),
            name,
            created: true,
            reassigned: false,
        }
    }
}

/// Picks the profile `run` should use. An explicit request never moves the
/// default; an implicit one self-heals a missing or stale default.
pub fn resolve_profile_for_run(
    store: &ProfileStore,
    state: &State,
    requested: Option<&str>,
) -> Result<RunSelection, LlmboxError> {
    if let Some(requested) = requested.filter(|r| *r != CURRENT_DEFAULT_TOKEN) {
        let name = validate_profile_name(requested)?;
        if !store.exists(name)? {
            return Err(not_found(name));
        }
        return Ok(RunSelection::existing(name.to_string()));
    }

    let profiles = store.list_profiles()?;
    if let Some(recorded) = state.default_profile.as_deref() {
        if profiles.iter().any(|p| p == recorded) {
            return Ok(RunSelection::existing(recorded.to_string()));
        }
    }

    match profiles.as_slice() {
        [] => {
            store.create(DEFAULT_PROFILE_NAME)?;
            Ok(RunSelection::created(DEFAULT_PROFILE_NAME.to_string()))
        }
        [only] => Ok(RunSelection::reassigned(only.clone())),
        many if many.iter().any(|p| p == DEFAULT_PROFILE_NAME) => {
            Ok(RunSelection::reassigned(DEFAULT_PROFILE_NAME.to_string()))
        }
        _ => {
            store.create(DEFAULT_PROFILE_NAME)?;
            Ok(RunSelection::created(DEFAULT_PROFILE_NAME.to_string()))
        }
    }
}

/// Replacement default once the current one is gone: a profile literally
/// named `default` if any, else the smallest remaining name.
pub fn replacement_default(remaining: &[String]) -> Option<String> {
    if remaining.iter().any(|p| p == DEFAULT_PROFILE_NAME) {
        return Some(DEFAULT_PROFILE_NAME.to_string());
    }
    remaining.iter().min().cloned()
}

/// Updates `state` after `deleted` were removed. Returns the new default
/// when the recorded default was among them.
pub fn reassign_default_after_delete(
    state: &mut State,
    deleted: &[String],
    remaining: &[String],
) -> Option<Option<String>> {
    let current = state.default_profile.as_deref()?;
    if !deleted.iter().any(|d| d == current) {
        return None;
    }
    let replacement = replacement_default(remaining);
    state.default_profile = replacement.clone();
    Some(replacement)
}

/// Follows a rename of the default profile. Returns whether state changed.
pub fn rename_default(state: &mut State, old: &str, new: &str) -> bool {
    if state.default_profile.as_deref() == Some(old) {
        state.default_profile = Some(new.to_string());
        return true;
    }
    false
}

/// How a `-` argument is interpreted by a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DashPolicy {
    /// The current default; an error when none resolves.
    CurrentDefault,
    /// The current default, or `default` when none resolves yet.
    CurrentDefaultOrNew,
    Reject,
}

/// Turns a profile argument (name, 1-based index into the sorted list, or
/// `-`) into a validated profile name.
pub fn resolve_profile_ref(
    token: &str,
    profiles: &[String],
    state: &State,
    dash: DashPolicy,
) -> Result<String, LlmboxError> {
    if token == CURRENT_DEFAULT_TOKEN {
        let current = choose_existing_default(profiles, state.default_profile.as_deref());
        return match (dash, current) {
            (DashPolicy::Reject, _) => Err(LlmboxError::InvalidArgument(
                "an explicit profile name is required here, not '-'".to_string(),
            )),
            (_, Some(name)) => Ok(name),
            (DashPolicy::CurrentDefaultOrNew, None) => Ok(DEFAULT_PROFILE_NAME.to_string()),
            (DashPolicy::CurrentDefault, None) => Err(LlmboxError::NotFound(
                "no default profile is set".to_string(),
            )),
        };
    }
    if is_index_token(token) {
        return token
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|idx| profiles.get(idx))
            .cloned()
            .ok_or_else(|| {
                LlmboxError::InvalidArgument(format!("profile number {token} is out of range"))
            });
    }
    Ok(validate_profile_name(token)?.to_string())
}
