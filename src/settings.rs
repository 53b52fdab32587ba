//! Settings resolution and the persisted default-profile state.

use crate::error::LlmboxError;
use dirs::home_dir;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub const DEFAULT_IMAGE_NAME: &str = "llm";
pub const DEFAULT_CONTAINER_RUNTIME: &str = "docker";
const ENV_PREFIX: &str = "LLMBOX_";
const APP_DIR: &str = "llmbox";

const IMAGE_NAME: &str = "image_name";
const CONFIG_DIR: &str = "config_dir";
const STATE_DIR: &str = "state_dir";
const CONTAINER_RUNTIME: &str = "container_runtime";
const SETTING_KEYS: [&str; 4] = [IMAGE_NAME, CONFIG_DIR, STATE_DIR, CONTAINER_RUNTIME];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub image_name: String,
    pub config_dir: PathBuf,
    pub state_dir: PathBuf,
    pub container_runtime: String,
}

/// Values supplied explicitly by the caller (CLI flags). Highest priority.
#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub image_name: Option<String>,
    pub config_dir: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub container_runtime: Option<String>,
}

/// Keys accepted in `config.yaml`. The directories themselves cannot be
/// relocated from inside the file they locate.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    image_name: Option<String>,
    container_runtime: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct State {
    pub default_profile: Option<String>,
}

type Layer = BTreeMap<&'static str, String>;

fn lookup(layers: &[&Layer], key: &str) -> Option<String> {
    layers.iter().find_map(|layer| layer.get(key).cloned())
}

fn override_layer(overrides: &SettingsOverrides) -> Layer {
    let mut layer = Layer::new();
    let path_text = |path: &PathBuf| path.to_string_lossy().to_string();
    let entries = [
        (IMAGE_NAME, overrides.image_name.clone()),
        (CONFIG_DIR, overrides.config_dir.as_ref().map(path_text)),
        (STATE_DIR, overrides.state_dir.as_ref().map(path_text)),
        (CONTAINER_RUNTIME, overrides.container_runtime.clone()),
    ];
    for (key, value) in entries {
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            layer.insert(key, value);
        }
    }
    layer
}

fn env_layer(env_lookup: &dyn Fn(&str) -> Option<String>) -> Layer {
    let mut layer = Layer::new();
    for key in SETTING_KEYS {
        let var = format!("{ENV_PREFIX}{}", key.to_uppercase());
        if let Some(value) = env_lookup(&var).filter(|v| !v.is_empty()) {
            layer.insert(key, value);
        }
    }
    layer
}

fn file_layer(config_dir: &Path) -> Result<Layer, LlmboxError> {
    let path = config_file_path(config_dir);
    let mut layer = Layer::new();
    if !path.exists() {
        return Ok(layer);
    }
    let parsed: ConfigFile = read_yaml_mapping(&path)?.unwrap_or_default();
    if let Some(image_name) = parsed.image_name {
        layer.insert(IMAGE_NAME, image_name);
    }
    if let Some(runtime) = parsed.container_runtime {
        layer.insert(CONTAINER_RUNTIME, runtime);
    }
    Ok(layer)
}

fn read_yaml_mapping<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, LlmboxError> {
    let content = fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(None);
    }
    let value: serde_yaml::Value = serde_yaml::from_str(&content)
        .map_err(|err| LlmboxError::Malformed(format!("{}: {err}", path.display())))?;
    match value {
        serde_yaml::Value::Null => Ok(None),
        serde_yaml::Value::Mapping(_) => serde_yaml::from_value(value)
            .map(Some)
            .map_err(|err| LlmboxError::Malformed(format!("{}: {err}", path.display()))),
        _ => Err(LlmboxError::Malformed(format!(
            "{} must contain a mapping",
            path.display()
        ))),
    }
}

fn xdg_base(
    env_lookup: &dyn Fn(&str) -> Option<String>,
    var: &str,
    fallback: &[&str],
    home: Option<PathBuf>,
) -> Result<PathBuf, LlmboxError> {
    if let Some(base) = env_lookup(var).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(base));
    }
    let mut base = home.ok_or_else(|| {
        LlmboxError::Config(format!(
            "unable to resolve home directory; set {var} or {ENV_PREFIX}{}",
            if var == "XDG_CONFIG_HOME" { "CONFIG_DIR" } else { "STATE_DIR" }
        ))
    })?;
    for segment in fallback {
        base.push(segment);
    }
    Ok(base)
}

fn default_config_dir(
    env_lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<PathBuf, LlmboxError> {
    Ok(xdg_base(env_lookup, "XDG_CONFIG_HOME", &[".config"], home_dir())?.join(APP_DIR))
}

fn default_state_dir(
    env_lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<PathBuf, LlmboxError> {
    Ok(xdg_base(env_lookup, "XDG_STATE_HOME", &[".local", "state"], home_dir())?.join(APP_DIR))
}

impl Settings {
    pub fn resolve(overrides: &SettingsOverrides) -> Result<Self, LlmboxError> {
        Self::resolve_with(overrides, &|var: &str| env::var(var).ok())
    }

    pub fn resolve_with(
        overrides: &SettingsOverrides,
        env_lookup: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self, LlmboxError> {
        let explicit = override_layer(overrides);
        let environment = env_layer(env_lookup);

        let config_dir = match lookup(&[&explicit, &environment], CONFIG_DIR) {
            Some(dir) => PathBuf::from(dir),
            None => default_config_dir(env_lookup)?,
        };
        let state_dir = match lookup(&[&explicit, &environment], STATE_DIR) {
            Some(dir) => PathBuf::from(dir),
            None => default_state_dir(env_lookup)?,
        };

        let file = file_layer(&config_dir).map_err(|err| match err {
            LlmboxError::Malformed(message) => LlmboxError::Config(message),
            other => other,
        })?;
        let layers = [&explicit, &environment, &file];

        let settings = Settings {
            image_name: lookup(&layers, IMAGE_NAME)
                .unwrap_or_else(|| DEFAULT_IMAGE_NAME.to_string()),
            config_dir,
            state_dir,
            container_runtime: lookup(&layers, CONTAINER_RUNTIME)
                .unwrap_or_else(|| DEFAULT_CONTAINER_RUNTIME.to_string()),
        };
        tracing::debug!(
            image_name = %settings.image_name,
            config_dir = %settings.config_dir.display(),
            state_dir = %settings.state_dir.display(),
            container_runtime = %settings.container_runtime,
            "resolved settings"
        );
        Ok(settings)
    }

    pub fn profiles_dir(&self) -> PathBuf {
        self.config_dir.join("profiles")
    }

    pub fn blocklist_path(&self) -> PathBuf {
        self.config_dir.join("proxy_blocklist")
    }
}

pub fn config_file_path(config_dir: &Path) -> PathBuf {
    config_dir.join("config.yaml")
}

pub fn state_file_path(state_dir: &Path) -> PathBuf {
    state_dir.join("state.yaml")
}

pub fn load_state(state_dir: &Path) -> Result<State, LlmboxError> {
    let path = state_file_path(state_dir);
    if !path.exists() {
        return Ok(State::default());
    }
    Ok(read_yaml_mapping(&path)?.unwrap_or_default())
}

pub fn save_state(state_dir: &Path, state: &State) -> Result<(), LlmboxError> {
    let path = state_file_path(state_dir);
    let body = serde_yaml::to_string(state)?;
    tracing::debug!(path = %path.display(), default_profile = ?state.default_profile, "saving state");
    write_atomic_text_file(&path, &body)
}

pub(crate) fn ensure_parent(path: &Path) -> Result<(), LlmboxError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

pub(crate) fn write_atomic_text_file(path: &Path, content: &str) -> Result<(), LlmboxError> {
    ensure_parent(path)?;
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let pid = std::process::id();
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let tmp_path = parent.join(format!(
        ".{}.tmp.{}.{}",
        path.file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "llmbox".to_string()),
        pid,
        ts
    ));

    fs::write(&tmp_path, content)?;
    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    fn dirs_overrides(config_dir: &Path, state_dir: &Path) -> SettingsOverrides {
        SettingsOverrides {
            config_dir: Some(config_dir.to_path_buf()),
            state_dir: Some(state_dir.to_path_buf()),
            ..SettingsOverrides::default()
        }
    }

    #[test]
    fn defaults_follow_xdg_base_dirs() {
        let settings = Settings::resolve_with(
            &SettingsOverrides::default(),
            &env_from(&[("XDG_CONFIG_HOME", "/tmp/cfg"), ("XDG_STATE_HOME", "/tmp/st")]),
        )
        .unwrap();
        assert_eq!(settings.config_dir, PathBuf::from("/tmp/cfg/llmbox"));
        assert_eq!(settings.state_dir, PathBuf::from("/tmp/st/llmbox"));
        assert_eq!(settings.image_name, DEFAULT_IMAGE_NAME);
        assert_eq!(settings.container_runtime, DEFAULT_CONTAINER_RUNTIME);
    }

    #[test]
    fn missing_home_is_a_config_error_unless_xdg_is_set() {
        let err = xdg_base(&env_from(&[]), "XDG_STATE_HOME", &[".local", "state"], None)
            .unwrap_err();
        assert!(matches!(err, LlmboxError::Config(_)));
        assert!(err.to_string().contains("LLMBOX_STATE_DIR"));

        let env = env_from(&[("XDG_CONFIG_HOME", "/tmp/cfg")]);
        let base = xdg_base(&env, "XDG_CONFIG_HOME", &[".config"], None).unwrap();
        assert_eq!(base, PathBuf::from("/tmp/cfg"));

        let base = xdg_base(
            &env_from(&[]),
            "XDG_CONFIG_HOME",
            &[".config"],
            Some(PathBuf::from("/home/u")),
        )
        .unwrap();
        assert_eq!(base, PathBuf::from("/home/u/.config"));
    }

    #[test]
    fn failed_atomic_write_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        // renaming a file over a non-empty directory fails
        let target = dir.path().join("state.yaml");
        fs::create_dir(&target).unwrap();
        fs::write(target.join("occupied"), "x").unwrap();

        assert!(write_atomic_text_file(&target, "default_profile: null\n").is_err());
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .filter(|name| name != "state.yaml")
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[test]
    fn precedence_is_overrides_then_env_then_file() {
        let dir = tempdir().unwrap();
        let config_dir = dir.path().join("config");
        let state_dir = dir.path().join("state");
        fs::create_dir_all(&config_dir).unwrap();
        fs::write(
            config_file_path(&config_dir),
            "image_name: fromfile\ncontainer_runtime: podman\n",
        )
        .unwrap();

        let base = dirs_overrides(&config_dir, &state_dir);
        let from_file = Settings::resolve_with(&base, &env_from(&[])).unwrap();
        assert_eq!(from_file.image_name, "fromfile");
        assert_eq!(from_file.container_runtime, "podman");

        let env = env_from(&[("LLMBOX_IMAGE_NAME", "fromenv")]);
        let from_env = Settings::resolve_with(&base, &env).unwrap();
        assert_eq!(from_env.image_name, "fromenv");
        assert_eq!(from_env.container_runtime, "podman");

        let explicit = SettingsOverrides {
            image_name: Some("fromcli".to_string()),
            ..base
        };
        let from_cli = Settings::resolve_with(&explicit, &env).unwrap();
        assert_eq!(from_cli.image_name, "fromcli");
    }

    #[test]
    fn env_can_relocate_directories() {
        let dir = tempdir().unwrap();
        let env_config = dir.path().join("env-config");
        fs::create_dir_all(&env_config).unwrap();
        fs::write(config_file_path(&env_config), "image_name: relocated\n").unwrap();
        let env_config_text = env_config.to_string_lossy().to_string();
        let env = env_from(&[
            ("LLMBOX_CONFIG_DIR", env_config_text.as_str()),
            ("LLMBOX_STATE_DIR", "/tmp/elsewhere"),
            ("LLMBOX_CONTAINER_RUNTIME", ""),
        ]);

        let settings = Settings::resolve_with(&SettingsOverrides::default(), &env).unwrap();
        assert_eq!(settings.config_dir, env_config);
        assert_eq!(settings.state_dir, PathBuf::from("/tmp/elsewhere"));
        assert_eq!(settings.image_name, "relocated");
        assert_eq!(settings.container_runtime, DEFAULT_CONTAINER_RUNTIME);
    }

    #[test]
    fn config_file_rejects_unknown_keys() {
        let dir = tempdir().unwrap();
        fs::write(config_file_path(dir.path()), "unexpected: value\n").unwrap();
        let err = Settings::resolve_with(&dirs_overrides(dir.path(), dir.path()), &env_from(&[]))
            .unwrap_err();
        assert!(matches!(err, LlmboxError::Config(_)));
        assert!(err.to_string().contains("unexpected"));
    }

    #[test]
    fn config_file_must_be_a_mapping() {
        let dir = tempdir().unwrap();
        fs::write(config_file_path(dir.path()), "- just\n- a list\n").unwrap();
        let err = Settings::resolve_with(&dirs_overrides(dir.path(), dir.path()), &env_from(&[]))
            .unwrap_err();
        assert!(err.to_string().contains("must contain a mapping"));
    }

    #[test]
    fn state_round_trips_and_tolerates_missing_or_empty_file() {
        let dir = tempdir().unwrap();
        assert_eq!(load_state(dir.path()).unwrap(), State::default());

        fs::write(state_file_path(dir.path()), "").unwrap();
        assert_eq!(load_state(dir.path()).unwrap(), State::default());

        let state = State {
            default_profile: Some("alpha".to_string()),
        };
        save_state(dir.path(), &state).unwrap();
        assert_eq!(load_state(dir.path()).unwrap(), state);

        save_state(dir.path(), &State::default()).unwrap();
        let content = fs::read_to_string(state_file_path(dir.path())).unwrap();
        assert_eq!(content, "default_profile: null\n");
    }

    #[test]
    fn state_with_unknown_key_is_malformed() {
        let dir = tempdir().unwrap();
        fs::write(state_file_path(dir.path()), "last_profile: alpha\n").unwrap();
        let err = load_state(dir.path()).unwrap_err();
        assert!(matches!(err, LlmboxError::Malformed(_)));
    }
}
