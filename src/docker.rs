//! Container runtime invocation: the sandbox launch command and the in-container
//! proxy reload signal.

use crate::error::LlmboxError;
use crate::volumes::VolumeMount;
use chrono::{DateTime, Utc};
use std::fs;
use std::io;
use std::path::Path;
use std::process::Command;

pub const CONTAINER_NAME_PREFIX: &str = "llmbox";
pub const MANAGED_LABEL: &str = "llmbox.managed=true";
pub const PROFILE_LABEL_KEY: &str = "llmbox.profile";
pub const BLOCKLIST_CONTAINER_PATH: &str = "/etc/tinyproxy/blocklist";

const BASE_RUN_ARGS: &[&str] = &[
    "run",
    "--rm",
    "-it",
    "--cap-drop",
    "ALL",
    "--cap-add",
    "NET_ADMIN",
    "--cap-add",
    "SETPCAP",
    "--cap-add",
    "SETUID",
    "--cap-add",
    "SETGID",
    "--cap-add",
    "AUDIT_WRITE",
    "--cap-add",
    "DAC_OVERRIDE",
    "--cap-add",
    "CHOWN",
    "--dns",
    "1.1.1.1",
    "--dns",
    "9.9.9.9",
    "-e",
    "HTTP_PROXY=http://127.0.0.1:8888",
    "-e",
    "HTTPS_PROXY=http://127.0.0.1:8888",
    "-e",
    "NO_PROXY=localhost,127.0.0.1",
    "-e",
    "CLAUDE_CONFIG_DIR=/home/llm/.persist/claude",
    "-e",
    "CODEX_HOME=/home/llm/.persist/codex",
    "-v",
    "llm_persist:/home/llm/.persist",
];

// USR1 makes tinyproxy re-read its filter list. The signal is sent as the
// proxy's own user since the container drops root's kill capability.
const RELOAD_PROXY_SCRIPT: &str =
    r#"pid="$(cat /run/tinyproxy.pid)" && runuser -u tinyproxy -- kill -USR1 "$pid""#;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }
}

/// Runs `argv` (program first). Output is inherited unless `capture_output`.
pub trait ContainerRuntime {
    fn invoke(&self, argv: &[String], capture_output: bool) -> Result<CommandOutput, io::Error>;
}

pub struct ProcessRuntime;

impl ContainerRuntime for ProcessRuntime {
    fn invoke(&self, argv: &[String], capture_output: bool) -> Result<CommandOutput, io::Error> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        if capture_output {
            let output = cmd.output()?;
            let status_code =
                output
                    .status
                    .code()
                    .unwrap_or(if output.status.success() { 0 } else { 1 });
            Ok(CommandOutput {
                status_code,
                stdout: output.stdout,
                stderr: output.stderr,
            })
        } else {
            let status = cmd.status()?;
            let status_code = status
                .code()
                .unwrap_or(if status.success() { 0 } else { 1 });
            Ok(CommandOutput {
                status_code,
                stdout: Vec::new(),
                stderr: Vec::new(),
            })
        }
    }
}

/// Resolves the runtime executable on `PATH` (or as given, if it has a
/// directory component).
pub fn locate_runtime(runtime: &str) -> Result<String, LlmboxError> {
    which::which(runtime)
        .map(|path| path.to_string_lossy().to_string())
        .map_err(|err| {
            LlmboxError::ExternalFailure(format!(
                "container runtime `{runtime}` not found: {err}\nHint: install it or set container_runtime in config.yaml (or LLMBOX_CONTAINER_RUNTIME)"
            ))
        })
}

#[derive(Debug, Clone)]
pub struct RunRequest<'a> {
    pub runtime: &'a str,
    pub image_name: &'a str,
    pub profile: &'a str,
    pub volumes: &'a [VolumeMount],
    pub extra_args: &'a [String],
    pub blocklist_path: &'a Path,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub argv: Vec<String>,
    pub container_name: String,
}

pub fn container_name(profile: &str, now: DateTime<Utc>) -> String {
    format!(
        "{CONTAINER_NAME_PREFIX}-{profile}-{}",
        now.format("%Y%m%d%H%M%S")
    )
}

fn profile_label(profile: &str) -> String {
    format!("{PROFILE_LABEL_KEY}={profile}")
}

/// Creates an empty egress policy file if none exists yet.
pub fn ensure_blocklist(path: &Path) -> Result<(), LlmboxError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    Ok(())
}

pub fn build_run_command(
    request: &RunRequest<'_>,
    now: DateTime<Utc>,
) -> Result<LaunchCommand, LlmboxError> {
    ensure_blocklist(request.blocklist_path)?;
    let name = container_name(request.profile, now);

    let mut argv: Vec<String> = Vec::with_capacity(BASE_RUN_ARGS.len() + 16);
    argv.push(request.runtime.to_string());
    argv.extend(BASE_RUN_ARGS.iter().map(|arg| arg.to_string()));
    argv.push("--name".to_string());
    argv.push(name.clone());
    for volume in request.volumes {
        argv.push("-v".to_string());
        argv.push(volume.spec());
    }
    argv.push("-v".to_string());
    argv.push(format!(
        "{}:{BLOCKLIST_CONTAINER_PATH}:ro",
        request.blocklist_path.display()
    ));
    argv.push("--label".to_string());
    argv.push(MANAGED_LABEL.to_string());
    argv.push("--label".to_string());
    argv.push(profile_label(request.profile));
    argv.extend(request.extra_args.iter().cloned());
    argv.push(request.image_name.to_string());

    Ok(LaunchCommand {
        argv,
        container_name: name,
    })
}

/// Renders `argv` so it can be pasted into a POSIX shell unchanged.
pub fn render_command(argv: &[String]) -> String {
    shell_words::join(argv)
}

fn execute<R: ContainerRuntime>(
    runner: &R,
    argv: &[String],
    capture_output: bool,
) -> Result<CommandOutput, LlmboxError> {
    let command = render_command(argv);
    tracing::debug!(%command, "invoking container runtime");
    let output = runner.invoke(argv, capture_output).map_err(|err| {
        let mut message = format!("failed to run command `{command}`: {err}");
        if err.kind() == io::ErrorKind::NotFound {
            message.push_str("\nHint: is the container runtime installed?");
        }
        LlmboxError::ExternalFailure(message)
    })?;
    if !output.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let mut message = format!(
            "command failed with status {} while running `{}`",
            output.status_code, command
        );
        if !stderr.is_empty() {
            message = format!("{message}: {stderr}");
        }
        return Err(LlmboxError::ExternalFailure(message));
    }
    Ok(output)
}

/// Launches the container attached to the current terminal.
pub fn run_container<R: ContainerRuntime>(
    runner: &R,
    launch: &LaunchCommand,
) -> Result<(), LlmboxError> {
    tracing::debug!(container = %launch.container_name, "launching container");
    execute(runner, &launch.argv, false)?;
    Ok(())
}

/// IDs of running containers labelled with `profile`.
pub fn list_profile_containers<R: ContainerRuntime>(
    runner: &R,
    runtime: &str,
    profile: &str,
) -> Result<Vec<String>, LlmboxError> {
    let argv: Vec<String> = vec![
        runtime.to_string(),
        "ps".to_string(),
        "--filter".to_string(),
        format!("label={}", profile_label(profile)),
        "--format".to_string(),
        "{{.ID}}".to_string(),
    ];
    let output = execute(runner, &argv, true)?;
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadFailure {
    pub container: String,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadOutcome {
    pub containers: Vec<String>,
    pub failures: Vec<ReloadFailure>,
}

/// Signals the proxy in every running container of `profile`. Every container
/// is attempted; failures are collected rather than returned early.
pub fn reload_proxy<R: ContainerRuntime>(
    runner: &R,
    runtime: &str,
    profile: &str,
) -> Result<ReloadOutcome, LlmboxError> {
    let containers = list_profile_containers(runner, runtime, profile)?;
    let mut failures = Vec::new();
    for container in &containers {
        let argv: Vec<String> = vec![
            runtime.to_string(),
            "exec".to_string(),
            container.clone(),
            "sh".to_string(),
            "-c".to_string(),
            RELOAD_PROXY_SCRIPT.to_string(),
        ];
        let detail = match runner.invoke(&argv, true) {
            Ok(output) if output.success() => None,
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                if stderr.is_empty() {
                    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
                } else {
                    Some(stderr)
                }
            }
            Err(err) => Some(err.to_string()),
        };
        tracing::debug!(%container, failed = detail.is_some(), "proxy reload attempted");
        if let Some(detail) = detail {
            failures.push(ReloadFailure {
                container: container.clone(),
                detail,
            });
        }
    }
    Ok(ReloadOutcome {
        containers,
        failures,
    })
}
