mod abbrev;
mod docker;
mod error;
mod profiles;
mod settings;
mod volumes;

use crate::docker::{ProcessRuntime, RunRequest};
use crate::error::LlmboxError;
use crate::profiles::{
    choose_existing_default, reassign_default_after_delete, rename_default,
    resolve_profile_for_run, resolve_profile_ref, validate_profile_name, DashPolicy, ProfileStore,
    CURRENT_DEFAULT_TOKEN,
};
use crate::settings::{load_state, save_state, Settings, SettingsOverrides, State};
use crate::volumes::{parse_mount_spec, remove_volume_targets};
use chrono::Utc;
use clap::{CommandFactory, FromArgMatches, Parser, Subcommand};
use std::env;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "LLMBOX_LOG";

#[derive(Parser, Debug)]
#[command(name = "llmbox", about = "Manage llm sandbox containers")]
struct Cli {
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a sandbox container for a profile.
    Run {
        /// Container image to run.
        #[arg(short = 'i', long = "image")]
        image: Option<String>,
        /// Print the runtime command without running it.
        #[arg(short = 'n', long, default_value_t = false)]
        dry_run: bool,
        profile: Option<String>,
        /// Extra arguments passed to the runtime, after `--`.
        #[arg(last = true)]
        args: Vec<String>,
    },
    /// Show version information.
    Version,
    /// Manage profile volumes.
    Volume {
        #[command(subcommand)]
        command: VolumeCommand,
    },
    /// Manage profiles.
    Profile {
        #[command(subcommand)]
        command: ProfileCommand,
    },
    /// Manage the in-container egress proxy.
    Proxy {
        #[command(subcommand)]
        command: ProxyCommand,
    },
}

#[derive(Subcommand, Debug)]
enum VolumeCommand {
    Add {
        profile: String,
        #[arg(required = true)]
        mounts: Vec<String>,
        /// Allow host paths that do not exist yet.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    List {
        profile: String,
    },
    #[command(visible_alias = "delete")]
    Remove {
        profile: String,
        #[arg(required = true)]
        targets: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
enum ProfileCommand {
    List,
    Create {
        #[arg(default_value = CURRENT_DEFAULT_TOKEN)]
        profile: String,
    },
    #[command(visible_alias = "delete")]
    Remove {
        #[arg(required = true)]
        profiles: Vec<String>,
    },
    Rename {
        old: String,
        new: String,
    },
    Copy {
        source: String,
        destination: String,
    },
    SetDefault {
        profile: String,
    },
}

#[derive(Subcommand, Debug)]
enum ProxyCommand {
    /// Make running containers re-read the proxy blocklist.
    Reload { profile: String },
}

struct Context {
    settings: Settings,
    store: ProfileStore,
}

impl Context {
    fn load_state(&self) -> Result<State, LlmboxError> {
        load_state(&self.settings.state_dir)
    }

    fn save_state(&self, state: &State) -> Result<(), LlmboxError> {
        save_state(&self.settings.state_dir, state)
    }

    /// Resolves a profile argument against the current profile list.
    fn profile_ref(
        &self,
        token: &str,
        state: &State,
        dash: DashPolicy,
    ) -> Result<String, LlmboxError> {
        let profiles = self.store.list_profiles()?;
        resolve_profile_ref(token, &profiles, state, dash)
    }
}

fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    let commit = env!("LLMBOX_GIT_COMMIT");
    if commit.is_empty() {
        version.to_string()
    } else {
        format!("{version} ({commit})")
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::IsTerminal::is_terminal(&std::io::stderr()))
        .without_time()
        .with_target(false)
        .try_init();
}

fn main() {
    init_tracing();

    let command = Cli::command().version(version_string());
    let args = match abbrev::expand_abbreviations(&command, env::args().collect()) {
        Ok(args) => args,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };
    let matches = command.get_matches_from(args);
    let cli = Cli::from_arg_matches(&matches).unwrap_or_else(|err| err.exit());

    if let Err(err) = dispatch(cli) {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

fn dispatch(cli: Cli) -> Result<(), LlmboxError> {
    let mut overrides = SettingsOverrides {
        config_dir: cli.config_dir,
        state_dir: cli.state_dir,
        ..SettingsOverrides::default()
    };
    if let Commands::Run { image, .. } = &cli.command {
        overrides.image_name = image.clone();
    }
    if let Commands::Version = cli.command {
        println!("{}", version_string());
        return Ok(());
    }

    let settings = Settings::resolve(&overrides)?;
    let ctx = Context {
        store: ProfileStore::new(settings.profiles_dir()),
        settings,
    };

    match cli.command {
        Commands::Run {
            dry_run,
            profile,
            args,
            ..
        } => handle_run(&ctx, profile.as_deref(), &args, dry_run),
        Commands::Version => Ok(()),
        Commands::Volume { command } => handle_volume(&ctx, command),
        Commands::Profile { command } => handle_profile(&ctx, command),
        Commands::Proxy { command } => handle_proxy(&ctx, command),
    }
}

fn handle_run(
    ctx: &Context,
    profile: Option<&str>,
    extra_args: &[String],
    dry_run: bool,
) -> Result<(), LlmboxError> {
    let mut state = ctx.load_state()?;
    let requested = match profile {
        Some(token) if token != CURRENT_DEFAULT_TOKEN => {
            Some(ctx.profile_ref(token, &state, DashPolicy::CurrentDefault)?)
        }
        _ => None,
    };
    let selection = resolve_profile_for_run(&ctx.store, &state, requested.as_deref())?;
    if selection.created {
        println!("Creating profile {}", selection.name);
    }
    if selection.reassigned {
        println!(
            "Default profile missing, switching default to {}",
            selection.name
        );
    }
    if let Some(new_default) = selection.new_default {
        state.default_profile = Some(new_default);
        ctx.save_state(&state)?;
    }

    let data = ctx.store.load(&selection.name)?;
    println!("Using profile {}", selection.name);
    if data.volumes.is_empty() {
        println!("Warning: profile has no volumes");
    }

    let blocklist_path = ctx.settings.blocklist_path();
    let request = RunRequest {
        runtime: &ctx.settings.container_runtime,
        image_name: &ctx.settings.image_name,
        profile: &selection.name,
        volumes: &data.volumes,
        extra_args,
        blocklist_path: &blocklist_path,
    };
    let mut launch = docker::build_run_command(&request, Utc::now())?;
    if dry_run {
        println!("{}", docker::render_command(&launch.argv));
        return Ok(());
    }

    launch.argv[0] = docker::locate_runtime(&ctx.settings.container_runtime)?;
    docker::run_container(&ProcessRuntime, &launch)
}

fn handle_volume(ctx: &Context, command: VolumeCommand) -> Result<(), LlmboxError> {
    match command {
        VolumeCommand::Add {
            profile,
            mounts,
            force,
        } => {
            let mut state = ctx.load_state()?;
            let name = ctx.profile_ref(&profile, &state, DashPolicy::CurrentDefaultOrNew)?;
            let cwd = env::current_dir()?;
            let parsed = mounts
                .iter()
                .map(|spec| parse_mount_spec(spec, &cwd, force))
                .collect::<Result<Vec<_>, _>>()?;

            let (mut data, created) = ctx.store.ensure(&name)?;
            if created {
                println!("Creating profile {name}");
                state.default_profile = Some(name.clone());
                ctx.save_state(&state)?;
            }
            data.volumes.extend(parsed);
            ctx.store.save(&name, &data)
        }
        VolumeCommand::List { profile } => {
            let state = ctx.load_state()?;
            let name = ctx.profile_ref(&profile, &state, DashPolicy::CurrentDefault)?;
            let data = ctx.store.load(&name)?;
            for (idx, volume) in data.volumes.iter().enumerate() {
                println!("{}. {}", idx + 1, volume);
            }
            Ok(())
        }
        VolumeCommand::Remove { profile, targets } => {
            let state = ctx.load_state()?;
            let name = ctx.profile_ref(&profile, &state, DashPolicy::CurrentDefault)?;
            let mut data = ctx.store.load(&name)?;
            let cwd = env::current_dir()?;
            data.volumes = remove_volume_targets(&data.volumes, &targets, &cwd)?;
            ctx.store.save(&name, &data)
        }
    }
}

fn handle_profile(ctx: &Context, command: ProfileCommand) -> Result<(), LlmboxError> {
    match command {
        ProfileCommand::List => {
            let state = ctx.load_state()?;
            let profiles = ctx.store.list_profiles()?;
            let current = choose_existing_default(&profiles, state.default_profile.as_deref());
            for (idx, name) in profiles.iter().enumerate() {
                let marker = if current.as_deref() == Some(name.as_str()) {
                    " *"
                } else {
                    ""
                };
                println!("{}. {name}{marker}", idx + 1);
            }
            Ok(())
        }
        ProfileCommand::Create { profile } => {
            let mut state = ctx.load_state()?;
            let name = ctx.profile_ref(&profile, &state, DashPolicy::CurrentDefaultOrNew)?;
            ctx.store.create(&name)?;
            state.default_profile = Some(name.clone());
            ctx.save_state(&state)?;
            println!("Created profile {name}");
            Ok(())
        }
        ProfileCommand::Remove { profiles } => {
            let mut state = ctx.load_state()?;
            let existing = ctx.store.list_profiles()?;
            let mut targets: Vec<String> = Vec::with_capacity(profiles.len());
            for token in &profiles {
                let name =
                    resolve_profile_ref(token, &existing, &state, DashPolicy::CurrentDefault)?;
                if !targets.contains(&name) {
                    targets.push(name);
                }
            }

            // Profiles removed before a failure stay removed, so the default
            // is repaired either way.
            let deleted = ctx.store.delete(&targets);
            let remaining = ctx.store.list_profiles()?;
            let gone: Vec<String> = targets
                .iter()
                .filter(|name| !remaining.contains(name))
                .cloned()
                .collect();
            let replacement = reassign_default_after_delete(&mut state, &gone, &remaining);
            if let Some(replacement) = replacement {
                ctx.save_state(&state)?;
                match replacement {
                    Some(name) => {
                        println!("Deleted default profile; new default profile is: {name}")
                    }
                    None => println!("Deleted default profile; no profiles remain"),
                }
            }
            deleted
        }
        ProfileCommand::Rename { old, new } => {
            let mut state = ctx.load_state()?;
            let old = ctx.profile_ref(&old, &state, DashPolicy::CurrentDefault)?;
            let new = validate_profile_name(&new)?.to_string();
            ctx.store.rename(&old, &new)?;
            if rename_default(&mut state, &old, &new) {
                ctx.save_state(&state)?;
            }
            println!("Renamed profile {old} to {new}");
            Ok(())
        }
        ProfileCommand::Copy {
            source,
            destination,
        } => {
            let state = ctx.load_state()?;
            let source = ctx.profile_ref(&source, &state, DashPolicy::CurrentDefault)?;
            let destination = validate_profile_name(&destination)?.to_string();
            ctx.store.copy(&source, &destination)?;
            println!("Copied profile {source} to {destination}");
            Ok(())
        }
        ProfileCommand::SetDefault { profile } => {
            let mut state = ctx.load_state()?;
            let name = ctx.profile_ref(&profile, &state, DashPolicy::Reject)?;
            if !ctx.store.exists(&name)? {
                return Err(LlmboxError::NotFound(format!(
                    "profile {name} does not exist"
                )));
            }
            state.default_profile = Some(name.clone());
            ctx.save_state(&state)?;
            println!("Default profile set to {name}");
            Ok(())
        }
    }
}

fn handle_proxy(ctx: &Context, command: ProxyCommand) -> Result<(), LlmboxError> {
    match command {
        ProxyCommand::Reload { profile } => {
            let state = ctx.load_state()?;
            let name = ctx.profile_ref(&profile, &state, DashPolicy::CurrentDefault)?;
            let runtime = docker::locate_runtime(&ctx.settings.container_runtime)?;
            let outcome = docker::reload_proxy(&ProcessRuntime, &runtime, &name)?;
            if outcome.containers.is_empty() {
                println!("Warning: no running containers for this profile");
                return Ok(());
            }
            if outcome.failures.is_empty() {
                return Ok(());
            }
            for failure in &outcome.failures {
                if failure.detail.is_empty() {
                    println!(
                        "Error: failed to reload proxy in container {}",
                        failure.container
                    );
                } else {
                    println!(
                        "Error: failed to reload proxy in container {}: {}",
                        failure.container, failure.detail
                    );
                }
            }
            Err(LlmboxError::ExternalFailure(
                "proxy reload failed".to_string(),
            ))
        }
    }
}
