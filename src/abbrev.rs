//! Unambiguous-prefix matching for subcommand names.
//!
//! Raw argv is rewritten before clap parses it: at each level of the command
//! tree the first positional token is matched against that level's direct
//! children only, and replaced by the full name when exactly one matches.

use crate::error::LlmboxError;
use clap::Command;

/// Resolves `token` against sibling command names. `Ok(None)` means nothing
/// matched and the caller should fall back to normal unknown-command handling.
pub fn resolve_command_name<'a>(
    token: &str,
    candidates: &[&'a str],
) -> Result<Option<&'a str>, LlmboxError> {
    if let Some(exact) = candidates.iter().copied().find(|name| *name == token) {
        return Ok(Some(exact));
    }
    let mut matches: Vec<&'a str> = candidates
        .iter()
        .copied()
        .filter(|name| name.starts_with(token))
        .collect();
    matches.sort_unstable();
    matches.dedup();
    match matches.as_slice() {
        [] => Ok(None),
        [only] => Ok(Some(*only)),
        _ => Err(LlmboxError::Ambiguous {
            token: token.to_string(),
            candidates: matches.iter().map(|m| m.to_string()).collect(),
        }),
    }
}

/// Rewrites abbreviated subcommand tokens in `args` (program name first) to
/// their full names. Options and everything after `--` pass through untouched.
pub fn expand_abbreviations(root: &Command, args: Vec<String>) -> Result<Vec<String>, LlmboxError> {
    let mut out = Vec::with_capacity(args.len());
    let mut rest = args.into_iter();
    if let Some(program) = rest.next() {
        out.push(program);
    }

    let mut current = root;
    let mut path: Vec<&Command> = vec![root];
    while let Some(arg) = rest.next() {
        if current.get_subcommands().next().is_none() || arg == "--" {
            out.push(arg);
            break;
        }
        if arg.starts_with('-') && arg != "-" {
            let needs_value = option_takes_value(&path, &arg);
            out.push(arg);
            if needs_value {
                if let Some(value) = rest.next() {
                    out.push(value);
                }
            }
            continue;
        }

        match resolve_subcommand(current, &arg)? {
            Some(sub) => {
                out.push(sub.get_name().to_string());
                path.push(sub);
                current = sub;
            }
            None => {
                out.push(arg);
                break;
            }
        }
    }
    out.extend(rest);
    Ok(out)
}

fn resolve_subcommand<'c>(
    current: &'c Command,
    token: &str,
) -> Result<Option<&'c Command>, LlmboxError> {
    let names: Vec<&str> = current
        .get_subcommands()
        .flat_map(|sub| std::iter::once(sub.get_name()).chain(sub.get_visible_aliases()))
        .collect();
    let resolved = match resolve_command_name(token, &names) {
        Ok(found) => found,
        Err(LlmboxError::Ambiguous { token, candidates }) => {
            // an alias and its command are one candidate
            let mut canonical: Vec<String> = candidates
                .iter()
                .filter_map(|name| find_by_name_or_alias(current, name))
                .map(|sub| sub.get_name().to_string())
                .collect();
            canonical.sort_unstable();
            canonical.dedup();
            if canonical.len() > 1 {
                return Err(LlmboxError::Ambiguous {
                    token,
                    candidates: canonical,
                });
            }
            return Ok(canonical
                .first()
                .and_then(|name| current.find_subcommand(name)));
        }
        Err(other) => return Err(other),
    };
    Ok(resolved.and_then(|name| find_by_name_or_alias(current, name)))
}

fn find_by_name_or_alias<'c>(current: &'c Command, name: &str) -> Option<&'c Command> {
    current
        .get_subcommands()
        .find(|sub| sub.get_name() == name || sub.get_visible_aliases().any(|a| a == name))
}

fn option_takes_value(path: &[&Command], arg: &str) -> bool {
    if arg.contains('=') {
        return false;
    }
    let matches_flag = |a: &clap::Arg| match arg.strip_prefix("--") {
        Some(long) => a.get_long() == Some(long),
        None => {
            let short = arg.trim_start_matches('-');
            short.len() == 1 && a.get_short().map(|c| c.to_string()).as_deref() == Some(short)
        }
    };
    path.iter()
        .flat_map(|cmd| cmd.get_arguments())
        .find(|a| matches_flag(*a))
        .map(|a| a.get_action().takes_values())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Arg;

    fn sample_cli() -> Command {
        Command::new("sample")
            .arg(Arg::new("config-dir").long("config-dir"))
            .subcommand(
                Command::new("volume")
                    .subcommand(Command::new("list"))
                    .subcommand(Command::new("add")),
            )
            .subcommand(
                Command::new("profile")
                    .subcommand(Command::new("list"))
                    .subcommand(Command::new("create"))
                    .subcommand(Command::new("remove").visible_alias("delete"))
                    .subcommand(Command::new("rename")),
            )
            .subcommand(Command::new("proxy").subcommand(Command::new("reload")))
            .subcommand(Command::new("run").arg(Arg::new("args").num_args(0..)))
    }

    fn expand(args: &[&str]) -> Result<Vec<String>, LlmboxError> {
        let mut argv = vec!["sample".to_string()];
        argv.extend(args.iter().map(|a| a.to_string()));
        expand_abbreviations(&sample_cli(), argv).map(|mut out| {
            out.remove(0);
            out
        })
    }

    #[test]
    fn exact_match_wins() {
        assert_eq!(resolve_command_name("run", &["run", "runner"]).unwrap(), Some("run"));
        assert_eq!(expand(&["volume", "list"]).unwrap(), ["volume", "list"]);
    }

    #[test]
    fn unique_prefixes_expand_at_every_level() {
        assert_eq!(expand(&["v", "l"]).unwrap(), ["volume", "list"]);
        assert_eq!(expand(&["vol", "lis"]).unwrap(), ["volume", "list"]);
        assert_eq!(expand(&["prof", "c"]).unwrap(), ["profile", "create"]);
        assert_eq!(expand(&["volume", "a"]).unwrap(), ["volume", "add"]);
        assert_eq!(expand(&["prox", "r"]).unwrap(), ["proxy", "reload"]);
        assert_eq!(expand(&["r"]).unwrap(), ["run"]);
    }

    #[test]
    fn ambiguous_prefix_lists_sorted_candidates() {
        let err = expand(&["p", "list"]).unwrap_err();
        match &err {
            LlmboxError::Ambiguous { token, candidates } => {
                assert_eq!(token, "p");
                assert_eq!(candidates, &["profile", "proxy"]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(
            err.to_string(),
            "ambiguous command 'p': could be profile, proxy"
        );
        assert!(expand(&["pro", "list"]).is_err());
        assert!(matches!(
            expand(&["profile", "re"]),
            Err(LlmboxError::Ambiguous { .. })
        ));
    }

    #[test]
    fn aliases_take_part_in_matching() {
        assert_eq!(expand(&["profile", "del", "x"]).unwrap(), ["profile", "remove", "x"]);
        assert_eq!(expand(&["profile", "rem"]).unwrap(), ["profile", "remove"]);
    }

    #[test]
    fn unknown_tokens_fall_through() {
        assert_eq!(expand(&["xyz", "l"]).unwrap(), ["xyz", "l"]);
        assert_eq!(resolve_command_name("xyz", &["run"]).unwrap(), None);
    }

    #[test]
    fn leaf_arguments_and_option_values_are_untouched() {
        assert_eq!(
            expand(&["--config-dir", "p", "r", "v", "--", "p"]).unwrap(),
            ["--config-dir", "p", "run", "v", "--", "p"]
        );
        assert_eq!(
            expand(&["--config-dir=x", "vo", "l"]).unwrap(),
            ["--config-dir=x", "volume", "list"]
        );
        assert_eq!(expand(&["profile", "c", "-"]).unwrap(), ["profile", "create", "-"]);
    }
}
