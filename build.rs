use std::path::Path;
use std::process::Command;

fn git_stdout(args: &[&str]) -> Option<String> {
    Command::new("git")
        .args(args)
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}

// A commit rewrites the branch ref, not HEAD, so the ref HEAD points at and
// the ref directories are watched as well.
fn watch_git_refs(git_dir: &str) {
    let git_path = Path::new(git_dir);
    let head = git_path.join("HEAD");
    if head.exists() {
        println!("cargo:rerun-if-changed={}", head.display());
    }
    if let Some(symbolic) = git_stdout(&["symbolic-ref", "-q", "HEAD"]) {
        let branch_ref = git_path.join(&symbolic);
        if branch_ref.exists() {
            println!("cargo:rerun-if-changed={}", branch_ref.display());
        }
    }
    for extra in ["packed-refs", "refs/heads", "refs/tags"] {
        let path = git_path.join(extra);
        if path.exists() {
            println!("cargo:rerun-if-changed={}", path.display());
        }
    }
}

fn main() {
    if let Some(git_dir) = git_stdout(&["rev-parse", "--git-dir"]) {
        watch_git_refs(&git_dir);
    }

    let commit = git_stdout(&["rev-parse", "--short", "HEAD"]).unwrap_or_default();
    println!("cargo:rustc-env=LLMBOX_GIT_COMMIT={commit}");
}
