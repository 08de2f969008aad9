use std::path::Path;
use std::process::Command;
use tracing::debug;

fn output(dir: &Path, args: &[&str]) -> Option<String> {
    let out = Command::new("git").args(args).current_dir(dir).output().ok()?;
    if !out.status.success() {
        debug!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&out.stderr).trim()
        );
        return None;
    }
    let text = String::from_utf8_lossy(&out.stdout).trim().to_owned();
    (!text.is_empty()).then_some(text)
}

/// Repository name from a remote URL: the last path segment without `.git`.
pub fn component_from_remote(url: &str) -> Option<String> {
    let trimmed = url.trim().trim_end_matches('/');
    let last = trimmed.rsplit(['/', ':']).next()?;
    let name = last.strip_suffix(".git").unwrap_or(last);
    (!name.is_empty()).then(|| name.to_owned())
}

pub fn component(dir: &Path) -> Result<String, String> {
    output(dir, &["config", "remote.origin.url"])
        .as_deref()
        .and_then(component_from_remote)
        .ok_or_else(|| "could not determine component name; use --component".to_owned())
}

pub fn commit(dir: &Path) -> Result<String, String> {
    output(dir, &["rev-parse", "HEAD"])
        .ok_or_else(|| "could not determine commit; use --commit".to_owned())
}
