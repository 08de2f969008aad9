use super::EXIT_SUCCESS;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::process::Command;

const GIT_IDENTITY_DEFAULT: &str = "cdflow2";
const GIT_EMAIL_DEFAULT: &str = "cdflow2@localhost";

const MANIFEST_TEMPLATE: &str = "version: 2
team: %{team}
config:
  image: mergermarket/cdflow2-config-simple:latest
  params: {}
builds: {}
terraform:
  image: hashicorp/terraform:latest
";

const MAIN_TF_TEMPLATE: &str = r#"variable "env" {
  type = string
}

variable "release" {
  type = map(string)
}

variable "version" {
  type    = string
  default = ""
}

output "component" {
  value = var.release["component"]
}
"#;

const COMMON_JSON_TEMPLATE: &str = "{}\n";

const README_TEMPLATE: &str = "# %{name}

Released and deployed with cdflow2:

    cdflow2 release VERSION
    cdflow2 deploy ENV VERSION

`cdflow.yaml` names the config, build and Terraform images. Terraform code
lives in `infra/`; per-environment variables go in `config/<env>.json`, shared
ones in `config/common.json`.
";

/// Collect `--KEY VALUE` and `--KEY=VALUE` pairs.
pub fn parse_vars(args: &[String]) -> Result<BTreeMap<String, String>, String> {
    let mut vars = BTreeMap::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let Some(flag) = arg.strip_prefix("--") else {
            return Err(format!("unexpected argument '{arg}' (expected --KEY VALUE)"));
        };
        let (key, value) = match flag.split_once('=') {
            Some((key, value)) => (key.to_owned(), value.to_owned()),
            None => {
                let value = iter
                    .next()
                    .ok_or_else(|| format!("missing value for --{flag}"))?;
                (flag.to_owned(), value.clone())
            }
        };
        if key.is_empty() {
            return Err(format!("invalid argument '{arg}'"));
        }
        vars.insert(key, value);
    }
    Ok(vars)
}

/// Replace `%{KEY}` placeholders, recording keys that have no value.
pub fn render(
    content: &str,
    vars: &BTreeMap<String, String>,
    missing: &mut BTreeSet<String>,
) -> String {
    let mut out = String::with_capacity(content.len());
    let mut rest = content;
    while let Some(start) = rest.find("%{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) if end > 0 => {
                let key = &after[..end];
                match vars.get(key) {
                    Some(value) => out.push_str(value),
                    None => {
                        missing.insert(key.to_owned());
                        out.push_str(&rest[start..start + 2 + end + 1]);
                    }
                }
                rest = &after[end + 1..];
            }
            _ => {
                out.push_str("%{");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn render_tree(
    dir: &Path,
    vars: &BTreeMap<String, String>,
    missing: &mut BTreeSet<String>,
) -> Result<(), String> {
    let entries = std::fs::read_dir(dir).map_err(|e| format!("{}: {e}", dir.display()))?;
    for entry in entries {
        let entry = entry.map_err(|e| format!("{}: {e}", dir.display()))?;
        let path = entry.path();
        let file_type = entry
            .file_type()
            .map_err(|e| format!("{}: {e}", path.display()))?;
        if file_type.is_dir() {
            if entry.file_name() != ".git" {
                render_tree(&path, vars, missing)?;
            }
            continue;
        }
        if !file_type.is_file() {
            continue;
        }
        // Binary files are copied untouched.
        let Ok(content) = std::fs::read_to_string(&path) else {
            continue;
        };
        let rendered = render(&content, vars, missing);
        if rendered != content {
            std::fs::write(&path, rendered).map_err(|e| format!("{}: {e}", path.display()))?;
        }
    }
    Ok(())
}

fn git(dir: &Path, args: &[&str]) -> Result<(), String> {
    let mut cmd = Command::new("git");
    cmd.args(args).current_dir(dir);
    for (name, default) in [
        ("GIT_AUTHOR_NAME", GIT_IDENTITY_DEFAULT),
        ("GIT_COMMITTER_NAME", GIT_IDENTITY_DEFAULT),
        ("GIT_AUTHOR_EMAIL", GIT_EMAIL_DEFAULT),
        ("GIT_COMMITTER_EMAIL", GIT_EMAIL_DEFAULT),
    ] {
        if std::env::var_os(name).is_none() {
            cmd.env(name, default);
        }
    }
    let out = cmd
        .output()
        .map_err(|e| format!("failed to run git: {e}"))?;
    if !out.status.success() {
        return Err(format!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&out.stderr).trim()
        ));
    }
    Ok(())
}

fn commit_project(dir: &Path) -> Result<(), String> {
    eprintln!("initialising git repository...");
    git(dir, &["init"])?;
    git(dir, &["add", "."])?;
    git(dir, &["commit", "-m", "Initial commit"])
}

fn write_basic(dir: &Path, vars: &BTreeMap<String, String>) -> Result<(), String> {
    let files = [
        ("cdflow.yaml", MANIFEST_TEMPLATE),
        ("infra/main.tf", MAIN_TF_TEMPLATE),
        ("config/common.json", COMMON_JSON_TEMPLATE),
        ("README.md", README_TEMPLATE),
    ];
    let mut missing = BTreeSet::new();
    for (relative, template) in files {
        let path = dir.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| format!("{}: {e}", parent.display()))?;
        }
        let content = render(template, vars, &mut missing);
        std::fs::write(&path, content).map_err(|e| format!("{}: {e}", path.display()))?;
    }
    Ok(())
}

fn clone_boilerplate(url: &str, dir: &Path) -> Result<(), String> {
    eprintln!("downloading boilerplate from '{url}'...");
    let (repository, branch) = match url.split_once("?ref=") {
        Some((repository, branch)) => (repository, Some(branch)),
        None => (url, None),
    };
    let target = dir.to_string_lossy();
    let mut args = vec!["clone", "--depth", "1"];
    if let Some(branch) = branch {
        args.extend(["--branch", branch]);
    }
    args.extend([repository, &*target]);
    let parent = dir.parent().unwrap_or_else(|| Path::new("."));
    git(parent, &args)?;
    std::fs::remove_dir_all(dir.join(".git"))
        .map_err(|e| format!("failed to remove boilerplate history: {e}"))
}

pub fn run(name: Option<&str>, boilerplate: Option<&str>, vars: &[String]) -> Result<u8, String> {
    let name = name
        .filter(|n| !n.is_empty())
        .ok_or_else(|| "init requires --name".to_owned())?;
    let mut vars = parse_vars(vars)?;
    vars.entry("name".to_owned())
        .or_insert_with(|| name.to_owned());

    let cwd = std::env::current_dir().map_err(|e| format!("cannot read working directory: {e}"))?;
    let dir = cwd.join(name);
    if dir.exists() {
        return Err(format!("'{name}' already exists"));
    }

    match boilerplate {
        Some(url) => {
            clone_boilerplate(url, &dir)?;
            let mut missing = BTreeSet::new();
            render_tree(&dir, &vars, &mut missing)?;
            if !missing.is_empty() {
                for key in &missing {
                    eprintln!("variable '{key}' not defined, pass it as --{key} VALUE");
                }
                return Err("required variables are missing".to_owned());
            }
        }
        None => {
            vars.entry("team".to_owned())
                .or_insert_with(|| name.to_owned());
            std::fs::create_dir(&dir).map_err(|e| format!("{}: {e}", dir.display()))?;
            write_basic(&dir, &vars)?;
        }
    }
    commit_project(&dir)?;
    println!("created project '{name}'");
    Ok(EXIT_SUCCESS)
}
