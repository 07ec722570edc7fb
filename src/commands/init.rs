use std::fs;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;

use crate::config::{CONFIG_TOML, Config};
use crate::error::ExitError;
use crate::subprocess::Tool;

#[derive(Debug, Args)]
pub struct InitArgs {
    /// Repository owner (user or organization)
    #[arg(long)]
    pub owner: Option<String>,
    /// Repository name
    #[arg(long)]
    pub repo: Option<String>,
    /// Project board number
    #[arg(long)]
    pub project_number: Option<u64>,
    /// Non-interactive mode
    #[arg(long)]
    pub no_interactive: bool,
    /// Force overwrite existing config
    #[arg(long)]
    pub force: bool,
    /// Project root directory
    #[arg(long)]
    pub project_root: Option<PathBuf>,
}

/// Owner and repo from a GitHub remote URL, SSH or HTTPS.
fn parse_remote(url: &str) -> Option<(String, String)> {
    let url = url.trim().trim_end_matches('/');
    let path = url
        .strip_prefix("git@github.com:")
        .or_else(|| url.strip_prefix("ssh://git@github.com/"))
        .or_else(|| url.strip_prefix("https://github.com/"))?;
    let path = path.strip_suffix(".git").unwrap_or(path);
    let (owner, repo) = path.split_once('/')?;
    if owner.is_empty() || repo.is_empty() || repo.contains('/') {
        return None;
    }
    Some((owner.to_string(), repo.to_string()))
}

fn infer_from_git(root: &Path) -> Option<(String, String)> {
    let out = Tool::new("git")
        .args(&["remote", "get-url", "origin"])
        .current_dir(root)
        .run()
        .ok()?;
    out.success().then(|| parse_remote(&out.stdout)).flatten()
}

fn prompt_input(prompt: &str, default: Option<&str>) -> Result<String> {
    let mut builder = dialoguer::Input::<String>::new().with_prompt(prompt);
    if let Some(d) = default {
        builder = builder.default(d.to_string());
    }
    builder.interact_text().context("reading user input")
}

/// Make sure the state directory is ignored by git.
fn ignore_state_dir(root: &Path) -> Result<bool> {
    let path = root.join(".gitignore");
    let existing = fs::read_to_string(&path).unwrap_or_default();
    if existing.lines().any(|l| matches!(l.trim(), ".foreman" | ".foreman/" | "/.foreman/")) {
        return Ok(false);
    }
    let mut contents = existing;
    if !contents.is_empty() && !contents.ends_with('\n') {
        contents.push('\n');
    }
    contents.push_str(".foreman/\n");
    fs::write(&path, contents).with_context(|| format!("writing {}", path.display()))?;
    Ok(true)
}

impl InitArgs {
    pub fn execute(&self) -> Result<()> {
        let root = match &self.project_root {
            Some(p) => p.clone(),
            None => std::env::current_dir().context("could not determine current directory")?,
        };
        let config_path = root.join(CONFIG_TOML);
        if config_path.exists() && !self.force {
            return Err(ExitError::Config(format!(
                "{CONFIG_TOML} already exists. Use --force to overwrite."
            ))
            .into());
        }

        let interactive = !self.no_interactive && std::io::stdin().is_terminal();
        let inferred = infer_from_git(&root);
        let (inferred_owner, inferred_repo) = inferred.unzip();

        let owner = match (&self.owner, interactive) {
            (Some(o), _) => o.clone(),
            (None, true) => prompt_input("Repository owner", inferred_owner.as_deref())?,
            (None, false) => inferred_owner
                .ok_or_else(|| ExitError::Config("--owner is required (no GitHub origin remote)".into()))?,
        };
        let repo = match (&self.repo, interactive) {
            (Some(r), _) => r.clone(),
            (None, true) => prompt_input("Repository name", inferred_repo.as_deref())?,
            (None, false) => inferred_repo
                .ok_or_else(|| ExitError::Config("--repo is required (no GitHub origin remote)".into()))?,
        };
        let project_number = match (self.project_number, interactive) {
            (Some(n), _) => n,
            (None, true) => prompt_input("Project board number", None)?
                .trim()
                .parse()
                .map_err(|e| ExitError::Config(format!("invalid project number: {e}")))?,
            (None, false) => {
                return Err(ExitError::Config("--project-number is required".into()).into());
            }
        };

        let config = Config::new(&owner, &repo, project_number);
        config.validate()?;
        fs::write(&config_path, config.to_toml()?)
            .with_context(|| format!("writing {}", config_path.display()))?;
        println!("Wrote {CONFIG_TOML} for {owner}/{repo} (board #{project_number})");
        if ignore_state_dir(&root)? {
            println!("Added .foreman/ to .gitignore");
        }
        Ok(())
    }
}
