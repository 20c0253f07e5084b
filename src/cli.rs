//! Command line parsing for the `multisite` binary

use crate::tasks::{Frequency, TaskTargets};
use std::path::PathBuf;

pub const USAGE: &str = "\
Usage:
  multisite [CONFIG]                      Serve sites
  multisite sites list                    List every site in the store
  multisite sites put FILE                Create or update sites from a TOML file
  multisite task NAME [ARGS..] TARGET     Run a task now
      TARGET: --site=ID | --sites=A,B | --all-sites | --control
            | --temporary-site [--theme=NAME]
      --concurrency=N                     Sites to run against at once
  multisite tasks --frequency=hourly|daily
                                          Run the scheduled tasks unless they ran recently

Options:
  --config=PATH   Config file (default: $MULTISITE_CONFIG or multisite.toml)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SitesCommand {
    List,
    Put(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Serve,
    Sites(SitesCommand),
    Task {
        name: String,
        args: Vec<String>,
        targets: TaskTargets,
        concurrency: Option<usize>,
    },
    Tasks {
        frequency: Frequency,
    },
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub config_path: Option<PathBuf>,
    pub command: Command,
}

/// Parse the arguments after the program name
pub fn parse_args(args: &[String]) -> anyhow::Result<Invocation> {
    let mut config_path = None;
    let mut rest = Vec::with_capacity(args.len());
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if let Some(path) = arg.strip_prefix("--config=") {
            config_path = Some(PathBuf::from(path));
        } else if arg == "--config" {
            let path = iter
                .next()
                .ok_or_else(|| anyhow::anyhow!("--config needs a path"))?;
            config_path = Some(PathBuf::from(path));
        } else {
            rest.push(arg.clone());
        }
    }

    let command = match rest.first().map(String::as_str) {
        None => Command::Serve,
        Some("help" | "--help" | "-h") => Command::Help,
        Some("sites") => parse_sites_command(&rest[1..])?,
        Some("task") => parse_task_command(&rest[1..])?,
        Some("tasks") => parse_tasks_command(&rest[1..])?,
        Some(path) if rest.len() == 1 && !path.starts_with('-') => {
            config_path = Some(PathBuf::from(path));
            Command::Serve
        }
        Some(other) => anyhow::bail!("Unknown command '{}'\n\n{}", other, USAGE),
    };

    Ok(Invocation {
        config_path,
        command,
    })
}

fn parse_sites_command(args: &[String]) -> anyhow::Result<Command> {
    match args.first().map(String::as_str) {
        Some("list") | Some("ls") => Ok(Command::Sites(SitesCommand::List)),
        Some("put") => {
            let file = args
                .get(1)
                .ok_or_else(|| anyhow::anyhow!("sites put needs a FILE"))?;
            Ok(Command::Sites(SitesCommand::Put(PathBuf::from(file))))
        }
        _ => anyhow::bail!("Usage: multisite sites list|put FILE"),
    }
}

fn parse_task_command(args: &[String]) -> anyhow::Result<Command> {
    let name = match args.first() {
        Some(name) if !name.starts_with('-') => name.clone(),
        _ => anyhow::bail!("task needs a NAME\n\n{}", USAGE),
    };

    let mut targets = Vec::new();
    let mut concurrency = None;
    let mut theme = None;
    let mut task_args = Vec::new();

    for arg in &args[1..] {
        if let Some(site) = arg.strip_prefix("--site=") {
            targets.push(TaskTargets::Site(site.to_string()));
        } else if let Some(sites) = arg.strip_prefix("--sites=") {
            let sites: Vec<String> = sites
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            if sites.is_empty() {
                anyhow::bail!("--sites needs at least one site");
            }
            targets.push(TaskTargets::Sites(sites));
        } else if arg == "--all-sites" {
            targets.push(TaskTargets::All);
        } else if arg == "--control" {
            targets.push(TaskTargets::Control);
        } else if arg == "--temporary-site" {
            targets.push(TaskTargets::Temporary { theme: None });
        } else if let Some(name) = arg.strip_prefix("--theme=") {
            if name.is_empty() {
                anyhow::bail!("--theme needs a name");
            }
            theme = Some(name.to_string());
        } else if let Some(n) = arg.strip_prefix("--concurrency=") {
            let n: usize = n
                .parse()
                .map_err(|_| anyhow::anyhow!("--concurrency must be a positive number"))?;
            if n == 0 {
                anyhow::bail!("--concurrency must be a positive number");
            }
            concurrency = Some(n);
        } else {
            task_args.push(arg.clone());
        }
    }

    let targets = match targets.len() {
        0 => anyhow::bail!(
            "task needs one of --site=ID, --sites=A,B, --all-sites, --control or --temporary-site"
        ),
        1 => targets.remove(0),
        _ => anyhow::bail!(
            "task takes exactly one of --site, --sites, --all-sites, --control or --temporary-site"
        ),
    };
    let targets = match (targets, theme) {
        (TaskTargets::Temporary { .. }, theme) => TaskTargets::Temporary { theme },
        (targets, None) => targets,
        (_, Some(_)) => anyhow::bail!("--theme only applies to --temporary-site"),
    };

    Ok(Command::Task {
        name,
        args: task_args,
        targets,
        concurrency,
    })
}

fn parse_tasks_command(args: &[String]) -> anyhow::Result<Command> {
    let frequency = args
        .iter()
        .find_map(|arg| arg.strip_prefix("--frequency="))
        .ok_or_else(|| anyhow::anyhow!("tasks needs --frequency=hourly|daily"))?;
    Ok(Command::Tasks {
        frequency: frequency.parse()?,
    })
}
