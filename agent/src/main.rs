//! Build agent CLI.
//!
//! Executes a serialized instruction tree the way the server's build compiler
//! emits it: `run` interprets the tree against local collaborators, `dump`
//! prints its deterministic text form, `validate` just parses it.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use agent::config::{AgentConfig, load_config};
use agent::console::StdoutSink;
use agent::exit_codes;
use agent::instruction::Instruction;
use agent::ports::{BuildResult, LocalArtifactRepository, LogStatusReporter, UreqHttpClient};
use agent::process::SystemProcessRunner;
use agent::session::{BuildSession, SessionContext};

#[derive(Parser)]
#[command(name = "agent", version, about = "Build instruction tree interpreter")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute an instruction tree and exit with the build result.
    Run {
        /// Path to the serialized instruction tree (JSON).
        tree: PathBuf,
        /// Path to the agent config (TOML). Missing file means defaults.
        #[arg(short, long, default_value = "agent.toml")]
        config: PathBuf,
    },
    /// Print the deterministic text dump of an instruction tree.
    Dump {
        /// Path to the serialized instruction tree (JSON).
        tree: PathBuf,
    },
    /// Parse an instruction tree and report errors without executing it.
    Validate {
        /// Path to the serialized instruction tree (JSON).
        tree: PathBuf,
    },
}

fn main() {
    agent::logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run { tree, config } => cmd_run(&tree, &config),
        Command::Dump { tree } => {
            let root = read_tree(&tree)?;
            println!("{}", root.dump());
            Ok(exit_codes::OK)
        }
        Command::Validate { tree } => {
            read_tree(&tree)?;
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_run(tree: &Path, config: &Path) -> Result<i32> {
    let config: AgentConfig = load_config(config)?;
    let root = read_tree(tree)?;

    fs::create_dir_all(&config.sandbox_dir)
        .with_context(|| format!("create {}", config.sandbox_dir.display()))?;
    fs::create_dir_all(&config.artifacts_dir)
        .with_context(|| format!("create {}", config.artifacts_dir.display()))?;
    let sandbox = config
        .sandbox_dir
        .canonicalize()
        .with_context(|| format!("resolve {}", config.sandbox_dir.display()))?;

    let mut session = BuildSession::new(SessionContext {
        console: Arc::new(StdoutSink),
        repository: Arc::new(LocalArtifactRepository::new(config.artifacts_dir.clone())),
        reporter: Arc::new(LogStatusReporter),
        http: Arc::new(UreqHttpClient),
        runner: Arc::new(SystemProcessRunner),
        sandbox,
        envs: config.env.clone(),
        poll_interval: config.poll_interval(),
    });

    Ok(match session.execute(&root) {
        BuildResult::Passed => exit_codes::OK,
        BuildResult::Failed => exit_codes::FAILED,
        BuildResult::Cancelled => exit_codes::CANCELLED,
    })
}

fn read_tree(path: &Path) -> Result<Instruction> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_defaults_config_path() {
        let cli = Cli::parse_from(["agent", "run", "build.json"]);
        match cli.command {
            Command::Run { tree, config } => {
                assert_eq!(tree, PathBuf::from("build.json"));
                assert_eq!(config, PathBuf::from("agent.toml"));
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn parse_dump() {
        let cli = Cli::parse_from(["agent", "dump", "build.json"]);
        assert!(matches!(cli.command, Command::Dump { .. }));
    }

    #[test]
    fn read_tree_reports_parse_errors() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("bad.json");
        fs::write(&path, "{\"name\": \"not-an-opcode\"}").expect("write");
        let err = read_tree(&path).expect_err("should fail");
        assert!(format!("{err:#}").contains("bad.json"));
    }
}
