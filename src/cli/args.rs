// ABOUTME: Command line argument definitions and parsing using Clap
// ABOUTME: Defines the trellis CLI structure with run and validate subcommands

use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "trellis")]
#[command(about = "Runs declarative task graphs with dependencies, fan-out and resource limits")]
#[command(version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true, help = "Enable verbose output")]
    pub verbose: bool,

    #[arg(short, long, global = true, help = "Path to configuration file")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Disable colored output")]
    pub no_color: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a task definition from a YAML file
    Run {
        #[arg(help = "Path to task definition YAML file")]
        definition: PathBuf,

        #[arg(
            short = 'V',
            long = "var",
            help = "Set an initial binding (key=value, value parsed as YAML)"
        )]
        vars: Vec<String>,

        #[arg(long, help = "Dry run - validate without executing")]
        dry_run: bool,

        #[arg(short, long, help = "Write the run result as JSON to this file")]
        output: Option<PathBuf>,

        #[arg(long, help = "Maximum number of concurrently running actions")]
        max_concurrent: Option<usize>,
    },

    /// Validate a task definition without running it
    Validate {
        #[arg(help = "Path to task definition YAML file")]
        definition: PathBuf,
    },
}

impl Args {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Parse `key=value` pairs. Values are read as YAML scalars, so `3`
    /// becomes a number and `true` a boolean; anything else stays a string.
    pub fn parse_variables(vars: &[String]) -> anyhow::Result<Map<String, Value>> {
        let mut variables = Map::new();

        for var in vars {
            let Some((key, raw)) = var.split_once('=') else {
                return Err(anyhow::anyhow!(
                    "Invalid variable format '{}'. Expected 'key=value'",
                    var
                ));
            };
            if key.trim().is_empty() {
                return Err(anyhow::anyhow!("Variable name cannot be empty in '{}'", var));
            }
            let value = match serde_yaml::from_str::<Value>(raw) {
                Ok(parsed @ (Value::Bool(_) | Value::Number(_))) => parsed,
                _ => Value::String(raw.to_string()),
            };
            variables.insert(key.trim().to_string(), value);
        }

        Ok(variables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_variables() {
        let vars = vec![
            "env=production".to_string(),
            "replicas=3".to_string(),
            "debug=true".to_string(),
            "query=a=b".to_string(),
        ];

        let parsed = Args::parse_variables(&vars).unwrap();

        assert_eq!(parsed.get("env"), Some(&json!("production")));
        assert_eq!(parsed.get("replicas"), Some(&json!(3)));
        assert_eq!(parsed.get("debug"), Some(&json!(true)));
        assert_eq!(parsed.get("query"), Some(&json!("a=b")));
    }

    #[test]
    fn test_parse_variables_invalid() {
        assert!(Args::parse_variables(&["invalid_format".to_string()]).is_err());
        assert!(Args::parse_variables(&["=value".to_string()]).is_err());
    }

    #[test]
    fn test_parse_run_command() {
        let args = Args::try_parse_from([
            "trellis",
            "run",
            "graph.yaml",
            "-V",
            "region=eu",
            "--max-concurrent",
            "2",
            "--verbose",
        ])
        .unwrap();

        assert!(args.verbose);
        match args.command {
            Commands::Run {
                definition,
                vars,
                max_concurrent,
                dry_run,
                ..
            } => {
                assert_eq!(definition, PathBuf::from("graph.yaml"));
                assert_eq!(vars, vec!["region=eu".to_string()]);
                assert_eq!(max_concurrent, Some(2));
                assert!(!dry_run);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
