use clap::{command, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about = "Measure the energy and resource usage of a command")]
pub struct Args {
    #[arg(short, long)]
    /// Configuration file layered over the built-in defaults
    pub config: Option<String>,
    #[arg(short = 's', long = "set", value_parser = parse_override)]
    /// Override one configuration value, e.g. `monitor.sampling_period=0.5`
    pub overrides: Vec<(String, String)>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a command under measurement and append the result to its history
    Monitor(MonitorArgs),
    /// List the sensors that can be read on this host
    Sensors,
}

#[derive(Parser, Debug)]
pub struct MonitorArgs {
    #[arg(short, long)]
    /// History key; defaults to the configured app name, else the command's name
    pub app: Option<String>,
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    /// The command line to measure
    pub command: Vec<String>,
}

fn parse_override(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.to_string())),
        _ => Err(format!("expected key=value, got '{}'", s)),
    }
}
