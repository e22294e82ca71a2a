mod agent;

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use credagent_core::{logging, AgentConfig, HttpTransport, LoggingEventSink};
use tracing::{error, info};

use crate::agent::Agent;

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|arg| arg == "--print-default-config") {
        print!("{}", default_config_document()?);
        return Ok(());
    }

    let config = match parse_config_path(&args)? {
        Some(path) => AgentConfig::from_file(&path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => AgentConfig::default_config(),
    };
    logging::init_from_config(&config.logging)?;
    let once = args.iter().any(|arg| arg == "--once");

    info!(
        version = env!("CARGO_PKG_VERSION"),
        base_url = %config.server.base_url,
        topology = ?config.server.topology,
        "Starting credagent-node"
    );

    let transport = Arc::new(HttpTransport::new(
        &config.server.user_agent,
        Duration::from_secs(config.server.request_timeout_secs),
    )?);
    let agent = Agent::new(config, transport, Arc::new(LoggingEventSink));
    agent.init()?;

    loop {
        let outcome = agent.tick();
        match &outcome {
            Ok(report) if !report.completed.is_empty() => {
                info!(completed = ?report.completed, "Assets completed");
            }
            Ok(_) => {}
            Err(err) => error!(error = %format!("{:#}", err), "Agent tick failed"),
        }
        if once {
            break;
        }
        thread::sleep(agent.next_delay(&outcome));
    }

    agent.shutdown();
    Ok(())
}

/// The default configuration as a file `--config` can load.
fn default_config_document() -> Result<String> {
    Ok(AgentConfig::default_config().to_toml_string()?)
}

fn parse_config_path(args: &[String]) -> Result<Option<PathBuf>> {
    let mut args_iter = args.iter();
    while let Some(arg) = args_iter.next() {
        if arg == "--config" {
            match args_iter.next() {
                Some(path) => return Ok(Some(PathBuf::from(path))),
                None => bail!("--config was provided without a path"),
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_config_path() {
        assert_eq!(
            parse_config_path(&args(&["credagent-node", "--config", "/etc/credagent.toml"])).unwrap(),
            Some(PathBuf::from("/etc/credagent.toml"))
        );
        assert_eq!(parse_config_path(&args(&["credagent-node"])).unwrap(), None);
        assert!(parse_config_path(&args(&["credagent-node", "--config"])).is_err());
    }

    #[test]
    fn test_printed_default_config_loads_back() {
        let document = default_config_document().unwrap();
        let loaded = AgentConfig::from_toml_str(&document).unwrap();
        assert_eq!(loaded, AgentConfig::default_config());
    }
}
