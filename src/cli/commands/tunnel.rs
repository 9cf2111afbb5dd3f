//! `tunnel check`: open the bastion tunnel once and probe it

use crate::cli::error::CliError;
use crate::config::PipelineConfig;
use crate::pipeline::steps;

pub fn handle_tunnel_check(config: &PipelineConfig) -> Result<(), CliError> {
    let endpoint = format!(
        "{}:{}",
        config.tunnel.local_host,
        config.tunnel_local_port()
    );
    if !steps::check_tunnel(config)? {
        return Err(CliError::Unhealthy(endpoint));
    }
    println!("Tunnel healthy on {}", endpoint);
    Ok(())
}
