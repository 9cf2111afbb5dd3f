//! Provider-mode aware connection resolution

use super::{ConnectionParams, DatabaseResult};
use crate::config::{
    DEFAULT_LOCAL_PORT, ENV_DB_NAME, ENV_DB_PASSWORD, ENV_DB_USER, PipelineConfig, ProviderMode,
    require,
};
use crate::infra::terraform::OutputSource;

/// Host used for a local server when `DB_HOST` is unset
pub const DEFAULT_LOCAL_HOST: &str = "localhost";

/// Resolve the connection parameters for this run
///
/// - `local`: configured host/port (default `localhost:5432`) and credentials
/// - `azure`: Terraform outputs read through `outputs`
/// - `azure_tunnel`: the tunnel's local endpoint and configured credentials
///
/// `outputs` is only consulted in `azure` mode.
pub fn resolve_connection(
    config: &PipelineConfig,
    outputs: &dyn OutputSource,
) -> DatabaseResult<ConnectionParams> {
    let db = &config.database;
    let params = match config.provider()? {
        ProviderMode::Local => ConnectionParams {
            host: db
                .host
                .clone()
                .unwrap_or_else(|| DEFAULT_LOCAL_HOST.to_string()),
            port: db.port.unwrap_or(DEFAULT_LOCAL_PORT),
            user: require(&db.user, ENV_DB_USER)?.to_string(),
            password: require(&db.password, ENV_DB_PASSWORD)?.to_string(),
            dbname: require(&db.name, ENV_DB_NAME)?.to_string(),
            schema: db.schema.clone(),
        },
        ProviderMode::Azure => outputs
            .load_outputs()?
            .connection_params(&db.schema)?,
        ProviderMode::AzureTunnel => ConnectionParams {
            host: config.tunnel.local_host.clone(),
            port: config.tunnel_local_port(),
            user: require(&db.user, ENV_DB_USER)?.to_string(),
            password: require(&db.password, ENV_DB_PASSWORD)?.to_string(),
            dbname: require(&db.name, ENV_DB_NAME)?.to_string(),
            schema: db.schema.clone(),
        },
    };

    tracing::debug!(
        "Resolved {} connection: {}",
        config.provider()?,
        params.connection_string_masked()
    );
    Ok(params)
}
