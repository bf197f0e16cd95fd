//! HTTP server command - `webs serve`.

use anyhow::Result;
use std::path::PathBuf;
use tracing::warn;

use webs::config::WebsConfig;

/// CLI flags that win over file and environment settings.
pub struct ServeOverrides {
    pub port: Option<u16>,
    pub host: Option<String>,
    pub db_path: Option<PathBuf>,
    pub dev: bool,
}

pub async fn cmd_serve(mut config: WebsConfig, overrides: ServeOverrides) -> Result<()> {
    if let Some(port) = overrides.port {
        config.server.port = port;
    }
    if let Some(host) = overrides.host {
        config.server.host = host;
    }
    if let Some(db_path) = overrides.db_path {
        config.database.path = db_path;
    }
    if overrides.dev {
        config.server.dev = true;
    }

    for warning in config.validate() {
        warn!("{}", warning);
    }

    webs::app::server::start_server(config).await
}
