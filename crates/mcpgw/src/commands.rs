use gateway_api_server::config::GatewayConfig;
use registry::proxy::{render_fragment, routes_from_records};
use registry::repository::FileRepository;
use shared::error::CommonError;

use crate::server;

pub async fn cmd_serve() -> Result<(), CommonError> {
    let config = GatewayConfig::from_env()?;
    server::serve(config).await
}

/// Operator debugging: render the fragment the registry would write, from
/// the records on disk, without starting anything.
pub async fn cmd_generate_config() -> Result<(), CommonError> {
    let config = GatewayConfig::from_env()?;
    let repository = FileRepository::new(&config.registry_dir);
    let (mut records, quarantined) = repository.load_all().await?;
    for q in &quarantined {
        eprintln!("# skipped {}: {}", q.file, q.error);
    }
    records.sort_by(|a, b| a.path.cmp(&b.path));
    print!("{}", render_fragment(&routes_from_records(records.iter())));
    Ok(())
}
