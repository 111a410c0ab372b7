use tracing::info;

use culvert::manage::Management;
use culvert::mesh::MeshRouter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("culvert — TCP tunneling over the address mesh");

    let mesh = MeshRouter::new();
    let management = Management::new(mesh);
    let created = management.apply_env().await?;
    if created == 0 {
        info!(
            "no endpoints configured; set {} and {} to bring tunnels up",
            culvert::manage::ENV_LISTENERS,
            culvert::manage::ENV_CONNECTORS
        );
    } else {
        info!(entities = created, "endpoints up");
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    for entity in management.list().await {
        management.delete(&entity.name).await?;
    }
    Ok(())
}
