use medvision_gateway::{config::get_configuration, services::init_metrics, Application};
use service_core::observability::init_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = get_configuration()?;
    init_tracing(
        "medvision-gateway",
        &settings.observability.log_level,
        settings.observability.otlp_endpoint.as_deref(),
    );
    init_metrics()?;

    let application = Application::build(settings).await?;

    let state = application.state();
    tokio::spawn(async move {
        state.meldrx.verify_connection(&state.broker).await;
    });

    application.run_until_stopped().await?;

    Ok(())
}
