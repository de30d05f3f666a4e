//! `podnetctl health` - daemon component health

use anyhow::Result;
use tabled::Tabled;

use crate::client::DaemonClient;
use crate::output::{self, OutputFormat};

#[derive(Tabled, serde::Serialize)]
struct HealthRow {
    #[tabled(rename = "COMPONENT")]
    component: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "MESSAGE")]
    message: String,
}

pub async fn run(client: &DaemonClient, format: OutputFormat) -> Result<()> {
    let health = client.health().await?;

    let mut rows: Vec<HealthRow> = health
        .components
        .iter()
        .map(|(name, component)| HealthRow {
            component: name.clone(),
            status: output::color_status(&component.status),
            message: component.message.clone().unwrap_or_default(),
        })
        .collect();
    rows.sort_by(|a, b| a.component.cmp(&b.component));

    output::print_table(&rows, format);

    if matches!(format, OutputFormat::Table) {
        output::print_info(&format!(
            "daemon status: {}",
            output::color_status(&health.status)
        ));
    }

    Ok(())
}
