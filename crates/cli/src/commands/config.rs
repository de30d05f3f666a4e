//! `podnetctl config` - daemon mode and per-pod resource bindings

use anyhow::Result;
use tabled::Tabled;

use crate::client::DaemonClient;
use crate::output::{self, OutputFormat};

#[derive(Tabled, serde::Serialize)]
struct PodRow {
    #[tabled(rename = "POD")]
    pod: String,
    #[tabled(rename = "RESOURCES")]
    resources: String,
}

pub async fn run(client: &DaemonClient, format: OutputFormat) -> Result<()> {
    let snapshot = client.config().await?;

    if matches!(format, OutputFormat::Table) {
        output::print_info(&format!("daemon mode: {}", snapshot.daemon_mode));
        output::print_info(&format!("config file: {}", snapshot.config_file_path));
        output::print_info(&format!("pending pods: {}", snapshot.pending_pods));
    }

    let rows: Vec<PodRow> = snapshot
        .pods
        .iter()
        .map(|pod| PodRow {
            pod: pod.key.clone(),
            resources: pod.resources.join(" "),
        })
        .collect();

    output::print_table(&rows, format);
    Ok(())
}
