//! `podnetctl mapping` - three-way resource mapping dump

use anyhow::Result;
use tabled::Tabled;

use crate::client::{DaemonClient, PodMapping};
use crate::output::{self, OutputFormat};

#[derive(Tabled, serde::Serialize)]
struct MappingRow {
    #[tabled(rename = "POD")]
    pod: String,
    #[tabled(rename = "LOCAL")]
    local: String,
    #[tabled(rename = "REMOTE")]
    remote: String,
    #[tabled(rename = "BOUND")]
    bound: String,
    #[tabled(rename = "STATUS")]
    status: String,
}

impl From<&PodMapping> for MappingRow {
    fn from(entry: &PodMapping) -> Self {
        let pod = if entry.name.is_empty() {
            "-".to_string()
        } else {
            format!("{}/{}", entry.namespace, entry.name)
        };
        let status = if entry.valid { "valid" } else { "invalid" };
        Self {
            pod,
            local: entry.local_res_id.clone(),
            remote: entry.remote_res_id.clone(),
            bound: entry.pod_bind_res_id.clone(),
            status: output::color_status(status),
        }
    }
}

pub async fn run(client: &DaemonClient, format: OutputFormat, invalid_only: bool) -> Result<()> {
    let mapping = client.mapping().await?;

    let invalid = mapping.iter().filter(|m| !m.valid).count();
    let rows: Vec<MappingRow> = mapping
        .iter()
        .filter(|m| !invalid_only || !m.valid)
        .map(MappingRow::from)
        .collect();

    output::print_table(&rows, format);

    if matches!(format, OutputFormat::Table) {
        if invalid > 0 {
            output::print_warning(&format!("{} resource(s) failed validation", invalid));
        } else {
            output::print_info("all resources consistent");
        }
    }

    Ok(())
}
