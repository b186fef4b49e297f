//! End-of-run statistics, written as JSON.

use std::path::PathBuf;

use serde::Serialize;

use meridian_stack::node::NodeReport;

use crate::topology::LinkReport;
use crate::traffic::FlowStats;

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write report to {0}: {1}")]
    Write(PathBuf, std::io::Error),
}

#[derive(Debug, Serialize)]
pub struct SimulationReport {
    pub simulated_millis: u64,
    pub interrupted: bool,
    pub nodes: Vec<NodeReport>,
    pub links: Vec<LinkReport>,
    pub flows: Vec<FlowStats>,
}

impl SimulationReport {
    /// Write to `path`, or to stdout when `path` is empty.
    pub fn write(&self, path: &str) -> Result<(), ReportError> {
        let text = serde_json::to_string_pretty(self)?;
        if path.is_empty() {
            println!("{text}");
            return Ok(());
        }
        let path = PathBuf::from(path);
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| ReportError::Write(path.clone(), e))?;
        }
        std::fs::write(&path, text).map_err(|e| ReportError::Write(path.clone(), e))?;
        tracing::info!(path = %path.display(), "report written");
        Ok(())
    }
}
