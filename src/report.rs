use std::fs;
use std::path::Path;

use crate::orchestrator::RunSummary;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Unable to serialize the report: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Unable to write the report to {0}: {1}")]
    Write(String, std::io::Error),
}

/// Writes the run summary as pretty-printed JSON.
pub fn write(path: &Path, summary: &RunSummary) -> Result<(), Error> {
    let file_contents = serde_json::to_string_pretty(summary)?;
    fs::write(path, file_contents)
        .map_err(|error| Error::Write(path.display().to_string(), error))?;

    return Ok(());
}
