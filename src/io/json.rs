//! Report JSON.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::{HarnessError, Result};
use crate::report::Report;

/// Write the structured report. Required output of the compare pass.
pub fn write_report_json(path: &Path, report: &Report) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| HarnessError::io(parent, e))?;
    }
    let file = File::create(path).map_err(|e| HarnessError::io(path, e))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, report)?;
    writer.flush().map_err(|e| HarnessError::io(path, e))?;
    Ok(())
}
