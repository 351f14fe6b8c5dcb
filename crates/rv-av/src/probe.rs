//! Container duration lookup via ffprobe.

use std::path::Path;
use std::time::Duration;

use crate::command::ToolCommand;
use crate::tools::ToolRegistry;

/// Return the container duration of `input` in seconds.
///
/// `Ok(None)` means ffprobe ran but reported no usable duration (e.g. a
/// live-style stream); errors from ffprobe itself are propagated.
pub async fn probe_duration(tools: &ToolRegistry, input: &Path) -> rv_core::Result<Option<f64>> {
    let ffprobe = tools.require("ffprobe")?;

    let output = ToolCommand::new(ffprobe.path.clone())
        .timeout(Duration::from_secs(60))
        .args(["-v", "error", "-print_format", "json", "-show_entries", "format=duration"])
        .arg(input.to_string_lossy().as_ref())
        .execute()
        .await?;

    parse_duration_json(&output.stdout)
}

/// Extract `format.duration` from ffprobe JSON output.
pub(crate) fn parse_duration_json(json: &str) -> rv_core::Result<Option<f64>> {
    let value: serde_json::Value = serde_json::from_str(json)
        .map_err(|e| rv_core::Error::tool("ffprobe", format!("unparseable output: {e}")))?;

    Ok(value
        .get("format")
        .and_then(|f| f.get("duration"))
        .and_then(|d| match d {
            serde_json::Value::String(s) => s.parse::<f64>().ok(),
            serde_json::Value::Number(n) => n.as_f64(),
            _ => None,
        })
        .filter(|d| d.is_finite() && *d > 0.0))
}
