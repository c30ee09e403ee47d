//! Output formatting utilities

use crate::OutputFormat;
use human_bytes::human_bytes;
use serde::Serialize;
use std::fmt::Display;

/// Render a result the way `format` asks for
fn render<T: Serialize + Display>(value: &T, format: OutputFormat) -> serde_json::Result<String> {
    match format {
        OutputFormat::Json => serde_json::to_string_pretty(value),
        OutputFormat::Human => Ok(value.to_string()),
    }
}

pub fn print_output<T: Serialize + Display>(value: &T, format: OutputFormat) -> anyhow::Result<()> {
    println!("{}", render(value, format)?);
    Ok(())
}

/// `downloaded / total` in human units, `?` when the total is unknown
pub fn format_progress(downloaded: u64, total: Option<u64>) -> String {
    let total = total.map_or_else(|| "?".to_string(), |total| human_bytes(total as f64));
    format!("{} / {}", human_bytes(downloaded as f64), total)
}
