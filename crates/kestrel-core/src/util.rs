use std::path::Path;

use crate::error::AppError;

/// Read a URL list: one URL per line, blank lines and `#` comments skipped.
pub fn load_urls(path: &Path) -> Result<Vec<String>, AppError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        AppError::ValidationError(format!("Cannot read URL file {}: {e}", path.display()))
    })?;
    Ok(parse_urls(&content))
}

/// Split text into URLs, same rules as [`load_urls`].
pub fn parse_urls(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}
