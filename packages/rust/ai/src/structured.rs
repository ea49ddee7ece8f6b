//! Parsing of structured (JSON) model output.
//!
//! Models are asked for bare JSON but regularly wrap it in a fenced code
//! block or surround it with prose. We try the content as-is first, then the
//! first fenced block, then the outermost `{...}` span.

use regex::Regex;
use serde::de::DeserializeOwned;
use tracing::debug;

use lexiforge_shared::{LexiforgeError, Result};

/// Parse model output as `T`, tolerating code fences and surrounding prose.
pub fn parse_json_content<T: DeserializeOwned>(content: &str) -> Result<T> {
    let direct_err = match serde_json::from_str::<T>(content.trim()) {
        Ok(value) => return Ok(value),
        Err(e) => e,
    };

    if let Some(block) = fenced_block(content) {
        if let Ok(value) = serde_json::from_str::<T>(block) {
            debug!("extracted JSON from fenced code block");
            return Ok(value);
        }
    }

    if let (Some(start), Some(end)) = (content.find('{'), content.rfind('}')) {
        if start < end {
            if let Ok(value) = serde_json::from_str::<T>(&content[start..=end]) {
                debug!("extracted JSON object from surrounding text");
                return Ok(value);
            }
        }
    }

    Err(LexiforgeError::parse(format!(
        "model output is not valid JSON: {direct_err} (got: {})",
        preview(content)
    )))
}

/// Body of the first ```json / ``` fenced block, if any.
fn fenced_block(content: &str) -> Option<&str> {
    let re = Regex::new(r"```(?:json|JSON)?\s*([\s\S]*?)\s*```").ok()?;
    re.captures(content)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

fn preview(content: &str) -> String {
    let mut preview: String = content.chars().take(120).collect();
    if content.chars().count() > 120 {
        preview.push('…');
    }
    preview
}
