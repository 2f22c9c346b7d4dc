use rmcp::ErrorData as McpError;
use serde_json::Value;
use url::Url;

use crate::pipeline::ImageSource;

pub fn validate_http_url(raw: &str) -> Result<Url, McpError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(McpError::invalid_params("url must not be empty", None));
    }
    let parsed = Url::parse(trimmed).map_err(|err| {
        McpError::invalid_params("invalid url", Some(Value::String(err.to_string())))
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        scheme => Err(McpError::invalid_params(
            "only http or https urls are allowed",
            Some(Value::String(format!("scheme: {scheme}"))),
        )),
    }
}

/// Accepts an http(s) url or a base64 `data:` URI. Server-side paths are
/// never reachable from a tool call.
pub fn parse_image_source(raw: &str) -> Result<ImageSource, McpError> {
    let trimmed = raw.trim();
    if trimmed.starts_with("data:") {
        if !trimmed.contains(";base64,") {
            return Err(McpError::invalid_params(
                "data uri must be base64 encoded",
                None,
            ));
        }
        return Ok(ImageSource::InlineData(trimmed.to_string()));
    }
    let url = validate_http_url(trimmed)?;
    Ok(ImageSource::RemoteUrl(url.to_string()))
}
