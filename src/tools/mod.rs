pub mod check_quota;
pub mod enhance_image;
pub mod generate_image;
pub mod list_generated_images;
pub mod url_validation;

use rmcp::{
    ErrorData as McpError,
    model::{CallToolResult, Content},
};
use serde::Serialize;
use tracing::info;

use crate::pipeline::{GenerationOutcome, GenerationRun};

#[derive(Serialize)]
pub struct ToolResponse {
    pub url: String,
    pub name: String,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(rename = "imageId", skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
}

pub use check_quota::{CheckQuotaRequest, check_quota};
pub use enhance_image::{EnhanceImageRequest, enhance_image};
pub use generate_image::{GenerateImageRequest, generate_image};
pub use list_generated_images::{ListGeneratedImagesRequest, list_generated_images};
pub use url_validation::{parse_image_source, validate_http_url};

pub(crate) fn json_result<T: Serialize>(value: &T) -> Result<CallToolResult, McpError> {
    let json = serde_json::to_string(value).map_err(|err| {
        McpError::internal_error(
            "serialize tool response failed",
            Some(serde_json::Value::String(err.to_string())),
        )
    })?;
    Ok(CallToolResult::success(vec![Content::text(json)]))
}

/// Waits for a run, logging its progress, and turns the outcome into a tool
/// response.
pub(crate) async fn finish_run(
    tool: &'static str,
    run: GenerationRun,
    name: &str,
    text: &str,
) -> Result<CallToolResult, McpError> {
    let outcome = run
        .finish(|event| info!(tool, percent = event.percent, phrase = %event.phrase, "progress"))
        .await;
    outcome_response(tool, outcome, name, text)
}

fn outcome_response(
    tool: &'static str,
    outcome: GenerationOutcome,
    name: &str,
    text: &str,
) -> Result<CallToolResult, McpError> {
    let GenerationOutcome {
        success,
        image_url,
        seed,
        image_id,
        error,
    } = outcome;
    let url = match (success, image_url) {
        (true, Some(url)) => url,
        _ => {
            return Err(McpError::internal_error(
                format!("{tool} failed"),
                error.map(serde_json::Value::String),
            ));
        }
    };
    let response = ToolResponse {
        mime_type: mime_for_url(&url).to_string(),
        url,
        name: name.to_string(),
        text: text.to_string(),
        seed,
        image_id,
    };
    json_result(&response)
}

fn mime_for_url(url: &str) -> &'static str {
    if let Some(header) = url.strip_prefix("data:") {
        return match header.split(';').next() {
            Some("image/jpeg") => "image/jpeg",
            Some("image/webp") => "image/webp",
            _ => "image/png",
        };
    }
    let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
    if path.ends_with(".jpg") || path.ends_with(".jpeg") {
        "image/jpeg"
    } else if path.ends_with(".webp") {
        "image/webp"
    } else {
        "image/png"
    }
}
