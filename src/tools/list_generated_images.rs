use rmcp::{ErrorData as McpError, handler::server::wrapper::Parameters, model::CallToolResult};
use schemars::JsonSchema;
use serde::Deserialize;

use crate::pipeline::GenerationPipeline;
use crate::tools::json_result;

const DEFAULT_LIMIT: u32 = 10;
const MAX_LIMIT: u32 = 50;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListGeneratedImagesRequest {
    #[schemars(description = "User whose saved images are listed")]
    pub user_id: String,
    #[schemars(description = "Maximum number of images, newest first. Default 10, at most 50")]
    pub limit: Option<u32>,
}

pub async fn list_generated_images(
    pipeline: &GenerationPipeline,
    Parameters(request): Parameters<ListGeneratedImagesRequest>,
) -> Result<CallToolResult, McpError> {
    let user_id = request.user_id.trim();
    if user_id.is_empty() {
        return Err(McpError::invalid_params("user_id must not be empty", None));
    }
    let limit = request.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT) as usize;
    let records = pipeline
        .images()
        .list_images(user_id, limit)
        .await
        .map_err(|err| {
            McpError::internal_error(
                "list generated images failed",
                Some(serde_json::Value::String(err.to_string())),
            )
        })?;
    json_result(&records)
}
