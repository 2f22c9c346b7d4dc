use rmcp::{ErrorData as McpError, handler::server::wrapper::Parameters, model::CallToolResult};
use schemars::JsonSchema;
use serde::Deserialize;

use crate::pipeline::{EnhanceRequest, GenerationPipeline};
use crate::tools::{finish_run, parse_image_source};

#[derive(Debug, Deserialize, JsonSchema)]
pub struct EnhanceImageRequest {
    #[schemars(description = "Image to enhance: http(s) url or base64 data uri")]
    pub image_url: String,
    #[schemars(description = "Upscale factor between 1 and 4. Default 2")]
    pub upscale_factor: Option<f32>,
    #[schemars(description = "User the enhancement is billed to and saved for")]
    pub user_id: Option<String>,
}

pub async fn enhance_image(
    pipeline: &GenerationPipeline,
    Parameters(request): Parameters<EnhanceImageRequest>,
) -> Result<CallToolResult, McpError> {
    let source = parse_image_source(&request.image_url)?;
    let upscale_factor = request.upscale_factor.unwrap_or(2.0);
    if !(1.0..=4.0).contains(&upscale_factor) {
        return Err(McpError::invalid_params(
            "upscale_factor must be between 1 and 4",
            None,
        ));
    }
    let run = pipeline.start_enhance(EnhanceRequest {
        source,
        upscale_factor: Some(upscale_factor),
        user_id: request.user_id.filter(|id| !id.trim().is_empty()),
    });
    finish_run("enhance_image", run, "enhanced-image", "Image enhanced.").await
}
