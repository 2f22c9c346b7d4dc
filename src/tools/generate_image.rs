use rmcp::{ErrorData as McpError, handler::server::wrapper::Parameters, model::CallToolResult};
use schemars::JsonSchema;
use serde::Deserialize;

use crate::pipeline::{GenerationPipeline, GenerationRequest};
use crate::prompt::Scene;
use crate::tools::{finish_run, parse_image_source};

const ASPECT_RATIOS: &[&str] = &["1:1", "16:9", "9:16", "4:3", "3:4", "3:2", "2:3"];
const MAX_IMAGES: u32 = 4;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GenerateImageRequest {
    #[schemars(description = "Source photo: http(s) url or base64 data uri")]
    pub image_url: String,
    #[schemars(description = "Scene id, used for the saved record")]
    pub scene_id: Option<String>,
    #[schemars(description = "Scene display name")]
    pub scene_name: Option<String>,
    #[schemars(description = "Scene category, e.g. travel, studio, fantasy")]
    pub scene_category: Option<String>,
    #[schemars(description = "Scene prompt template; {gender} is replaced with the subject's gender")]
    pub prompt_template: Option<String>,
    #[schemars(description = "Full prompt, overrides the scene template")]
    pub prompt: Option<String>,
    #[schemars(description = "Subject gender inserted into the prompt, e.g. female, male")]
    pub gender: Option<String>,
    #[schemars(description = "Aspect ratio: 1:1, 16:9, 9:16, 4:3, 3:4, 3:2, 2:3. Default 3:4")]
    pub aspect_ratio: Option<String>,
    #[schemars(description = "Number of images, 1-4. Default 1")]
    pub image_count: Option<u32>,
    #[schemars(description = "User the generation is billed to and saved for")]
    pub user_id: Option<String>,
}

impl GenerateImageRequest {
    fn scene(&self) -> Option<Scene> {
        let has_scene = self.scene_id.is_some() || self.prompt_template.is_some();
        has_scene.then(|| {
            let id = self
                .scene_id
                .clone()
                .unwrap_or_else(|| "custom".to_string());
            Scene {
                name: self.scene_name.clone().unwrap_or_else(|| id.clone()),
                category: self
                    .scene_category
                    .clone()
                    .unwrap_or_else(|| "custom".to_string()),
                prompt_template: self.prompt_template.clone().unwrap_or_default(),
                id,
            }
        })
    }

    fn into_pipeline_request(self) -> Result<GenerationRequest, McpError> {
        let source = parse_image_source(&self.image_url)?;
        let aspect_ratio = self.aspect_ratio.as_deref().unwrap_or("3:4").trim().to_string();
        if !ASPECT_RATIOS.contains(&aspect_ratio.as_str()) {
            return Err(McpError::invalid_params(
                "aspect_ratio must be one of 1:1, 16:9, 9:16, 4:3, 3:4, 3:2, 2:3",
                None,
            ));
        }
        let image_count = self.image_count.unwrap_or(1);
        if !(1..=MAX_IMAGES).contains(&image_count) {
            return Err(McpError::invalid_params("image_count must be between 1 and 4", None));
        }

        Ok(GenerationRequest {
            scene: self.scene(),
            gender: self.gender,
            prompt: self.prompt,
            aspect_ratio: Some(aspect_ratio),
            image_count,
            user_id: self.user_id.filter(|id| !id.trim().is_empty()),
            ..GenerationRequest::new(source)
        })
    }
}

pub async fn generate_image(
    pipeline: &GenerationPipeline,
    Parameters(request): Parameters<GenerateImageRequest>,
) -> Result<CallToolResult, McpError> {
    let request = request.into_pipeline_request()?;
    let run = pipeline.start(request);
    finish_run("generate_image", run, "generated-image", "Image generated.").await
}
