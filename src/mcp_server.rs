use rmcp::{
    ErrorData as McpError, ServerHandler,
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{CallToolResult, ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router,
};

use crate::pipeline::GenerationPipeline;
use crate::tools::{
    CheckQuotaRequest, EnhanceImageRequest, GenerateImageRequest, ListGeneratedImagesRequest,
};

#[derive(Clone)]
pub struct SceneGenServer {
    tool_router: ToolRouter<Self>,
    pipeline: GenerationPipeline,
}

impl SceneGenServer {
    pub fn new(pipeline: GenerationPipeline) -> Self {
        Self {
            tool_router: Self::tool_router(),
            pipeline,
        }
    }
}

#[tool_router]
impl SceneGenServer {
    #[tool(
        description = "Turn a photo into a scene portrait. Takes the source photo url plus an optional scene template and gender. Can take a few minutes; tell the user before calling. Show the result with ![](url)"
    )]
    async fn generate_image(
        &self,
        Parameters(request): Parameters<GenerateImageRequest>,
    ) -> Result<CallToolResult, McpError> {
        crate::tools::generate_image(&self.pipeline, Parameters(request)).await
    }

    #[tool(
        description = "Upscale and sharpen an existing image. Can take a few minutes. Show the result with ![](url)"
    )]
    async fn enhance_image(
        &self,
        Parameters(request): Parameters<EnhanceImageRequest>,
    ) -> Result<CallToolResult, McpError> {
        crate::tools::enhance_image(&self.pipeline, Parameters(request)).await
    }

    #[tool(description = "Check whether a user can generate right now and how many generations are left")]
    async fn check_quota(
        &self,
        Parameters(request): Parameters<CheckQuotaRequest>,
    ) -> Result<CallToolResult, McpError> {
        crate::tools::check_quota(&self.pipeline, Parameters(request)).await
    }

    #[tool(description = "List a user's saved generated images, newest first")]
    async fn list_generated_images(
        &self,
        Parameters(request): Parameters<ListGeneratedImagesRequest>,
    ) -> Result<CallToolResult, McpError> {
        crate::tools::list_generated_images(&self.pipeline, Parameters(request)).await
    }
}

#[tool_handler]
impl ServerHandler for SceneGenServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            instructions: Some(
                "Scene portrait generation: generate_image, enhance_image, check_quota, list_generated_images".into(),
            ),
            ..Default::default()
        }
    }
}
