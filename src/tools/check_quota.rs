use rmcp::{ErrorData as McpError, handler::server::wrapper::Parameters, model::CallToolResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::pipeline::GenerationPipeline;
use crate::quota::QuotaDecision;
use crate::tools::json_result;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CheckQuotaRequest {
    #[schemars(description = "User whose remaining generations are checked")]
    pub user_id: String,
}

#[derive(Serialize)]
struct QuotaResponse {
    #[serde(flatten)]
    decision: QuotaDecision,
    remaining_today: u32,
    message: String,
}

pub async fn check_quota(
    pipeline: &GenerationPipeline,
    Parameters(request): Parameters<CheckQuotaRequest>,
) -> Result<CallToolResult, McpError> {
    let user_id = request.user_id.trim();
    if user_id.is_empty() {
        return Err(McpError::invalid_params("user_id must not be empty", None));
    }
    let decision = pipeline.check_quota(user_id).await;
    let message = match &decision.reason {
        Some(reason) => reason.to_string(),
        None => format!(
            "{} generations left today, {} left this period.",
            decision.remaining_today(),
            decision.period_limit.saturating_sub(decision.period_used)
        ),
    };
    json_result(&QuotaResponse {
        remaining_today: decision.remaining_today(),
        decision,
        message,
    })
}
