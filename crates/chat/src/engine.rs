use adhikari_backend::BoxFuture;

use crate::plan::PlanResult;

/// Produces outfit plans for chat prompts.
///
/// Failures are reported in-band as [`PlanResult::Error`] so the chat can apologize.
pub trait RecommendationEngine: Send + Sync {
    fn request_plan(&self, text: String) -> BoxFuture<'static, PlanResult>;
}
