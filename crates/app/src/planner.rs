use std::time::Duration;

use adhikari_backend::BoxFuture;
use adhikari_chat::{PlanResult, RecommendationEngine};
use serde::Serialize;
use snafu::{ResultExt, Snafu};

#[derive(Debug, Serialize)]
struct PlanRequest<'a> {
    message: &'a str,
}

/// Recommendation engine reached over HTTP.
///
/// Posts `{"message": ...}` to the endpoint and expects a plan result as JSON back.
#[derive(Debug, Clone)]
pub struct HttpPlanner {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpPlanner {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> PlannerResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context(BuildClientSnafu {
                stage: "build-planner-http-client",
            })?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn plan(&self, message: &str) -> PlannerResult<PlanResult> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&PlanRequest { message })
            .send()
            .await
            .context(SendSnafu {
                stage: "send-plan-request",
                endpoint: self.endpoint.clone(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return UnexpectedStatusSnafu {
                stage: "check-plan-response-status",
                status: status.as_u16(),
                body,
            }
            .fail();
        }

        response.json::<PlanResult>().await.context(DecodeSnafu {
            stage: "decode-plan-response",
        })
    }
}

impl RecommendationEngine for HttpPlanner {
    fn request_plan(&self, text: String) -> BoxFuture<'static, PlanResult> {
        let planner = self.clone();
        Box::pin(async move {
            match planner.plan(&text).await {
                Ok(plan) => plan,
                Err(error) => {
                    tracing::warn!(%error, endpoint = %planner.endpoint, "plan request failed");
                    PlanResult::error(error.to_string())
                }
            }
        })
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PlannerError {
    #[snafu(display("failed to build the planner client on `{stage}`: {source}"))]
    BuildClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("could not reach the outfit planner at {endpoint}"))]
    Send {
        stage: &'static str,
        endpoint: String,
        source: reqwest::Error,
    },
    #[snafu(display("the outfit planner answered with status {status}"))]
    UnexpectedStatus {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("the outfit planner sent a response that could not be read"))]
    Decode {
        stage: &'static str,
        source: reqwest::Error,
    },
}

pub type PlannerResult<T> = Result<T, PlannerError>;
