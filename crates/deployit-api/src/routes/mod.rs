//! API routes.

pub mod health;
pub mod pipelines;
pub mod runs;
pub mod webhooks;

use crate::AppState;
use axum::Router;

/// Build the main API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", api_router())
        .nest("/webhooks", webhooks::router())
        .merge(health::router())
        .with_state(state)
}

fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/pipelines", pipelines::router())
        .nest("/runs", runs::router())
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::AppState;
    use axum::response::Response;
    use deployit_config::QueuePolicy;
    use deployit_core::artifact::ArtifactName;
    use deployit_core::buildspec::{ArtifactSelection, BuildSpec, PhaseName};
    use deployit_core::pipeline::{BuildAction, DeployAction, Pipeline};
    use deployit_core::source::SourceRef;
    use deployit_scheduler::{RunHistory, RunQueue};
    use std::sync::Arc;

    pub fn pipeline(name: &str) -> Arc<Pipeline> {
        let src = ArtifactName::new("src").unwrap();
        let out = ArtifactName::new("out").unwrap();
        let spec = BuildSpec::new(ArtifactSelection::files(["out.txt"]))
            .with_phase(PhaseName::Build, ["echo hello > out.txt"]);
        Arc::new(
            Pipeline::builder(name)
                .source_stage(
                    "Source",
                    "Checkout",
                    SourceRef::github("acme", "demo", "main"),
                    src.clone(),
                )
                .build_stage(
                    "Build",
                    "Synth",
                    src,
                    out.clone(),
                    BuildAction {
                        image: "alpine".into(),
                        privileged: false,
                        spec,
                    },
                )
                .deploy_stage(
                    "Deploy",
                    "Apply",
                    DeployAction::new("demo-stack", out.at_path("out.txt")),
                )
                .build()
                .unwrap(),
        )
    }

    pub fn state(secret: Option<&str>) -> AppState {
        AppState::new(
            [pipeline("demo")],
            Arc::new(RunQueue::new(QueuePolicy::LatestWins)),
            RunHistory::new(),
        )
        .with_webhook_secret(secret.map(String::from))
    }

    pub async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{json_body, state};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health() {
        let app = super::router(state(None));
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_ready_reports_queue() {
        let app = super::router(state(None));
        let response = app
            .oneshot(Request::get("/health/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["status"], "ready");
        assert_eq!(body["pipelines"], 1);
        assert_eq!(body["pending"], 0);
    }
}
