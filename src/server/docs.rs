use axum::{response::IntoResponse, Json};
use utoipa::OpenApi;
use utoipauto::utoipauto;

#[utoipauto(paths = "./src")]
#[derive(OpenApi)]
#[openapi(info(
    description = "sync-player exposes endpoints to inspect rooms and request media metadata"
))]
pub struct ApiDoc;

pub async fn docs() -> impl IntoResponse {
    Json(ApiDoc::openapi())
}
