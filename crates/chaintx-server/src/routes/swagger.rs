use actix_files::NamedFile;
use actix_web::http::header;
use actix_web::{web, HttpRequest, HttpResponse};
use chaintx::AppError;

use crate::error::ApiError;
use crate::state::AppState;

const INDEX_PATH: &str = "/swagger/index.html";

const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8" />
  <title>ChainTx API</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js" crossorigin></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({
        url: "/swagger/openapi.yaml",
        dom_id: "#swagger-ui",
        persistAuthorization: true,
      });
    };
  </script>
</body>
</html>
"##;

/// GET /swagger and /swagger/
pub async fn redirect_to_index() -> HttpResponse {
    HttpResponse::TemporaryRedirect()
        .insert_header((header::LOCATION, INDEX_PATH))
        .finish()
}

/// GET /swagger/index.html
pub async fn index() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(INDEX_HTML)
}

/// GET /swagger/openapi.yaml - the file at OPENAPI_SPEC_PATH
pub async fn openapi_spec(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let path = &state.openapi_spec_path;
    let file = NamedFile::open_async(path).await.map_err(|e| {
        AppError::internal("openapi_file_read_failed", "failed to read OpenAPI spec file")
            .with("path", path.display().to_string())
            .with("error", e.to_string())
    })?;
    let mime = "application/yaml; charset=utf-8"
        .parse()
        .unwrap_or(actix_web::mime::TEXT_PLAIN_UTF_8);
    Ok(file
        .set_content_type(mime)
        .disable_content_disposition()
        .into_response(&req))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/swagger", web::get().to(redirect_to_index))
        .route("/swagger/", web::get().to(redirect_to_index))
        .route(INDEX_PATH, web::get().to(index))
        .route("/swagger/openapi.yaml", web::get().to(openapi_spec));
}
