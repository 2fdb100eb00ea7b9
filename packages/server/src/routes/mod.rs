use axum::routing::get;
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;

use crate::handlers;
use crate::state::AppState;

pub fn api_routes(max_upload_size: u64) -> OpenApiRouter<AppState> {
    let files = OpenApiRouter::new()
        .routes(routes!(handlers::files::get_image_url))
        .routes(routes!(handlers::files::get_image_url_list))
        .routes(routes!(
            handlers::files::get_file_details,
            handlers::files::update_file_details
        ))
        // Wildcard captures are registered by hand; the operation is listed on `ApiDoc`.
        .route(
            "/api/files/images/{*ref_path}",
            get(handlers::files::serve_file),
        );

    let upload = OpenApiRouter::new()
        .routes(routes!(
            handlers::files::upload_file,
            handlers::files::delete_file
        ))
        .layer(handlers::files::upload_body_limit(max_upload_size));

    files.merge(upload)
}
