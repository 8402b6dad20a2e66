use axum::{
    routing::{
        get,
        post,
    },
    Router,
};

use crate::{
    public_api::{
        create_machine_post,
        query_post,
        send_post,
    },
    LocalAppState,
};

pub fn router(st: LocalAppState) -> Router {
    let machine_routes = Router::new()
        .route("/machines", post(create_machine_post))
        .route("/machines/{id}/query", post(query_post))
        .route("/machines/{id}/send", post(send_post));

    Router::new()
        .nest("/v0", machine_routes)
        .route(
            "/",
            get(|| async { "This machined daemon is running. Try POST /v0/machines." }),
        )
        .with_state(st)
}
