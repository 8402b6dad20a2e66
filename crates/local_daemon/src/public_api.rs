use axum::{
    extract::{
        Path,
        State,
    },
    response::IntoResponse,
    Json,
};
use ipfs::MachineId;
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value as JsonValue;

use crate::{
    http::HttpResponseError,
    LocalAppState,
};

#[derive(Serialize, Deserialize)]
pub struct CreateMachineResponse {
    pub id: String,
}

#[derive(Serialize, Deserialize)]
pub struct QueryRequest {
    pub expression: JsonValue,
}

#[derive(Serialize, Deserialize)]
pub struct QueryResponse {
    pub expression: JsonValue,
}

#[derive(Serialize, Deserialize)]
pub struct SendRequest {
    pub expressions: Vec<JsonValue>,
}

#[derive(Serialize, Deserialize)]
pub struct SendResponse {
    pub results: Vec<JsonValue>,
}

/// Create a fresh machine with this daemon as its writer.
pub async fn create_machine_post(
    State(st): State<LocalAppState>,
) -> Result<impl IntoResponse, HttpResponseError> {
    let id = st.hub.create_machine().await?;
    Ok(Json(CreateMachineResponse { id: id.0 }))
}

/// Evaluate an expression against the machine's state without changing it.
pub async fn query_post(
    State(st): State<LocalAppState>,
    Path(id): Path<String>,
    Json(req): Json<QueryRequest>,
) -> Result<impl IntoResponse, HttpResponseError> {
    let expression = st.hub.query(&MachineId(id), &req.expression).await?;
    Ok(Json(QueryResponse { expression }))
}

/// Append expressions to the machine's log and return their results.
pub async fn send_post(
    State(st): State<LocalAppState>,
    Path(id): Path<String>,
    Json(req): Json<SendRequest>,
) -> Result<impl IntoResponse, HttpResponseError> {
    let results = st.hub.send(&MachineId(id), &req.expressions).await?;
    Ok(Json(SendResponse { results }))
}
