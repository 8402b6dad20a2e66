use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Body,
    Router,
};
use http::{
    Request,
    StatusCode,
};
use ipfs::testing::TestIpfs;
use serde_json::Value as JsonValue;
use tempfile::TempDir;
use tower::ServiceExt;

use crate::{
    config::LocalConfig,
    make_app,
    router::router,
    LocalAppState,
};

pub struct TestDaemon {
    router: Router,
    pub st: LocalAppState,
}

/// A daemon over an in-process IPFS network, driven through its router
/// without binding a port. Daemons sharing one `TestIpfs` see each other.
pub async fn setup_daemon(
    ipfs: &TestIpfs,
    dir: &TempDir,
    name: &str,
) -> anyhow::Result<TestDaemon> {
    let file_prefix = format!("{}/{name}-", dir.path().display());
    let config = LocalConfig::new_for_test(&file_prefix)?;
    let st = make_app(config, Arc::new(ipfs.clone())).await?;
    let router = router(st.clone());
    Ok(TestDaemon { router, st })
}

impl TestDaemon {
    pub async fn post(
        &self,
        path: &str,
        body: JsonValue,
    ) -> anyhow::Result<(StatusCode, JsonValue)> {
        let request = Request::builder()
            .uri(path)
            .method("POST")
            .header("Content-Type", "application/json")
            .body(Body::from(serde_json::to_vec(&body)?))?;
        let response = self.router.clone().oneshot(request).await?;
        let (parts, body) = response.into_parts();
        let bytes = axum::body::to_bytes(body, usize::MAX).await?;
        let json = serde_json::from_slice(&bytes).with_context(|| {
            format!("Couldn't decode body: {}", String::from_utf8_lossy(&bytes))
        })?;
        Ok((parts.status, json))
    }

    pub async fn expect_success(&self, path: &str, body: JsonValue) -> anyhow::Result<JsonValue> {
        let (status, json) = self.post(path, body).await?;
        assert_eq!(status, StatusCode::OK, "unexpected response: {json}");
        Ok(json)
    }

    pub async fn expect_error(
        &self,
        path: &str,
        body: JsonValue,
        expected_status: StatusCode,
        expected_code: &str,
    ) -> anyhow::Result<()> {
        let (status, json) = self.post(path, body).await?;
        assert_eq!(status, expected_status, "unexpected response: {json}");
        assert_eq!(json["code"], expected_code, "unexpected response: {json}");
        Ok(())
    }
}
