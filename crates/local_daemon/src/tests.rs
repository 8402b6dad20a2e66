use http::StatusCode;
use ipfs::{
    testing::TestIpfs,
    MachineId,
};
use machines::Role;
use serde_json::json;
use tempfile::TempDir;

use crate::test_helpers::setup_daemon;

#[tokio::test]
async fn test_new_writer_roundtrip() -> anyhow::Result<()> {
    cmd_util::env::config_test();
    let ipfs = TestIpfs::new();
    let dir = TempDir::new()?;
    let daemon = setup_daemon(&ipfs, &dir, "a").await?;

    let created = daemon.expect_success("/v0/machines", json!({})).await?;
    let id = created["id"].as_str().unwrap().to_string();

    let sent = daemon
        .expect_success(
            &format!("/v0/machines/{id}/send"),
            json!({"expressions": [1, 2, 3]}),
        )
        .await?;
    assert_eq!(sent, json!({"results": [1, 2, 3]}));

    let answer = daemon
        .expect_success(
            &format!("/v0/machines/{id}/query"),
            json!({"expression": "(+ 1 2)"}),
        )
        .await?;
    assert_eq!(answer, json!({"expression": 3}));
    Ok(())
}

#[tokio::test]
async fn test_reader_follows_writer() -> anyhow::Result<()> {
    let ipfs = TestIpfs::new();
    let dir = TempDir::new()?;
    let daemon_a = setup_daemon(&ipfs, &dir, "a").await?;
    let daemon_b = setup_daemon(&ipfs, &dir, "b").await?;

    let created = daemon_a.expect_success("/v0/machines", json!({})).await?;
    let id = created["id"].as_str().unwrap().to_string();
    daemon_a
        .expect_success(
            &format!("/v0/machines/{id}/send"),
            json!({"expressions": [10]}),
        )
        .await?;

    // B has never heard of the machine; the query adopts it as a reader.
    let answer = daemon_b
        .expect_success(
            &format!("/v0/machines/{id}/query"),
            json!({"expression": 42}),
        )
        .await?;
    assert_eq!(answer, json!({"expression": 42}));
    assert_eq!(
        daemon_b.st.hub.role(&MachineId(id.clone())),
        Some(Role::Reader)
    );

    // And B's follow file now records the adoption.
    let follows: serde_json::Value =
        serde_json::from_slice(&std::fs::read(dir.path().join("b-follows.json"))?)?;
    assert_eq!(follows[&id], json!("Reader"));
    Ok(())
}

#[tokio::test]
async fn test_reader_send_is_acknowledged_by_writer() -> anyhow::Result<()> {
    let ipfs = TestIpfs::new();
    let dir = TempDir::new()?;
    let daemon_a = setup_daemon(&ipfs, &dir, "a").await?;
    let daemon_b = setup_daemon(&ipfs, &dir, "b").await?;

    let created = daemon_a.expect_success("/v0/machines", json!({})).await?;
    let id = created["id"].as_str().unwrap().to_string();

    let sent = daemon_b
        .expect_success(
            &format!("/v0/machines/{id}/send"),
            json!({"expressions": ["(+ 2 2)"]}),
        )
        .await?;
    assert_eq!(sent, json!({"results": [4]}));

    // Read-your-writes holds at the writer.
    let counted = daemon_a
        .expect_success(
            &format!("/v0/machines/{id}/query"),
            json!({"expression": "(count history)"}),
        )
        .await?;
    assert_eq!(counted, json!({"expression": 1}));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_send_without_writer_times_out() -> anyhow::Result<()> {
    let ipfs = TestIpfs::new();
    let dir = TempDir::new()?;
    let id;
    {
        let daemon_a = setup_daemon(&ipfs, &dir, "a").await?;
        let created = daemon_a.expect_success("/v0/machines", json!({})).await?;
        id = created["id"].as_str().unwrap().to_string();
        daemon_a
            .expect_success(
                &format!("/v0/machines/{id}/send"),
                json!({"expressions": [1]}),
            )
            .await?;
        daemon_a.st.shutdown().await;
    }

    let daemon_b = setup_daemon(&ipfs, &dir, "b").await?;
    daemon_b
        .expect_error(
            &format!("/v0/machines/{id}/send"),
            json!({"expressions": [9]}),
            StatusCode::GATEWAY_TIMEOUT,
            "AckTimeout",
        )
        .await?;
    // The failed remote append left storage untouched.
    assert_eq!(ipfs.log_len(&MachineId(id)), 1);
    Ok(())
}

#[tokio::test]
async fn test_restart_replays_writer_state() -> anyhow::Result<()> {
    let ipfs = TestIpfs::new();
    let dir = TempDir::new()?;
    let id;
    {
        let daemon = setup_daemon(&ipfs, &dir, "a").await?;
        let created = daemon.expect_success("/v0/machines", json!({})).await?;
        id = created["id"].as_str().unwrap().to_string();
        daemon
            .expect_success(
                &format!("/v0/machines/{id}/send"),
                json!({"expressions": [1, 2, 3]}),
            )
            .await?;
        daemon.st.shutdown().await;
    }

    let daemon = setup_daemon(&ipfs, &dir, "a").await?;
    let counted = daemon
        .expect_success(
            &format!("/v0/machines/{id}/query"),
            json!({"expression": "(count history)"}),
        )
        .await?;
    assert_eq!(counted, json!({"expression": 3}));
    Ok(())
}

#[tokio::test]
async fn test_rejected_expression_maps_to_bad_request() -> anyhow::Result<()> {
    let ipfs = TestIpfs::new();
    let dir = TempDir::new()?;
    let daemon = setup_daemon(&ipfs, &dir, "a").await?;

    let created = daemon.expect_success("/v0/machines", json!({})).await?;
    let id = created["id"].as_str().unwrap().to_string();

    daemon
        .expect_error(
            &format!("/v0/machines/{id}/send"),
            json!({"expressions": ["(+ 1 unbound)"]}),
            StatusCode::BAD_REQUEST,
            "InvalidInput",
        )
        .await?;
    daemon
        .expect_error(
            &format!("/v0/machines/{id}/query"),
            json!({"expression": "(1 2"}),
            StatusCode::BAD_REQUEST,
            "InvalidInput",
        )
        .await?;
    Ok(())
}

#[tokio::test]
async fn test_path_parameters_are_percent_decoded() -> anyhow::Result<()> {
    let ipfs = TestIpfs::new();
    let dir = TempDir::new()?;
    let daemon = setup_daemon(&ipfs, &dir, "a").await?;

    let created = daemon.expect_success("/v0/machines", json!({})).await?;
    let id = created["id"].as_str().unwrap().to_string();

    let encoded = id.replace('-', "%2D");
    let answer = daemon
        .expect_success(
            &format!("/v0/machines/{encoded}/query"),
            json!({"expression": 7}),
        )
        .await?;
    assert_eq!(answer, json!({"expression": 7}));
    Ok(())
}
