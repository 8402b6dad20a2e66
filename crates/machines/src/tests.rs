use std::{
    sync::Arc,
    time::Duration,
};

use errors::ErrorMetadataAnyhowExt;
use ipfs::testing::TestIpfs;
use serde_json::json;
use tempfile::TempDir;

use crate::{
    FollowStore,
    Hub,
    PollingState,
    Role,
};

fn new_hub(ipfs: &TestIpfs, dir: &TempDir, name: &str) -> Arc<Hub> {
    let store = FollowStore::new(dir.path().join(format!("{name}-follows.json")));
    Hub::new(Arc::new(ipfs.clone()), store)
}

fn follow_file(dir: &TempDir, name: &str) -> serde_json::Value {
    let path = dir.path().join(format!("{name}-follows.json"));
    serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
}

#[tokio::test]
async fn test_writer_roundtrip() -> anyhow::Result<()> {
    cmd_util::env::config_test();
    let ipfs = TestIpfs::new();
    let dir = TempDir::new()?;
    let hub = new_hub(&ipfs, &dir, "a");

    let id = hub.create_machine().await?;
    assert_eq!(hub.role(&id), Some(Role::Writer));

    let results = hub.send(&id, &[json!(1), json!(2), json!(3)]).await?;
    assert_eq!(results, vec![json!(1), json!(2), json!(3)]);
    assert_eq!(ipfs.log_len(&id), 3);

    let answer = hub.query(&id, &json!("(+ 1 2)")).await?;
    assert_eq!(answer, json!(3));

    // The follow file reflects the new writer.
    assert_eq!(follow_file(&dir, "a")[&id.0], json!("Writer"));
    Ok(())
}

#[tokio::test]
async fn test_query_adopts_unknown_machine_as_reader() -> anyhow::Result<()> {
    let ipfs = TestIpfs::new();
    let dir = TempDir::new()?;
    let writer = new_hub(&ipfs, &dir, "a");
    let reader = new_hub(&ipfs, &dir, "b");

    let id = writer.create_machine().await?;
    writer.send(&id, &[json!(10)]).await?;

    // Integers autoquote, so querying one exercises adoption end to end.
    let answer = reader.query(&id, &json!(42)).await?;
    assert_eq!(answer, json!(42));
    assert_eq!(reader.role(&id), Some(Role::Reader));
    assert_eq!(follow_file(&dir, "b")[&id.0], json!("Reader"));

    // The adopted reader folded the existing log.
    let snapshot = reader.testing_snapshot(&id).await.unwrap();
    assert_eq!(snapshot.history_len, 1);
    Ok(())
}

#[tokio::test]
async fn test_reader_send_round_trips_through_writer() -> anyhow::Result<()> {
    let ipfs = TestIpfs::new();
    let dir = TempDir::new()?;
    let writer = new_hub(&ipfs, &dir, "a");
    let reader = new_hub(&ipfs, &dir, "b");

    let id = writer.create_machine().await?;
    let results = reader.send(&id, &[json!("(+ 1 2)"), json!(7)]).await?;
    assert_eq!(results, vec![json!(3), json!(7)]);

    // The writer's cache committed the append before acknowledging.
    let snapshot = writer.testing_snapshot(&id).await.unwrap();
    assert_eq!(snapshot.history_len, 2);
    assert_eq!(ipfs.log_len(&id), 2);

    // Read-your-writes holds at the writer.
    assert_eq!(writer.query(&id, &json!("(count history)")).await?, json!(2));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_reader_send_times_out_when_writer_is_gone() -> anyhow::Result<()> {
    let ipfs = TestIpfs::new();
    let dir = TempDir::new()?;
    let writer = new_hub(&ipfs, &dir, "a");
    let id = writer.create_machine().await?;
    writer.send(&id, &[json!(1)]).await?;

    let reader = new_hub(&ipfs, &dir, "b");
    reader.query(&id, &json!(0)).await?;

    // Take the writer offline.
    writer.drain().await;
    drop(writer);

    let err = reader.send(&id, &[json!(9)]).await.unwrap_err();
    assert!(err.is_ack_timeout(), "{err:#}");
    // Storage is unchanged by the failed remote append.
    assert_eq!(ipfs.log_len(&id), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_poller_recovers_lost_broadcast() -> anyhow::Result<()> {
    let ipfs = TestIpfs::new();
    let dir = TempDir::new()?;
    let writer = new_hub(&ipfs, &dir, "a");
    let reader = new_hub(&ipfs, &dir, "b");

    let id = writer.create_machine().await?;
    reader.query(&id, &json!(0)).await?;

    // The new_inputs broadcast for this append is lost on the wire.
    ipfs.set_drop_publishes(true);
    writer.send(&id, &[json!(7)]).await?;
    assert_eq!(
        reader.testing_snapshot(&id).await.unwrap().history_len,
        0
    );

    // Not due yet this soon after the adopting refresh.
    tokio::time::advance(Duration::from_secs(2)).await;
    reader.poll_tick().await;
    assert_eq!(
        reader.testing_snapshot(&id).await.unwrap().history_len,
        0
    );

    // Once the refresh interval is exhausted the poller catches up.
    tokio::time::advance(Duration::from_secs(9)).await;
    reader.poll_tick().await;
    let snapshot = reader.testing_snapshot(&id).await.unwrap();
    assert_eq!(snapshot.history_len, 1);
    assert_eq!(
        snapshot.polling,
        PollingState::HighFreq {
            remaining: *crate::knobs::HIGH_FREQ_WINDOW
        }
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_quiet_reader_decays_to_low_frequency() -> anyhow::Result<()> {
    let ipfs = TestIpfs::new();
    let dir = TempDir::new()?;
    let writer = new_hub(&ipfs, &dir, "a");
    let reader = new_hub(&ipfs, &dir, "b");

    let id = writer.create_machine().await?;
    reader.query(&id, &json!(0)).await?;

    // The adopting query's refresh found nothing new, so the machine has
    // already decayed out of its initial burst window.
    let snapshot = reader.testing_snapshot(&id).await.unwrap();
    assert_eq!(snapshot.polling, PollingState::LowFreq);

    // A due refresh that still finds nothing keeps the machine quiet.
    tokio::time::advance(Duration::from_secs(11)).await;
    reader.poll_tick().await;
    let snapshot = reader.testing_snapshot(&id).await.unwrap();
    assert_eq!(snapshot.polling, PollingState::LowFreq);
    assert_eq!(snapshot.history_len, 0);

    // And a fresh batch re-arms the burst window on the next due refresh.
    // The broadcast is suppressed so the poller alone drives the refresh.
    ipfs.set_drop_publishes(true);
    writer.send(&id, &[json!(5)]).await?;
    tokio::time::advance(Duration::from_secs(11)).await;
    reader.poll_tick().await;
    let snapshot = reader.testing_snapshot(&id).await.unwrap();
    assert_eq!(
        snapshot.polling,
        PollingState::HighFreq {
            remaining: *crate::knobs::HIGH_FREQ_WINDOW
        }
    );
    assert_eq!(snapshot.history_len, 1);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_writer_sends_serialise() -> anyhow::Result<()> {
    let ipfs = TestIpfs::new();
    let dir = TempDir::new()?;
    let hub = new_hub(&ipfs, &dir, "a");
    let id = hub.create_machine().await?;

    let first = [json!(1), json!(2)];
    let second = [json!(3), json!(4)];
    let (left, right) = tokio::join!(
        hub.send(&id, &first),
        hub.send(&id, &second),
    );
    // Each caller gets the results for its own inputs, in order.
    assert_eq!(left?, vec![json!(1), json!(2)]);
    assert_eq!(right?, vec![json!(3), json!(4)]);

    // Batches append atomically; they never interleave and never get lost.
    let (_, log) = {
        use ipfs::Ipfs as _;
        ipfs.read_log_from(&id, None).await?
    };
    assert_eq!(log.len(), 4);
    let as_pairs: Vec<_> = log.chunks(2).collect();
    assert!(
        as_pairs == vec![&[json!(1), json!(2)][..], &[json!(3), json!(4)][..]]
            || as_pairs == vec![&[json!(3), json!(4)][..], &[json!(1), json!(2)][..]]
    );
    Ok(())
}

#[tokio::test]
async fn test_restart_replays_follow_file() -> anyhow::Result<()> {
    let ipfs = TestIpfs::new();
    let dir = TempDir::new()?;

    let other = new_hub(&ipfs, &dir, "other");
    let followed_id = other.create_machine().await?;
    other.send(&followed_id, &[json!(5)]).await?;

    let owned_id;
    {
        let hub = new_hub(&ipfs, &dir, "a");
        owned_id = hub.create_machine().await?;
        hub.send(&owned_id, &[json!(1), json!(2), json!(3)]).await?;
        hub.query(&followed_id, &json!(0)).await?;
        hub.drain().await;
    }

    // A fresh process over the same follow file restores both machines in
    // their persisted roles, with states folded from current storage.
    let hub = new_hub(&ipfs, &dir, "a");
    hub.restore_followed().await?;
    assert_eq!(hub.role(&owned_id), Some(Role::Writer));
    assert_eq!(hub.role(&followed_id), Some(Role::Reader));
    assert_eq!(
        hub.query(&owned_id, &json!("(count history)")).await?,
        json!(3)
    );
    assert_eq!(hub.send(&owned_id, &[json!(4)]).await?, vec![json!(4)]);
    Ok(())
}

#[tokio::test]
async fn test_empty_send_changes_nothing() -> anyhow::Result<()> {
    let ipfs = TestIpfs::new();
    let dir = TempDir::new()?;
    let hub = new_hub(&ipfs, &dir, "a");
    let id = hub.create_machine().await?;

    assert_eq!(hub.send(&id, &[]).await?, Vec::<serde_json::Value>::new());
    let snapshot = hub.testing_snapshot(&id).await.unwrap();
    assert_eq!(snapshot.last_index, None);
    assert_eq!(ipfs.log_len(&id), 0);
    Ok(())
}

#[tokio::test]
async fn test_rejected_input_leaves_machine_unchanged() -> anyhow::Result<()> {
    let ipfs = TestIpfs::new();
    let dir = TempDir::new()?;
    let hub = new_hub(&ipfs, &dir, "a");
    let id = hub.create_machine().await?;
    hub.send(&id, &[json!(1)]).await?;

    // The second input of the batch fails; the whole batch is rejected
    // before anything reaches storage.
    let err = hub
        .send(&id, &[json!(2), json!("(+ 1 unbound)")])
        .await
        .unwrap_err();
    assert!(err.is_invalid_input(), "{err:#}");
    assert_eq!(ipfs.log_len(&id), 1);
    assert_eq!(hub.query(&id, &json!("(count history)")).await?, json!(1));

    // The machine still accepts good inputs afterwards.
    assert_eq!(hub.send(&id, &[json!(2)]).await?, vec![json!(2)]);
    Ok(())
}

#[tokio::test]
async fn test_query_never_commits() -> anyhow::Result<()> {
    let ipfs = TestIpfs::new();
    let dir = TempDir::new()?;
    let hub = new_hub(&ipfs, &dir, "a");
    let id = hub.create_machine().await?;

    assert_eq!(hub.query(&id, &json!("(def x 1)")).await?, json!(1));
    let err = hub.query(&id, &json!("x")).await.unwrap_err();
    assert!(err.is_invalid_input(), "{err:#}");
    assert_eq!(hub.testing_snapshot(&id).await.unwrap().history_len, 0);
    Ok(())
}

#[tokio::test]
async fn test_reader_converges_with_writer() -> anyhow::Result<()> {
    let ipfs = TestIpfs::new();
    let dir = TempDir::new()?;
    let writer = new_hub(&ipfs, &dir, "a");
    let reader = new_hub(&ipfs, &dir, "b");

    let id = writer.create_machine().await?;
    for n in 0..5 {
        writer.send(&id, &[json!(n)]).await?;
    }
    // A query refreshes the reader first, so it observes the final log.
    assert_eq!(reader.query(&id, &json!("(count history)")).await?, json!(5));

    let reader_snapshot = reader.testing_snapshot(&id).await.unwrap();
    let writer_snapshot = writer.testing_snapshot(&id).await.unwrap();
    assert_eq!(reader_snapshot.history_len, writer_snapshot.history_len);
    assert_eq!(reader_snapshot.last_index, writer_snapshot.last_index);
    Ok(())
}

mod registry {
    use std::sync::Arc;

    use errors::{
        ErrorCode,
        ErrorMetadata,
    };
    use futures::FutureExt;
    use ipfs::{
        testing::TestIpfs,
        Ipfs as _,
        MachineId,
    };

    use crate::{
        Machine,
        Registry,
        Role,
    };

    async fn test_machine(ipfs: &TestIpfs, id: &MachineId, role: Role) -> Machine {
        let subscription = ipfs.subscribe(id).await.unwrap();
        Machine::new(id.clone(), role, subscription)
    }

    fn error_code(err: &anyhow::Error) -> Option<ErrorCode> {
        err.downcast_ref::<ErrorMetadata>().map(|m| m.code)
    }

    #[tokio::test]
    async fn test_insert_new_rejects_duplicates() {
        let ipfs = TestIpfs::new();
        let id = MachineId("m".to_string());
        let registry = Registry::new();

        let machine = test_machine(&ipfs, &id, Role::Writer).await;
        registry.insert_new(id.clone(), machine).unwrap();

        let duplicate = test_machine(&ipfs, &id, Role::Reader).await;
        let err = registry.insert_new(id.clone(), duplicate).unwrap_err();
        assert_eq!(error_code(&err), Some(ErrorCode::MachineAlreadyCached));
        // The original entry is untouched.
        assert_eq!(registry.role(&id), Some(Role::Writer));
    }

    #[tokio::test]
    async fn test_modify_missing_machine() {
        let registry = Registry::new();
        let err = registry
            .modify(&MachineId("nope".to_string()), |_machine: &mut Machine| {
                async move { Ok(()) }.boxed()
            })
            .await
            .unwrap_err();
        assert_eq!(error_code(&err), Some(ErrorCode::MachineNotCached));
    }

    #[tokio::test]
    async fn test_modify_serialises_per_entry() {
        let ipfs = TestIpfs::new();
        let id = MachineId("m".to_string());
        let registry = Arc::new(Registry::new());
        let machine = test_machine(&ipfs, &id, Role::Writer).await;
        registry.insert_new(id.clone(), machine).unwrap();

        // Many concurrent modifies each observe and extend the history
        // atomically; per-entry locking means none of them are lost.
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            let id = id.clone();
            tasks.push(tokio::spawn(async move {
                registry
                    .modify(&id, |machine: &mut Machine| {
                        async move {
                            let seen = machine.history.len();
                            tokio::task::yield_now().await;
                            machine.advance(&[lang::Value::Int(seen as i64)])?;
                            Ok(())
                        }
                        .boxed()
                    })
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        let snapshot_len = registry
            .modify(&id, |machine: &mut Machine| {
                async move { Ok(machine.history.len()) }.boxed()
            })
            .await
            .unwrap();
        assert_eq!(snapshot_len, 16);
    }
}

mod follow_store {
    use ipfs::MachineId;
    use tempfile::TempDir;

    use crate::{
        FollowStore,
        Role,
    };

    #[tokio::test]
    async fn test_load_creates_missing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("follows.json");
        let store = FollowStore::new(path.clone());
        let follows = store.load().await.unwrap();
        assert!(follows.is_empty());
        assert_eq!(std::fs::read_to_string(path).unwrap().trim(), "{}");
    }

    #[tokio::test]
    async fn test_persist_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = FollowStore::new(dir.path().join("follows.json"));
        let mut follows = std::collections::BTreeMap::new();
        follows.insert(MachineId("a".to_string()), Role::Writer);
        follows.insert(MachineId("b".to_string()), Role::Reader);
        store.persist(&follows).await.unwrap();
        assert_eq!(store.load().await.unwrap(), follows);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("follows.json");
        std::fs::write(&path, "{\"a\": \"Admin\"}").unwrap();
        let err = FollowStore::new(path).load().await.unwrap_err();
        assert!(err.to_string().contains("corrupt"), "{err:#}");
    }
}
