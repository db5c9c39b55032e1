//! Monitor stream behavior against a scripted server: seeding, streamed
//! inserts and deletes, and the diff merge rules for maps and sets.

mod common;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use common::{wait_until, MockOvsdb};
use ovn_client::{Client, Config, LogicalSwitch, SignalHandler, DB_NORTHBOUND};
use serde_json::json;

const LS0: &str = "53000000-0000-4000-8000-000000000001";
const LS1: &str = "53000000-0000-4000-8000-000000000002";
const AS0: &str = "a5000000-0000-4000-8000-000000000001";
const TXN1: &str = "77000000-0000-4000-8000-000000000001";
const TXN2: &str = "77000000-0000-4000-8000-000000000002";
const TXN3: &str = "77000000-0000-4000-8000-000000000003";
const TXN4: &str = "77000000-0000-4000-8000-000000000004";

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl Recorder {
    fn note(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl SignalHandler for Recorder {
    fn on_logical_switch_create(&self, ls: &LogicalSwitch) {
        self.note(format!("+switch {}", ls.name));
    }

    fn on_logical_switch_delete(&self, ls: &LogicalSwitch) {
        self.note(format!("-switch {}", ls.name));
    }
}

/// Server preloaded with one switch and one address set, client attached.
async fn seeded(recorder: Arc<Recorder>) -> Result<(MockOvsdb, Client)> {
    let server = MockOvsdb::start(DB_NORTHBOUND).await;
    server.set_last_txn(TXN1);
    server.set_snapshot(json!({
        "Logical_Switch": {
            LS0: { "initial": {
                "name": "ls0",
                "external_ids": ["map", [["tier", "prod"]]],
            }}
        },
        "Address_Set": {
            AS0: { "initial": {
                "name": "as0",
                "addresses": ["set", ["10.0.0.1"]],
            }}
        },
    }));
    let client = Client::connect(
        Config::new(DB_NORTHBOUND, server.endpoint()).signal(recorder),
    )
    .await
    .context("connecting to the scripted server")?;
    Ok((server, client))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn seeding_fills_defaults_without_signalling() -> Result<()> {
    let recorder = Arc::new(Recorder::default());
    let (_server, client) = seeded(Arc::clone(&recorder)).await?;

    let switches = client.ls_list().await;
    assert_eq!(switches.len(), 1);
    let ls0 = &switches[0];
    assert_eq!(ls0.name, "ls0");
    assert_eq!(ls0.uuid.to_string(), LS0);
    assert!(ls0.ports.is_empty(), "unsent set columns read as empty");
    assert!(ls0.other_config.is_empty(), "unsent map columns read as empty");
    assert_eq!(
        ls0.external_ids,
        BTreeMap::from([("tier".to_owned(), "prod".to_owned())])
    );
    assert_eq!(client.last_txn(), TXN1);
    assert!(recorder.events().is_empty(), "the seed dump is silent");
    client.close().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn streamed_inserts_land_and_signal() -> Result<()> {
    let recorder = Arc::new(Recorder::default());
    let (server, client) = seeded(Arc::clone(&recorder)).await?;

    server.push_update3(TXN2, json!({
        "Logical_Switch": { LS1: { "insert": { "name": "ls1" } } }
    }));
    let probe = &client;
    wait_until(
        move || async move { probe.ls_get("ls1").await.is_ok() },
        "ls1 to replicate",
    )
    .await;

    let ls1 = client.ls_get("ls1").await?;
    assert!(ls1.acls.is_empty(), "inserted rows get schema defaults");
    assert_eq!(client.last_txn(), TXN2, "the cursor follows applied updates");
    assert_eq!(recorder.events(), vec!["+switch ls1".to_owned()]);
    client.close().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn map_diffs_toggle_pairs_in_place() -> Result<()> {
    let recorder = Arc::new(Recorder::default());
    let (server, client) = seeded(recorder).await?;
    let probe = &client;

    let diff = json!({
        "Logical_Switch": {
            LS0: { "modify": { "external_ids": ["map", [["owner", "qa"]]] } }
        }
    });
    server.push_update3(TXN2, diff.clone());
    wait_until(
        move || async move {
            probe
                .ls_get("ls0")
                .await
                .is_ok_and(|ls| ls.external_ids.contains_key("owner"))
        },
        "the owner pair to appear",
    )
    .await;

    // the same pair again toggles it back out
    server.push_update3(TXN3, diff);
    wait_until(
        move || async move {
            probe
                .ls_get("ls0")
                .await
                .is_ok_and(|ls| !ls.external_ids.contains_key("owner"))
        },
        "the owner pair to toggle away",
    )
    .await;

    let ls0 = client.ls_get("ls0").await?;
    assert_eq!(
        ls0.external_ids.get("tier").map(String::as_str),
        Some("prod"),
        "pairs the diff never mentioned survive"
    );
    assert_eq!(client.last_txn(), TXN3);
    client.close().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn set_diffs_toggle_membership() -> Result<()> {
    let recorder = Arc::new(Recorder::default());
    let (server, client) = seeded(recorder).await?;
    let probe = &client;

    server.push_update3(TXN2, json!({
        "Address_Set": { AS0: { "modify": { "addresses": ["set", ["10.0.0.2"]] } } }
    }));
    wait_until(
        move || async move {
            probe
                .as_get("as0")
                .await
                .is_ok_and(|set| set.addresses.len() == 2)
        },
        "the second address to join",
    )
    .await;

    // naming both removes both
    server.push_update3(TXN3, json!({
        "Address_Set": {
            AS0: { "modify": { "addresses": ["set", ["10.0.0.1", "10.0.0.2"]] } }
        }
    }));
    wait_until(
        move || async move {
            probe
                .as_get("as0")
                .await
                .is_ok_and(|set| set.addresses.is_empty())
        },
        "the addresses to empty out",
    )
    .await;
    client.close().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn streamed_deletes_report_the_departed_row() -> Result<()> {
    let recorder = Arc::new(Recorder::default());
    let (server, client) = seeded(Arc::clone(&recorder)).await?;
    let probe = &client;

    server.push_update3(TXN2, json!({
        "Logical_Switch": { LS1: { "insert": { "name": "ls1" } } }
    }));
    wait_until(
        move || async move { probe.ls_get("ls1").await.is_ok() },
        "ls1 to replicate",
    )
    .await;

    server.push_update3(TXN3, json!({
        "Logical_Switch": { LS1: { "delete": null } }
    }));
    wait_until(
        move || async move { probe.ls_get("ls1").await.is_err() },
        "ls1 to disappear",
    )
    .await;
    assert!(
        recorder.events().contains(&"-switch ls1".to_owned()),
        "the delete signal carries the content the row had"
    );

    // a delete for a row never seen applies as a no-op but still moves
    // the cursor
    server.push_update3(TXN4, json!({
        "Logical_Switch": { LS1: { "delete": null } }
    }));
    wait_until(
        move || async move { probe.last_txn() == TXN4 },
        "the cursor to advance past the no-op delete",
    )
    .await;
    assert_eq!(client.ls_list().await.len(), 1, "only ls0 remains");
    client.close().await;
    Ok(())
}
