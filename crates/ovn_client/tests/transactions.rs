//! Transact batching: wire shape, committed ids, and the failure modes
//! that drop the connection.

mod common;

use anyhow::{Context, Result};
use common::{wait_until, MockOvsdb};
use ovn_client::{Client, Config, Error, DB_NORTHBOUND};
use serde_json::json;

const NEW_LS: &str = "53000000-0000-4000-8000-00000000000f";

async fn connected(server: &MockOvsdb) -> Result<Client> {
    Client::connect(Config::new(DB_NORTHBOUND, server.endpoint()))
        .await
        .context("connecting to the scripted server")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn inserts_return_their_committed_id() -> Result<()> {
    let server = MockOvsdb::start(DB_NORTHBOUND).await;
    let client = connected(&server).await?;

    server.queue_transact_reply(json!([{ "uuid": ["uuid", NEW_LS] }]));
    let cmd = client.ls_add("ls0").await?;
    let ids = client.execute_returning_ids([cmd]).await?;
    assert_eq!(
        ids.iter().map(|u| u.to_string()).collect::<Vec<_>>(),
        vec![NEW_LS.to_owned()]
    );

    let recorded = server.transacts();
    assert_eq!(recorded.len(), 1);
    let params = recorded[0].as_array().context("params array")?;
    assert_eq!(params[0], json!(DB_NORTHBOUND));
    assert_eq!(params[1]["op"], json!("insert"));
    assert_eq!(params[1]["table"], json!("Logical_Switch"));
    assert_eq!(params[1]["row"]["name"], json!("ls0"));
    client.close().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn batches_flatten_into_one_wire_call() -> Result<()> {
    let server = MockOvsdb::start(DB_NORTHBOUND).await;
    let client = connected(&server).await?;

    server.queue_transact_reply(json!([{}, {}]));
    let a = client.ls_add("a").await?;
    let b = client.ls_add("b").await?;
    client.execute([a, b]).await?;

    let recorded = server.transacts();
    assert_eq!(recorded.len(), 1, "one transact for the whole batch");
    let params = recorded[0].as_array().context("params array")?;
    assert_eq!(params.len(), 3, "database name plus both operations");
    client.close().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn empty_batches_skip_the_wire() -> Result<()> {
    let server = MockOvsdb::start(DB_NORTHBOUND).await;
    let client = connected(&server).await?;

    client.execute(Vec::new()).await?;
    assert!(server.transacts().is_empty());
    client.close().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn refused_operations_name_the_culprit_and_drop_the_link() -> Result<()> {
    let server = MockOvsdb::start(DB_NORTHBOUND).await;
    let client = connected(&server).await?;

    server.queue_transact_reply(json!([
        {},
        { "error": "constraint violation", "details": "duplicate port" },
    ]));
    let a = client.ls_add("a").await?;
    let b = client.ls_add("b").await?;
    let err = client
        .execute([a, b])
        .await
        .expect_err("the reply carries an error member");
    assert!(matches!(err, Error::Transaction(_)), "{err}");
    let text = err.to_string();
    assert!(text.contains("constraint violation"), "{text}");
    assert!(text.contains("insert on Logical_Switch"), "{text}");
    assert!(text.contains("duplicate port"), "{text}");

    // a refusal can mean a stale server; the connection gets dropped
    let probe = &client;
    wait_until(
        move || async move { !probe.is_connected().await },
        "the link to drop after the refusal",
    )
    .await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn commit_failures_read_as_batch_failures() -> Result<()> {
    let server = MockOvsdb::start(DB_NORTHBOUND).await;
    let client = connected(&server).await?;

    // one operation, two results: the trailing member is the commit error
    server.queue_transact_reply(json!([{}, { "error": "timed out" }]));
    let cmd = client.ls_add("ls0").await?;
    let err = client.execute([cmd]).await.expect_err("commit refused");
    assert!(
        err.to_string().contains("timed out during committing the batch"),
        "{err}"
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn short_replies_violate_conformance() -> Result<()> {
    let server = MockOvsdb::start(DB_NORTHBOUND).await;
    let client = connected(&server).await?;

    server.queue_transact_reply(json!([{}]));
    let a = client.ls_add("a").await?;
    let b = client.ls_add("b").await?;
    let err = client.execute([a, b]).await.expect_err("one result short");
    assert!(matches!(err, Error::Conformance(_)), "{err}");
    assert!(
        err.to_string().contains("2 operations answered by 1 results"),
        "{err}"
    );
    client.close().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transactions_need_a_live_connection() -> Result<()> {
    let server = MockOvsdb::start(DB_NORTHBOUND).await;
    let client = connected(&server).await?;

    let cmd = client.ls_add("ls0").await?;
    client.close().await;
    let err = client.execute([cmd]).await.expect_err("closed client");
    assert!(matches!(err, Error::Connection(_)), "{err}");
    Ok(())
}
