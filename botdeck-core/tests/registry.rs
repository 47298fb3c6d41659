//! Server registry and durability of the persisted documents.

mod common;

use std::fs;
use std::sync::Arc;

use botdeck_core::{Core, CoreError, ServerEntry};
use common::{FakeEngine, FakeProvider, harness, online_profile};

fn hub() -> ServerEntry {
    ServerEntry {
        name: "hub".to_string(),
        host: "mc.example.net".to_string(),
        port: 25565,
    }
}

#[tokio::test]
async fn add_list_remove_servers() {
    let h = harness();
    h.core.add_server(hub()).unwrap();
    h.core
        .add_server(ServerEntry {
            name: "lobby".to_string(),
            host: "lobby.example.net".to_string(),
            port: 25566,
        })
        .unwrap();

    let mut names: Vec<_> = h.core.list_servers().into_iter().map(|s| s.name).collect();
    names.sort();
    assert_eq!(names, ["hub", "lobby"]);

    h.core.remove_server("lobby").unwrap();
    assert_eq!(h.core.list_servers().len(), 1);
    assert!(matches!(
        h.core.remove_server("lobby"),
        Err(CoreError::UnknownServer(_))
    ));
}

#[tokio::test]
async fn duplicate_add_leaves_the_document_untouched() {
    let h = harness();
    h.core.add_server(hub()).unwrap();
    let path = h.dir.path().join("servers.json");
    let before = fs::read(&path).unwrap();

    let mut duplicate = hub();
    duplicate.port = 19132;
    assert!(matches!(
        h.core.add_server(duplicate),
        Err(CoreError::DuplicateServer(_))
    ));
    assert_eq!(fs::read(&path).unwrap(), before);
}

#[tokio::test]
async fn live_connection_counts_per_server() {
    let h = harness();
    h.core.add_server(hub()).unwrap();
    let (client, _) = h.core.authenticate_offline("Steve").unwrap();
    let conn = h.core.create_connection(client, "hub", "1.21".into()).unwrap();

    assert_eq!(h.core.list_servers()[0].connections, 0);
    h.core.connect(client, conn).await.unwrap();
    assert_eq!(h.core.list_servers()[0].connections, 1);
    h.core.kill_hard(client, conn).unwrap();
    assert_eq!(h.core.list_servers()[0].connections, 0);
}

#[tokio::test]
async fn removing_a_server_spares_its_connections() {
    let h = harness();
    h.core.add_server(hub()).unwrap();
    let (client, _) = h.core.authenticate_offline("Steve").unwrap();
    let conn = h.core.create_connection(client, "hub", "1.21".into()).unwrap();
    h.core.connect(client, conn).await.unwrap();

    h.core.remove_server("hub").unwrap();
    assert!(h.core.list_instances(client).unwrap()[&conn].connected);
    // Chat still flows; only future lookups of the name fail.
    h.core.send_chat(client, conn, "still here").await.unwrap();
    assert!(matches!(
        h.core.create_connection(client, "hub", "1.20.4".into()),
        Err(CoreError::UnknownServer(_))
    ));
}

#[tokio::test]
async fn removing_a_client_drops_its_connections() {
    let h = harness();
    h.core.add_server(hub()).unwrap();
    let (client, _) = h.core.authenticate_offline("Steve").unwrap();
    let conn = h.core.create_connection(client, "hub", "1.21".into()).unwrap();
    h.core.connect(client, conn).await.unwrap();

    h.core.remove_client(client).unwrap();
    assert!(h.core.list_clients().is_empty());
    assert!(matches!(
        h.core.list_instances(client),
        Err(CoreError::UnknownClient(_))
    ));
    assert_eq!(h.core.list_servers()[0].connections, 0);
}

#[tokio::test]
async fn registries_survive_a_reopen() {
    let h = harness();
    h.core.add_server(hub()).unwrap();
    let (client, _) = h.core.authenticate_offline("Steve").unwrap();
    let conn = h.core.create_connection(client, "hub", "1.21".into()).unwrap();
    h.core.connect(client, conn).await.unwrap();

    let config = botdeck_core::CoreConfig {
        data_dir: h.dir.path().to_path_buf(),
        ..Default::default()
    };
    h.core.shutdown().await;
    drop(h.core);

    let reopened = Core::open(
        config,
        Arc::new(FakeEngine::default()),
        Arc::new(FakeProvider::with_profile(online_profile("Herobrine"))),
    )
    .unwrap();
    assert_eq!(reopened.list_servers().len(), 1);
    let clients = reopened.list_clients();
    assert_eq!(clients.len(), 1);
    assert_eq!(clients[0].username, "Steve");
    // Sessions are process-scoped; the connection reloads idle.
    let instances = reopened.list_instances(client).unwrap();
    assert!(!instances[&conn].connected);
}

#[tokio::test]
async fn supported_versions_come_from_the_engine() {
    let h = harness();
    let versions = h.core.available_versions();
    assert!(versions.contains(&"1.21".into()));
    assert!(versions.contains(&"1.20.4".into()));
}
