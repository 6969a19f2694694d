//! Integration tests for the Proxmox API client using wiremock

use k3s_deploy::proxmox::ProxmoxClient;
use serde_json::json;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TOKEN: &str = "PVEAPIToken=root@pam!ci=secret";

fn client_for(server: &MockServer) -> ProxmoxClient {
    ProxmoxClient::with_base_url(server.uri(), TOKEN)
}

#[tokio::test]
async fn test_version_sends_token_and_unwraps_envelope() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/version"))
        .and(header("Authorization", TOKEN))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"version": "8.2.4", "release": "8.2", "repoid": "faa83925c9641325"}
        })))
        .mount(&server)
        .await;

    let version = client_for(&server).version().await.unwrap();
    assert_eq!(version.version, "8.2.4");
    assert_eq!(version.release.as_deref(), Some("8.2"));
}

#[tokio::test]
async fn test_cluster_status_entries() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/cluster/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                {"type": "cluster", "name": "lab", "quorate": 1},
                {"type": "node", "name": "pve1", "online": 1, "local": 1, "ip": "10.0.0.1"},
                {"type": "node", "name": "pve2", "online": 0}
            ]
        })))
        .mount(&server)
        .await;

    let status = client_for(&server).cluster_status().await.unwrap();
    assert_eq!(status.len(), 3);
    assert!(status[1].is_online_node());
    assert!(!status[2].is_online_node());
    assert_eq!(status[0].quorate, Some(1));
}

#[tokio::test]
async fn test_api_error_carries_status_and_body() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/version"))
        .respond_with(ResponseTemplate::new(401).set_body_string("authentication failure"))
        .mount(&server)
        .await;

    let err = client_for(&server).version().await.unwrap_err();
    let message = err.to_string();
    assert!(message.contains("401"));
    assert!(message.contains("authentication failure"));
}

#[tokio::test]
async fn test_discovery_filters_by_single_k3s_tag() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/cluster/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"type": "node", "name": "pve1", "online": 1}]
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/nodes/pve1/qemu"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                {"vmid": 100, "name": "k3s-server-1", "status": "running", "tags": "k3s-server"},
                {"vmid": 101, "name": "both-tags", "status": "running",
                 "tags": "k3s-server;k3s-agent"},
                {"vmid": 102, "name": "untagged", "status": "running"},
                {"vmid": 103, "name": "k3s-agent-1", "status": "stopped",
                 "tags": "prod;k3s-agent"}
            ]
        })))
        .mount(&server)
        .await;

    // QGA probing: 100 has the agent enabled and running, 103 disabled
    Mock::given(method("GET"))
        .and(path("/nodes/pve1/qemu/100/config"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"agent": "enabled=1,fstrim_cloned_disks=1"}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/nodes/pve1/qemu/100/agent/info"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"version": "8.2.0"}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/nodes/pve1/qemu/103/config"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"agent": 0}
        })))
        .mount(&server)
        .await;

    let discovered = client_for(&server).discover_k3s_vms().await.unwrap();
    assert_eq!(discovered.len(), 2);

    assert_eq!(discovered[0].vmid, 100);
    assert_eq!(discovered[0].role.to_string(), "server");
    assert!(discovered[0].qga.enabled);
    assert!(discovered[0].qga.running);
    assert_eq!(discovered[0].qga.version.as_deref(), Some("8.2.0"));

    assert_eq!(discovered[1].vmid, 103);
    assert_eq!(discovered[1].role.to_string(), "agent");
    assert!(!discovered[1].qga.enabled);
}

#[tokio::test]
async fn test_qga_running_probe_failure_is_not_fatal() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/nodes/pve1/qemu/100/config"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"agent": 1}
        })))
        .mount(&server)
        .await;
    // agent/info returns the QEMU "not running" error
    Mock::given(method("GET"))
        .and(path("/nodes/pve1/qemu/100/agent/info"))
        .respond_with(ResponseTemplate::new(500).set_body_string("QEMU guest agent is not running"))
        .mount(&server)
        .await;

    let qga = client_for(&server).qga_status("pve1", 100).await;
    assert!(qga.enabled);
    assert!(!qga.running);
    assert!(qga.error.is_none());
}

#[tokio::test]
async fn test_snippet_storage_selection() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/nodes/pve1/storage"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                {"storage": "local-lvm", "content": "images,rootdir",
                 "enabled": 1, "active": 1, "type": "lvmthin"},
                {"storage": "local", "content": "snippets,iso,vztmpl",
                 "enabled": 1, "active": 1, "type": "dir",
                 "path": "/var/lib/vz", "shared": 0}
            ]
        })))
        .mount(&server)
        .await;

    let storage = client_for(&server)
        .snippet_storage("pve1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(storage.name, "local");
    assert_eq!(storage.path.as_deref(), Some("/var/lib/vz"));
    assert!(!storage.shared);
}

#[tokio::test]
async fn test_snippet_storage_detail_fallback() {
    let server = MockServer::start().await;

    // Node listing lacks path/shared, forcing the detail lookup
    Mock::given(method("GET"))
        .and(path("/nodes/pve1/storage"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                {"storage": "tank", "content": "snippets", "enabled": 1, "active": 1,
                 "type": "nfs"}
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/storage/tank"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"type": "nfs", "path": "/mnt/pve/tank", "shared": 1}
        })))
        .mount(&server)
        .await;

    let storage = client_for(&server)
        .snippet_storage("pve1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(storage.name, "tank");
    assert_eq!(storage.path.as_deref(), Some("/mnt/pve/tank"));
    assert!(storage.shared);
}

#[tokio::test]
async fn test_snippet_storage_none_available() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/nodes/pve1/storage"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                {"storage": "local-lvm", "content": "images", "enabled": 1, "active": 1},
                {"storage": "inactive", "content": "snippets", "enabled": 1, "active": 0}
            ]
        })))
        .mount(&server)
        .await;

    let storage = client_for(&server).snippet_storage("pve1").await.unwrap();
    assert!(storage.is_none());
}

#[tokio::test]
async fn test_find_vm_node_skips_unreachable_nodes() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/cluster/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                {"type": "node", "name": "pve1", "online": 1},
                {"type": "node", "name": "pve2", "online": 1}
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/nodes/pve1/qemu"))
        .respond_with(ResponseTemplate::new(595).set_body_string("no route to host"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/nodes/pve2/qemu"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"vmid": 100, "name": "k3s-server-1", "status": "running"}]
        })))
        .mount(&server)
        .await;

    let node = client_for(&server).find_vm_node(100).await.unwrap();
    assert_eq!(node.as_deref(), Some("pve2"));

    let missing = client_for(&server).find_vm_node(999).await.unwrap();
    assert!(missing.is_none());
}

#[tokio::test]
async fn test_set_cicustom_posts_form() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/nodes/pve1/qemu/100/config"))
        .and(body_string_contains("cicustom="))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": null})))
        .expect(1)
        .mount(&server)
        .await;

    client_for(&server)
        .set_cicustom("pve1", 100, "user=local:snippets/userconfig-100.yaml")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_power_operations_return_task_id() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/nodes/pve1/qemu/100/status/start"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": "UPID:pve1:0000C0FF:00AA:qmstart:100:root@pam:"
        })))
        .mount(&server)
        .await;

    let upid = client_for(&server).start_vm("pve1", 100).await.unwrap();
    assert!(upid.starts_with("UPID:"));
}

#[tokio::test]
async fn test_regenerate_cloudinit_put() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/nodes/pve1/qemu/100/cloudinit"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": null})))
        .expect(1)
        .mount(&server)
        .await;

    client_for(&server)
        .regenerate_cloudinit("pve1", 100)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_node_dns_search() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/nodes/pve1/dns"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"search": "lan.example.io", "dns1": "10.0.0.1"}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/nodes/pve2/dns"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"dns1": "10.0.0.1"}
        })))
        .mount(&server)
        .await;

    let client = client_for(&server);
    assert_eq!(
        client.node_dns_search("pve1").await.unwrap().as_deref(),
        Some("lan.example.io")
    );
    assert!(client.node_dns_search("pve2").await.unwrap().is_none());
}
