//! Proxmox VE API client
//!
//! A thin typed wrapper over the Proxmox REST API (`/api2/json`). Supports
//! API-token authentication via the `Authorization` header and password
//! authentication via a ticket obtained from `/access/ticket`. Every
//! response unwraps the `{"data": ...}` envelope.

pub mod discovery;
pub mod provision;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, info};

use crate::DeployError;
use crate::config::ProxmoxConfig;

/// Envelope wrapping every Proxmox API response
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    data: T,
}

#[derive(Debug, Clone)]
enum Auth {
    /// `Authorization: PVEAPIToken=<id>=<secret>`
    Token(String),
    /// Ticket cookie plus CSRF token for write requests
    Ticket { ticket: String, csrf: String },
}

/// Response of `POST /access/ticket`
#[derive(Debug, Deserialize)]
struct TicketResponse {
    ticket: String,
    #[serde(rename = "CSRFPreventionToken")]
    csrf_token: String,
}

/// Proxmox VE version information
#[derive(Debug, Clone, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    #[serde(default)]
    pub release: Option<String>,
    #[serde(default)]
    pub repoid: Option<String>,
}

/// One entry of `GET /cluster/status` (a cluster, node, or qdevice row)
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterStatusEntry {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub online: Option<u8>,
    #[serde(default)]
    pub quorate: Option<u8>,
    #[serde(default)]
    pub local: Option<u8>,
    #[serde(default)]
    pub ip: Option<String>,
}

impl ClusterStatusEntry {
    pub fn is_online_node(&self) -> bool {
        self.kind == "node" && self.online == Some(1)
    }
}

/// One entry of `GET /nodes/{node}/qemu`
#[derive(Debug, Clone, Deserialize)]
pub struct VmSummary {
    pub vmid: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub tags: Option<String>,
}

/// Current VM status from `GET .../status/current`
#[derive(Debug, Clone, Deserialize)]
pub struct VmStatus {
    pub status: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl VmStatus {
    pub fn is_running(&self) -> bool {
        self.status.eq_ignore_ascii_case("running")
    }

    pub fn is_stopped(&self) -> bool {
        self.status.eq_ignore_ascii_case("stopped")
    }
}

/// One entry of `GET /nodes/{node}/storage`
#[derive(Debug, Clone, Deserialize)]
pub struct StorageEntry {
    pub storage: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub enabled: Option<u8>,
    #[serde(default)]
    pub active: Option<u8>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub shared: Option<u8>,
}

/// Detail record of `GET /storage/{name}`
#[derive(Debug, Clone, Deserialize)]
pub struct StorageDetail {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub shared: Option<u8>,
}

/// DNS settings of `GET /nodes/{node}/dns`
#[derive(Debug, Clone, Deserialize)]
pub struct DnsInfo {
    #[serde(default)]
    pub search: Option<String>,
}

/// Typed client for the Proxmox VE API
pub struct ProxmoxClient {
    http: Client,
    base_url: String,
    auth: Auth,
}

impl ProxmoxClient {
    /// Connect using the configured credentials and verify with `/version`.
    ///
    /// API tokens take effect immediately; password auth performs a ticket
    /// login first. Tickets outlive any CLI invocation, so no renewal.
    pub async fn connect(config: &ProxmoxConfig) -> Result<Self, DeployError> {
        let base_url = api_base_url(&config.host);
        let http = build_http_client(config)?;

        let auth = if let (Some(token_id), Some(secret)) = (
            config.api_token_id.as_deref(),
            config.api_token_secret.as_deref(),
        ) {
            debug!("Using API token authentication for {}", config.host);
            Auth::Token(format!("PVEAPIToken={token_id}={secret}"))
        } else if let Some(password) = config.password.as_deref() {
            debug!(
                "Using ticket authentication for {} as {}",
                config.host, config.user
            );
            login(&http, &base_url, &config.user, password).await?
        } else {
            return Err(DeployError::config(
                "Proxmox authentication not configured. Provide 'password' or both \
                 'api_token_id' and 'api_token_secret'",
            ));
        };

        let client = Self {
            http,
            base_url,
            auth,
        };

        // Verify the connection before handing the client out
        let version = client.version().await?;
        info!(
            "Connected to Proxmox VE {} at {}",
            version.version, config.host
        );
        Ok(client)
    }

    /// Build a client against an explicit base URL with token auth already
    /// in place (integration tests point this at a mock server).
    pub fn with_base_url(base_url: impl Into<String>, token_header: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
            auth: Auth::Token(token_header.into()),
        }
    }

    /// `GET /version`
    pub async fn version(&self) -> Result<VersionInfo, DeployError> {
        self.get("/version").await
    }

    /// `GET /cluster/status`
    pub async fn cluster_status(&self) -> Result<Vec<ClusterStatusEntry>, DeployError> {
        self.get("/cluster/status").await
    }

    /// `GET /nodes/{node}/qemu`
    pub async fn list_vms(&self, node: &str) -> Result<Vec<VmSummary>, DeployError> {
        self.get(&format!("/nodes/{node}/qemu")).await
    }

    /// `GET /nodes/{node}/qemu/{vmid}/status/current`
    pub async fn vm_status(&self, node: &str, vmid: u32) -> Result<VmStatus, DeployError> {
        self.get(&format!("/nodes/{node}/qemu/{vmid}/status/current"))
            .await
    }

    /// `POST .../status/start` — returns the task UPID
    pub async fn start_vm(&self, node: &str, vmid: u32) -> Result<String, DeployError> {
        debug!("Starting VM {vmid} on node '{node}'");
        self.post(&format!("/nodes/{node}/qemu/{vmid}/status/start"), &[])
            .await
    }

    /// `POST .../status/shutdown` — graceful guest shutdown
    pub async fn shutdown_vm(&self, node: &str, vmid: u32) -> Result<String, DeployError> {
        debug!("Gracefully shutting down VM {vmid} on node '{node}'");
        self.post(&format!("/nodes/{node}/qemu/{vmid}/status/shutdown"), &[])
            .await
    }

    /// `POST .../status/stop` — hard stop
    pub async fn stop_vm(&self, node: &str, vmid: u32) -> Result<String, DeployError> {
        debug!("Force stopping VM {vmid} on node '{node}'");
        self.post(&format!("/nodes/{node}/qemu/{vmid}/status/stop"), &[])
            .await
    }

    /// `POST .../status/reboot`
    pub async fn reboot_vm(&self, node: &str, vmid: u32) -> Result<String, DeployError> {
        debug!("Rebooting VM {vmid} on node '{node}'");
        self.post(&format!("/nodes/{node}/qemu/{vmid}/status/reboot"), &[])
            .await
    }

    /// `GET .../config` — loosely typed; the `agent` key in particular can
    /// be an integer or an option string depending on how it was set
    pub async fn vm_config(&self, node: &str, vmid: u32) -> Result<serde_json::Value, DeployError> {
        self.get(&format!("/nodes/{node}/qemu/{vmid}/config")).await
    }

    /// `POST .../config` setting the `cicustom` parameter
    pub async fn set_cicustom(
        &self,
        node: &str,
        vmid: u32,
        cicustom: &str,
    ) -> Result<(), DeployError> {
        debug!("Setting cicustom for VM {vmid}: {cicustom}");
        let _: Option<String> = self
            .post(
                &format!("/nodes/{node}/qemu/{vmid}/config"),
                &[("cicustom", cicustom)],
            )
            .await?;
        Ok(())
    }

    /// `GET .../agent/info` — QGA runtime probe.
    ///
    /// Returns `None` when the agent is not running or not responding;
    /// probe failures never propagate.
    pub async fn agent_info(&self, node: &str, vmid: u32) -> Option<serde_json::Value> {
        match self
            .get::<serde_json::Value>(&format!("/nodes/{node}/qemu/{vmid}/agent/info"))
            .await
        {
            Ok(info) => Some(info),
            Err(e) => {
                debug!("QGA not available for VM {vmid}: {e}");
                None
            }
        }
    }

    /// `PUT .../cloudinit` — regenerate the cloud-init drive from the
    /// currently configured sources
    pub async fn regenerate_cloudinit(&self, node: &str, vmid: u32) -> Result<(), DeployError> {
        debug!("Triggering cloud-init regeneration for VM {vmid}");
        let _: Option<serde_json::Value> = self
            .put(&format!("/nodes/{node}/qemu/{vmid}/cloudinit"))
            .await?;
        Ok(())
    }

    /// `GET /nodes/{node}/dns` — the node's DNS search domain, if set
    pub async fn node_dns_search(&self, node: &str) -> Result<Option<String>, DeployError> {
        let dns: DnsInfo = self.get(&format!("/nodes/{node}/dns")).await?;
        Ok(dns.search.filter(|s| !s.is_empty()))
    }

    /// `GET /nodes/{node}/storage`
    pub async fn node_storage(&self, node: &str) -> Result<Vec<StorageEntry>, DeployError> {
        self.get(&format!("/nodes/{node}/storage")).await
    }

    /// `GET /storage/{name}` — cluster-wide storage definition
    pub async fn storage_detail(&self, name: &str) -> Result<StorageDetail, DeployError> {
        self.get(&format!("/storage/{name}")).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, DeployError> {
        let request = self.http.get(format!("{}{path}", self.base_url));
        let response = self.authorize(request, false).send().await?;
        self.unwrap_response(path, response).await
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        form: &[(&str, &str)],
    ) -> Result<T, DeployError> {
        let request = self
            .http
            .post(format!("{}{path}", self.base_url))
            .form(form);
        let response = self.authorize(request, true).send().await?;
        self.unwrap_response(path, response).await
    }

    async fn put<T: DeserializeOwned>(&self, path: &str) -> Result<T, DeployError> {
        let request = self.http.put(format!("{}{path}", self.base_url));
        let response = self.authorize(request, true).send().await?;
        self.unwrap_response(path, response).await
    }

    fn authorize(&self, request: reqwest::RequestBuilder, write: bool) -> reqwest::RequestBuilder {
        match &self.auth {
            Auth::Token(header) => request.header("Authorization", header),
            Auth::Ticket { ticket, csrf } => {
                let request = request.header("Cookie", format!("PVEAuthCookie={ticket}"));
                if write {
                    request.header("CSRFPreventionToken", csrf)
                } else {
                    request
                }
            }
        }
    }

    async fn unwrap_response<T: DeserializeOwned>(
        &self,
        path: &str,
        response: reqwest::Response,
    ) -> Result<T, DeployError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(api_error(path, status, &body));
        }

        let envelope: ApiResponse<T> = response.json().await.map_err(|e| {
            DeployError::proxmox(format!("Invalid response from '{path}': {e}"))
        })?;
        Ok(envelope.data)
    }
}

/// Build the `https://host:8006/api2/json` base URL; an explicit port in
/// the host string is respected
fn api_base_url(host: &str) -> String {
    if host.contains(':') {
        format!("https://{host}/api2/json")
    } else {
        format!("https://{host}:8006/api2/json")
    }
}

fn build_http_client(config: &ProxmoxConfig) -> Result<Client, DeployError> {
    Client::builder()
        .timeout(Duration::from_secs(config.timeout))
        .connect_timeout(Duration::from_secs(config.timeout))
        .danger_accept_invalid_certs(!config.verify_ssl)
        .build()
        .map_err(|e| DeployError::proxmox(format!("Failed to create HTTP client: {e}")))
}

async fn login(
    http: &Client,
    base_url: &str,
    user: &str,
    password: &str,
) -> Result<Auth, DeployError> {
    let response = http
        .post(format!("{base_url}/access/ticket"))
        .form(&[("username", user), ("password", password)])
        .send()
        .await
        .map_err(|e| DeployError::proxmox(format!("Failed to connect to Proxmox API: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(api_error("/access/ticket", status, &body));
    }

    let envelope: ApiResponse<TicketResponse> = response
        .json()
        .await
        .map_err(|e| DeployError::proxmox(format!("Invalid ticket response: {e}")))?;

    Ok(Auth::Ticket {
        ticket: envelope.data.ticket,
        csrf: envelope.data.csrf_token,
    })
}

fn api_error(path: &str, status: StatusCode, body: &str) -> DeployError {
    let body = body.trim();
    if body.is_empty() {
        DeployError::proxmox(format!("'{path}' failed with status {status}"))
    } else {
        DeployError::proxmox(format!("'{path}' failed with status {status}: {body}"))
    }
}
