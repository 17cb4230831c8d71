//! Firecracker API client
//!
//! Provides a high-level client for interacting with Firecracker's HTTP API
//! over Unix domain sockets.

use std::path::PathBuf;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_util::client::legacy::Client;
use hyperlocal::UnixConnector;
use serde::Serialize;

use super::config::*;
use crate::error::{Result, VmmError};

type HyperClient = Client<UnixConnector, Full<Bytes>>;

/// Client for communicating with Firecracker's control API
pub struct FirecrackerClient {
    client: HyperClient,
    socket_path: PathBuf,
}

impl FirecrackerClient {
    /// Create a new Firecracker API client
    ///
    /// # Arguments
    /// * `socket_path` - Path to the Firecracker API Unix socket
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        let client = Client::builder(hyper_util::rt::TokioExecutor::new()).build(UnixConnector);

        Self {
            client,
            socket_path: socket_path.into(),
        }
    }

    /// Send a request and fail with [`VmmError::Api`] on a non-2xx status
    async fn send_request<T: Serialize>(
        &self,
        method: hyper::Method,
        endpoint: &str,
        body: Option<&T>,
    ) -> Result<Bytes> {
        let uri: hyper::Uri = hyperlocal::Uri::new(&self.socket_path, endpoint).into();
        let payload = match body {
            Some(body) => Bytes::from(serde_json::to_vec(body)?),
            None => Bytes::new(),
        };

        let req = hyper::Request::builder()
            .method(method)
            .uri(uri)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .body(Full::new(payload))?;

        let res = self.client.request(req).await?;
        let status = res.status();
        let body_bytes = res.into_body().collect().await?.to_bytes();

        if !status.is_success() {
            return Err(VmmError::Api {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body_bytes).into_owned(),
            });
        }

        Ok(body_bytes)
    }

    async fn put<T: Serialize>(&self, endpoint: &str, body: &T) -> Result<()> {
        self.send_request(hyper::Method::PUT, endpoint, Some(body))
            .await
            .map(|_| ())
    }

    /// Configure the boot source (kernel and boot arguments)
    pub async fn boot_source(
        &self,
        kernel_image_path: impl Into<String>,
        boot_args: impl Into<String>,
    ) -> Result<()> {
        self.put(
            "/boot-source",
            &BootSource {
                kernel_image_path: kernel_image_path.into(),
                boot_args: boot_args.into(),
            },
        )
        .await
    }

    /// Add a block device (drive) to the VM
    pub async fn add_drive(&self, drive: &Drive) -> Result<()> {
        let endpoint = format!("/drives/{}", drive.drive_id);
        self.put(&endpoint, drive).await
    }

    /// Set vCPU count and memory size
    pub async fn machine_config(&self, config: &MachineConfig) -> Result<()> {
        self.put("/machine-config", config).await
    }

    /// Attach a virtio-net interface backed by a TAP device
    pub async fn add_network_interface(&self, iface: &NetworkInterface) -> Result<()> {
        let endpoint = format!("/network-interfaces/{}", iface.iface_id);
        self.put(&endpoint, iface).await
    }

    /// Start the VM instance
    pub async fn start(&self) -> Result<()> {
        self.put(
            "/actions",
            &Action {
                action_type: "InstanceStart".to_string(),
            },
        )
        .await
    }

    /// Ask the guest to shut down (keyboard reset; with `reboot=k` Firecracker exits)
    pub async fn send_ctrl_alt_del(&self) -> Result<()> {
        self.put(
            "/actions",
            &Action {
                action_type: "SendCtrlAltDel".to_string(),
            },
        )
        .await
    }

    /// Raw instance description (`GET /`), used to confirm the API is answering
    pub async fn instance_info(&self) -> Result<serde_json::Value> {
        let body = self
            .send_request::<()>(hyper::Method::GET, "/", None)
            .await?;
        Ok(serde_json::from_slice(&body)?)
    }
}
