//! Eureka registration so gateway services can discover this instance.

use crate::config::RegistryConfig;
use reqwest::StatusCode;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::{
    sync::broadcast,
    time::{interval_at, Instant},
};

const FALLBACK_HOST: &str = "127.0.0.1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const LEASE_DURATION_SECS: u64 = 90;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Registry request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Registry rejected {operation} with status {status}")]
    Rejected {
        operation: &'static str,
        status: StatusCode,
    },
}

#[derive(Serialize)]
struct Registration<'a> {
    instance: &'a InstanceInfo,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfo {
    pub instance_id: String,
    pub host_name: String,
    pub app: String,
    pub ip_addr: String,
    pub status: String,
    pub vip_address: String,
    pub secure_vip_address: String,
    pub port: PortInfo,
    pub secure_port: PortInfo,
    pub home_page_url: String,
    pub status_page_url: String,
    pub health_check_url: String,
    pub data_center_info: DataCenterInfo,
    pub lease_info: LeaseInfo,
}

#[derive(Serialize, Debug, Clone)]
pub struct PortInfo {
    #[serde(rename = "$")]
    pub port: u16,
    #[serde(rename = "@enabled")]
    pub enabled: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct DataCenterInfo {
    #[serde(rename = "@class")]
    pub class: String,
    pub name: String,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LeaseInfo {
    pub renewal_interval_in_secs: u64,
    pub duration_in_secs: u64,
}

impl InstanceInfo {
    pub fn new(app_name: &str, host: &str, port: u16, renewal_interval: Duration) -> Self {
        let base_url = format!("http://{}:{}", host, port);
        let vip = app_name.to_lowercase();

        Self {
            instance_id: format!("{}:{}:{}", host, vip, port),
            host_name: host.to_string(),
            app: app_name.to_uppercase(),
            ip_addr: host.to_string(),
            status: "UP".to_string(),
            vip_address: vip.clone(),
            secure_vip_address: vip,
            port: PortInfo {
                port,
                enabled: "true".to_string(),
            },
            secure_port: PortInfo {
                port: 443,
                enabled: "false".to_string(),
            },
            home_page_url: format!("{}/", base_url),
            status_page_url: format!("{}/info", base_url),
            health_check_url: format!("{}/actuator/health", base_url),
            data_center_info: DataCenterInfo {
                class: "com.netflix.appinfo.InstanceInfo$DefaultDataCenterInfo".to_string(),
                name: "MyOwn".to_string(),
            },
            lease_info: LeaseInfo {
                renewal_interval_in_secs: renewal_interval.as_secs(),
                duration_in_secs: LEASE_DURATION_SECS,
            },
        }
    }
}

/// Uses the configured host, else asks the public IP lookup service, else
/// falls back to loopback.
pub async fn resolve_instance_host(config: &RegistryConfig) -> String {
    if let Some(host) = &config.instance_host {
        return host.clone();
    }

    let lookup = async {
        reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?
            .get(&config.public_ip_url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await
    };

    match lookup.await {
        Ok(ip) if !ip.trim().is_empty() => {
            let ip = ip.trim().to_string();
            tracing::info!("Resolved public IP address: {}", ip);
            ip
        }
        Ok(_) => {
            tracing::warn!("Public IP lookup returned nothing, using {}", FALLBACK_HOST);
            FALLBACK_HOST.to_string()
        }
        Err(e) => {
            tracing::warn!("Public IP lookup failed, using {}: {}", FALLBACK_HOST, e);
            FALLBACK_HOST.to_string()
        }
    }
}

pub struct EurekaClient {
    client: reqwest::Client,
    server_url: String,
    instance: InstanceInfo,
    heartbeat_interval: Duration,
}

impl EurekaClient {
    pub fn new(config: &RegistryConfig, instance: InstanceInfo) -> Result<Self, RegistryError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        Ok(Self {
            client,
            server_url: config.server_url.trim_end_matches('/').to_string(),
            instance,
            heartbeat_interval: config.heartbeat_interval(),
        })
    }

    fn app_url(&self) -> String {
        format!("{}/apps/{}", self.server_url, self.instance.app)
    }

    fn instance_url(&self) -> String {
        format!("{}/{}", self.app_url(), self.instance.instance_id)
    }

    pub async fn register(&self) -> Result<(), RegistryError> {
        let response = self
            .client
            .post(self.app_url())
            .json(&Registration {
                instance: &self.instance,
            })
            .send()
            .await?;
        check("register", response.status())?;

        tracing::info!(
            "Registered {} with service registry as {}",
            self.instance.app,
            self.instance.instance_id
        );
        Ok(())
    }

    /// Renews the lease, registering again if the registry forgot us.
    pub async fn heartbeat(&self) -> Result<(), RegistryError> {
        let response = self
            .client
            .put(self.instance_url())
            .query(&[("status", "UP")])
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            tracing::warn!("Registry does not know this instance, registering again");
            return self.register().await;
        }
        check("heartbeat", response.status())
    }

    pub async fn deregister(&self) -> Result<(), RegistryError> {
        let response = self.client.delete(self.instance_url()).send().await?;
        check("deregister", response.status())?;

        tracing::info!("Deregistered {} from service registry", self.instance.instance_id);
        Ok(())
    }

    /// Registers, renews the lease until shutdown, then deregisters.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        if let Err(e) = self.register().await {
            tracing::error!("Service registration failed, will retry on heartbeat: {}", e);
        }

        let mut ticker = interval_at(
            Instant::now() + self.heartbeat_interval,
            self.heartbeat_interval,
        );
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.heartbeat().await {
                        tracing::error!("Registry heartbeat failed: {}", e);
                    }
                }
            }
        }

        if let Err(e) = self.deregister().await {
            tracing::error!("Service deregistration failed: {}", e);
        }
    }
}

fn check(operation: &'static str, status: StatusCode) -> Result<(), RegistryError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(RegistryError::Rejected { operation, status })
    }
}
