//! `/networks/*` — list, create, inspect, remove, connect, disconnect.

use std::net::Ipv4Addr;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::DaemonError;
use crate::network::{Attachment, NetworkAgentClient, NetworkDriver, NetworkRecord};
use crate::router::AppState;

#[derive(Debug, Serialize)]
pub struct NetworkResponse {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Driver")]
    pub driver: String,
    #[serde(rename = "IPAM")]
    pub ipam: IpamResponse,
    #[serde(rename = "Containers")]
    pub containers: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct IpamResponse {
    #[serde(rename = "Config")]
    pub config: Vec<IpamConfigEntry>,
}

#[derive(Debug, Serialize)]
pub struct IpamConfigEntry {
    #[serde(rename = "Subnet")]
    pub subnet: String,
    #[serde(rename = "Gateway")]
    pub gateway: String,
}

impl From<&NetworkRecord> for NetworkResponse {
    fn from(r: &NetworkRecord) -> Self {
        Self {
            id: r.id.clone(),
            name: r.name.clone(),
            driver: driver_name(r.driver).to_string(),
            ipam: IpamResponse {
                config: vec![IpamConfigEntry {
                    subnet: format!("{}/{}", r.subnet, r.prefix_len),
                    gateway: r.gateway.to_string(),
                }],
            },
            containers: r.connected_containers.clone(),
        }
    }
}

fn driver_name(driver: NetworkDriver) -> &'static str {
    match driver {
        NetworkDriver::BridgeLike => "bridge",
        NetworkDriver::HostLike => "host",
        NetworkDriver::None => "null",
    }
}

fn parse_driver(name: &str) -> NetworkDriver {
    match name {
        "host" => NetworkDriver::HostLike,
        "null" | "none" => NetworkDriver::None,
        _ => NetworkDriver::BridgeLike,
    }
}

pub async fn list<A: NetworkAgentClient + 'static>(
    State(state): State<AppState<A>>,
) -> Result<Json<Vec<NetworkResponse>>, DaemonError> {
    let networks = state.networks.list().await?;
    Ok(Json(networks.iter().map(NetworkResponse::from).collect()))
}

#[derive(Debug, Deserialize)]
pub struct CreateBody {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Driver", default)]
    pub driver: Option<String>,
    #[serde(rename = "IPAM", default)]
    pub ipam: Option<CreateIpamBody>,
}

#[derive(Debug, Deserialize)]
pub struct CreateIpamBody {
    #[serde(rename = "Config", default)]
    pub config: Vec<CreateIpamConfigEntry>,
}

#[derive(Debug, Deserialize)]
pub struct CreateIpamConfigEntry {
    #[serde(rename = "Subnet")]
    pub subnet: String,
    #[serde(rename = "Gateway", default)]
    pub gateway: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateResponse {
    #[serde(rename = "Id")]
    pub id: String,
}

pub async fn create<A: NetworkAgentClient + 'static>(
    State(state): State<AppState<A>>,
    Json(body): Json<CreateBody>,
) -> Result<(StatusCode, Json<CreateResponse>), DaemonError> {
    let entry = body.ipam.and_then(|i| i.config.into_iter().next());
    let (subnet, prefix_len) = entry
        .as_ref()
        .and_then(|e| parse_cidr(&e.subnet))
        .unwrap_or((Ipv4Addr::new(172, 20, 0, 0), 16));
    let gateway = entry
        .as_ref()
        .and_then(|e| e.gateway.as_ref())
        .and_then(|g| g.parse().ok())
        .unwrap_or(first_host(subnet));

    let id = uuid::Uuid::new_v4().to_string();
    let driver = parse_driver(body.driver.as_deref().unwrap_or("bridge"));
    let record = state
        .networks
        .create_network(id, body.name, driver, subnet, prefix_len, gateway, None)
        .await?;

    Ok((StatusCode::CREATED, Json(CreateResponse { id: record.id })))
}

fn parse_cidr(spec: &str) -> Option<(Ipv4Addr, u8)> {
    let (addr, len) = spec.split_once('/')?;
    Some((addr.parse().ok()?, len.parse().ok()?))
}

fn first_host(subnet: Ipv4Addr) -> Ipv4Addr {
    let bits = u32::from(subnet);
    Ipv4Addr::from(bits + 1)
}

pub async fn inspect<A: NetworkAgentClient + 'static>(
    State(state): State<AppState<A>>,
    Path(id): Path<String>,
) -> Result<Json<NetworkResponse>, DaemonError> {
    let record = state.networks.get(&id).await?;
    Ok(Json(NetworkResponse::from(&record)))
}

pub async fn remove<A: NetworkAgentClient + 'static>(
    State(state): State<AppState<A>>,
    Path(id): Path<String>,
) -> Result<StatusCode, DaemonError> {
    state.networks.remove_network(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct ConnectBody {
    #[serde(rename = "Container")]
    pub container: String,
    #[serde(rename = "EndpointConfig", default)]
    pub endpoint_config: Option<EndpointConfigBody>,
}

#[derive(Debug, Deserialize)]
pub struct EndpointConfigBody {
    #[serde(rename = "IPAMConfig", default)]
    pub ipam_config: Option<EndpointIpamBody>,
    #[serde(rename = "Aliases", default)]
    pub aliases: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct EndpointIpamBody {
    #[serde(rename = "IPv4Address", default)]
    pub ipv4_address: Option<String>,
}

pub async fn connect<A: NetworkAgentClient + 'static>(
    State(state): State<AppState<A>>,
    Path(id): Path<String>,
    Json(body): Json<ConnectBody>,
) -> Result<StatusCode, DaemonError> {
    let endpoint = body.endpoint_config.unwrap_or(EndpointConfigBody { ipam_config: None, aliases: vec![] });
    let ip_hint = endpoint.ipam_config.and_then(|c| c.ipv4_address).and_then(|s| s.parse().ok());

    let attachment: Attachment = state
        .networks
        .attach(&id, &body.container, random_mac(), endpoint.aliases, ip_hint)
        .await?;
    let _ = attachment;
    Ok(StatusCode::OK)
}

/// Locally-administered MAC for a manually connected endpoint, same
/// scheme the Container Manager uses for its own attachments at `start`.
fn random_mac() -> String {
    let bytes: [u8; 5] = uuid::Uuid::new_v4().as_bytes()[..5].try_into().unwrap();
    format!("02:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", bytes[0], bytes[1], bytes[2], bytes[3], bytes[4])
}

#[derive(Debug, Deserialize)]
pub struct DisconnectBody {
    #[serde(rename = "Container")]
    pub container: String,
}

pub async fn disconnect<A: NetworkAgentClient + 'static>(
    State(state): State<AppState<A>>,
    Path(id): Path<String>,
    Json(body): Json<DisconnectBody>,
) -> Result<StatusCode, DaemonError> {
    state.networks.detach(&id, &body.container).await?;
    Ok(StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_body_deserializes_docker_shaped_json() {
        let body: ConnectBody = serde_json::from_str(
            r#"{"Container":"c1","EndpointConfig":{"Aliases":["web"],"IPAMConfig":{"IPv4Address":"10.1.0.5"}}}"#,
        )
        .unwrap();
        assert_eq!(body.container, "c1");
        let endpoint = body.endpoint_config.unwrap();
        assert_eq!(endpoint.aliases, vec!["web".to_string()]);
        assert_eq!(endpoint.ipam_config.unwrap().ipv4_address.as_deref(), Some("10.1.0.5"));
    }

    #[test]
    fn disconnect_body_deserializes_docker_shaped_json() {
        let body: DisconnectBody = serde_json::from_str(r#"{"Container":"c1","Force":false}"#).unwrap();
        assert_eq!(body.container, "c1");
    }
}
