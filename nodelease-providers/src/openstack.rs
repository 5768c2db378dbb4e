use crate::{inventory, CloudProvider};
use anyhow::Context;
use async_trait::async_trait;
use inventory::{CatalogItem, CreateInstanceRequest, InstanceSnapshot, NetworkAddresses};
use nodelease_common::{NodeError, Result};
use reqwest::{Client, Method, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Keystone (v2 password credentials) + Nova compute API.
pub struct OpenStackProvider {
    client: Client,
    auth_url: String,
    username: String,
    password: String,
    tenant: String,
    region: String,
    session: RwLock<Option<Session>>,
}

#[derive(Clone, Debug)]
struct Session {
    token: String,
    compute_url: String,
}

fn unavailable(e: impl std::fmt::Display) -> NodeError {
    NodeError::ProviderUnavailable(e.to_string())
}

impl OpenStackProvider {
    pub fn new(
        auth_url: String,
        username: String,
        password: String,
        tenant: String,
        region: String,
    ) -> Result<Self> {
        // Default reqwest client has no overall timeout. If the API stalls, a worker can hang forever.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| NodeError::Config(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            auth_url: auth_url.trim().trim_end_matches('/').to_string(),
            username: username.trim().to_string(),
            password,
            tenant: tenant.trim().to_string(),
            region: region.trim().to_string(),
            session: RwLock::new(None),
        })
    }

    async fn login(&self) -> Result<Session> {
        let url = format!("{}/tokens", self.auth_url);
        let body = json!({
            "auth": {
                "passwordCredentials": {
                    "username": self.username,
                    "password": self.password,
                },
                "tenantName": self.tenant,
            }
        });

        debug!(url = %url, tenant = %self.tenant, "[openstack] authenticating");
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(unavailable)?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let text = resp.text().await.unwrap_or_default();
            return Err(NodeError::AuthenticationFailure(format!(
                "status={} body={}",
                status.as_u16(),
                text
            )));
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(NodeError::ProviderUnavailable(format!(
                "keystone POST {} failed: status={} body={}",
                url,
                status.as_u16(),
                text
            )));
        }

        let access: Value = resp.json().await.map_err(unavailable)?;
        let session = parse_access(&access, &self.region).map_err(|e| {
            NodeError::AuthenticationFailure(format!("unusable keystone response: {:#}", e))
        })?;
        info!(
            region = %self.region,
            compute_url = %session.compute_url,
            "[openstack] authenticated"
        );
        Ok(session)
    }

    async fn session(&self) -> Result<Session> {
        if let Some(s) = self.session.read().await.as_ref() {
            return Ok(s.clone());
        }
        let fresh = self.login().await?;
        *self.session.write().await = Some(fresh.clone());
        Ok(fresh)
    }

    async fn invalidate_session(&self) {
        *self.session.write().await = None;
    }

    /// Issue a compute API call, re-authenticating once on 401.
    ///
    /// Returns the HTTP status and the parsed body (`Value::Null` for empty bodies).
    async fn compute(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<(StatusCode, Value)> {
        for attempt in 0..2 {
            let session = self.session().await?;
            let url = format!("{}{}", session.compute_url, path);
            let mut req = self
                .client
                .request(method.clone(), &url)
                .header("X-Auth-Token", &session.token);
            if let Some(b) = body {
                req = req.json(b);
            }
            let resp = req.send().await.map_err(unavailable)?;
            let status = resp.status();

            if status == StatusCode::UNAUTHORIZED && attempt == 0 {
                warn!(url = %url, "[openstack] token rejected, re-authenticating");
                self.invalidate_session().await;
                continue;
            }
            if status == StatusCode::UNAUTHORIZED {
                return Err(NodeError::AuthenticationFailure(format!(
                    "{} {} rejected after re-authentication",
                    method, url
                )));
            }

            let text = resp.text().await.map_err(unavailable)?;
            let value = if text.trim().is_empty() {
                Value::Null
            } else {
                serde_json::from_str(&text).unwrap_or(Value::String(text))
            };
            return Ok((status, value));
        }
        Err(NodeError::AuthenticationFailure(
            "re-authentication loop exhausted".to_string(),
        ))
    }

    fn api_failure(what: &str, status: StatusCode, body: &Value) -> NodeError {
        NodeError::ProviderUnavailable(format!(
            "{} failed: status={} body={}",
            what,
            status.as_u16(),
            body
        ))
    }
}

fn parse_access(access: &Value, region: &str) -> anyhow::Result<Session> {
    let token = access["access"]["token"]["id"]
        .as_str()
        .context("missing access.token.id")?
        .to_string();
    let catalog = access["access"]["serviceCatalog"]
        .as_array()
        .context("missing access.serviceCatalog")?;
    let compute = catalog
        .iter()
        .find(|svc| svc["type"].as_str() == Some("compute"))
        .context("no compute service in catalog")?;
    let endpoints = compute["endpoints"]
        .as_array()
        .context("compute service has no endpoints")?;
    let endpoint = if region.is_empty() {
        endpoints.first()
    } else {
        endpoints
            .iter()
            .find(|e| e["region"].as_str() == Some(region))
    }
    .with_context(|| format!("no compute endpoint for region {:?}", region))?;
    let compute_url = endpoint["publicURL"]
        .as_str()
        .context("compute endpoint has no publicURL")?
        .trim_end_matches('/')
        .to_string();
    Ok(Session { token, compute_url })
}

fn parse_server(server: &Value) -> anyhow::Result<InstanceSnapshot> {
    let id = server["id"].as_str().context("server without id")?.to_string();
    let name = server["name"].as_str().unwrap_or_default().to_string();
    let status = server["status"].as_str().unwrap_or("UNKNOWN").to_string();

    // Object order is the provider's network order (serde_json preserve_order).
    let mut networks = Vec::new();
    if let Some(map) = server["addresses"].as_object() {
        for (network, entries) in map {
            let addresses = entries
                .as_array()
                .map(|list| {
                    list.iter()
                        .filter_map(|a| a["addr"].as_str().map(|s| s.to_string()))
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            networks.push(NetworkAddresses {
                network: network.clone(),
                addresses,
            });
        }
    }

    Ok(InstanceSnapshot {
        id,
        name,
        status,
        networks,
    })
}

fn parse_catalog(body: &Value, key: &str) -> anyhow::Result<Vec<CatalogItem>> {
    let list = body[key]
        .as_array()
        .with_context(|| format!("response has no {:?} array", key))?;
    Ok(list
        .iter()
        .filter_map(|item| {
            Some(CatalogItem {
                id: item["id"].as_str()?.to_string(),
                name: item["name"].as_str().unwrap_or_default().to_string(),
            })
        })
        .collect())
}

fn server_body(request: &CreateInstanceRequest) -> Value {
    let mut server = json!({
        "name": request.name,
        "imageRef": request.image_ref,
        "flavorRef": request.flavor_ref,
    });
    if let Some(key) = request.key_name.as_deref().filter(|k| !k.is_empty()) {
        server["key_name"] = json!(key);
    }
    let groups: Vec<Value> = request
        .security_groups
        .iter()
        .filter(|g| !g.is_empty())
        .map(|g| json!({ "name": g }))
        .collect();
    if !groups.is_empty() {
        server["security_groups"] = Value::Array(groups);
    }
    if let Some(az) = request.availability_zone.as_deref().filter(|z| !z.is_empty()) {
        server["availability_zone"] = json!(az);
    }
    json!({ "server": server })
}

#[async_trait]
impl CloudProvider for OpenStackProvider {
    fn provider_code(&self) -> &'static str {
        "openstack"
    }

    async fn authenticate(&self) -> Result<String> {
        let fresh = self.login().await?;
        *self.session.write().await = Some(fresh.clone());
        Ok(fresh.token)
    }

    async fn list_instances(&self) -> Result<Vec<InstanceSnapshot>> {
        let (status, body) = self.compute(Method::GET, "/servers/detail", None).await?;
        if !status.is_success() {
            return Err(Self::api_failure("list servers", status, &body));
        }
        let servers = body["servers"].as_array().cloned().unwrap_or_default();
        servers
            .iter()
            .map(|s| parse_server(s).map_err(|e| unavailable(format!("{:#}", e))))
            .collect()
    }

    async fn create_instance(&self, request: &CreateInstanceRequest) -> Result<InstanceSnapshot> {
        let body = server_body(request);
        info!(
            name = %request.name,
            image = %request.image_ref,
            flavor = %request.flavor_ref,
            "[openstack] POST /servers"
        );
        let (status, resp) = self.compute(Method::POST, "/servers", Some(&body)).await?;
        if !status.is_success() {
            if status == StatusCode::BAD_REQUEST {
                return Err(NodeError::InvalidTemplate(format!(
                    "create server rejected: {}",
                    resp
                )));
            }
            return Err(Self::api_failure("create server", status, &resp));
        }
        // The create response only carries the id; status and addresses come from polling.
        let id = resp["server"]["id"]
            .as_str()
            .ok_or_else(|| unavailable("no server id in create response"))?
            .to_string();
        Ok(InstanceSnapshot {
            id,
            name: request.name.clone(),
            status: "BUILD".to_string(),
            networks: Vec::new(),
        })
    }

    async fn get_instance(&self, instance_id: &str) -> Result<InstanceSnapshot> {
        let path = format!("/servers/{}", instance_id);
        let (status, body) = self.compute(Method::GET, &path, None).await?;
        if status == StatusCode::NOT_FOUND {
            return Err(NodeError::InstanceNotFound(instance_id.to_string()));
        }
        if !status.is_success() {
            return Err(Self::api_failure("show server", status, &body));
        }
        parse_server(&body["server"]).map_err(|e| unavailable(format!("{:#}", e)))
    }

    async fn delete_instance(&self, instance_id: &str) -> Result<()> {
        let path = format!("/servers/{}", instance_id);
        let (status, body) = self.compute(Method::DELETE, &path, None).await?;
        if status == StatusCode::NOT_FOUND {
            return Err(NodeError::InstanceNotFound(instance_id.to_string()));
        }
        if !status.is_success() {
            return Err(Self::api_failure("delete server", status, &body));
        }
        info!(instance_id = %instance_id, "[openstack] server deleted");
        Ok(())
    }

    async fn stop_instance(&self, instance_id: &str) -> Result<bool> {
        let path = format!("/servers/{}/action", instance_id);
        let body = json!({ "os-stop": null });
        let (status, resp) = self.compute(Method::POST, &path, Some(&body)).await?;
        if status == StatusCode::NOT_FOUND {
            return Err(NodeError::InstanceNotFound(instance_id.to_string()));
        }
        if status == StatusCode::CONFLICT {
            // Already stopped or in a state that cannot be stopped.
            warn!(instance_id = %instance_id, body = %resp, "[openstack] os-stop conflict");
            return Ok(false);
        }
        if !status.is_success() {
            return Err(Self::api_failure("stop server", status, &resp));
        }
        Ok(true)
    }

    async fn list_images(&self) -> Result<Vec<CatalogItem>> {
        let (status, body) = self.compute(Method::GET, "/images", None).await?;
        if !status.is_success() {
            return Err(Self::api_failure("list images", status, &body));
        }
        parse_catalog(&body, "images").map_err(|e| unavailable(format!("{:#}", e)))
    }

    async fn list_flavors(&self) -> Result<Vec<CatalogItem>> {
        let (status, body) = self.compute(Method::GET, "/flavors", None).await?;
        if !status.is_success() {
            return Err(Self::api_failure("list flavors", status, &body));
        }
        parse_catalog(&body, "flavors").map_err(|e| unavailable(format!("{:#}", e)))
    }
}
