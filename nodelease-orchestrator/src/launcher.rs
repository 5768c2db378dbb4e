use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nodelease_common::{NodeError, OsFamily, Result};
use serde::Serialize;
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

use crate::template::Template;

/// An open management channel to a node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlChannel {
    pub protocol: String,
    pub network: String,
    pub address: String,
    pub user: String,
    pub opened_at: DateTime<Utc>,
}

/// Opens a control channel to one address of a booted instance.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// "ssh", "winrm", ...
    fn protocol(&self) -> &'static str;

    /// Succeeds once the node accepts management commands on `address`.
    async fn launch(&self, address: &str, template: &Template) -> Result<()>;
}

fn socket_addr(address: &str, port: u16) -> Result<SocketAddr> {
    // Provider addresses may carry a prefix length ("10.0.0.5/24").
    let clean = address.split('/').next().unwrap_or(address).trim();
    let ip: IpAddr = clean
        .parse()
        .map_err(|_| NodeError::LaunchFailure(format!("invalid address {:?}", address)))?;
    Ok(SocketAddr::new(ip, port))
}

async fn port_open(addr: SocketAddr, timeout: Duration) -> bool {
    tokio::task::spawn_blocking(move || TcpStream::connect_timeout(&addr, timeout).is_ok())
        .await
        .unwrap_or(false)
}

fn sh_escape_single(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\"'\"'"))
}

/// Unix nodes: remote shell with key or password login.
pub struct SshLauncher {
    pub port: u16,
    pub connect_timeout: Duration,
    pub launch_timeout: Duration,
}

impl Default for SshLauncher {
    fn default() -> Self {
        Self {
            port: 22,
            connect_timeout: Duration::from_secs(3),
            launch_timeout: Duration::from_secs(30),
        }
    }
}

impl SshLauncher {
    fn remote_command(template: &Template) -> String {
        if template.remote_fs.is_empty() {
            "true".to_string()
        } else {
            format!("mkdir -p {}", sh_escape_single(&template.remote_fs))
        }
    }

    fn command(&self, addr: &SocketAddr, template: &Template) -> Command {
        let use_password = template.private_key_file.is_none() && template.remote_password.is_some();
        let mut cmd = if use_password {
            let mut c = Command::new("sshpass");
            c.arg("-e").arg("ssh");
            if let Some(pw) = &template.remote_password {
                c.env("SSHPASS", pw);
            }
            c
        } else {
            let mut c = Command::new("ssh");
            c.arg("-o").arg("BatchMode=yes");
            c
        };
        if let Some(key) = &template.private_key_file {
            cmd.arg("-i").arg(key);
        }
        cmd.arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-o")
            .arg("UserKnownHostsFile=/dev/null")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)))
            .arg("-p")
            .arg(addr.port().to_string())
            .arg(format!("{}@{}", template.remote_user, addr.ip()))
            .arg(Self::remote_command(template))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Launcher for SshLauncher {
    fn protocol(&self) -> &'static str {
        "ssh"
    }

    async fn launch(&self, address: &str, template: &Template) -> Result<()> {
        let addr = socket_addr(address, self.port)?;
        if !port_open(addr, self.connect_timeout).await {
            return Err(NodeError::LaunchFailure(format!("{} refused connection", addr)));
        }

        debug!(address = %addr, user = %template.remote_user, "[launcher-ssh] opening session");
        let child = self
            .command(&addr, template)
            .spawn()
            .map_err(|e| NodeError::LaunchFailure(format!("ssh spawn failed: {}", e)))?;

        match tokio::time::timeout(self.launch_timeout, child.wait_with_output()).await {
            Ok(Ok(output)) if output.status.success() => {
                info!(address = %addr, "[launcher-ssh] session established");
                Ok(())
            }
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(NodeError::LaunchFailure(format!(
                    "ssh {} exited with {}: {}",
                    addr,
                    output.status,
                    stderr.trim()
                )))
            }
            Ok(Err(e)) => Err(NodeError::LaunchFailure(format!("ssh {} failed: {}", addr, e))),
            Err(_) => Err(NodeError::LaunchFailure(format!(
                "ssh {} timed out after {}s",
                addr,
                self.launch_timeout.as_secs()
            ))),
        }
    }
}

const WSMAN_IDENTIFY: &str = r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:wsmid="http://schemas.dmtf.org/wbem/wsman/identity/1/wsmanidentity.xsd"><s:Header/><s:Body><wsmid:Identify/></s:Body></s:Envelope>"#;

/// Windows nodes: WS-Management endpoint with user/password.
pub struct WinRmLauncher {
    pub port: u16,
    client: reqwest::Client,
}

impl WinRmLauncher {
    pub fn new(port: u16, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(timeout)
            .build()
            .map_err(|e| NodeError::Config(format!("winrm http client: {}", e)))?;
        Ok(Self { port, client })
    }
}

#[async_trait]
impl Launcher for WinRmLauncher {
    fn protocol(&self) -> &'static str {
        "winrm"
    }

    async fn launch(&self, address: &str, template: &Template) -> Result<()> {
        let addr = socket_addr(address, self.port)?;
        let url = format!("http://{}/wsman", addr);
        let resp = self
            .client
            .post(&url)
            .basic_auth(&template.remote_user, template.remote_password.as_deref())
            .header("Content-Type", "application/soap+xml;charset=UTF-8")
            .body(WSMAN_IDENTIFY)
            .send()
            .await
            .map_err(|e| NodeError::LaunchFailure(format!("winrm {}: {}", url, e)))?;

        let status = resp.status();
        if status.is_success() {
            info!(address = %addr, "[launcher-winrm] endpoint identified");
            Ok(())
        } else {
            Err(NodeError::LaunchFailure(format!(
                "winrm {} answered status={}",
                url,
                status.as_u16()
            )))
        }
    }
}

/// Launcher per OS family.
#[derive(Clone)]
pub struct LauncherRegistry {
    unix: Arc<dyn Launcher>,
    windows: Arc<dyn Launcher>,
}

impl LauncherRegistry {
    pub fn new(unix: Arc<dyn Launcher>, windows: Arc<dyn Launcher>) -> Self {
        Self { unix, windows }
    }

    /// Same launcher for every OS family (tests, single-protocol fleets).
    pub fn uniform(launcher: Arc<dyn Launcher>) -> Self {
        Self {
            unix: launcher.clone(),
            windows: launcher,
        }
    }

    pub fn for_os(&self, os: OsFamily) -> Arc<dyn Launcher> {
        match os {
            OsFamily::Unix => self.unix.clone(),
            OsFamily::Windows => self.windows.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodelease_common::TemplateConfig;

    fn template(extra: serde_json::Value) -> Template {
        let mut v = serde_json::json!({ "id": "linux", "image": "i", "flavor": "f" });
        if let (Some(obj), Some(more)) = (v.as_object_mut(), extra.as_object()) {
            for (k, val) in more {
                obj.insert(k.clone(), val.clone());
            }
        }
        let cfg: TemplateConfig = serde_json::from_value(v).unwrap();
        Template::from_config(cfg).unwrap()
    }

    #[test]
    fn parses_addresses_with_prefix() {
        assert_eq!(
            socket_addr("10.0.0.5/24", 22).unwrap(),
            "10.0.0.5:22".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(socket_addr("fe80::1", 5985).unwrap().port(), 5985);
        assert!(matches!(socket_addr("not-an-ip", 22), Err(NodeError::LaunchFailure(_))));
    }

    #[test]
    fn remote_command_prepares_workdir() {
        assert_eq!(SshLauncher::remote_command(&template(serde_json::json!({}))), "true");
        let t = template(serde_json::json!({ "remote_fs": "/var/lib/build's" }));
        assert_eq!(
            SshLauncher::remote_command(&t),
            "mkdir -p '/var/lib/build'\"'\"'s'"
        );
    }

    #[test]
    fn registry_selects_by_os() {
        let reg = LauncherRegistry::new(
            Arc::new(SshLauncher::default()),
            Arc::new(WinRmLauncher::new(5985, Duration::from_secs(5)).unwrap()),
        );
        assert_eq!(reg.for_os(OsFamily::Unix).protocol(), "ssh");
        assert_eq!(reg.for_os(OsFamily::Windows).protocol(), "winrm");
    }

    #[tokio::test]
    async fn ssh_refused_port_fails_fast() {
        // Bind then drop to get a local port with nothing listening.
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let launcher = SshLauncher {
            port,
            connect_timeout: Duration::from_millis(500),
            launch_timeout: Duration::from_secs(1),
        };
        let err = launcher
            .launch("127.0.0.1", &template(serde_json::json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::LaunchFailure(_)));
    }
}
