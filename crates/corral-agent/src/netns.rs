//! NetworkProvisioner — per-container network namespaces with CNI.
//!
//! Setup creates an OS network namespace named by the container ID and
//! invokes the CNI plugin to attach an interface with the requested
//! host ↔ container port mappings. Cleanup runs in a fixed order —
//! resolve the namespace IP, delete firewall rules referencing it, CNI
//! teardown, delete the namespace — because rule lookup needs the
//! namespace alive to resolve its IP. Namespace existence is derived
//! from the OS namespace registry, never recorded elsewhere.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, warn};

use corral_store::PortMapping;

use crate::error::{AgentError, AgentResult, TeardownReport};
use crate::exec::{Cmd, Exec};

/// Network provisioning configuration.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// OS network namespace registry directory.
    pub netns_dir: PathBuf,
    /// Path to the CNI plugin binary.
    pub cni_bin: PathBuf,
    /// CNI network name.
    pub network_name: String,
    /// Bridge device the plugin attaches veths to.
    pub bridge: String,
    /// Subnet handed to the plugin's IPAM.
    pub subnet: String,
    /// Interface name inside each namespace.
    pub ifname: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            netns_dir: PathBuf::from("/var/run/netns"),
            cni_bin: PathBuf::from("/opt/cni/bin/bridge"),
            network_name: "corral".to_string(),
            bridge: "corral0".to_string(),
            subnet: "10.88.0.0/16".to_string(),
            ifname: "eth0".to_string(),
        }
    }
}

/// Provisions container network namespaces via ip(8), the CNI plugin,
/// and iptables(8).
pub struct NetworkProvisioner {
    config: NetworkConfig,
    exec: Arc<dyn Exec>,
}

impl NetworkProvisioner {
    pub fn new(config: NetworkConfig, exec: Arc<dyn Exec>) -> Self {
        Self { config, exec }
    }

    /// Filesystem path of a namespace in the OS registry.
    pub fn netns_path(&self, id: &str) -> PathBuf {
        self.config.netns_dir.join(id)
    }

    /// Create the namespace and attach a CNI interface with the given
    /// port mappings. CNI failure tears the fresh namespace back down.
    pub async fn setup(&self, id: &str, ports: &[PortMapping]) -> AgentResult<()> {
        self.exec
            .run_checked(&Cmd::new("ip").args(["netns", "add"]).arg(id))
            .await?;

        if let Err(e) = self.cni_invoke("ADD", id, ports).await {
            warn!(%id, error = %e, "CNI attach failed, removing namespace");
            if let Err(del) = self
                .exec
                .run_checked(&Cmd::new("ip").args(["netns", "delete"]).arg(id))
                .await
            {
                warn!(%id, error = %del, "namespace rollback failed");
            }
            return Err(e);
        }

        info!(%id, ports = ports.len(), "container network ready");
        Ok(())
    }

    /// Tear down a container's network. Order matters: the IP must be
    /// resolved while the namespace still exists, firewall rules are
    /// deleted one by one, then CNI teardown, then the namespace.
    /// Every step is attempted; failures land in the report.
    pub async fn cleanup(&self, id: &str) -> AgentResult<TeardownReport> {
        if !self.netns_path(id).exists() {
            return Err(AgentError::NamespaceNotFound(id.to_string()));
        }

        let mut report = TeardownReport::default();

        match self.resolve_ip(id).await {
            Ok(ip) => self.delete_firewall_rules(&ip, &mut report).await,
            Err(e) => {
                warn!(%id, error = %e, "could not resolve namespace IP, skipping firewall scan");
                report.record("resolve ip", e);
            }
        }

        if let Err(e) = self.cni_invoke("DEL", id, &[]).await {
            warn!(%id, error = %e, "CNI teardown failed, continuing");
            report.record("cni del", e);
        }

        if let Err(e) = self
            .exec
            .run_checked(&Cmd::new("ip").args(["netns", "delete"]).arg(id))
            .await
        {
            warn!(%id, error = %e, "namespace deletion failed");
            report.record("delete namespace", e);
        }

        info!(%id, clean = report.is_clean(), "container network removed");
        Ok(report)
    }

    /// Enumerate namespace names from the OS namespace registry.
    pub fn list(&self) -> AgentResult<Vec<String>> {
        if !self.config.netns_dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.config.netns_dir)
            .map_err(|e| AgentError::io(self.config.netns_dir.display(), e))?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| AgentError::io(self.config.netns_dir.display(), e))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    // ── Internals ─────────────────────────────────────────────────

    /// Run the CNI plugin with the standard environment contract and
    /// the network config (plus port mappings) on stdin.
    async fn cni_invoke(&self, command: &str, id: &str, ports: &[PortMapping]) -> AgentResult<()> {
        let netconf = self.netconf(ports);
        let cni_path = self
            .config
            .cni_bin
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();

        let cmd = Cmd::new(self.config.cni_bin.to_string_lossy())
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", id)
            .env("CNI_NETNS", self.netns_path(id).to_string_lossy())
            .env("CNI_IFNAME", &self.config.ifname)
            .env("CNI_PATH", cni_path)
            .stdin(netconf.to_string());

        self.exec.run_checked(&cmd).await?;
        Ok(())
    }

    fn netconf(&self, ports: &[PortMapping]) -> serde_json::Value {
        let mappings: Vec<serde_json::Value> = ports
            .iter()
            .map(|p| {
                json!({
                    "hostPort": p.host_port,
                    "containerPort": p.container_port,
                    "protocol": p.protocol.to_string(),
                })
            })
            .collect();

        json!({
            "cniVersion": "0.4.0",
            "name": self.config.network_name,
            "type": self.config.cni_bin.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
            "bridge": self.config.bridge,
            "isGateway": true,
            "ipMasq": true,
            "ipam": {
                "type": "host-local",
                "subnet": self.config.subnet,
            },
            "runtimeConfig": {
                "portMappings": mappings,
            },
        })
    }

    /// Resolve the namespace's assigned IP by inspecting its primary
    /// interface from inside the namespace.
    async fn resolve_ip(&self, id: &str) -> AgentResult<String> {
        let cmd = Cmd::new("ip")
            .args(["netns", "exec"])
            .arg(id)
            .args(["ip", "-j", "addr", "show"])
            .arg(&self.config.ifname);
        let output = self.exec.run_checked(&cmd).await?;

        let parsed: serde_json::Value =
            serde_json::from_str(&output.stdout).map_err(|e| AgentError::UnexpectedOutput {
                command: cmd.display(),
                detail: e.to_string(),
            })?;

        parsed
            .as_array()
            .and_then(|links| links.first())
            .and_then(|link| link.get("addr_info"))
            .and_then(|addrs| addrs.as_array())
            .and_then(|addrs| {
                addrs
                    .iter()
                    .find(|a| a.get("family").and_then(|f| f.as_str()) == Some("inet"))
            })
            .and_then(|a| a.get("local"))
            .and_then(|l| l.as_str())
            .map(str::to_string)
            .ok_or_else(|| AgentError::UnexpectedOutput {
                command: cmd.display(),
                detail: "no inet address on interface".to_string(),
            })
    }

    /// Scan the NAT and filter tables and delete each rule referencing
    /// `ip` individually; per-rule failures are recorded and skipped.
    async fn delete_firewall_rules(&self, ip: &str, report: &mut TeardownReport) {
        for table in ["nat", "filter"] {
            let list = Cmd::new("iptables").args(["-t", table, "-S"]);
            let output = match self.exec.run_checked(&list).await {
                Ok(output) => output,
                Err(e) => {
                    warn!(table, error = %e, "failed to list firewall rules");
                    report.record("list firewall rules", e);
                    continue;
                }
            };

            for line in output.stdout.lines() {
                let Some(rule) = line.strip_prefix("-A ") else {
                    continue;
                };
                if !line.contains(ip) {
                    continue;
                }
                debug!(table, rule, "deleting firewall rule");
                let delete = Cmd::new("iptables")
                    .args(["-t", table, "-D"])
                    .args(rule.split_whitespace());
                if let Err(e) = self.exec.run_checked(&delete).await {
                    warn!(table, rule, error = %e, "rule deletion failed, continuing");
                    report.record("delete firewall rule", e);
                }
            }
        }
    }
}
