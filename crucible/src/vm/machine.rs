//! Supervisor for one Firecracker process.
//!
//! The VMM is spawned inside the VM's netns and driven over its API Unix
//! socket: configuration `PUT`s, `InstanceStart`, and `SendCtrlAltDel` for
//! the graceful stop. The process handle stays here so waiting and killing
//! go through one place.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use hyper::{Body, Client, Method, Request};
use hyperlocal::{UnixClientExt, UnixConnector};
use serde_json::json;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use super::network::{self, NetworkLease};
use super::VmError;
use crate::config;

const SOCKET_WAIT: Duration = Duration::from_secs(2);
const SOCKET_POLL: Duration = Duration::from_millis(50);

pub(crate) struct Machine {
    vm_id: String,
    child: Child,
    sock_path: PathBuf,
    rootfs: PathBuf,
    lease: NetworkLease,
    api: Client<UnixConnector>,
    net_detached: bool,
}

pub(crate) fn socket_path(vm_id: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        ".firecracker.sock-{}-{}",
        std::process::id(),
        vm_id
    ))
}

pub(crate) fn log_sibling(sock_path: &Path) -> PathBuf {
    PathBuf::from(format!("{}.log", sock_path.display()))
}

fn boot_args(lease: &NetworkLease) -> String {
    let gateway = lease.gateway.map(|gw| gw.to_string()).unwrap_or_default();
    format!(
        "console=ttyS0 reboot=k panic=1 pci=off ip={}::{}:{}::eth0:off",
        lease.ip,
        gateway,
        network::netmask(lease.prefix)
    )
}

impl Machine {
    /// Spawn the VMM and wait (bounded) for its API socket to appear.
    /// The process is killed with the handle, so an early drop cannot
    /// strand a VMM.
    pub(crate) async fn create(
        vm_id: &str,
        rootfs: PathBuf,
        lease: NetworkLease,
        token: &CancellationToken,
    ) -> Result<Self, VmError> {
        let cfg = config::get();
        let sock_path = socket_path(vm_id);
        let log_path = log_sibling(&sock_path);

        //firecracker wants the log file to exist before it will log into it
        std::fs::File::create(&log_path)
            .map_err(|err| VmError::VmmStart(format!("create log file {log_path:?}: {err}")))?;

        let mut child = Command::new("ip")
            .args(["netns", "exec", &lease.netns])
            .arg(&cfg.firecracker_binary)
            .arg("--api-sock")
            .arg(&sock_path)
            .arg("--id")
            .arg(vm_id)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| VmError::VmmStart(format!("spawn firecracker: {err}")))?;

        let deadline = tokio::time::Instant::now() + SOCKET_WAIT;
        loop {
            if token.is_cancelled() {
                let _ = child.start_kill();
                return Err(VmError::VmmStart(
                    "cancelled while waiting for the API socket".to_owned(),
                ));
            }
            if sock_path.exists() {
                break;
            }
            if let Ok(Some(status)) = child.try_wait() {
                return Err(VmError::VmmStart(format!(
                    "firecracker exited during startup: {status}"
                )));
            }
            if tokio::time::Instant::now() >= deadline {
                let _ = child.start_kill();
                return Err(VmError::VmmStart(
                    "timed out waiting for the VMM API socket".to_owned(),
                ));
            }
            tokio::time::sleep(SOCKET_POLL).await;
        }

        Ok(Machine {
            vm_id: vm_id.to_owned(),
            child,
            sock_path,
            rootfs,
            lease,
            api: Client::unix(),
            net_detached: false,
        })
    }

    /// Push the full VM configuration and boot the guest.
    pub(crate) async fn start(&self) -> Result<(), VmError> {
        self.configure()
            .await
            .map_err(|err| VmError::VmmStart(format!("{err:#}")))
    }

    async fn configure(&self) -> Result<()> {
        let cfg = config::get();

        self.api_put(
            "/logger",
            json!({
                "log_path": log_sibling(&self.sock_path),
                "level": "Warning",
                "show_level": true,
                "show_log_origin": false,
            }),
        )
        .await?;

        self.api_put(
            "/machine-config",
            json!({
                "vcpu_count": cfg.vm.vcpus,
                "mem_size_mib": cfg.vm.mem_size_mib,
                "smt": false,
            }),
        )
        .await?;

        self.api_put(
            "/boot-source",
            json!({
                "kernel_image_path": cfg.kernel_image,
                "boot_args": boot_args(&self.lease),
            }),
        )
        .await?;

        self.api_put(
            "/drives/rootfs",
            json!({
                "drive_id": "rootfs",
                "path_on_host": self.rootfs,
                "is_root_device": true,
                "is_read_only": false,
            }),
        )
        .await?;

        self.api_put(
            "/network-interfaces/eth0",
            json!({
                "iface_id": "eth0",
                "guest_mac": network::guest_mac(self.lease.ip),
                "host_dev_name": self.lease.tap_dev,
            }),
        )
        .await?;

        self.api_put("/actions", json!({ "action_type": "InstanceStart" }))
            .await
    }

    /// Ask the guest to shut itself down. The caller bounds this.
    pub(crate) async fn send_ctrl_alt_del(&self) -> Result<()> {
        self.api_put("/actions", json!({ "action_type": "SendCtrlAltDel" }))
            .await
    }

    /// Wait for the VMM to exit, then release its network attachment.
    /// Exit-by-SIGTERM and CNI teardown noise surface in the error text so
    /// the caller can classify them.
    pub(crate) async fn wait(&mut self) -> Result<()> {
        let status = self.child.wait().await.context("wait for the VMM process")?;

        let exit_err = if status.success() {
            None
        } else if let Some(code) = status.code() {
            Some(format!("firecracker exited with status {code}"))
        } else {
            use std::os::unix::process::ExitStatusExt;
            match status.signal() {
                Some(sig) if sig == libc::SIGTERM => Some("signal: terminated".to_owned()),
                Some(sig) if sig == libc::SIGKILL => Some("signal: killed".to_owned()),
                Some(sig) => Some(format!("signal: {sig}")),
                None => Some(format!("firecracker exited abnormally: {status}")),
            }
        };

        let net_err = if self.net_detached {
            None
        } else {
            self.net_detached = true;
            network::detach(&self.vm_id).await.err().map(|err| format!("{err:#}"))
        };

        let problems: Vec<String> = [exit_err, net_err].into_iter().flatten().collect();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("{}", problems.join("; ")))
        }
    }

    /// SIGKILL the VMM. Failing because the process is already gone is the
    /// expected case on this path.
    pub(crate) fn force_stop(&mut self) -> std::io::Result<()> {
        self.child.start_kill()
    }

    pub(crate) fn sock_path(&self) -> &Path {
        &self.sock_path
    }

    async fn api_put(&self, endpoint: &str, body: serde_json::Value) -> Result<()> {
        let uri: hyper::Uri = hyperlocal::Uri::new(&self.sock_path, endpoint).into();
        let request = Request::builder()
            .method(Method::PUT)
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .context("build VMM API request")?;

        let response = self
            .api
            .request(request)
            .await
            .with_context(|| format!("PUT {endpoint} on {:?}", self.sock_path))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = hyper::body::to_bytes(response.into_body())
                .await
                .unwrap_or_default();
            anyhow::bail!(
                "VMM API PUT {endpoint} answered {status}: {}",
                String::from_utf8_lossy(&body).trim()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn lease() -> NetworkLease {
        NetworkLease {
            netns: "fc-test".into(),
            tap_dev: "tap0".into(),
            ip: Ipv4Addr::new(10, 61, 0, 5),
            prefix: 24,
            gateway: Some(Ipv4Addr::new(10, 61, 0, 1)),
        }
    }

    #[test]
    fn socket_path_is_keyed_by_pid_and_vm() {
        let path = socket_path("abc123");
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(
            name,
            format!(".firecracker.sock-{}-abc123", std::process::id())
        );
        assert!(path.starts_with(std::env::temp_dir()));
    }

    #[test]
    fn log_lives_next_to_the_socket() {
        let sock = socket_path("abc123");
        let log = log_sibling(&sock);
        assert_eq!(
            log.to_string_lossy(),
            format!("{}.log", sock.to_string_lossy())
        );
    }

    #[test]
    fn boot_args_carry_the_leased_address() {
        let args = boot_args(&lease());
        assert!(args.contains("ip=10.61.0.5::10.61.0.1:255.255.255.0::eth0:off"));
        assert!(args.contains("panic=1"));
    }

    #[test]
    fn boot_args_tolerate_a_missing_gateway() {
        let mut lease = lease();
        lease.gateway = None;
        assert!(boot_args(&lease).contains("ip=10.61.0.5:::255.255.255.0::eth0:off"));
    }
}
