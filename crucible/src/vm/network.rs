//! Network attachment for microVMs.
//!
//! The actual interface plumbing is delegated to the host CNI stack: each VM
//! gets its own named netns, and `cnitool` invokes the `fcnet` network list
//! (ptp + tc-redirect-tap) inside it. The result JSON tells us the leased IP
//! and the tap device the VMM should attach to.

use std::net::Ipv4Addr;
use std::process::Output;

use serde::Deserialize;
use tokio::process::Command;

use super::VmError;

pub(crate) const CNI_NETWORK: &str = "fcnet";
pub(crate) const CNI_IFNAME: &str = "fire_veth";
const NETNS_DIR: &str = "/var/run/netns";

#[derive(Debug, Clone)]
pub(crate) struct NetworkLease {
    pub netns: String,
    pub tap_dev: String,
    pub ip: Ipv4Addr,
    pub prefix: u8,
    pub gateway: Option<Ipv4Addr>,
}

#[derive(Deserialize)]
struct CniResult {
    #[serde(default)]
    interfaces: Vec<CniInterface>,
    #[serde(default)]
    ips: Vec<CniIp>,
}

#[derive(Deserialize)]
struct CniInterface {
    name: String,
}

#[derive(Deserialize)]
struct CniIp {
    address: String,
    gateway: Option<Ipv4Addr>,
}

pub(crate) fn netns_name(vm_id: &str) -> String {
    format!("fc-{vm_id}")
}

async fn run_checked(cmd: &mut Command, what: &str) -> Result<Output, VmError> {
    let output = cmd
        .output()
        .await
        .map_err(|err| VmError::NetworkSetup(format!("{what}: {err}")))?;
    if !output.status.success() {
        return Err(VmError::NetworkSetup(format!(
            "{what}: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(output)
}

pub(crate) async fn attach(vm_id: &str) -> Result<NetworkLease, VmError> {
    let netns = netns_name(vm_id);
    run_checked(
        Command::new("ip").args(["netns", "add", &netns]),
        "create netns",
    )
    .await?;

    let mut add = Command::new("cnitool");
    add.args(["add", CNI_NETWORK, &format!("{NETNS_DIR}/{netns}")])
        .env("CNI_IFNAME", CNI_IFNAME);

    let output = match run_checked(&mut add, &format!("CNI network list \"{CNI_NETWORK}\"")).await {
        Ok(output) => output,
        Err(err) => {
            let _ = Command::new("ip").args(["netns", "del", &netns]).output().await;
            return Err(err);
        }
    };

    match parse_lease(&netns, &output.stdout) {
        Ok(lease) => {
            tracing::debug!(?lease, "VM network attached");
            Ok(lease)
        }
        Err(err) => {
            let _ = detach(vm_id).await;
            Err(err)
        }
    }
}

/// Tear down what [`attach`] built. Errors carry the plugin/netns detail
/// upward so the shutdown path can decide how loudly to report them.
pub(crate) async fn detach(vm_id: &str) -> anyhow::Result<()> {
    let netns = netns_name(vm_id);
    let mut failures = Vec::new();

    let mut del = Command::new("cnitool");
    del.args(["del", CNI_NETWORK, &format!("{NETNS_DIR}/{netns}")])
        .env("CNI_IFNAME", CNI_IFNAME);
    if let Err(err) = run_checked(&mut del, &format!("teardown of CNI network list \"{CNI_NETWORK}\"")).await {
        failures.push(err.to_string());
    }

    if let Err(err) = run_checked(
        Command::new("ip").args(["netns", "del", &netns]),
        "delete netns",
    )
    .await
    {
        failures.push(err.to_string());
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(anyhow::anyhow!("{}", failures.join("; ")))
    }
}

fn parse_lease(netns: &str, raw: &[u8]) -> Result<NetworkLease, VmError> {
    let result: CniResult = serde_json::from_slice(raw)
        .map_err(|err| VmError::NetworkSetup(format!("decode CNI result: {err}")))?;

    // tc-redirect-tap reports the tap it created alongside the veth pair
    let tap_dev = result
        .interfaces
        .iter()
        .map(|iface| iface.name.as_str())
        .find(|name| name.starts_with("tap"))
        .unwrap_or("tap0")
        .to_owned();

    let lease = result
        .ips
        .first()
        .ok_or_else(|| VmError::NetworkSetup("CNI result carried no IP".to_owned()))?;
    let (ip, prefix) = split_cidr(&lease.address)?;

    Ok(NetworkLease {
        netns: netns.to_owned(),
        tap_dev,
        ip,
        prefix,
        gateway: lease.gateway,
    })
}

pub(crate) fn split_cidr(address: &str) -> Result<(Ipv4Addr, u8), VmError> {
    let bad = || VmError::NetworkSetup(format!("malformed CNI address {address:?}"));
    let (ip, prefix) = address.split_once('/').ok_or_else(bad)?;
    Ok((
        ip.parse().map_err(|_| bad())?,
        prefix.parse().map_err(|_| bad())?,
    ))
}

pub(crate) fn netmask(prefix: u8) -> Ipv4Addr {
    let bits = match prefix {
        0 => 0,
        p if p >= 32 => u32::MAX,
        p => u32::MAX << (32 - p),
    };
    Ipv4Addr::from(bits)
}

/// Deterministic locally-administered MAC for the guest side of the tap.
pub(crate) fn guest_mac(ip: Ipv4Addr) -> String {
    let [a, b, c, d] = ip.octets();
    format!("02:fc:{a:02x}:{b:02x}:{c:02x}:{d:02x}")
}
