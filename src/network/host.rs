//! Host network plumbing: bridge, TAP devices, NAT and port forwards
//!
//! ```text
//!   guest eth0 ── vmm-0-2 (tap) ──┐
//!   guest eth0 ── vmm-0-3 (tap) ──┼── vmm-br0 (172.16.0.1/16) ── MASQUERADE ── eth0/wlan0 (default route)
//!   guest eth0 ── vmm-0-4 (tap) ──┘
//! ```
//!
//! Every setup step checks for existing state first and tolerates
//! "File exists" from the kernel, so two invocations racing to create the
//! bridge or the NAT rules both succeed.

use std::net::Ipv4Addr;
use std::process::Command;

use tracing::{debug, info, warn};

use crate::error::{Result, ResultExt, VmmError};
use crate::vm::record::PortForward;

/// Host-side network operations
pub trait HostNetwork: Send + Sync {
    /// Interface carrying the default route (never hardcoded)
    fn default_route_interface(&self) -> Result<String>;

    /// Create the bridge with the gateway address if missing, and bring it up
    fn ensure_bridge(&self, bridge: &str, gateway: Ipv4Addr, prefix: u8) -> Result<()>;

    /// IP forwarding + MASQUERADE for `subnet` out of `out_iface`
    fn ensure_nat(&self, bridge: &str, subnet: &str, out_iface: &str) -> Result<()>;

    /// Create `tap` (replacing a stale one) and enslave it to `bridge`
    fn create_tap(&self, tap: &str, bridge: &str) -> Result<()>;

    /// Delete `tap`; already absent is success
    fn delete_tap(&self, tap: &str) -> Result<()>;

    fn tap_exists(&self, tap: &str) -> bool;

    fn add_port_forward(&self, out_iface: &str, guest_ip: Ipv4Addr, forward: &PortForward) -> Result<()>;

    fn remove_port_forward(&self, out_iface: &str, guest_ip: Ipv4Addr, forward: &PortForward) -> Result<()>;
}

/// Real implementation over `ip`, `iptables` and `sysctl`
pub struct IpTablesNetwork;

impl IpTablesNetwork {
    fn link_exists(name: &str) -> bool {
        Command::new("ip")
            .args(["link", "show", "dev", name])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Append a rule unless `iptables -C` finds it already present
    fn ensure_rule(table: &str, chain: &str, rule: &[String]) -> Result<()> {
        if Self::rule_exists(table, chain, rule) {
            return Ok(());
        }
        let mut args = vec!["-t".to_string(), table.to_string(), "-A".to_string(), chain.to_string()];
        args.extend_from_slice(rule);
        run("iptables", &args)
    }

    /// Delete a rule if present
    fn drop_rule(table: &str, chain: &str, rule: &[String]) -> Result<()> {
        if !Self::rule_exists(table, chain, rule) {
            return Ok(());
        }
        let mut args = vec!["-t".to_string(), table.to_string(), "-D".to_string(), chain.to_string()];
        args.extend_from_slice(rule);
        run("iptables", &args)
    }

    fn rule_exists(table: &str, chain: &str, rule: &[String]) -> bool {
        let mut args = vec!["-t".to_string(), table.to_string(), "-C".to_string(), chain.to_string()];
        args.extend_from_slice(rule);
        Command::new("iptables")
            .args(&args)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }
}

impl HostNetwork for IpTablesNetwork {
    fn default_route_interface(&self) -> Result<String> {
        let output = Command::new("ip")
            .args(["route", "show", "default"])
            .output()
            .context("spawning ip route")?;
        if !output.status.success() {
            return Err(tool_failure("ip route", &output));
        }
        parse_default_route(&String::from_utf8_lossy(&output.stdout))
            .ok_or_else(|| VmmError::NotFound("default route interface".to_string()))
    }

    fn ensure_bridge(&self, bridge: &str, gateway: Ipv4Addr, prefix: u8) -> Result<()> {
        if !Self::link_exists(bridge) {
            info!(bridge, "creating bridge");
            run_tolerant("ip", &args(&["link", "add", "name", bridge, "type", "bridge"]))?;
            run_tolerant(
                "ip",
                &args(&["addr", "add", &format!("{}/{}", gateway, prefix), "dev", bridge]),
            )?;
        }
        run("ip", &args(&["link", "set", "dev", bridge, "up"]))
    }

    fn ensure_nat(&self, bridge: &str, subnet: &str, out_iface: &str) -> Result<()> {
        run("sysctl", &args(&["-w", "net.ipv4.ip_forward=1"]))?;

        Self::ensure_rule(
            "nat",
            "POSTROUTING",
            &args(&["-s", subnet, "-o", out_iface, "-j", "MASQUERADE"]),
        )?;
        Self::ensure_rule(
            "filter",
            "FORWARD",
            &args(&["-i", bridge, "-o", out_iface, "-j", "ACCEPT"]),
        )?;
        Self::ensure_rule(
            "filter",
            "FORWARD",
            &args(&[
                "-i", out_iface, "-o", bridge, "-m", "state", "--state", "RELATED,ESTABLISHED", "-j", "ACCEPT",
            ]),
        )?;
        debug!(bridge, subnet, out_iface, "NAT rules in place");
        Ok(())
    }

    fn create_tap(&self, tap: &str, bridge: &str) -> Result<()> {
        if Self::link_exists(tap) {
            warn!(tap, "removing stale TAP device");
            self.delete_tap(tap)?;
        }

        run("ip", &args(&["tuntap", "add", "dev", tap, "mode", "tap"]))?;

        let configure = run("ip", &args(&["link", "set", "dev", tap, "master", bridge]))
            .and_then(|_| run("ip", &args(&["link", "set", "dev", tap, "up"])));
        if let Err(e) = configure {
            let _ = run("ip", &args(&["link", "delete", tap]));
            return Err(e).with_context(|| format!("configuring TAP device {}", tap));
        }

        Ok(())
    }

    fn delete_tap(&self, tap: &str) -> Result<()> {
        if !Self::link_exists(tap) {
            return Ok(());
        }
        run("ip", &args(&["link", "delete", tap]))
    }

    fn tap_exists(&self, tap: &str) -> bool {
        Self::link_exists(tap)
    }

    fn add_port_forward(&self, out_iface: &str, guest_ip: Ipv4Addr, forward: &PortForward) -> Result<()> {
        let (dnat, accept) = port_forward_rules(out_iface, guest_ip, forward);
        Self::ensure_rule("nat", "PREROUTING", &dnat)?;
        Self::ensure_rule("filter", "FORWARD", &accept)
    }

    fn remove_port_forward(&self, out_iface: &str, guest_ip: Ipv4Addr, forward: &PortForward) -> Result<()> {
        let (dnat, accept) = port_forward_rules(out_iface, guest_ip, forward);
        let first = Self::drop_rule("nat", "PREROUTING", &dnat);
        let second = Self::drop_rule("filter", "FORWARD", &accept);
        first.and(second)
    }
}

/// DNAT rule for PREROUTING and the matching FORWARD accept
fn port_forward_rules(out_iface: &str, guest_ip: Ipv4Addr, forward: &PortForward) -> (Vec<String>, Vec<String>) {
    let proto = forward.protocol.as_str();
    let dnat = args(&[
        "-i",
        out_iface,
        "-p",
        proto,
        "--dport",
        &forward.host_port.to_string(),
        "-j",
        "DNAT",
        "--to-destination",
        &format!("{}:{}", guest_ip, forward.guest_port),
    ]);
    let accept = args(&[
        "-p",
        proto,
        "-d",
        &guest_ip.to_string(),
        "--dport",
        &forward.guest_port.to_string(),
        "-j",
        "ACCEPT",
    ]);
    (dnat, accept)
}

/// Interface name from `ip route show default` output
pub fn parse_default_route(output: &str) -> Option<String> {
    output
        .lines()
        .filter(|line| line.starts_with("default"))
        .find_map(|line| {
            let mut words = line.split_whitespace();
            while let Some(word) = words.next() {
                if word == "dev" {
                    return words.next().map(str::to_string);
                }
            }
            None
        })
}

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn run(tool: &str, args: &[String]) -> Result<()> {
    let output = Command::new(tool)
        .args(args)
        .output()
        .with_context(|| format!("spawning {}", tool))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(tool_failure(&format!("{} {}", tool, args.join(" ")), &output))
    }
}

/// Like [`run`], but a concurrent creator winning the race is success
fn run_tolerant(tool: &str, args: &[String]) -> Result<()> {
    match run(tool, args) {
        Err(VmmError::ExternalToolFailure { output, .. }) if output.contains("File exists") => Ok(()),
        other => other,
    }
}

fn tool_failure(tool: &str, output: &std::process::Output) -> VmmError {
    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    VmmError::ExternalToolFailure {
        tool: tool.to_string(),
        status: output.status.to_string(),
        output: combined.trim().to_string(),
    }
}
