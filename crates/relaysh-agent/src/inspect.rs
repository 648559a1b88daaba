//! Host inspection for the registration block
//!
//! The controller treats the result as an opaque blob and only scans it for
//! `Key: value` fields, so every lookup here degrades to an `Error getting ..`
//! line instead of failing.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;
use std::path::Path;
use sysinfo::{Disks, Networks, System};
use tracing::debug;

/// Source of the metadata blob sent at registration
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Produce the blob, one record per line
    async fn collect(&self) -> String;
}

/// Fixed metadata, useful for tests and for hosts that should not be inspected
#[derive(Debug, Clone, Default)]
pub struct StaticMetadata(pub String);

#[async_trait]
impl MetadataSource for StaticMetadata {
    async fn collect(&self) -> String {
        self.0.clone()
    }
}

/// Inspects the local machine
#[derive(Debug, Clone, Copy, Default)]
pub struct HostInspector;

#[async_trait]
impl MetadataSource for HostInspector {
    async fn collect(&self) -> String {
        match tokio::task::spawn_blocking(inspect_host).await {
            Ok(blob) => blob,
            Err(e) => format!("Error getting host info: {}\n", e),
        }
    }
}

/// Gather every section of the blob synchronously
pub fn inspect_host() -> String {
    let mut out = String::new();
    let sys = System::new_all();

    let _ = writeln!(out, "{}", cpu_section(&sys));
    let _ = writeln!(out, "Memory | {}MB", sys.total_memory() / 1024 / 1024);

    let disks = Disks::new_with_refreshed_list();
    match disks.list().iter().find(|d| d.mount_point() == Path::new("/")) {
        Some(root) => {
            let _ = writeln!(out, "Disk | {}GB", root.total_space() / 1024 / 1024 / 1024);
        }
        None => {
            let _ = writeln!(out, "Error getting disk info: no filesystem mounted at /");
        }
    }

    let _ = writeln!(out, "{}", product_section());

    let mut seen = BTreeSet::new();
    let disk_types: Vec<String> = disks
        .list()
        .iter()
        .filter(|d| seen.insert(d.name().to_string_lossy().to_string()))
        .map(|d| {
            format!(
                "Name: {} | Type: {:?} | Size: {}GB",
                d.name().to_string_lossy(),
                d.kind(),
                d.total_space() / 1024 / 1024 / 1024
            )
        })
        .collect();
    let _ = writeln!(out, "Disk Types | {}", disk_types.join("\n"));

    let _ = writeln!(out, "RAID Info | {}", raid_section());

    let _ = writeln!(out, "Network Interfaces | {}", network_section().join("\n"));

    out
}

fn cpu_section(sys: &System) -> String {
    let cpus = sys.cpus();
    let Some(first) = cpus.first() else {
        return "Error getting CPU info: no processors reported".to_string();
    };

    let logical = cpus.len();
    let (physical, total_cores) = std::fs::read_to_string("/proc/cpuinfo")
        .ok()
        .and_then(|raw| parse_cpu_topology(&raw))
        .unwrap_or((1, logical));
    let cores_per_cpu = if physical > 0 { total_cores / physical } else { 0 };

    format!(
        "CPU | Model: {} | Physical CPUs: {} | Logical CPUs: {} | Cores per CPU: {} | Total Cores: {} | Total Threads: {} | Frequency: {:.2}GHz",
        first.brand().trim(),
        physical,
        logical,
        cores_per_cpu,
        total_cores,
        logical,
        first.frequency() as f64 / 1000.0
    )
}

/// Count physical packages and distinct cores from `/proc/cpuinfo`
pub fn parse_cpu_topology(cpuinfo: &str) -> Option<(usize, usize)> {
    let mut packages = BTreeSet::new();
    let mut cores = BTreeSet::new();
    let mut package = None;

    for line in cpuinfo.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key.trim() {
            "physical id" => {
                let id = value.trim().to_string();
                packages.insert(id.clone());
                package = Some(id);
            }
            "core id" => {
                if let Some(package) = &package {
                    cores.insert((package.clone(), value.trim().to_string()));
                }
            }
            _ => {}
        }
    }

    if packages.is_empty() {
        None
    } else {
        Some((packages.len(), cores.len().max(packages.len())))
    }
}

fn product_section() -> String {
    const DMI: &str = "/sys/class/dmi/id";
    let read = |name: &str| {
        std::fs::read_to_string(Path::new(DMI).join(name))
            .map(|v| v.trim().to_string())
            .ok()
    };

    let Some(name) = read("product_name") else {
        return format!("Error getting product info: {} is not readable", DMI);
    };
    let field = |name: &str| read(name).unwrap_or_else(|| "unknown".to_string());

    format!(
        "Product | Family: {} | Name: {} | Serial Number: {} | UUID: {} | SKU: {} | Vendor: {} | Version: {}",
        field("product_family"),
        name,
        field("product_serial"),
        field("product_uuid"),
        field("product_sku"),
        field("sys_vendor"),
        field("product_version"),
    )
}

fn raid_section() -> String {
    if cfg!(windows) {
        return "RAID information not available on Windows".to_string();
    }

    match std::process::Command::new("lshw").args(["-class", "storage"]).output() {
        Ok(output) if output.status.success() => {
            parse_storage_controllers(&String::from_utf8_lossy(&output.stdout))
        }
        Ok(output) => format!("Error getting RAID info: lshw exited with {}", output.status),
        Err(e) => {
            debug!("lshw unavailable: {}", e);
            format!("Error getting RAID info: {}", e)
        }
    }
}

/// Summarise `lshw -class storage` output, one controller per entry
pub fn parse_storage_controllers(output: &str) -> String {
    #[derive(Default)]
    struct Controller {
        class: String,
        description: String,
        product: String,
        vendor: String,
        driver: String,
    }

    let mut controllers: Vec<Controller> = Vec::new();
    for line in output.lines().map(str::trim) {
        if let Some(class) = line.strip_prefix("*-") {
            controllers.push(Controller {
                class: class.to_string(),
                ..Default::default()
            });
            continue;
        }
        let Some(current) = controllers.last_mut() else {
            continue;
        };
        if let Some(v) = line.strip_prefix("description: ") {
            current.description = v.to_string();
        } else if let Some(v) = line.strip_prefix("product: ") {
            current.product = v.to_string();
        } else if let Some(v) = line.strip_prefix("vendor: ") {
            current.vendor = v.to_string();
        } else if let Some(rest) = line.strip_prefix("configuration: driver=") {
            current.driver = rest.split_whitespace().next().unwrap_or_default().to_string();
        }
    }

    if controllers.is_empty() {
        return "No RAID information available".to_string();
    }

    controllers
        .iter()
        .map(|c| format!("{}, {}, {}, {}, {}", c.class, c.description, c.product, c.vendor, c.driver))
        .collect::<Vec<_>>()
        .join("; ")
}

fn network_section() -> Vec<String> {
    let networks = Networks::new_with_refreshed_list();
    let sorted: BTreeMap<_, _> = networks.list().iter().collect();

    sorted
        .into_iter()
        .filter(|(_, data)| !data.mac_address().is_unspecified())
        .map(|(name, data)| {
            let ips: Vec<String> = data
                .ip_networks()
                .iter()
                .map(|net| format!("{}/{}", net.addr, net.prefix))
                .collect();
            format!("Name: {} MAC: {} IPs: [{}]", name, data.mac_address(), ips.join(" "))
        })
        .collect()
}
