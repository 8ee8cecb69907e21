//! Installed packages from the distribution package managers

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sitrep_api::{Machine, Package};
use sitrep_core::{ConfigError, ConfigRegistry, Configurable, Module, ModuleContext, ModuleError};
use sitrep_exec::CommandRunner;
use sitrep_store::{InventoryStore, InventoryStoreExt};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::{CollectorError, Result};
use crate::host::{HOST_BASIC, require_host};
use crate::platform::HostFs;

pub const DPKG: &str = "dpkg";
pub const RPM: &str = "rpm";

const DPKG_ADMIN_DIR: &str = "dpkg.admin-dir";

const DEBIAN_FAMILY: &[&str] = &["debian", "ubuntu", "linuxmint"];
const REDHAT_FAMILY: &[&str] = &[
    "fedora",
    "rhel",
    "centos",
    "rocky",
    "almalinux",
    "amzn",
    "ol",
    "suse",
    "opensuse",
    "opensuse-leap",
    "opensuse-tumbleweed",
    "sles",
];

const RPM_QUERY_FORMAT: &str = "%{NAME}\\t%{VERSION}-%{RELEASE}\\t%{VENDOR}\\t%{INSTALLTIME}\\n";
const RPM_TIMEOUT: Duration = Duration::from_secs(120);

/// Whether the host distribution or one it derives from is in `family`
///
/// `None` when nothing is known about the distribution.
fn in_family(host: &Machine, family: &[&str]) -> Option<bool> {
    let mut ids = std::iter::once(host.distribution.as_str())
        .chain(host.distribution_like.split_whitespace())
        .filter(|id| !id.is_empty() && *id != "linux")
        .peekable();
    ids.peek()?;
    Some(ids.any(|id| family.contains(&id)))
}

/// False (after a warning) when the host is known to use another manager
fn manages(host: &Machine, family: &[&str], manager: &str) -> bool {
    if in_family(host, family) == Some(false) {
        warn!(
            manager,
            distribution = %host.distribution,
            like = %host.distribution_like,
            "package manager does not serve this distribution, skipping"
        );
        return false;
    }
    true
}

/// One installed paragraph of the dpkg status database
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DpkgEntry {
    pub name: String,
    pub version: String,
    pub maintainer: String,
    pub architecture: String,
}

/// Parse `/var/lib/dpkg/status`, keeping installed packages only
#[must_use]
pub fn parse_dpkg_status(content: &str) -> Vec<DpkgEntry> {
    let mut entries = Vec::new();
    for paragraph in content.split("\n\n") {
        let mut entry = DpkgEntry::default();
        let mut installed = false;
        for line in paragraph.lines() {
            if line.starts_with(' ') || line.starts_with('\t') {
                continue;
            }
            let Some((field, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match field {
                "Package" => entry.name = value.to_string(),
                "Version" => entry.version = value.to_string(),
                "Maintainer" => entry.maintainer = value.to_string(),
                "Architecture" => entry.architecture = value.to_string(),
                "Status" => installed = value == "install ok installed",
                _ => {}
            }
        }
        if installed && !entry.name.is_empty() {
            entries.push(entry);
        }
    }
    entries
}

/// Debian packages from the dpkg database
pub struct Dpkg {
    fs: HostFs,
    admin_dir: String,
}

impl Dpkg {
    #[must_use]
    pub fn new(fs: HostFs) -> Self {
        Self {
            fs,
            admin_dir: "/var/lib/dpkg".to_string(),
        }
    }

    fn admin_path(&self, relative: &str) -> PathBuf {
        self.fs.resolve(&self.admin_dir).join(relative)
    }

    /// Files and install time from the package's `.list` file
    async fn file_list(&self, entry: &DpkgEntry) -> (Vec<String>, Option<DateTime<Utc>>) {
        let candidates = [
            format!("info/{}.list", entry.name),
            format!("info/{}:{}.list", entry.name, entry.architecture),
        ];
        for candidate in candidates {
            let path = self.admin_path(&candidate);
            let Ok(content) = fs::read_to_string(&path).await else {
                continue;
            };
            let installed = fs::metadata(&path)
                .await
                .and_then(|m| m.modified())
                .ok()
                .map(DateTime::<Utc>::from);
            let files = content
                .lines()
                .filter(|l| !l.is_empty() && *l != "/.")
                .map(str::to_string)
                .collect();
            return (files, installed);
        }
        (Vec::new(), None)
    }

    async fn collect(&self, ctx: &ModuleContext) -> Result<()> {
        let store = ctx.store.as_ref();
        let host = require_host(store).await?;
        if !manages(&host, DEBIAN_FAMILY, DPKG) {
            return Ok(());
        }

        let status = self.admin_path("status");
        let content = fs::read_to_string(&status)
            .await
            .map_err(|e| CollectorError::read(status, e))?;
        let entries = parse_dpkg_status(&content);

        for entry in &entries {
            if ctx.cancel.is_cancelled() {
                return Err(CollectorError::Cancelled(DPKG.to_string()));
            }
            let (files, install_time) = self.file_list(entry).await;
            store
                .put(Package {
                    machine_id: host.id,
                    name: entry.name.clone(),
                    version: entry.version.clone(),
                    vendor: entry.maintainer.clone(),
                    manager: DPKG.to_string(),
                    install_time,
                    files,
                    ..Package::default()
                })
                .await?;
        }
        info!(packages = entries.len(), "dpkg database read");
        Ok(())
    }
}

impl Configurable for Dpkg {
    fn bind(&self, config: &mut ConfigRegistry) -> Result<(), ConfigError> {
        config.define(DPKG_ADMIN_DIR, self.admin_dir.as_str(), "dpkg administrative directory")
    }

    fn configure(&mut self, config: &ConfigRegistry) -> Result<(), ConfigError> {
        self.admin_dir = config.get(DPKG_ADMIN_DIR)?;
        Ok(())
    }
}

#[async_trait]
impl Module for Dpkg {
    fn name(&self) -> &'static str {
        DPKG
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &[HOST_BASIC]
    }

    async fn run(&self, ctx: &ModuleContext) -> Result<(), ModuleError> {
        Ok(self.collect(ctx).await?)
    }

    fn as_configurable(&mut self) -> Option<&mut dyn Configurable> {
        Some(self)
    }
}

/// Parse `rpm -qa` output in [`RPM_QUERY_FORMAT`]
#[must_use]
pub fn parse_rpm_query(output: &str) -> Vec<Package> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split('\t');
            let name = fields.next()?.trim();
            if name.is_empty() {
                return None;
            }
            let version = fields.next().unwrap_or_default();
            let vendor = fields.next().unwrap_or_default();
            let install_time = fields
                .next()
                .and_then(|t| t.trim().parse::<i64>().ok())
                .and_then(|t| DateTime::<Utc>::from_timestamp(t, 0));
            Some(Package {
                name: name.to_string(),
                version: version.to_string(),
                vendor: if vendor == "(none)" { String::new() } else { vendor.to_string() },
                manager: RPM.to_string(),
                install_time,
                ..Package::default()
            })
        })
        .collect()
}

/// RPM packages via the `rpm` tool
pub struct Rpm {
    runner: Arc<dyn CommandRunner>,
}

impl Rpm {
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn collect(&self, store: &dyn InventoryStore) -> Result<()> {
        let host = require_host(store).await?;
        if !manages(&host, REDHAT_FAMILY, RPM) {
            return Ok(());
        }

        let output = self
            .runner
            .run_with_timeout("rpm", &["-qa", "--queryformat", RPM_QUERY_FORMAT], RPM_TIMEOUT)
            .await?
            .into_stdout()?;
        let packages = parse_rpm_query(&output);
        debug!(packages = packages.len(), "rpm query parsed");
        for package in packages {
            store
                .put(Package {
                    machine_id: host.id,
                    ..package
                })
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Module for Rpm {
    fn name(&self) -> &'static str {
        RPM
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &[HOST_BASIC]
    }

    async fn run(&self, ctx: &ModuleContext) -> Result<(), ModuleError> {
        Ok(self.collect(ctx.store.as_ref()).await?)
    }
}
