//! Access to kernel-exported system state
//!
//! [`HostFs`] reads `/proc`, `/sys` and `/etc` below a configurable root so
//! collectors can be pointed at a fixture tree in tests. Outside Linux every
//! reader returns [`CollectorError::Unsupported`].

pub mod parse;

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use sitrep_api::Protocol;
use tokio::fs;
use tracing::{debug, trace};

use crate::error::{CollectorError, Result};

/// Completed neighbour table entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpEntry {
    pub ip: IpAddr,
    /// Lower-case colon separated
    pub mac: String,
    pub device: String,
}

/// One row of `/proc/net/{tcp,udp}[6]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketEntry {
    pub protocol: Protocol,
    pub local: IpAddr,
    pub port: u16,
    pub remote: IpAddr,
    pub remote_port: u16,
    /// Kernel socket state (`0x0A` is TCP listen)
    pub state: u8,
    pub uid: u32,
    pub inode: u64,
}

/// Block device from `/sys/block`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDevice {
    pub name: String,
    pub model: String,
    /// Bytes
    pub size: u64,
    pub rotational: bool,
}

/// Display controller from the PCI bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayDevice {
    pub slot: String,
    pub vendor: String,
    pub product: String,
    pub driver: String,
}

/// Distribution identity from os-release
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OsRelease {
    pub id: String,
    /// Space separated parent distributions
    pub id_like: String,
    pub version_id: String,
}

/// Prefixes of virtual block devices
const VIRTUAL_BLOCK_PREFIXES: [&str; 4] = ["loop", "ram", "dm-", "zram"];

/// PCI classes of VGA, 3D and other display controllers
const DISPLAY_CLASSES: [&str; 3] = ["0x0300", "0x0302", "0x0380"];

/// Read-only view of a Linux system tree
#[derive(Debug, Clone)]
pub struct HostFs {
    root: PathBuf,
    supported: bool,
}

impl Default for HostFs {
    fn default() -> Self {
        Self::system()
    }
}

impl HostFs {
    /// The running system
    #[must_use]
    pub fn system() -> Self {
        Self {
            root: PathBuf::from("/"),
            supported: cfg!(target_os = "linux"),
        }
    }

    /// A system tree mounted below `root`
    #[must_use]
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            supported: true,
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// Map an absolute system path into this tree
    #[must_use]
    pub fn resolve(&self, path: &str) -> PathBuf {
        self.path(path.trim_start_matches('/'))
    }

    fn ensure_supported(&self, what: &str) -> Result<()> {
        if self.supported {
            Ok(())
        } else {
            Err(CollectorError::Unsupported(what.to_string()))
        }
    }

    async fn read(&self, relative: &str) -> Result<String> {
        let path = self.path(relative);
        fs::read_to_string(&path)
            .await
            .map_err(|e| CollectorError::read(path, e))
    }

    /// Read a file that may legitimately be absent
    async fn read_optional(&self, relative: &str) -> Result<Option<String>> {
        match self.read(relative).await {
            Ok(content) => Ok(Some(content)),
            Err(CollectorError::Read { source, .. })
                if matches!(source.kind(), ErrorKind::NotFound | ErrorKind::PermissionDenied) =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn read_trimmed(&self, relative: &str) -> Option<String> {
        self.read_optional(relative)
            .await
            .ok()
            .flatten()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// Completed entries of the kernel neighbour table
    ///
    /// # Errors
    /// Returns `Unsupported` off Linux or `Read` if the table is unreadable.
    pub async fn arp_table(&self) -> Result<Vec<ArpEntry>> {
        self.ensure_supported("arp table")?;
        Ok(parse::arp(&self.read("proc/net/arp").await?))
    }

    /// Listening TCP and UDP sockets, v4 and v6
    ///
    /// Tables missing from the kernel (no IPv6) are skipped.
    ///
    /// # Errors
    /// Returns `Unsupported` off Linux or `Parse` for a malformed table.
    pub async fn listening_sockets(&self) -> Result<Vec<SocketEntry>> {
        self.ensure_supported("socket tables")?;
        let tables = [
            ("proc/net/tcp", Protocol::Tcp),
            ("proc/net/tcp6", Protocol::Tcp),
            ("proc/net/udp", Protocol::Udp),
            ("proc/net/udp6", Protocol::Udp),
        ];
        let mut sockets = Vec::new();
        for (table, protocol) in tables {
            let Some(content) = self.read_optional(table).await? else {
                debug!(table, "socket table not present");
                continue;
            };
            sockets.extend(
                parse::proc_net(&content, protocol)?
                    .into_iter()
                    .filter(SocketEntry::is_listening),
            );
        }
        Ok(sockets)
    }

    /// Socket inode -> owning pid
    ///
    /// Processes whose descriptors cannot be read (other users without
    /// privileges) are left out.
    ///
    /// # Errors
    /// Returns `Unsupported` off Linux or `Read` if `/proc` is not listable.
    pub async fn socket_owners(&self) -> Result<HashMap<u64, u32>> {
        self.ensure_supported("socket owners")?;
        let proc_dir = self.path("proc");
        let mut entries = fs::read_dir(&proc_dir)
            .await
            .map_err(|e| CollectorError::read(&proc_dir, e))?;

        let mut owners = HashMap::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CollectorError::read(&proc_dir, e))?
        {
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            let Ok(mut fds) = fs::read_dir(entry.path().join("fd")).await else {
                trace!(pid, "descriptors not readable");
                continue;
            };
            while let Ok(Some(fd)) = fds.next_entry().await {
                if let Ok(target) = fs::read_link(fd.path()).await
                    && let Some(inode) = target.to_str().and_then(parse::socket_inode)
                {
                    owners.entry(inode).or_insert(pid);
                }
            }
        }
        Ok(owners)
    }

    /// Arguments of a process, program first
    ///
    /// # Errors
    /// Returns `Unsupported` off Linux or `Read` if the process is gone.
    pub async fn process_cmdline(&self, pid: u32) -> Result<Vec<String>> {
        self.ensure_supported("process table")?;
        let path = self.path(&format!("proc/{pid}/cmdline"));
        let raw = fs::read(&path)
            .await
            .map_err(|e| CollectorError::read(path, e))?;
        Ok(parse::cmdline(&raw))
    }

    /// Name of the user a process runs as
    ///
    /// # Errors
    /// Returns `Unsupported` off Linux or `Read` if the process is gone.
    pub async fn process_user(&self, pid: u32) -> Result<Option<String>> {
        self.ensure_supported("process table")?;
        let status = self.read(&format!("proc/{pid}/status")).await?;
        let Some(uid) = parse::status_uid(&status) else {
            return Ok(None);
        };
        Ok(self.user_name(uid).await)
    }

    /// Resolve a uid through `/etc/passwd`, falling back to the number
    pub async fn user_name(&self, uid: u32) -> Option<String> {
        let passwd = self.read_optional("etc/passwd").await.ok().flatten()?;
        Some(
            parse::passwd(&passwd)
                .remove(&uid)
                .unwrap_or_else(|| uid.to_string()),
        )
    }

    /// Stable machine identity
    ///
    /// DMI product uuid first, then the systemd machine id, then the boot id.
    ///
    /// # Errors
    /// Returns `Unsupported` off Linux.
    pub async fn host_id(&self) -> Result<Option<String>> {
        self.ensure_supported("host id")?;
        for source in [
            "sys/class/dmi/id/product_uuid",
            "etc/machine-id",
            "proc/sys/kernel/random/boot_id",
        ] {
            if let Some(id) = self.read_trimmed(source).await {
                debug!(source, "resolved host id");
                return Ok(Some(id.to_ascii_lowercase()));
            }
        }
        Ok(None)
    }

    /// Distribution identity, from `/etc/os-release` or `/usr/lib/os-release`
    ///
    /// # Errors
    /// Returns `Unsupported` off Linux.
    pub async fn os_release(&self) -> Result<Option<OsRelease>> {
        self.ensure_supported("os-release")?;
        for source in ["etc/os-release", "usr/lib/os-release"] {
            let Some(content) = self.read_optional(source).await? else {
                continue;
            };
            let mut fields = parse::os_release(&content);
            let mut take = |key: &str| fields.remove(key).unwrap_or_default();
            return Ok(Some(OsRelease {
                id: take("ID").to_ascii_lowercase(),
                id_like: take("ID_LIKE").to_ascii_lowercase(),
                version_id: take("VERSION_ID"),
            }));
        }
        Ok(None)
    }

    /// SMBIOS chassis type as a name (`laptop`, `server`, ...)
    ///
    /// # Errors
    /// Returns `Unsupported` off Linux.
    pub async fn chassis(&self) -> Result<Option<String>> {
        self.ensure_supported("chassis type")?;
        Ok(self
            .read_trimmed("sys/class/dmi/id/chassis_type")
            .await
            .and_then(|t| parse::chassis_name(&t))
            .map(str::to_string))
    }

    /// Physical block devices, sorted by name
    ///
    /// # Errors
    /// Returns `Unsupported` off Linux or `Read` if `/sys/block` is missing.
    pub async fn block_devices(&self) -> Result<Vec<BlockDevice>> {
        self.ensure_supported("block devices")?;
        let block = self.path("sys/block");
        let mut entries = fs::read_dir(&block)
            .await
            .map_err(|e| CollectorError::read(&block, e))?;

        let mut devices = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CollectorError::read(&block, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if VIRTUAL_BLOCK_PREFIXES.iter().any(|p| name.starts_with(p)) {
                continue;
            }
            let sectors: u64 = self
                .read_trimmed(&format!("sys/block/{name}/size"))
                .await
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            if sectors == 0 {
                continue;
            }
            let model = self
                .read_trimmed(&format!("sys/block/{name}/device/model"))
                .await
                .unwrap_or_default();
            let rotational = self
                .read_trimmed(&format!("sys/block/{name}/queue/rotational"))
                .await
                .is_some_and(|r| r == "1");
            devices.push(BlockDevice {
                name,
                model,
                size: sectors * 512,
                rotational,
            });
        }
        devices.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(devices)
    }

    /// Display controllers, sorted by PCI slot
    ///
    /// # Errors
    /// Returns `Unsupported` off Linux or `Read` if the PCI bus is missing.
    pub async fn display_devices(&self) -> Result<Vec<DisplayDevice>> {
        self.ensure_supported("pci bus")?;
        let bus = self.path("sys/bus/pci/devices");
        let mut entries = fs::read_dir(&bus)
            .await
            .map_err(|e| CollectorError::read(&bus, e))?;

        let mut devices = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CollectorError::read(&bus, e))?
        {
            let slot = entry.file_name().to_string_lossy().into_owned();
            let base = format!("sys/bus/pci/devices/{slot}");
            let Some(class) = self.read_trimmed(&format!("{base}/class")).await else {
                continue;
            };
            if !DISPLAY_CLASSES.iter().any(|c| class.starts_with(c)) {
                continue;
            }
            let vendor_id = self
                .read_trimmed(&format!("{base}/vendor"))
                .await
                .unwrap_or_default();
            let product = self
                .read_trimmed(&format!("{base}/device"))
                .await
                .unwrap_or_default();
            let driver = fs::read_link(entry.path().join("driver"))
                .await
                .ok()
                .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
                .unwrap_or_default();
            devices.push(DisplayDevice {
                slot,
                vendor: pci_vendor_name(&vendor_id),
                product,
                driver,
            });
        }
        devices.sort_by(|a, b| a.slot.cmp(&b.slot));
        Ok(devices)
    }
}

fn pci_vendor_name(id: &str) -> String {
    match id.to_ascii_lowercase().as_str() {
        "0x10de" => "NVIDIA".to_string(),
        "0x1002" => "AMD".to_string(),
        "0x8086" => "Intel".to_string(),
        "0x1af4" => "Red Hat".to_string(),
        "0x15ad" => "VMware".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::write_file as write;

    #[tokio::test]
    async fn test_host_id_fallback_order() {
        let dir = tempfile::tempdir().unwrap();
        let fs = HostFs::at(dir.path());
        assert_eq!(fs.host_id().await.unwrap(), None);

        write(dir.path(), "proc/sys/kernel/random/boot_id", "boot\n");
        assert_eq!(fs.host_id().await.unwrap().as_deref(), Some("boot"));

        write(dir.path(), "etc/machine-id", "ABCDEF0123\n");
        assert_eq!(fs.host_id().await.unwrap().as_deref(), Some("abcdef0123"));
    }

    #[tokio::test]
    async fn test_listening_sockets_skips_missing_tables() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "proc/net/tcp",
            "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode\n   0: 00000000:0016 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 18212 1\n   1: 0201A8C0:0016 0101A8C0:D431 01 00000000:00000000 02:000A7B0F 00000000     0        0 40112 4\n",
        );
        let sockets = HostFs::at(dir.path()).listening_sockets().await.unwrap();
        assert_eq!(sockets.len(), 1);
        assert_eq!(sockets[0].port, 22);
        assert_eq!(sockets[0].inode, 18212);
    }

    #[tokio::test]
    async fn test_process_user() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "proc/42/status", "Name:\tpostgres\nUid:\t112\t112\t112\t112\n");
        write(dir.path(), "proc/42/cmdline", "postgres\0-D\0/var/lib/postgresql\0");
        write(dir.path(), "etc/passwd", "root:x:0:0::/root:/bin/sh\npostgres:x:112:120::/var/lib/postgresql:/bin/sh\n");
        let fs = HostFs::at(dir.path());
        assert_eq!(fs.process_user(42).await.unwrap().as_deref(), Some("postgres"));
        assert_eq!(fs.process_cmdline(42).await.unwrap()[0], "postgres");
        assert!(fs.process_cmdline(43).await.is_err());
    }

    #[tokio::test]
    async fn test_block_devices_skip_virtual() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "sys/block/sda/size", "1000215216\n");
        write(dir.path(), "sys/block/sda/device/model", "Samsung SSD 870\n");
        write(dir.path(), "sys/block/sda/queue/rotational", "0\n");
        write(dir.path(), "sys/block/loop0/size", "2048\n");
        write(dir.path(), "sys/block/sr0/size", "0\n");

        let devices = HostFs::at(dir.path()).block_devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "sda");
        assert_eq!(devices[0].size, 1_000_215_216 * 512);
        assert_eq!(devices[0].model, "Samsung SSD 870");
        assert!(!devices[0].rotational);
    }

    #[tokio::test]
    async fn test_display_devices() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "sys/bus/pci/devices/0000:01:00.0/class", "0x030000\n");
        write(dir.path(), "sys/bus/pci/devices/0000:01:00.0/vendor", "0x10de\n");
        write(dir.path(), "sys/bus/pci/devices/0000:01:00.0/device", "0x2684\n");
        write(dir.path(), "sys/bus/pci/devices/0000:00:1f.3/class", "0x040300\n");

        let devices = HostFs::at(dir.path()).display_devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].vendor, "NVIDIA");
        assert_eq!(devices[0].product, "0x2684");
        assert_eq!(devices[0].driver, "");
    }

    #[tokio::test]
    async fn test_unsupported_outside_linux() {
        let fs = HostFs {
            root: PathBuf::from("/"),
            supported: false,
        };
        assert!(matches!(
            fs.arp_table().await,
            Err(CollectorError::Unsupported(_))
        ));
    }
}
