//! Parsers for `/proc`, `/sys` and `/etc` formats
//!
//! Kept free of I/O so they can be tested on any platform.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use sitrep_api::Protocol;

use super::{ArpEntry, SocketEntry};
use crate::error::CollectorError;

/// TCP_LISTEN in `/proc/net/tcp`
const TCP_LISTEN: u8 = 0x0A;
/// TCP_CLOSE, the state of unconnected UDP sockets
const UDP_UNCONNECTED: u8 = 0x07;
/// ATF_COM: the neighbour entry is complete
const ATF_COM: u32 = 0x2;

/// Parse `/proc/net/arp`, skipping incomplete entries
#[must_use]
pub fn arp(content: &str) -> Vec<ArpEntry> {
    let mut entries = Vec::new();
    for line in content.lines().skip(1) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 6 {
            continue;
        }
        let Ok(ip) = parts[0].parse::<IpAddr>() else {
            continue;
        };
        let flags = u32::from_str_radix(parts[2].trim_start_matches("0x"), 16).unwrap_or(0);
        let mac = parts[3].to_ascii_lowercase();
        if flags & ATF_COM == 0 || mac == "00:00:00:00:00:00" {
            continue;
        }
        entries.push(ArpEntry {
            ip,
            mac,
            device: parts[5].to_string(),
        });
    }
    entries
}

/// Parse one of `/proc/net/{tcp,tcp6,udp,udp6}`
///
/// # Errors
/// Returns `Parse` for a malformed address column.
pub fn proc_net(content: &str, protocol: Protocol) -> Result<Vec<SocketEntry>, CollectorError> {
    let mut entries = Vec::new();
    for line in content.lines().skip(1) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 10 {
            continue;
        }
        let (local, port) = socket_addr(parts[1])?;
        let (remote, remote_port) = socket_addr(parts[2])?;
        let state = u8::from_str_radix(parts[3], 16)
            .map_err(|e| CollectorError::Parse(format!("socket state {}: {e}", parts[3])))?;
        entries.push(SocketEntry {
            protocol,
            local,
            port,
            remote,
            remote_port,
            state,
            uid: parts[7].parse().unwrap_or(0),
            inode: parts[9].parse().unwrap_or(0),
        });
    }
    Ok(entries)
}

impl SocketEntry {
    /// Whether the socket accepts inbound traffic
    #[must_use]
    pub fn is_listening(&self) -> bool {
        match self.protocol {
            Protocol::Tcp => self.state == TCP_LISTEN,
            Protocol::Udp => self.state == UDP_UNCONNECTED && self.remote_port == 0,
        }
    }
}

/// `0100007F:0016` -> `127.0.0.1:22`
///
/// Addresses are printed as host-order 32-bit words.
fn socket_addr(field: &str) -> Result<(IpAddr, u16), CollectorError> {
    let bad = || CollectorError::Parse(format!("socket address {field}"));
    let (addr, port) = field.split_once(':').ok_or_else(bad)?;
    let port = u16::from_str_radix(port, 16).map_err(|_| bad())?;

    let words = addr
        .as_bytes()
        .chunks(8)
        .map(|chunk| {
            std::str::from_utf8(chunk)
                .ok()
                .and_then(|s| u32::from_str_radix(s, 16).ok())
                .map(u32::to_le_bytes)
        })
        .collect::<Option<Vec<[u8; 4]>>>()
        .ok_or_else(bad)?;

    let ip = match words.as_slice() {
        [w] => IpAddr::V4(Ipv4Addr::from(*w)),
        [a, b, c, d] => {
            let mut octets = [0u8; 16];
            for (i, word) in [a, b, c, d].into_iter().enumerate() {
                octets[i * 4..i * 4 + 4].copy_from_slice(word);
            }
            let v6 = Ipv6Addr::from(octets);
            v6.to_ipv4_mapped().map_or(IpAddr::V6(v6), IpAddr::V4)
        }
        _ => return Err(bad()),
    };
    Ok((ip, port))
}

/// `socket:[12345]` -> `12345`
#[must_use]
pub fn socket_inode(link: &str) -> Option<u64> {
    link.strip_prefix("socket:[")?.strip_suffix(']')?.parse().ok()
}

/// Split `/proc/<pid>/cmdline`
#[must_use]
pub fn cmdline(raw: &[u8]) -> Vec<String> {
    raw.split(|b| *b == 0)
        .filter(|arg| !arg.is_empty())
        .map(|arg| String::from_utf8_lossy(arg).into_owned())
        .collect()
}

/// Real uid from `/proc/<pid>/status`
#[must_use]
pub fn status_uid(content: &str) -> Option<u32> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("Uid:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|uid| uid.parse().ok())
}

/// uid -> user name from `/etc/passwd`
#[must_use]
pub fn passwd(content: &str) -> HashMap<u32, String> {
    content
        .lines()
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| {
            let mut fields = line.split(':');
            let name = fields.next()?;
            let uid = fields.nth(1)?.parse().ok()?;
            Some((uid, name.to_string()))
        })
        .collect()
}

/// SMBIOS chassis type number -> chassis name
#[must_use]
pub fn chassis_name(chassis_type: &str) -> Option<&'static str> {
    let name = match chassis_type.trim().parse::<u8>().ok()? {
        3 | 4 | 5 | 6 | 7 | 13 | 15 | 16 | 24 | 35 | 36 => "desktop",
        8 | 9 | 10 | 14 | 31 | 32 => "laptop",
        11 => "handset",
        30 => "tablet",
        17 | 23 | 25 | 28 | 29 => "server",
        1 => "vm",
        _ => return None,
    };
    Some(name)
}

/// `KEY=value` pairs of an os-release file, quotes removed
#[must_use]
pub fn os_release(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
            Some((key.trim().to_string(), value.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arp() {
        let content = "\
IP address       HW type     Flags       HW address            Mask     Device
192.168.1.1      0x1         0x2         AA:BB:CC:DD:EE:01     *        eth0
192.168.1.7      0x1         0x0         00:00:00:00:00:00     *        eth0
192.168.1.9      0x1         0x2         aa:bb:cc:dd:ee:09     *        eth0
";
        let entries = arp(content);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].ip, "192.168.1.1".parse::<IpAddr>().unwrap());
        assert_eq!(entries[0].mac, "aa:bb:cc:dd:ee:01");
        assert_eq!(entries[1].device, "eth0");
    }

    #[test]
    fn test_parse_proc_net_tcp() {
        let content = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000:0016 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 18212 1 0000000000000000 100 0 0 10 0
   1: 0100007F:0CEA 00000000:0000 0A 00000000:00000000 00:00000000 00000000   112        0 20412 1 0000000000000000 100 0 0 10 0
   2: 0201A8C0:0016 0101A8C0:D431 01 00000000:00000000 02:000A7B0F 00000000     0        0 40112 4 0000000000000000 20 4 29 10 -1
";
        let entries = proc_net(content, Protocol::Tcp).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].local, "0.0.0.0".parse::<IpAddr>().unwrap());
        assert_eq!(entries[0].port, 22);
        assert!(entries[0].is_listening());
        assert_eq!(entries[1].local, "127.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(entries[1].port, 3306);
        assert_eq!(entries[1].uid, 112);
        assert_eq!(entries[1].inode, 20412);
        assert_eq!(entries[2].local, "192.168.1.2".parse::<IpAddr>().unwrap());
        assert!(!entries[2].is_listening());
    }

    #[test]
    fn test_parse_proc_net_tcp6() {
        let content = "\
  sl  local_address                         remote_address                        st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000000000000000000000000000:0050 00000000000000000000000000000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 31001 1 0000000000000000 100 0 0 10 0
   1: 00000000000000000000000001000000:0277 00000000000000000000000000000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 31002 1 0000000000000000 100 0 0 10 0
   2: 0000000000000000FFFF00000100007F:1F90 00000000000000000000000000000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 31003 1 0000000000000000 100 0 0 10 0
";
        let entries = proc_net(content, Protocol::Tcp).unwrap();
        assert_eq!(entries[0].local, "::".parse::<IpAddr>().unwrap());
        assert_eq!(entries[0].port, 80);
        assert_eq!(entries[1].local, "::1".parse::<IpAddr>().unwrap());
        assert_eq!(entries[1].port, 631);
        assert_eq!(entries[2].local, "127.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(entries[2].port, 8080);
    }

    #[test]
    fn test_udp_listening() {
        let content = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode ref pointer drops
  1: 00000000:0044 00000000:0000 07 00000000:00000000 00:00000000 00000000     0        0 15000 2 0000000000000000 0
";
        let entries = proc_net(content, Protocol::Udp).unwrap();
        assert_eq!(entries[0].port, 68);
        assert!(entries[0].is_listening());
    }

    #[test]
    fn test_malformed_address() {
        let content = "header\n 0: zz:0016 00000000:0000 0A 0 0 0 0 0 1\n";
        assert!(proc_net(content, Protocol::Tcp).is_err());
    }

    #[test]
    fn test_process_helpers() {
        assert_eq!(socket_inode("socket:[4242]"), Some(4242));
        assert_eq!(socket_inode("pipe:[4242]"), None);
        assert_eq!(
            cmdline(b"/usr/sbin/sshd\0-D\0\0"),
            vec!["/usr/sbin/sshd".to_string(), "-D".to_string()]
        );
        assert_eq!(
            status_uid("Name:\tsshd\nUid:\t0\t0\t0\t0\nGid:\t0\t0\t0\t0\n"),
            Some(0)
        );
        let users = passwd("root:x:0:0:root:/root:/bin/bash\n# comment\nmysql:x:112:120::/nonexistent:/bin/false\n");
        assert_eq!(users.get(&112).map(String::as_str), Some("mysql"));
        assert_eq!(users.get(&0).map(String::as_str), Some("root"));
    }

    #[test]
    fn test_parse_os_release() {
        let fields = os_release(
            "# raspberry pi\nPRETTY_NAME=\"Raspbian GNU/Linux 11 (bullseye)\"\nID=raspbian\nID_LIKE=debian\nVERSION_ID='11'\n\n",
        );
        assert_eq!(fields["ID"], "raspbian");
        assert_eq!(fields["ID_LIKE"], "debian");
        assert_eq!(fields["VERSION_ID"], "11");
        assert_eq!(fields["PRETTY_NAME"], "Raspbian GNU/Linux 11 (bullseye)");
    }

    #[test]
    fn test_chassis_name() {
        assert_eq!(chassis_name("10\n"), Some("laptop"));
        assert_eq!(chassis_name("17"), Some("server"));
        assert_eq!(chassis_name("2"), None);
    }
}
