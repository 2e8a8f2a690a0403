//! Which local process owns a client connection
//!
//! Resolution is best effort. Anything that cannot be answered yields `None`,
//! which callers treat as "not a watched process".

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
}

#[cfg_attr(test, mockall::automock)]
pub trait ProcessResolver: Send + Sync {
    /// Owning process of the client end of a connection to the proxy
    fn resolve(&self, client: SocketAddr) -> Option<ProcessInfo>;
}

/// Configured pids and process names. Empty means no restriction.
#[derive(Debug, Clone, Default)]
pub struct ProcessFilter {
    pids: Vec<u32>,
    names: Vec<String>,
}

impl ProcessFilter {
    pub fn new(pids: Vec<u32>, names: Vec<String>) -> Self {
        Self {
            pids,
            names: names.iter().map(|n| normalize_name(n)).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pids.is_empty() && self.names.is_empty()
    }

    pub fn matches(&self, process: &ProcessInfo) -> bool {
        if self.pids.contains(&process.pid) {
            return true;
        }
        let name = normalize_name(&process.name);
        self.names.iter().any(|n| *n == name)
    }
}

fn normalize_name(name: &str) -> String {
    let lower = name.trim().to_ascii_lowercase();
    lower.strip_suffix(".exe").map(str::to_string).unwrap_or(lower)
}

/// Resolver backed by the operating system's socket tables
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcessResolver;

impl ProcessResolver for SystemProcessResolver {
    #[cfg(target_os = "linux")]
    fn resolve(&self, client: SocketAddr) -> Option<ProcessInfo> {
        linux::resolve(client)
    }

    #[cfg(not(target_os = "linux"))]
    fn resolve(&self, _client: SocketAddr) -> Option<ProcessInfo> {
        None
    }
}

/// Parse an address column of `/proc/net/tcp{,6}` such as `0100007F:1F90`.
/// The address words are printed in host byte order.
fn parse_proc_socket(field: &str) -> Option<SocketAddr> {
    let (addr, port) = field.split_once(':')?;
    let port = u16::from_str_radix(port, 16).ok()?;

    let ip = match addr.len() {
        8 => {
            let word = u32::from_str_radix(addr, 16).ok()?;
            IpAddr::V4(Ipv4Addr::from(word.to_ne_bytes()))
        }
        32 => {
            let mut bytes = [0u8; 16];
            for (i, chunk) in bytes.chunks_mut(4).enumerate() {
                let word = u32::from_str_radix(&addr[i * 8..i * 8 + 8], 16).ok()?;
                chunk.copy_from_slice(&word.to_ne_bytes());
            }
            IpAddr::V6(Ipv6Addr::from(bytes))
        }
        _ => return None,
    };

    Some(SocketAddr::new(ip, port))
}

fn canonical(addr: SocketAddr) -> SocketAddr {
    SocketAddr::new(addr.ip().to_canonical(), addr.port())
}

/// Socket inode whose local end is `local`, from the text of a tcp table
fn find_inode(table: &str, local: SocketAddr) -> Option<u64> {
    let local = canonical(local);
    table.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let addr = parse_proc_socket(fields.get(1)?)?;
        if canonical(addr) != local {
            return None;
        }
        fields.get(9)?.parse().ok()
    })
}

#[cfg(target_os = "linux")]
mod linux {
    use super::{find_inode, ProcessInfo};
    use std::fs;
    use std::net::SocketAddr;

    pub(super) fn resolve(client: SocketAddr) -> Option<ProcessInfo> {
        let inode = ["/proc/net/tcp", "/proc/net/tcp6"]
            .iter()
            .filter_map(|path| fs::read_to_string(path).ok())
            .find_map(|table| find_inode(&table, client))?;
        let target = format!("socket:[{inode}]");

        for entry in fs::read_dir("/proc").ok()?.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            let Ok(fds) = fs::read_dir(entry.path().join("fd")) else {
                continue;
            };
            let owns = fds.flatten().any(|fd| {
                fs::read_link(fd.path())
                    .map(|link| link.to_string_lossy() == target)
                    .unwrap_or(false)
            });
            if owns {
                let name = fs::read_to_string(entry.path().join("comm"))
                    .map(|s| s.trim().to_string())
                    .unwrap_or_default();
                tracing::trace!(pid, name = %name, "Resolved client process");
                return Some(ProcessInfo { pid, name });
            }
        }
        None
    }
}
