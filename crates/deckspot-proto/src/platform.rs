use std::path::PathBuf;

/// Port the TLS OAuth callback listener binds to.
pub const OAUTH_PORT: u16 = 39281;
/// Port the loopback dashboard listener binds to.
pub const DASHBOARD_PORT: u16 = 39282;

pub fn data_dir() -> PathBuf {
    // On macOS and Linux, use ~/.local/share/deckspot/ (XDG standard)
    // instead of macOS Application Support for consistency
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".local")
            .join("share")
            .join("deckspot")
    }
    #[cfg(windows)]
    {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("deckspot")
    }
}

pub fn config_dir() -> PathBuf {
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("deckspot")
    }
    #[cfg(windows)]
    {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("deckspot")
    }
}

pub fn cache_dir() -> PathBuf {
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(".cache")
            .join("deckspot")
    }
    #[cfg(windows)]
    {
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("deckspot")
    }
}

#[cfg(unix)]
pub fn librespot_binary_name() -> &'static str {
    "librespot"
}

#[cfg(windows)]
pub fn librespot_binary_name() -> &'static str {
    "librespot.exe"
}

fn find_beside_exe(name: &str) -> Option<PathBuf> {
    let current_exe = std::env::current_exe().ok()?;
    let dir = current_exe.parent()?;
    let p = dir.join(name);
    if p.exists() {
        return Some(p);
    }
    let p = dir.join("bin").join(name);
    if p.exists() {
        return Some(p);
    }
    None
}

fn find_on_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var("PATH").ok()?;
    #[cfg(unix)]
    let sep = ":";
    #[cfg(windows)]
    let sep = ";";
    for dir in path.split(sep) {
        let p = PathBuf::from(dir).join(name);
        if p.exists() {
            return Some(p);
        }
    }
    None
}

/// Find the librespot binary.
/// Checks: beside the current exe (and its bin/ subdir), the bundled
/// location under the data dir, then PATH.
pub fn find_librespot_binary() -> Option<PathBuf> {
    let name = librespot_binary_name();

    if let Some(p) = find_beside_exe(name) {
        return Some(p);
    }

    let bundled = data_dir().join("bin").join(name);
    if bundled.exists() {
        return Some(bundled);
    }

    find_on_path(name)
}

/// Best-effort LAN address, used when no hostname is available for the
/// OAuth redirect URI. The UDP socket is never actually written to.
pub fn lan_ip() -> String {
    let probe = || -> std::io::Result<std::net::SocketAddr> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:80")?;
        socket.local_addr()
    };
    match probe() {
        Ok(addr) => addr.ip().to_string(),
        Err(_) => "127.0.0.1".to_string(),
    }
}

/// Hostname the OAuth redirect URI is built from. Prefers the mDNS name
/// (`<hostname>.local`) so phones on the same network can resolve it.
pub fn mdns_host() -> String {
    #[cfg(unix)]
    {
        if let Ok(name) = std::fs::read_to_string("/etc/hostname") {
            let name = name.trim();
            if !name.is_empty() {
                return format!("{name}.local");
            }
        }
    }
    lan_ip()
}
