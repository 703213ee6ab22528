//! Network interface link state from `/sys/class/net`.

use std::fs;
use std::io;
use std::path::Path;

/// Default sysfs root for network interfaces.
pub const NET_ROOT: &str = "/sys/class/net";

/// Kernel `operstate` of an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// The link is up.
    Up,
    /// The link is down or dormant.
    Down,
    /// The driver reports `unknown` (common for PPP and some modems).
    Unknown,
}

impl LinkState {
    fn parse(raw: &str) -> Self {
        match raw.trim() {
            "up" => Self::Up,
            "unknown" => Self::Unknown,
            _ => Self::Down,
        }
    }
}

/// Read the link state of `interface` under `root`.
///
/// # Errors
///
/// Returns an error if the interface does not exist.
pub fn link_state(root: &Path, interface: &str) -> io::Result<LinkState> {
    let raw = fs::read_to_string(root.join(interface).join("operstate"))?;
    Ok(LinkState::parse(&raw))
}

/// Check whether `interface` can carry traffic.
///
/// PPP links used by cellular modems report `unknown` while connected, so
/// `unknown` counts as up when the interface carrier is present.
#[must_use]
pub fn interface_is_up(root: &Path, interface: &str) -> bool {
    match link_state(root, interface) {
        Ok(LinkState::Up) => true,
        Ok(LinkState::Unknown) => fs::read_to_string(root.join(interface).join("carrier"))
            .map(|c| c.trim() == "1")
            .unwrap_or(false),
        Ok(LinkState::Down) | Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_iface(root: &Path, name: &str, operstate: &str, carrier: Option<&str>) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("operstate"), format!("{operstate}\n")).unwrap();
        if let Some(c) = carrier {
            fs::write(dir.join("carrier"), format!("{c}\n")).unwrap();
        }
    }

    #[test]
    fn test_link_state_parse() {
        assert_eq!(LinkState::parse("up\n"), LinkState::Up);
        assert_eq!(LinkState::parse("down"), LinkState::Down);
        assert_eq!(LinkState::parse("dormant"), LinkState::Down);
        assert_eq!(LinkState::parse("unknown"), LinkState::Unknown);
    }

    #[test]
    fn test_interface_up() {
        let tmp = tempfile::tempdir().unwrap();
        write_iface(tmp.path(), "wwan0", "up", None);
        assert!(interface_is_up(tmp.path(), "wwan0"));
    }

    #[test]
    fn test_interface_down() {
        let tmp = tempfile::tempdir().unwrap();
        write_iface(tmp.path(), "wwan0", "down", Some("0"));
        assert!(!interface_is_up(tmp.path(), "wwan0"));
    }

    #[test]
    fn test_ppp_unknown_with_carrier() {
        let tmp = tempfile::tempdir().unwrap();
        write_iface(tmp.path(), "ppp0", "unknown", Some("1"));
        assert!(interface_is_up(tmp.path(), "ppp0"));
    }

    #[test]
    fn test_unknown_without_carrier() {
        let tmp = tempfile::tempdir().unwrap();
        write_iface(tmp.path(), "ppp0", "unknown", None);
        assert!(!interface_is_up(tmp.path(), "ppp0"));
    }

    #[test]
    fn test_missing_interface() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(!interface_is_up(tmp.path(), "eth9"));
        assert!(link_state(tmp.path(), "eth9").is_err());
    }
}
