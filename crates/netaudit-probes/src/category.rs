//! Probe categories and the interception points behind them

use std::fmt;

use bitflags::bitflags;
use netaudit_core::ProbeSettings;

use crate::error::ProbeError;

bitflags! {
    /// Set of independently switchable probe categories
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ProbeCategory: u32 {
        const TCP_CONNECT = 1 << 0;
        const TCP_ACCEPT = 1 << 1;
        const TCP_CLOSE = 1 << 2;
        const UDP_CONNECT = 1 << 3;
        const UDP_BIND = 1 << 4;
        const UDP_CLOSE = 1 << 5;
    }
}

/// Categories served by the shared close point
pub const CLOSE_CATEGORIES: ProbeCategory = ProbeCategory::TCP_CLOSE.union(ProbeCategory::UDP_CLOSE);

/// Order in which categories are planted and removed
pub const PLANT_ORDER: [ProbeCategory; 6] = [
    ProbeCategory::TCP_CONNECT,
    ProbeCategory::TCP_ACCEPT,
    ProbeCategory::TCP_CLOSE,
    ProbeCategory::UDP_CONNECT,
    ProbeCategory::UDP_BIND,
    ProbeCategory::UDP_CLOSE,
];

impl ProbeCategory {
    /// Parse a comma separated list such as `tcp_connect,udp_bind` or `all`
    pub fn parse_list(list: &str) -> Result<Self, ProbeError> {
        let mut categories = ProbeCategory::empty();
        for name in list.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            if name.eq_ignore_ascii_case("all") {
                categories |= ProbeCategory::all();
                continue;
            }
            let flag = ProbeCategory::from_name(&name.to_ascii_uppercase())
                .ok_or_else(|| ProbeError::UnknownCategory(name.to_string()))?;
            categories |= flag;
        }
        Ok(categories)
    }

    /// Categories switched on in the `[probes]` configuration section
    pub fn from_settings(settings: &ProbeSettings) -> Self {
        let mut categories = ProbeCategory::empty();
        categories.set(ProbeCategory::TCP_CONNECT, settings.tcp_connect);
        categories.set(ProbeCategory::TCP_ACCEPT, settings.tcp_accept);
        categories.set(ProbeCategory::TCP_CLOSE, settings.tcp_close);
        categories.set(ProbeCategory::UDP_CONNECT, settings.udp_connect);
        categories.set(ProbeCategory::UDP_BIND, settings.udp_bind);
        categories.set(ProbeCategory::UDP_CLOSE, settings.udp_close);
        categories
    }

    /// Lower-case names of the categories in the set
    pub fn names(&self) -> Vec<String> {
        self.iter_names()
            .map(|(name, _)| name.to_ascii_lowercase())
            .collect()
    }

    /// Interception points owned by a single category, excluding the shared
    /// close point
    pub fn own_points(self) -> &'static [ProbePoint] {
        if self == ProbeCategory::TCP_CONNECT {
            &[ProbePoint::StreamConnectEntry, ProbePoint::StreamConnectExit]
        } else if self == ProbeCategory::TCP_ACCEPT {
            &[ProbePoint::AcceptExit]
        } else if self == ProbeCategory::UDP_CONNECT {
            &[ProbePoint::DgramConnectEntry, ProbePoint::DgramConnectExit]
        } else if self == ProbeCategory::UDP_BIND {
            &[ProbePoint::BindEntry, ProbePoint::BindExit]
        } else {
            &[]
        }
    }
}

impl fmt::Display for ProbeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        f.write_str(&self.names().join(","))
    }
}

/// When a hook runs relative to the intercepted operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPhase {
    /// Before the operation; sees the call arguments and must not block
    Entry,
    /// After the operation; sees its outcome
    Exit,
}

/// One attachment at an OS function boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbePoint {
    StreamConnectEntry,
    StreamConnectExit,
    DgramConnectEntry,
    DgramConnectExit,
    AcceptExit,
    /// Shared by TCP and UDP close
    CloseEntry,
    BindEntry,
    BindExit,
}

impl ProbePoint {
    pub const ALL: [ProbePoint; 8] = [
        ProbePoint::StreamConnectEntry,
        ProbePoint::StreamConnectExit,
        ProbePoint::DgramConnectEntry,
        ProbePoint::DgramConnectExit,
        ProbePoint::AcceptExit,
        ProbePoint::CloseEntry,
        ProbePoint::BindEntry,
        ProbePoint::BindExit,
    ];

    /// Kernel symbol the point attaches to
    pub fn symbol(&self) -> &'static str {
        match self {
            ProbePoint::StreamConnectEntry | ProbePoint::StreamConnectExit => "inet_stream_connect",
            ProbePoint::DgramConnectEntry | ProbePoint::DgramConnectExit => "inet_dgram_connect",
            ProbePoint::AcceptExit => "sys_accept4",
            ProbePoint::CloseEntry => "sys_close",
            ProbePoint::BindEntry | ProbePoint::BindExit => "sys_bind",
        }
    }

    pub fn phase(&self) -> HookPhase {
        match self {
            ProbePoint::StreamConnectEntry
            | ProbePoint::DgramConnectEntry
            | ProbePoint::CloseEntry
            | ProbePoint::BindEntry => HookPhase::Entry,
            ProbePoint::StreamConnectExit
            | ProbePoint::DgramConnectExit
            | ProbePoint::AcceptExit
            | ProbePoint::BindExit => HookPhase::Exit,
        }
    }
}

impl fmt::Display for ProbePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self.phase() {
            HookPhase::Entry => "entry",
            HookPhase::Exit => "exit",
        };
        write!(f, "{}:{}", self.symbol(), phase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list() {
        let parsed = ProbeCategory::parse_list("tcp_connect, UDP_BIND").unwrap();
        assert_eq!(parsed, ProbeCategory::TCP_CONNECT | ProbeCategory::UDP_BIND);
        assert_eq!(ProbeCategory::parse_list("all").unwrap(), ProbeCategory::all());
        assert_eq!(ProbeCategory::parse_list("").unwrap(), ProbeCategory::empty());
        assert!(matches!(
            ProbeCategory::parse_list("tcp_connect,icmp"),
            Err(ProbeError::UnknownCategory(name)) if name == "icmp"
        ));
    }

    #[test]
    fn test_from_settings() {
        let settings = ProbeSettings {
            tcp_close: false,
            udp_bind: false,
            ..Default::default()
        };
        let categories = ProbeCategory::from_settings(&settings);
        assert!(!categories.contains(ProbeCategory::TCP_CLOSE));
        assert!(!categories.contains(ProbeCategory::UDP_BIND));
        assert!(categories.contains(ProbeCategory::TCP_CONNECT | ProbeCategory::UDP_CLOSE));
    }

    #[test]
    fn test_display() {
        assert_eq!(
            (ProbeCategory::TCP_ACCEPT | ProbeCategory::UDP_CLOSE).to_string(),
            "tcp_accept,udp_close"
        );
        assert_eq!(ProbeCategory::empty().to_string(), "none");
        assert_eq!(ProbePoint::AcceptExit.to_string(), "sys_accept4:exit");
    }

    #[test]
    fn test_close_categories_own_no_points() {
        assert!(ProbeCategory::TCP_CLOSE.own_points().is_empty());
        assert!(ProbeCategory::UDP_CLOSE.own_points().is_empty());
        for category in PLANT_ORDER {
            assert!(!category.own_points().contains(&ProbePoint::CloseEntry));
        }
    }
}
