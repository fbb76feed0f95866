use std::path::PathBuf;

use lattica::LatticaError;

/// Interface declaration from the config file. Forms:
/// `tcp-client:<host>:<port>`, `tcp-server:<bind>:<port>`,
/// `udp:<bind-addr>[:<forward-addr>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterfaceSpec {
    TcpClient { addr: String },
    TcpServer { addr: String },
    Udp { bind: String, forward: Option<String> },
}

impl InterfaceSpec {
    fn parse(value: &str) -> Option<Self> {
        let (kind, rest) = value.split_once(':')?;
        match kind.trim() {
            "tcp-client" => Some(Self::TcpClient { addr: rest.trim().to_string() }),
            "tcp-server" => Some(Self::TcpServer { addr: rest.trim().to_string() }),
            "udp" => {
                let rest = rest.trim();
                // bind and forward are both host:port; split on the comma.
                match rest.split_once(',') {
                    Some((bind, forward)) => Some(Self::Udp {
                        bind: bind.trim().to_string(),
                        forward: Some(forward.trim().to_string()),
                    }),
                    None => Some(Self::Udp { bind: rest.to_string(), forward: None }),
                }
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    pub name: String,
    pub storage_root: PathBuf,
    pub retransmit: bool,
    pub panic_on_interface_error: bool,
    pub rpc_listen: Option<String>,
    pub rpc_key: String,
    pub announce_interval_secs: u64,
    pub interfaces: Vec<InterfaceSpec>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            name: "latticad".into(),
            storage_root: PathBuf::from("."),
            retransmit: false,
            panic_on_interface_error: false,
            rpc_listen: None,
            rpc_key: String::new(),
            announce_interval_secs: 1800,
            interfaces: Vec::new(),
        }
    }
}

impl DaemonConfig {
    pub fn from_ini(ini: &str) -> Result<Self, LatticaError> {
        let mut config = Self::default();
        let mut section = String::new();

        for raw_line in ini.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if line.starts_with('[') && line.ends_with(']') {
                section = line[1..line.len() - 1].trim().to_ascii_lowercase();
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();

            match section.as_str() {
                "lattica" => match key {
                    "name" => config.name = value.to_string(),
                    "storage" => config.storage_root = PathBuf::from(value),
                    "retransmit" => config.retransmit = parse_bool(value),
                    "panic_on_interface_error" => {
                        config.panic_on_interface_error = parse_bool(value)
                    }
                    "rpc_listen" => config.rpc_listen = Some(value.to_string()),
                    "rpc_key" => config.rpc_key = value.to_string(),
                    "announce_interval" => {
                        config.announce_interval_secs =
                            value.parse().map_err(|_| LatticaError::InvalidArgument)?;
                    }
                    _ => {}
                },
                "interfaces" => {
                    if key.starts_with("interface") && !value.is_empty() {
                        match InterfaceSpec::parse(value) {
                            Some(spec) => config.interfaces.push(spec),
                            None => {
                                log::warn!("config: unrecognised interface '{}'", value);
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(config)
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
