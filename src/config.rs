//! Hand-written reader for the proxy's own configuration grammar: `#`
//! comments, single/double quoted values, top-level `Key value` pairs, and
//! `Block name { ... }` bodies (`Client`, `Server`, `Realm`, `TLS`).
//!
//! Not `toml`/`serde`: this grammar isn't TOML, and the block-name-as-peer
//! shape (`Client nas1.example.com { ... }`) doesn't map onto a derived
//! `Deserialize` impl without contortions.

use std::collections::HashMap;
use std::fs::read_to_string;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};

use clap::Parser;
use engine::TransportKind;

const DEFAULT_UDP_PORT: u16 = 1812;
const DEFAULT_TLS_PORT: u16 = 2083;

/// RFC 6614's conventional RadSec shared secret, used when a `tls`-typed
/// `Client`/`Server` block doesn't configure one explicitly.
const DEFAULT_RADSEC_SECRET: &str = "radsec";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error("{block} is missing required option `{field}`")]
    MissingField { block: String, field: &'static str },
    #[error("unknown TLS context `{0}`")]
    UnknownTls(String),
    #[error("realm references unknown server `{0}`")]
    UnknownServer(String),
    #[error("configuration has no {0}")]
    Empty(&'static str),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match self {
            Self::Error => log::Level::Error,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
        }
    }

    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            1 => Some(Self::Error),
            2 => Some(Self::Warn),
            3 => Some(Self::Info),
            4 => Some(Self::Debug),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum LogDestination {
    Stderr,
    File(PathBuf),
    /// Parsed and validated, but not implemented (§10.3): `main` logs a
    /// warning and falls back to stderr rather than silently downgrading.
    Syslog { facility: String },
}

const SYSLOG_FACILITIES: &[&str] = &[
    "kern", "user", "mail", "daemon", "auth", "syslog", "lpr", "news", "uucp", "cron",
    "authpriv", "ftp", "local0", "local1", "local2", "local3", "local4", "local5", "local6",
    "local7",
];

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub ca_certificate_file: Option<PathBuf>,
    pub ca_certificate_path: Option<PathBuf>,
    pub certificate_file: PathBuf,
    pub certificate_key_file: PathBuf,
    pub certificate_key_password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub name: String,
    pub transport: TransportKind,
    pub secret: String,
    pub tls: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub transport: TransportKind,
    pub secret: String,
    pub tls: Option<String>,
    pub port: u16,
    pub status_server: bool,
}

#[derive(Debug, Clone)]
pub struct RealmConfig {
    pub pattern: String,
    pub server: Option<String>,
    pub reply_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_udp: Vec<SocketAddr>,
    pub listen_tcp: Vec<SocketAddr>,
    pub log_level: LogLevel,
    pub log_destination: LogDestination,
    pub clients: Vec<ClientConfig>,
    pub servers: Vec<ServerConfig>,
    pub realms: Vec<RealmConfig>,
    pub tls: HashMap<String, TlsConfig>,
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
    disable_version_flag = true,
)]
pub struct Cli {
    /// Configuration file path. Defaults to /etc/radsecproxy.conf, falling
    /// back to ./radsecproxy.conf when that default is absent.
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Overrides LogLevel from the configuration file.
    #[arg(short = 'd', long = "debug", value_parser = clap::value_parser!(u8).range(1..=4))]
    pub debug: Option<u8>,

    /// Log to stderr instead of the configured destination.
    #[arg(short = 'f', long = "foreground")]
    pub foreground: bool,

    /// Print the version and exit, without touching the configuration file.
    #[arg(short = 'v', long = "version")]
    pub version: bool,
}

impl Cli {
    /// Resolves the effective config path per §6/§10.2: the `-c` argument if
    /// given, else `/etc/radsecproxy.conf` if it exists, else
    /// `./radsecproxy.conf`.
    pub fn config_path(&self) -> PathBuf {
        if let Some(path) = &self.config {
            return path.clone();
        }
        let system_default = PathBuf::from("/etc/radsecproxy.conf");
        if system_default.exists() {
            system_default
        } else {
            PathBuf::from("radsecproxy.conf")
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = read_to_string(path)?;
        parse(&text)
    }
}

/// A block body's `Key value` pairs plus the 1-based source line each came
/// from, preserving duplicates (§6: "duplicates are implementation-defined";
/// we keep the last one).
struct Block {
    kind: String,
    name: String,
    header_line: usize,
    fields: HashMap<String, (String, usize)>,
}

fn parse(text: &str) -> Result<Config> {
    let lines: Vec<&str> = text.lines().collect();

    let mut listen_udp = Vec::new();
    let mut listen_tcp = Vec::new();
    let mut log_level = LogLevel::Info;
    let mut log_destination = LogDestination::Stderr;

    let mut tls: HashMap<String, TlsConfig> = HashMap::new();
    let mut tls_defined_at: HashMap<String, usize> = HashMap::new();
    let mut client_blocks = Vec::new();
    let mut server_blocks = Vec::new();
    let mut realm_blocks = Vec::new();

    let mut i = 0usize;
    while i < lines.len() {
        let line_no = i + 1;
        let stripped = strip_comment(lines[i]);
        let trimmed = stripped.trim();
        i += 1;

        if trimmed.is_empty() {
            continue;
        }

        if let Some(header) = trimmed.strip_suffix('{') {
            let words = tokenize(header.trim(), line_no)?;
            let (kind, name) = match words.as_slice() {
                [kind, name] => (kind.clone(), name.clone()),
                _ => {
                    return Err(ConfigError::Parse {
                        line: line_no,
                        message: "block header must be `Kind name {`".into(),
                    })
                }
            };

            let mut fields = HashMap::new();
            loop {
                if i >= lines.len() {
                    return Err(ConfigError::Parse {
                        line: line_no,
                        message: format!("unterminated {kind} block"),
                    });
                }
                let body_line_no = i + 1;
                let body_stripped = strip_comment(lines[i]);
                let body_trimmed = body_stripped.trim();
                i += 1;

                if body_trimmed.is_empty() {
                    continue;
                }
                if body_trimmed == "}" {
                    break;
                }

                let words = tokenize(body_trimmed, body_line_no)?;
                let (key, value) = match words.as_slice() {
                    [key, value] => (key.to_ascii_lowercase(), value.clone()),
                    _ => {
                        return Err(ConfigError::Parse {
                            line: body_line_no,
                            message: "expected `Key value`".into(),
                        })
                    }
                };
                fields.insert(key, (value, body_line_no));
            }

            let block = Block { kind: kind.to_ascii_lowercase(), name, header_line: line_no, fields };
            match block.kind.as_str() {
                "tls" => {
                    tls_defined_at.insert(block.name.clone(), block.header_line);
                    tls.insert(block.name.clone(), build_tls(&block)?);
                }
                "client" => client_blocks.push(block),
                "server" => server_blocks.push(block),
                "realm" => realm_blocks.push(block),
                other => {
                    return Err(ConfigError::Parse {
                        line: line_no,
                        message: format!("unknown block kind `{other}`"),
                    })
                }
            }
            continue;
        }

        let words = tokenize(trimmed, line_no)?;
        let (key, value) = match words.as_slice() {
            [key, value] => (key.to_ascii_lowercase(), value.clone()),
            _ => {
                return Err(ConfigError::Parse {
                    line: line_no,
                    message: "expected `Key value`".into(),
                })
            }
        };

        match key.as_str() {
            "listenudp" => listen_udp.push(parse_listen_addr(&value, line_no, DEFAULT_UDP_PORT)?),
            "listentcp" => listen_tcp.push(parse_listen_addr(&value, line_no, DEFAULT_TLS_PORT)?),
            "loglevel" => {
                let n: u8 = value.parse().map_err(|_| ConfigError::Parse {
                    line: line_no,
                    message: format!("LogLevel must be 1-4, got `{value}`"),
                })?;
                log_level = LogLevel::from_number(n).ok_or_else(|| ConfigError::Parse {
                    line: line_no,
                    message: format!("LogLevel must be 1-4, got `{n}`"),
                })?;
            }
            "logdestination" => log_destination = parse_log_destination(&value, line_no)?,
            other => {
                return Err(ConfigError::Parse {
                    line: line_no,
                    message: format!("unknown top-level option `{other}`"),
                })
            }
        }
    }

    let clients = client_blocks
        .iter()
        .map(|b| build_client(b, &tls_defined_at))
        .collect::<Result<Vec<_>>>()?;
    let servers = server_blocks
        .iter()
        .map(|b| build_server(b, &tls_defined_at))
        .collect::<Result<Vec<_>>>()?;
    let realms = realm_blocks.iter().map(build_realm).collect::<Result<Vec<_>>>()?;

    if clients.is_empty() {
        return Err(ConfigError::Empty("clients"));
    }
    if servers.is_empty() {
        return Err(ConfigError::Empty("servers"));
    }
    if realms.is_empty() {
        return Err(ConfigError::Empty("realms"));
    }

    for realm in &realms {
        if let Some(server_name) = &realm.server {
            if !servers.iter().any(|s| &s.name == server_name) {
                return Err(ConfigError::UnknownServer(server_name.clone()));
            }
        }
    }

    Ok(Config {
        listen_udp,
        listen_tcp,
        log_level,
        log_destination,
        clients,
        servers,
        realms,
        tls,
    })
}

fn build_tls(block: &Block) -> Result<TlsConfig> {
    let ca_certificate_file = block.fields.get("cacertificatefile").map(|(v, _)| PathBuf::from(v));
    let ca_certificate_path = block.fields.get("cacertificatepath").map(|(v, _)| PathBuf::from(v));
    if ca_certificate_file.is_none() && ca_certificate_path.is_none() {
        return Err(ConfigError::MissingField {
            block: format!("TLS {}", block.name),
            field: "CACertificateFile/CACertificatePath",
        });
    }

    let certificate_file = required_path(block, "certificatefile")?;
    let certificate_key_file = required_path(block, "certificatekeyfile")?;
    let certificate_key_password = block.fields.get("certificatekeypassword").map(|(v, _)| v.clone());

    Ok(TlsConfig {
        ca_certificate_file,
        ca_certificate_path,
        certificate_file,
        certificate_key_file,
        certificate_key_password,
    })
}

fn required_path(block: &Block, field: &'static str) -> Result<PathBuf> {
    block
        .fields
        .get(field)
        .map(|(v, _)| PathBuf::from(v))
        .ok_or_else(|| ConfigError::MissingField { block: format!("{} {}", block.kind, block.name), field })
}

/// Resolves the `tls` field of a Client/Server block: explicit name (must
/// have been textually defined already, per §6/§10.1), else the
/// `defaultclient`/`defaultserver` → `default` fallback chain.
fn resolve_tls_reference(
    block: &Block,
    fallback_specific: &str,
    tls_defined_at: &HashMap<String, usize>,
) -> Result<Option<String>> {
    if let Some((name, line)) = block.fields.get("tls") {
        let defined_line = tls_defined_at.get(name).ok_or_else(|| ConfigError::UnknownTls(name.clone()))?;
        if *defined_line > *line {
            return Err(ConfigError::Parse {
                line: *line,
                message: format!("TLS context `{name}` must be defined before its first use"),
            });
        }
        return Ok(Some(name.clone()));
    }

    if tls_defined_at.contains_key(fallback_specific) {
        return Ok(Some(fallback_specific.to_string()));
    }
    if tls_defined_at.contains_key("default") {
        return Ok(Some("default".to_string()));
    }
    Ok(None)
}

fn build_client(block: &Block, tls_defined_at: &HashMap<String, usize>) -> Result<ClientConfig> {
    let (type_value, _) = block
        .fields
        .get("type")
        .ok_or_else(|| ConfigError::MissingField { block: format!("Client {}", block.name), field: "type" })?;
    let transport = parse_transport(type_value, block)?;

    let tls = if transport == TransportKind::Stream {
        let resolved = resolve_tls_reference(block, "defaultclient", tls_defined_at)?;
        Some(resolved.ok_or_else(|| ConfigError::UnknownTls("defaultclient/default".into()))?)
    } else {
        None
    };

    let secret = match block.fields.get("secret") {
        Some((v, _)) => v.clone(),
        None if transport == TransportKind::Datagram => {
            return Err(ConfigError::MissingField { block: format!("Client {}", block.name), field: "secret" })
        }
        None => DEFAULT_RADSEC_SECRET.to_string(),
    };

    Ok(ClientConfig { name: block.name.clone(), transport, secret, tls })
}

fn build_server(block: &Block, tls_defined_at: &HashMap<String, usize>) -> Result<ServerConfig> {
    let (type_value, _) = block
        .fields
        .get("type")
        .ok_or_else(|| ConfigError::MissingField { block: format!("Server {}", block.name), field: "type" })?;
    let transport = parse_transport(type_value, block)?;

    let tls = if transport == TransportKind::Stream {
        let resolved = resolve_tls_reference(block, "defaultserver", tls_defined_at)?;
        Some(resolved.ok_or_else(|| ConfigError::UnknownTls("defaultserver/default".into()))?)
    } else {
        None
    };

    let secret = match block.fields.get("secret") {
        Some((v, _)) => v.clone(),
        None if transport == TransportKind::Datagram => {
            return Err(ConfigError::MissingField { block: format!("Server {}", block.name), field: "secret" })
        }
        None => DEFAULT_RADSEC_SECRET.to_string(),
    };

    let default_port = if transport == TransportKind::Stream { DEFAULT_TLS_PORT } else { DEFAULT_UDP_PORT };
    let port = match block.fields.get("port") {
        Some((v, line)) => v.parse().map_err(|_| ConfigError::Parse {
            line: *line,
            message: format!("invalid port `{v}`"),
        })?,
        None => default_port,
    };

    let status_server = match block.fields.get("statusserver") {
        Some((v, line)) => parse_on_off(v, *line)?,
        None => false,
    };

    Ok(ServerConfig { name: block.name.clone(), transport, secret, tls, port, status_server })
}

fn build_realm(block: &Block) -> Result<RealmConfig> {
    let server = block.fields.get("server").map(|(v, _)| v.clone());
    let reply_message = match block.fields.get("replymessage") {
        Some((v, line)) if v.len() > 253 => {
            return Err(ConfigError::Parse {
                line: *line,
                message: "ReplyMessage must be at most 253 bytes".into(),
            })
        }
        Some((v, _)) => Some(v.clone()),
        None => None,
    };

    Ok(RealmConfig { pattern: block.name.clone(), server, reply_message })
}

fn parse_transport(value: &str, block: &Block) -> Result<TransportKind> {
    match value.to_ascii_lowercase().as_str() {
        "udp" => Ok(TransportKind::Datagram),
        "tls" => Ok(TransportKind::Stream),
        other => Err(ConfigError::Parse {
            line: block.header_line,
            message: format!("{} {}: unknown transport type `{other}` (expected udp/tls)", block.kind, block.name),
        }),
    }
}

fn parse_on_off(value: &str, line: usize) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "on" => Ok(true),
        "off" => Ok(false),
        other => Err(ConfigError::Parse { line, message: format!("expected on/off, got `{other}`") }),
    }
}

fn parse_log_destination(value: &str, line: usize) -> Result<LogDestination> {
    if let Some(path) = value.strip_prefix("file://") {
        return Ok(LogDestination::File(PathBuf::from(path)));
    }
    if let Some(facility) = value.strip_prefix("x-syslog:///") {
        if !SYSLOG_FACILITIES.contains(&facility) {
            return Err(ConfigError::Parse {
                line,
                message: format!("unknown syslog facility `{facility}`"),
            });
        }
        return Ok(LogDestination::Syslog { facility: facility.to_string() });
    }
    Err(ConfigError::Parse {
        line,
        message: format!("LogDestination must be file://... or x-syslog:///FACILITY, got `{value}`"),
    })
}

/// Listener address syntax (§6): `*[:port]`, `IPv4[:port]`, `[IPv6][:port]`.
fn parse_listen_addr(value: &str, line: usize, default_port: u16) -> Result<SocketAddr> {
    let normalized = if let Some(rest) = value.strip_prefix('*') {
        format!("0.0.0.0{rest}")
    } else {
        value.to_string()
    };

    if let Ok(addr) = normalized.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = normalized.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }

    Err(ConfigError::Parse { line, message: format!("invalid listener address `{value}`") })
}

/// Resolves a configured Client/Server name (a host, per the block-name
/// convention) to its full address set, once, synchronously (§4.3, §10.1).
pub fn resolve_peer_addresses(host: &str, default_port: u16) -> std::io::Result<Vec<SocketAddr>> {
    let target = if host.contains(':') && host.parse::<std::net::IpAddr>().is_err() {
        host.to_string()
    } else {
        format!("{host}:{default_port}")
    };
    target.to_socket_addrs().map(|it| it.collect())
}

fn strip_comment(line: &str) -> &str {
    let mut in_quotes: Option<char> = None;
    for (idx, ch) in line.char_indices() {
        match in_quotes {
            Some(q) if ch == q => in_quotes = None,
            Some(_) => {}
            None if ch == '"' || ch == '\'' => in_quotes = Some(ch),
            None if ch == '#' => return &line[..idx],
            None => {}
        }
    }
    line
}

/// Splits a line into whitespace-separated words, honoring single/double
/// quoted spans that may themselves contain whitespace.
fn tokenize(line: &str, line_no: usize) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_quotes: Option<char> = None;

    for ch in line.chars() {
        match in_quotes {
            Some(q) if ch == q => in_quotes = None,
            Some(_) => current.push(ch),
            None if ch == '"' || ch == '\'' => in_quotes = Some(ch),
            None if ch.is_whitespace() => {
                if !current.is_empty() {
                    words.push(std::mem::take(&mut current));
                }
            }
            None => current.push(ch),
        }
    }

    if in_quotes.is_some() {
        return Err(ConfigError::Parse { line: line_no, message: "unterminated quote".into() });
    }
    if !current.is_empty() {
        words.push(current);
    }
    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_configuration() {
        let text = r#"
            ListenUDP *:1812
            LogLevel 3

            Client nas1 {
                type udp
                secret "testing123"
            }

            Server radius.example.com {
                type udp
                secret up-secret
            }

            Realm example.com {
                server radius.example.com
            }
        "#;

        let config = parse(text).unwrap();
        assert_eq!(config.listen_udp, vec!["0.0.0.0:1812".parse().unwrap()]);
        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(config.clients.len(), 1);
        assert_eq!(config.clients[0].secret, "testing123");
        assert_eq!(config.servers[0].port, DEFAULT_UDP_PORT);
        assert_eq!(config.realms[0].server.as_deref(), Some("radius.example.com"));
    }

    #[test]
    fn rejects_tls_reference_before_its_definition() {
        let text = r#"
            Client nas1 {
                type tls
                tls mycontext
            }

            TLS mycontext {
                CertificateFile cert.pem
                CertificateKeyFile key.pem
                CACertificateFile ca.pem
            }

            Server radius.example.com {
                type udp
                secret up-secret
            }

            Realm example.com {
                server radius.example.com
            }
        "#;

        match parse(text) {
            Err(ConfigError::Parse { message, .. }) => assert!(message.contains("must be defined before")),
            other => panic!("expected an ordering error, got {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_server_reference_from_a_realm() {
        let text = r#"
            Client nas1 {
                type udp
                secret testing123
            }

            Server radius.example.com {
                type udp
                secret up-secret
            }

            Realm example.com {
                server nonexistent
            }
        "#;

        assert!(matches!(parse(text), Err(ConfigError::UnknownServer(name)) if name == "nonexistent"));
    }

    #[test]
    fn rejects_empty_realm_list() {
        let text = r#"
            Client nas1 {
                type udp
                secret testing123
            }

            Server radius.example.com {
                type udp
                secret up-secret
            }
        "#;

        assert!(matches!(parse(text), Err(ConfigError::Empty("realms"))));
    }
}
