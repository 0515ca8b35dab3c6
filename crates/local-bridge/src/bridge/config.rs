use std::{
    borrow::Cow,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

const CONFIG_ENV: &str = "BRIDGE_CONFIG";
const CONFIG_CANDIDATES: [&str; 3] = ["bridge.toml", "bridge.yaml", "bridge.yml"];

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        let p = normalize_explicit_path(&p)?;
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        });
    }

    // clap already folds BRIDGE_CONFIG into the flag; this covers callers that bypass clap.
    if let Some(p) = std::env::var_os(CONFIG_ENV) {
        if !p.is_empty() {
            let p = normalize_explicit_path(Path::new(&p))?;
            return Ok(ResolvedConfigPath {
                path: p,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Ok(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    let p = p.to_path_buf();

    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(&p) {
        if m.is_dir() {
            if let Ok(discovered) = discover_config_path(&p) {
                return Ok(discovered);
            }
            return Ok(p.join(CONFIG_CANDIDATES[0]));
        }
        return Ok(p);
    }

    // Non-existent path: default to .toml if no extension.
    let mut out = p;
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    for c in CONFIG_CANDIDATES {
        let p = dir.join(c);
        if fs::metadata(&p).is_ok_and(|m| m.is_file()) {
            return Ok(p);
        }
    }
    anyhow::bail!("config: no bridge.* found in {}", dir.display())
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    // Linux: system-wide default.
    #[cfg(target_os = "linux")]
    {
        return Ok(PathBuf::from("/etc/local-bridge/bridge.toml"));
    }

    // Other OSes: per-user config dir.

    #[cfg(not(target_os = "linux"))]
    {
        let proj = directories::ProjectDirs::from("dev", "local-bridge", "local-bridge")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join(CONFIG_CANDIDATES[0]))
    }
}

/// Writes the default template to `path` if nothing is there yet. Returns true when created.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) => {
            if m.is_file() {
                return Ok(false);
            }
            anyhow::bail!(
                "config: {} exists but is not a regular file",
                path.display()
            );
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = default_config_template_for_path(path)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
    }

    let mut f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn default_config_template_for_path(path: &Path) -> anyhow::Result<&'static str> {
    match extension_of(path).as_str() {
        "toml" => Ok(DEFAULT_CONFIG_TEMPLATE_TOML),
        "yaml" | "yml" => Ok(DEFAULT_CONFIG_TEMPLATE_YAML),
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            path.extension()
        ),
    }
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = extension_of(path);
    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!("config: unsupported config extension {}", ext),
    };

    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Public HTTP listener: previews, outbound proxy, health and metrics.
    pub api_addr: String,
    /// WebSocket listener tunnel clients register on.
    pub tunnel_addr: String,
    pub max_body_bytes: usize,
    pub logging: LoggingConfig,
    pub tunnel: TunnelConfig,
    pub outbound: OutboundConfig,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub response_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct OutboundConfig {
    pub timeout: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    api_addr: Option<String>,
    tunnel_addr: Option<String>,
    #[serde(default)]
    max_body_bytes: i64,
    logging: Option<FileLogging>,
    tunnel: Option<FileTunnel>,
    outbound: Option<FileOutbound>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTunnel {
    response_timeout_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileOutbound {
    timeout_ms: Option<i64>,
}

fn non_empty(v: Option<&String>, default: &str) -> String {
    v.map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or(default)
        .to_string()
}

fn millis_or(v: Option<i64>, default_ms: u64) -> Duration {
    match v {
        Some(ms) if ms > 0 => Duration::from_millis(ms as u64),
        _ => Duration::from_millis(default_ms),
    }
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let cfg = Config {
            api_addr: non_empty(fc.api_addr.as_ref(), ":8080"),
            tunnel_addr: non_empty(fc.tunnel_addr.as_ref(), ":8081"),
            max_body_bytes: if fc.max_body_bytes > 0 {
                fc.max_body_bytes as usize
            } else {
                10 * 1024 * 1024
            },
            logging: LoggingConfig {
                level: non_empty(fc.logging.as_ref().and_then(|l| l.level.as_ref()), "info"),
                format: non_empty(fc.logging.as_ref().and_then(|l| l.format.as_ref()), "json"),
                output: non_empty(fc.logging.as_ref().and_then(|l| l.output.as_ref()), "stderr"),
                add_source: fc.logging.as_ref().is_some_and(|l| l.add_source),
            },
            tunnel: TunnelConfig {
                response_timeout: millis_or(
                    fc.tunnel.as_ref().and_then(|t| t.response_timeout_ms),
                    30_000,
                ),
            },
            outbound: OutboundConfig {
                timeout: millis_or(fc.outbound.as_ref().and_then(|o| o.timeout_ms), 30_000),
            },
        };

        if cfg.api_addr == cfg.tunnel_addr {
            anyhow::bail!(
                "config: api_addr and tunnel_addr must differ (both {})",
                cfg.api_addr
            );
        }
        Ok(cfg)
    }
}

/// Config files use the shorthand `":PORT"` for "all interfaces"; `SocketAddr` parsing wants
/// an explicit host.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# local-bridge configuration (auto-generated)
#
# Created because no configuration file existed at the resolved config path.
# Tunnel clients connect to ws://<host>:8081/ws/<user>/<component> and public
# traffic for them arrives at http://<host>:8080/preview/<user>/<component>/...

api_addr = ":8080"
tunnel_addr = ":8081"
max_body_bytes = 10485760

[tunnel]
response_timeout_ms = 30000

[outbound]
timeout_ms = 30000

[logging]
level = "info"
format = "json"
output = "stderr"
add_source = false
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# local-bridge configuration (auto-generated)
#
# Created because no configuration file existed at the resolved config path.
# Tunnel clients connect to ws://<host>:8081/ws/<user>/<component> and public
# traffic for them arrives at http://<host>:8080/preview/<user>/<component>/...

api_addr: ":8080"
tunnel_addr: ":8081"
max_body_bytes: 10485760

tunnel:
  response_timeout_ms: 30000

outbound:
  timeout_ms: 30000

logging:
  level: "info"
  format: "json"
  output: "stderr"
  add_source: false
"#;
