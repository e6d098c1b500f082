use crate::error::{Result, SayerError};
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::net::ToSocketAddrs;
use std::path::{Path, PathBuf};

/// Name of the config file looked up in each candidate directory.
pub const CONFIG_FILE_NAME: &str = "config.yaml";

/// Credentials longer than this keep a few characters on each side when redacted.
const REDACT_WIDTH: usize = 9;

/// The closed set of synthesis backends a config may enable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SayerKind {
    /// Microsoft Azure cloud TTS over HTTPS.
    Azure,
    /// A local `say`-style command writing an audio file.
    Say,
}

impl SayerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SayerKind::Azure => "azure",
            SayerKind::Say => "say",
        }
    }
}

impl fmt::Display for SayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Address the RPC server listens on. A bare port means all interfaces.
    pub srv_addr: String,
    pub enabled_sayer: SayerKind,
    #[serde(default)]
    pub azure_sayer: AzureSayerSettings,
    #[serde(default)]
    pub say_sayer: SaySayerSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AzureSayerSettings {
    #[serde(default)]
    pub speech_key: String,
    #[serde(default)]
    pub speech_region: String,
    /// role -> SSML template with a single `{{.}}` placeholder for the text
    #[serde(default)]
    pub roles: HashMap<String, String>,
    pub format_microsoft: String,
    pub format_mime_subtype: String,
    /// Overrides the region-derived endpoint when non-empty.
    #[serde(default)]
    pub endpoint: String,
}

impl Default for AzureSayerSettings {
    fn default() -> Self {
        Self {
            speech_key: String::new(),
            speech_region: String::new(),
            roles: HashMap::new(),
            format_microsoft: "audio-16khz-32kbitrate-mono-mp3".to_string(),
            format_mime_subtype: "mp3".to_string(),
            endpoint: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaySayerSettings {
    pub command: String,
    /// Extension of the output file, also returned as the audio format.
    pub format: String,
    /// Delete each artifact after reading it, and the temp dir on close.
    pub clean: bool,
}

impl Default for SaySayerSettings {
    fn default() -> Self {
        Self {
            command: "say".to_string(),
            format: "aiff".to_string(),
            clean: false,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            srv_addr: "127.0.0.1:50010".to_string(),
            enabled_sayer: SayerKind::Azure,
            azure_sayer: AzureSayerSettings::default(),
            say_sayer: SaySayerSettings::default(),
        }
    }
}

impl Settings {
    /// Loads and validates the YAML file at `path`, layered over defaults
    /// and under `SAYERD_*` environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SayerError::ConfigInvalid(format!("reading {} failed: {}", path.display(), e))
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let settings: Settings = Self::defaults()?
            .add_source(File::from_str(raw, FileFormat::Yaml))
            // e.g. SAYERD_AZURE_SAYER__SPEECH_KEY
            .add_source(
                Environment::with_prefix("SAYERD")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn defaults() -> std::result::Result<ConfigBuilder<DefaultState>, config::ConfigError> {
        let azure = AzureSayerSettings::default();
        let say = SaySayerSettings::default();

        Config::builder()
            .set_default("srv_addr", "127.0.0.1:50010")?
            .set_default("enabled_sayer", SayerKind::Azure.as_str())?
            .set_default("azure_sayer.format_microsoft", azure.format_microsoft)?
            .set_default("azure_sayer.format_mime_subtype", azure.format_mime_subtype)?
            .set_default("azure_sayer.endpoint", azure.endpoint)?
            .set_default("say_sayer.command", say.command)?
            .set_default("say_sayer.format", say.format)?
            .set_default("say_sayer.clean", say.clean)
    }

    /// A snapshot must pass this as a whole before it is ever made live.
    pub fn validate(&self) -> Result<()> {
        if self.srv_addr.trim().is_empty() {
            return Err(invalid("srv_addr must be set"));
        }
        let resolvable = self
            .bind_addr()
            .to_socket_addrs()
            .map(|mut addrs| addrs.next().is_some())
            .unwrap_or(false);
        if !resolvable {
            return Err(invalid(format!(
                "srv_addr {:?} must be a port, :port or host:port",
                self.srv_addr
            )));
        }

        match self.enabled_sayer {
            SayerKind::Azure => {
                let azure = &self.azure_sayer;
                if azure.speech_key.is_empty() {
                    return Err(invalid("azure_sayer.speech_key must be set"));
                }
                if azure.speech_region.is_empty() {
                    return Err(invalid("azure_sayer.speech_region must be set"));
                }
                if azure.roles.is_empty() {
                    return Err(invalid("azure_sayer.roles must be set"));
                }
                if azure.format_microsoft.is_empty() || azure.format_mime_subtype.is_empty() {
                    return Err(invalid(
                        "azure_sayer.format_microsoft and format_mime_subtype must be set",
                    ));
                }
            }
            SayerKind::Say => {
                let say = &self.say_sayer;
                if say.command.trim().is_empty() {
                    return Err(invalid("say_sayer.command must be set"));
                }
                if say.format.is_empty() || say.format.contains(['/', '\\']) {
                    return Err(invalid(format!(
                        "say_sayer.format {:?} must be a plain file extension",
                        say.format
                    )));
                }
            }
        }
        Ok(())
    }

    /// The address handed to the listener; `"50010"` and `":50010"` become `"0.0.0.0:50010"`.
    pub fn bind_addr(&self) -> String {
        let addr = self.srv_addr.trim();
        if addr.parse::<u16>().is_ok() {
            format!("0.0.0.0:{}", addr)
        } else if let Some(port) = addr.strip_prefix(':') {
            format!("0.0.0.0:{}", port)
        } else {
            addr.to_string()
        }
    }

    /// Copy with every credential masked, safe to print.
    pub fn redacted(&self) -> Settings {
        let mut copy = self.clone();
        copy.azure_sayer.speech_key = redact(&copy.azure_sayer.speech_key);
        copy
    }

    pub fn write_yaml<W: Write>(&self, mut dst: W) -> Result<()> {
        let yaml = serde_yaml::to_string(self)
            .map_err(|e| SayerError::ConfigInvalid(format!("serializing config: {}", e)))?;
        dst.write_all(yaml.as_bytes())?;
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> SayerError {
    SayerError::ConfigInvalid(msg.into())
}

/// `"0123456789abcdef"` -> `"012...def"`. Short secrets are masked entirely.
fn redact(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    match chars.len() {
        0 => String::new(),
        n if n <= REDACT_WIDTH => "***".to_string(),
        n => {
            let keep = (REDACT_WIDTH - 3) / 2;
            let head: String = chars[..keep].iter().collect();
            let tail: String = chars[n - keep..].iter().collect();
            format!("{}...{}", head, tail)
        }
    }
}

/// Directories searched, in order, when no explicit config path is given.
pub fn candidate_paths() -> Vec<PathBuf> {
    let mut paths = vec![
        PathBuf::from(CONFIG_FILE_NAME),
        PathBuf::from("/etc/sayerd").join(CONFIG_FILE_NAME),
    ];
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("sayerd").join(CONFIG_FILE_NAME));
    }
    paths
}

/// Picks the config file: the explicit path if given, else the first candidate that exists.
pub fn resolve_path(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if !path.is_file() {
            return Err(invalid(format!("config file {} not found", path.display())));
        }
        return Ok(path.to_path_buf());
    }

    candidate_paths()
        .into_iter()
        .find(|p| p.is_file())
        .ok_or_else(|| invalid("no config file found (tried ./, /etc/sayerd, user config dir)"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const AZURE_YAML: &str = r#"
srv_addr: "127.0.0.1:50123"
enabled_sayer: azure
azure_sayer:
  speech_key: "0123456789abcdef"
  speech_region: "eastus"
  roles:
    narrator: "<speak version='1.0' xml:lang='en-US'><voice name='en-US-JennyNeural'>{{.}}</voice></speak>"
"#;

    #[test]
    #[serial]
    fn test_config_load() {
        let settings = Settings::from_yaml(AZURE_YAML).expect("Failed to load settings");
        assert_eq!(settings.srv_addr, "127.0.0.1:50123");
        assert_eq!(settings.enabled_sayer, SayerKind::Azure);
        assert_eq!(settings.azure_sayer.speech_region, "eastus");
        assert!(settings.azure_sayer.roles.contains_key("narrator"));
        // untouched keys keep their defaults
        assert_eq!(
            settings.azure_sayer.format_microsoft,
            "audio-16khz-32kbitrate-mono-mp3"
        );
        assert_eq!(settings.azure_sayer.format_mime_subtype, "mp3");
        assert_eq!(settings.say_sayer, SaySayerSettings::default());
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, AZURE_YAML).unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.azure_sayer.speech_key, "0123456789abcdef");
        assert_eq!(resolve_path(Some(&path)).unwrap(), path);
    }

    #[test]
    fn test_missing_explicit_path() {
        let err = resolve_path(Some(Path::new("/definitely/not/here.yaml"))).unwrap_err();
        assert!(matches!(err, SayerError::ConfigInvalid(_)));
    }

    #[test]
    #[serial]
    fn test_azure_requires_credentials() {
        let yaml = AZURE_YAML.replace("speech_key: \"0123456789abcdef\"", "speech_key: \"\"");
        let err = Settings::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("speech_key"), "{}", err);

        let yaml = "enabled_sayer: azure\nazure_sayer:\n  speech_key: k\n  speech_region: r\n";
        let err = Settings::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("roles"), "{}", err);
    }

    #[test]
    #[serial]
    fn test_unknown_sayer_rejected() {
        let err = Settings::from_yaml("enabled_sayer: festival\n").unwrap_err();
        assert!(matches!(err, SayerError::ConfigInvalid(_)));
    }

    #[test]
    #[serial]
    fn test_say_needs_no_credentials() {
        let settings =
            Settings::from_yaml("srv_addr: \"50010\"\nenabled_sayer: say\nsay_sayer:\n  clean: true\n")
                .unwrap();
        assert_eq!(settings.enabled_sayer, SayerKind::Say);
        assert!(settings.say_sayer.clean);
        assert_eq!(settings.say_sayer.format, "aiff");
        assert_eq!(settings.bind_addr(), "0.0.0.0:50010");
    }

    #[test]
    fn test_bind_addr_forms() {
        let mut settings = Settings {
            enabled_sayer: SayerKind::Say,
            ..Settings::default()
        };
        for (srv_addr, bind) in [
            ("50010", "0.0.0.0:50010"),
            (":50010", "0.0.0.0:50010"),
            (" :50010 ", "0.0.0.0:50010"),
            ("127.0.0.1:50010", "127.0.0.1:50010"),
            ("[::1]:50010", "[::1]:50010"),
        ] {
            settings.srv_addr = srv_addr.to_string();
            assert!(settings.validate().is_ok(), "{:?} should validate", srv_addr);
            assert_eq!(settings.bind_addr(), bind);
        }
    }

    #[test]
    #[serial]
    fn test_colon_port_binds_all_interfaces() {
        let settings =
            Settings::from_yaml("srv_addr: \":0\"\nenabled_sayer: say\n").unwrap();
        assert_eq!(settings.bind_addr(), "0.0.0.0:0");
        let listener = std::net::TcpListener::bind(settings.bind_addr());
        assert!(listener.is_ok(), "{:?}", listener.err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut settings = Settings {
            enabled_sayer: SayerKind::Say,
            ..Settings::default()
        };
        assert!(settings.validate().is_ok());

        settings.srv_addr = String::new();
        assert!(settings.validate().is_err());

        settings.srv_addr = "localhost:http".to_string();
        assert!(settings.validate().is_err());

        settings.srv_addr = ":".to_string();
        assert!(settings.validate().is_err());

        settings.srv_addr = "127.0.0.1:".to_string();
        assert!(settings.validate().is_err());

        settings.srv_addr = "localhost:50010".to_string();
        settings.say_sayer.format = "../aiff".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_env_override() {
        std::env::set_var("SAYERD_AZURE_SAYER__SPEECH_REGION", "westeurope");
        let result = Settings::from_yaml(AZURE_YAML);
        std::env::remove_var("SAYERD_AZURE_SAYER__SPEECH_REGION");

        assert_eq!(result.unwrap().azure_sayer.speech_region, "westeurope");
    }

    #[test]
    fn test_redact() {
        assert_eq!(redact(""), "");
        assert_eq!(redact("short"), "***");
        assert_eq!(redact("0123456789abcdef"), "012...def");
    }

    #[test]
    #[serial]
    fn test_redacted_copy_leaves_settings_untouched() {
        let settings = Settings::from_yaml(AZURE_YAML).unwrap();
        let redacted = settings.redacted();

        assert_eq!(settings.azure_sayer.speech_key, "0123456789abcdef");
        assert_eq!(redacted.azure_sayer.speech_key, "012...def");
        assert_eq!(redacted.azure_sayer.roles, settings.azure_sayer.roles);

        let mut out = Vec::new();
        redacted.write_yaml(&mut out).unwrap();
        let yaml = String::from_utf8(out).unwrap();
        assert!(yaml.contains("012...def"));
        assert!(!yaml.contains("0123456789abcdef"));
    }
}
