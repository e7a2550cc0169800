//! Per-capability launch specifications.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::warn;

use concierge_config::InstanceConfig;
use concierge_types::{CapabilityType, LaunchSpec};

use crate::error::McpError;

/// System variables a child server may inherit. Everything else is withheld.
const SAFE_ENV_KEYS: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "SHELL",
    "LANG",
    "LC_ALL",
    "LC_CTYPE",
    "TMPDIR",
    "TEMP",
    "TMP",
    "NODE_PATH",
    "NODE_OPTIONS",
    "npm_config_cache",
    "NPM_CONFIG_PREFIX",
    "XDG_CONFIG_HOME",
    "XDG_DATA_HOME",
    "XDG_CACHE_HOME",
    "VIRTUAL_ENV",
    "UV_CACHE_DIR",
    "UV_PYTHON",
];

/// Build the launch spec for one configured instance from the process environment.
///
/// Relative paths in the instance config are resolved against `base_dir`.
pub fn launch_spec(
    instance_id: &str,
    config: &InstanceConfig,
    base_dir: &Path,
) -> Result<LaunchSpec, McpError> {
    launch_spec_with_env(instance_id, config, base_dir, &|key: &str| std::env::var(key).ok())
}

pub fn launch_spec_with_env(
    instance_id: &str,
    config: &InstanceConfig,
    base_dir: &Path,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<LaunchSpec, McpError> {
    let builder = Builder {
        instance_id,
        config,
        base_dir,
        lookup,
    };
    let mut spec = match config.capability {
        CapabilityType::Gmail => builder.gmail(),
        CapabilityType::Calendar => builder.calendar(),
        CapabilityType::Telegram => builder.telegram(),
        CapabilityType::Whatsapp => builder.whatsapp()?,
        CapabilityType::Slack => builder.slack(),
        CapabilityType::Confluence => builder.atlassian("@aashari/mcp-server-atlassian-confluence"),
        CapabilityType::Jira => builder.atlassian("@aashari/mcp-server-atlassian-jira"),
    };

    if let Some(command) = &config.command {
        spec.command = command.clone();
        spec.args = config.args.clone();
    }
    if let Some(framing) = config.framing {
        spec.framing = framing;
    }
    spec.env
        .extend(config.env.iter().map(|(k, v)| (k.clone(), v.clone())));
    Ok(spec)
}

struct Builder<'a> {
    instance_id: &'a str,
    config: &'a InstanceConfig,
    base_dir: &'a Path,
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Builder<'_> {
    fn base_env(&self) -> BTreeMap<String, String> {
        SAFE_ENV_KEYS
            .iter()
            .filter_map(|key| (self.lookup)(key).map(|value| (key.to_string(), value)))
            .collect()
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    /// Copy the value of the env var *named* in config into `target`.
    fn forward(&self, env: &mut BTreeMap<String, String>, target: &str, source: Option<&String>) {
        let Some(source) = source else {
            return;
        };
        match (self.lookup)(source) {
            Some(value) => {
                env.insert(target.to_string(), value);
            }
            None => {
                warn!(instance = self.instance_id, var = %source, "Credential variable is not set");
                env.insert(target.to_string(), String::new());
            }
        }
    }

    fn spec(&self, command: &str, args: &[&str], env: BTreeMap<String, String>) -> LaunchSpec {
        let mut spec = LaunchSpec::new(self.config.capability, command).with_args(args.iter().copied());
        spec.env = env;
        spec
    }

    fn gmail(&self) -> LaunchSpec {
        let mut env = self.base_env();
        if let Some(dir) = &self.config.credentials_dir {
            let dir = self.resolve(dir);
            env.insert(
                "GMAIL_OAUTH_PATH".into(),
                dir.join("credentials.json").display().to_string(),
            );
            env.insert(
                "GMAIL_CREDENTIALS_PATH".into(),
                dir.join("token.json").display().to_string(),
            );
        }
        self.spec("npx", &["-y", "@gongrzhe/server-gmail-autoauth-mcp"], env)
    }

    fn calendar(&self) -> LaunchSpec {
        let mut env = self.base_env();
        match &self.config.credentials_dir {
            Some(dir) => {
                let dir = self.resolve(dir);
                env.insert(
                    "GOOGLE_OAUTH_CREDENTIALS".into(),
                    dir.join("credentials.json").display().to_string(),
                );
                env.insert(
                    "GOOGLE_CALENDAR_MCP_TOKEN_PATH".into(),
                    dir.join("calendar_tokens.json").display().to_string(),
                );
            }
            None => {
                for key in ["GOOGLE_OAUTH_CREDENTIALS", "GOOGLE_CALENDAR_MCP_TOKEN_PATH"] {
                    if let Some(value) = (self.lookup)(key) {
                        env.insert(key.into(), value);
                    }
                }
            }
        }
        if let Some(account) = &self.config.account {
            env.insert("CALENDAR_ACCOUNT".into(), account.clone());
        }
        if !env.contains_key("GOOGLE_OAUTH_CREDENTIALS") {
            warn!(instance = self.instance_id, "GOOGLE_OAUTH_CREDENTIALS not set, calendar server may fail to start");
        }
        self.spec("npx", &["-y", "@cocal/google-calendar-mcp"], env)
    }

    fn telegram(&self) -> LaunchSpec {
        let mut env = self.base_env();
        self.forward(&mut env, "TELEGRAM_API_ID", self.config.api_id_env.as_ref());
        self.forward(&mut env, "TELEGRAM_API_HASH", self.config.api_hash_env.as_ref());
        self.forward(
            &mut env,
            "TELEGRAM_SESSION_STRING",
            self.config.session_string_env.as_ref(),
        );

        match &self.config.server_dir {
            Some(dir) => {
                let dir = self.resolve(dir).display().to_string();
                self.spec("uv", &["--directory", dir.as_str(), "run", "main.py"], env)
            }
            None => self.spec("uvx", &["telegram-mcp"], env),
        }
    }

    fn whatsapp(&self) -> Result<LaunchSpec, McpError> {
        let dir = self.config.server_dir.as_ref().ok_or_else(|| McpError::Launch {
            server: self.instance_id.to_string(),
            reason: "whatsapp requires server_dir (a local checkout of the server)".into(),
        })?;
        let entry = self.resolve(dir).join("src").join("main.ts").display().to_string();
        Ok(self.spec("node", &[entry.as_str()], self.base_env()))
    }

    fn slack(&self) -> LaunchSpec {
        let mut env = self.base_env();
        self.forward(&mut env, "SLACK_MCP_XOXP_TOKEN", self.config.token_env.as_ref());
        env.insert("SLACK_MCP_ADD_MESSAGE_TOOL".into(), "true".into());
        self.spec(
            "npx",
            &["-y", "slack-mcp-server@latest", "--transport", "stdio"],
            env,
        )
    }

    fn atlassian(&self, package: &str) -> LaunchSpec {
        let mut env = self.base_env();
        if let Some(site) = &self.config.site_name {
            env.insert("ATLASSIAN_SITE_NAME".into(), site.clone());
        }
        if let Some(email) = &self.config.user_email {
            env.insert("ATLASSIAN_USER_EMAIL".into(), email.clone());
        }
        self.forward(&mut env, "ATLASSIAN_API_TOKEN", self.config.api_token_env.as_ref());
        self.spec("npx", &["-y", package], env)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concierge_types::Framing;

    fn lookup(key: &str) -> Option<String> {
        match key {
            "PATH" => Some("/usr/bin".into()),
            "AWS_SECRET_ACCESS_KEY" => Some("leak".into()),
            "TG_ID" => Some("12345".into()),
            "SLACK_TOKEN" => Some("xoxp-1".into()),
            _ => None,
        }
    }

    fn build(config: &InstanceConfig) -> Result<LaunchSpec, McpError> {
        launch_spec_with_env("inst", config, Path::new("/srv/concierge"), &lookup)
    }

    #[test]
    fn test_gmail_paths_resolved_against_base_dir() {
        let mut config = InstanceConfig::new(CapabilityType::Gmail);
        config.credentials_dir = Some("creds/work".into());
        let spec = build(&config).unwrap();
        assert_eq!(spec.command, "npx");
        assert_eq!(
            spec.env["GMAIL_OAUTH_PATH"],
            "/srv/concierge/creds/work/credentials.json"
        );
        assert_eq!(spec.env["PATH"], "/usr/bin");
        assert!(!spec.env.contains_key("AWS_SECRET_ACCESS_KEY"));
    }

    #[test]
    fn test_telegram_forwards_named_credentials() {
        let mut config = InstanceConfig::new(CapabilityType::Telegram);
        config.api_id_env = Some("TG_ID".into());
        config.api_hash_env = Some("TG_HASH".into());
        config.server_dir = Some("/opt/telegram-mcp".into());
        let spec = build(&config).unwrap();
        assert_eq!(spec.command, "uv");
        assert_eq!(spec.args, vec!["--directory", "/opt/telegram-mcp", "run", "main.py"]);
        assert_eq!(spec.env["TELEGRAM_API_ID"], "12345");
        assert_eq!(spec.env["TELEGRAM_API_HASH"], "");
    }

    #[test]
    fn test_telegram_without_checkout_uses_uvx() {
        let spec = build(&InstanceConfig::new(CapabilityType::Telegram)).unwrap();
        assert_eq!(spec.command_line(), "uvx telegram-mcp");
    }

    #[test]
    fn test_whatsapp_requires_server_dir() {
        let err = build(&InstanceConfig::new(CapabilityType::Whatsapp)).unwrap_err();
        assert!(matches!(err, McpError::Launch { .. }));
        assert!(err.is_operational());
    }

    #[test]
    fn test_slack_enables_write_tools() {
        let mut config = InstanceConfig::new(CapabilityType::Slack);
        config.token_env = Some("SLACK_TOKEN".into());
        let spec = build(&config).unwrap();
        assert_eq!(spec.env["SLACK_MCP_XOXP_TOKEN"], "xoxp-1");
        assert_eq!(spec.env["SLACK_MCP_ADD_MESSAGE_TOOL"], "true");
    }

    #[test]
    fn test_jira_and_confluence_packages() {
        let mut config = InstanceConfig::new(CapabilityType::Jira);
        config.site_name = Some("acme".into());
        let spec = build(&config).unwrap();
        assert_eq!(spec.args, vec!["-y", "@aashari/mcp-server-atlassian-jira"]);
        assert_eq!(spec.env["ATLASSIAN_SITE_NAME"], "acme");

        let spec = build(&InstanceConfig::new(CapabilityType::Confluence)).unwrap();
        assert_eq!(spec.args[1], "@aashari/mcp-server-atlassian-confluence");
    }

    #[test]
    fn test_overrides_win() {
        let mut config = InstanceConfig::new(CapabilityType::Gmail);
        config.command = Some("/usr/local/bin/gmail-mcp".into());
        config.args = vec!["--stdio".into()];
        config.framing = Some(Framing::ContentLength);
        config.env.insert("DEBUG".into(), "1".into());
        let spec = build(&config).unwrap();
        assert_eq!(spec.command_line(), "/usr/local/bin/gmail-mcp --stdio");
        assert_eq!(spec.framing, Framing::ContentLength);
        assert_eq!(spec.env["DEBUG"], "1");
    }
}
