use std::{collections::BTreeMap, path::Path};

use {
    serde::{Deserialize, Serialize},
    tracing::debug,
};

use crate::{account::AccountConfig, error::ConfigError};

/// Auto-away / auto-xa behaviour, shared by all accounts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdleConfig {
    pub autoaway: bool,
    /// Minutes of inactivity before going away.
    pub autoawaytime: u64,
    /// `$S` is replaced by the current status message, `$T` by the idle minutes.
    pub autoaway_message: String,
    pub autoxa: bool,
    /// Minutes of inactivity before going extended away.
    pub autoxatime: u64,
    pub autoxa_message: String,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            autoaway: true,
            autoawaytime: 5,
            autoaway_message: "$S (Away as a result of being idle more than $T min)".into(),
            autoxa: true,
            autoxatime: 15,
            autoxa_message: "$S (Not available as a result of being idle more than $T min)"
                .into(),
        }
    }
}

impl IdleConfig {
    /// Whether auto-status is enabled for `state` (`"away"` or `"xa"`).
    pub fn enabled_for(&self, state: &str) -> bool {
        match state {
            "away" => self.autoaway,
            "xa" => self.autoxa,
            _ => false,
        }
    }

    /// Status message to publish while idle in `state`.
    ///
    /// Falls back to the user's own status message when no template is set.
    pub fn idle_status_message(&self, state: &str, status_message: &str) -> String {
        let (template, minutes) = match state {
            "away" => (&self.autoaway_message, self.autoawaytime),
            "xa" => (&self.autoxa_message, self.autoxatime),
            _ => return status_message.to_string(),
        };
        if template.is_empty() {
            return status_message.to_string();
        }
        template
            .replace("$S", status_message)
            .replace("$T", &minutes.to_string())
    }
}

/// Top-level settings file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Accounts keyed by their local name.
    pub accounts: BTreeMap<String, AccountConfig>,
    pub idle: IdleConfig,
}

impl AppConfig {
    /// Load and validate a TOML settings file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "loading config");
        Self::from_toml_str(&data)
    }

    pub fn from_toml_str(data: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Write the settings back, e.g. after a legacy field was migrated.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let data = self.to_toml_string()?;
        std::fs::write(path, data).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, account) in &self.accounts {
            let invalid = |reason: &str| ConfigError::InvalidAccount {
                account: name.clone(),
                reason: reason.to_string(),
            };
            if account.jid.is_empty() {
                return Err(invalid("JID is required"));
            }
            let Some((node, domain)) = account.jid.split_once('@') else {
                if account.anonymous_auth {
                    continue;
                }
                return Err(invalid("JID must have the form user@domain"));
            };
            if node.is_empty() || domain.is_empty() || domain.contains('/') {
                return Err(invalid("JID must have the form user@domain"));
            }
        }
        Ok(())
    }

    pub fn enabled_accounts(&self) -> impl Iterator<Item = (&String, &AccountConfig)> {
        self.accounts.iter().filter(|(_, a)| a.enabled)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, secrecy::ExposeSecret};

    const SAMPLE: &str = r#"
[idle]
autoawaytime = 10

[accounts.work]
jid = "juliet@capulet.lit"
password = "secret"
resource = "laptop"

[accounts.work.muc_rooms."balcony@chat.capulet.lit"]
autojoin = true

[accounts.old]
jid = "romeo@montague.lit"
enabled = false
"#;

    #[test]
    fn parses_sample_file() {
        let cfg = AppConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(cfg.accounts.len(), 2);
        let work = &cfg.accounts["work"];
        assert_eq!(work.jid, "juliet@capulet.lit");
        assert_eq!(work.password.expose_secret(), "secret");
        assert_eq!(work.resource, "laptop");
        assert!(work.muc_rooms["balcony@chat.capulet.lit"].autojoin);
        assert_eq!(cfg.idle.autoawaytime, 10);
        assert!(cfg.idle.autoxa);

        let enabled: Vec<_> = cfg.enabled_accounts().map(|(n, _)| n.as_str()).collect();
        assert_eq!(enabled, vec!["work"]);
    }

    #[test]
    fn rejects_missing_jid() {
        let err = AppConfig::from_toml_str("[accounts.a]\nresource = \"x\"\n").unwrap_err();
        assert!(err.to_string().contains("JID is required"));
    }

    #[test]
    fn rejects_malformed_jid() {
        let err = AppConfig::from_toml_str("[accounts.a]\njid = \"@capulet.lit\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidAccount { .. }));
    }

    #[test]
    fn anonymous_accounts_may_use_a_domain() {
        let cfg =
            AppConfig::from_toml_str("[accounts.a]\njid = \"anon.lit\"\nanonymous_auth = true\n")
                .unwrap();
        assert!(cfg.accounts["a"].anonymous_auth);
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gajim.toml");
        let cfg = AppConfig::from_toml_str(SAMPLE).unwrap();
        cfg.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.accounts["work"].resource, "laptop");
        assert!(!loaded.accounts["old"].enabled);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = AppConfig::load(Path::new("/nonexistent/gajim.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn idle_message_templates() {
        let idle = IdleConfig::default();
        assert_eq!(
            idle.idle_status_message("away", "Lunch"),
            "Lunch (Away as a result of being idle more than 5 min)"
        );

        let plain = IdleConfig {
            autoxa_message: String::new(),
            ..Default::default()
        };
        assert_eq!(plain.idle_status_message("xa", "Lunch"), "Lunch");
        assert!(plain.enabled_for("away"));
        assert!(!plain.enabled_for("online"));
    }
}
