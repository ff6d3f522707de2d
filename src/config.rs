use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config file")]
    ConfigFile(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// The single configuration document for one manager unit. Everything the
/// scaler and its clients need is carried here; there are no process-wide
/// singletons behind it.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub name: String,
    pub prefix: String,

    pub github_token: String,
    pub github_path: GithubPath,
    #[serde(default)]
    pub github_runner_group: Option<String>,

    pub runner_count: u32,
    #[serde(default)]
    pub runner_labels: Vec<String>,

    pub openstack: OpenStackCredentials,
    pub openstack_image: String,
    pub openstack_flavor: String,
    pub openstack_network: String,

    /// Local account that owns keyfiles and metric directories.
    pub system_user: String,
    /// Root for keys, metric storage, quarantine and the event log.
    pub base_dir: PathBuf,
    #[serde(default)]
    pub ssh_keys_dir: Option<PathBuf>,

    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,

    /// Global egress proxy handed to runner VMs.
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
    #[serde(default)]
    pub dockerhub_mirror: Option<String>,
    #[serde(default)]
    pub repo_policy_compliance: Option<RepoPolicyCompliance>,
    #[serde(default)]
    pub aproxy_redirect_address: Option<String>,

    #[serde(default)]
    pub reactive: Option<ReactiveConfig>,

    #[serde(default)]
    pub ssh_debug_connections: Vec<SshDebugConnection>,
}

fn default_reconcile_interval() -> u64 {
    30
}

#[derive(Clone, Debug, Deserialize)]
pub struct OpenStackCredentials {
    pub auth_url: String,
    pub project_name: String,
    pub username: String,
    pub password: String,
    pub user_domain_name: String,
    pub project_domain_name: String,
    pub region_name: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub http: Option<String>,
    #[serde(default)]
    pub https: Option<String>,
    #[serde(default)]
    pub no_proxy: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RepoPolicyCompliance {
    pub url: String,
    pub token: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ReactiveConfig {
    pub queue_uri: String,
    pub queue_name: String,
    pub supported_labels: Vec<String>,
    /// How long the broker waits for an ack before redelivering.
    #[serde(default)]
    pub visibility_timeout_secs: Option<u64>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SshDebugConnection {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub rsa_fingerprint: Option<String>,
    #[serde(default)]
    pub ed25519_fingerprint: Option<String>,
}

/// Where runners register: a single repository or a whole organization.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GithubPath {
    Repo { owner: String, repo: String },
    Org { org: String },
}

impl GithubPath {
    pub fn path(&self) -> String {
        match self {
            Self::Repo { owner, repo } => format!("{owner}/{repo}"),
            Self::Org { org } => org.clone(),
        }
    }
}

impl fmt::Display for GithubPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

impl FromStr for GithubPath {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let segments: Vec<&str> = s.split('/').collect();
        match segments.as_slice() {
            [org] if !org.is_empty() => Ok(Self::Org {
                org: (*org).to_string(),
            }),
            [owner, repo] if !owner.is_empty() && !repo.is_empty() => Ok(Self::Repo {
                owner: (*owner).to_string(),
                repo: (*repo).to_string(),
            }),
            _ => Err(format!("invalid github path: {s:?}")),
        }
    }
}

impl<'de> Deserialize<'de> for GithubPath {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .build()?;

        let cfg = settings.try_deserialize::<Config>()?;
        cfg.validate()?;

        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.prefix.is_empty() {
            return Err(ConfigError::Invalid("prefix must not be empty".into()));
        }
        if !self
            .prefix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(ConfigError::Invalid(format!(
                "prefix {:?} must be lowercase alphanumeric with dashes",
                self.prefix
            )));
        }
        if self.github_token.is_empty() {
            return Err(ConfigError::Invalid("github_token must not be empty".into()));
        }
        if self.github_runner_group.is_some()
            && matches!(self.github_path, GithubPath::Repo { .. })
        {
            return Err(ConfigError::Invalid(
                "github_runner_group is only valid with an organization github_path".into(),
            ));
        }
        if let Some(reactive) = &self.reactive {
            if reactive.queue_uri.is_empty() || reactive.queue_name.is_empty() {
                return Err(ConfigError::Invalid(
                    "reactive mode requires both queue_uri and queue_name".into(),
                ));
            }
        }

        Ok(())
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.ssh_keys_dir
            .clone()
            .unwrap_or_else(|| self.base_dir.join(".ssh"))
    }

    pub fn metrics_dir(&self) -> PathBuf {
        self.base_dir.join("metrics")
    }

    pub fn quarantine_dir(&self) -> PathBuf {
        self.base_dir.join("quarantine")
    }

    pub fn events_log_path(&self) -> PathBuf {
        self.base_dir.join("metrics.jsonl")
    }

    pub fn reactive_mode(&self) -> bool {
        self.reactive.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
name: unit-0
prefix: mgr-a
github_token: ghp_test
github_path: my-org/my-repo
runner_count: 3
runner_labels: [self-hosted, large]
openstack:
  auth_url: https://keystone.example/v3
  project_name: ci
  username: svc
  password: secret
  user_domain_name: Default
  project_domain_name: Default
  region_name: RegionOne
openstack_image: runner-jammy
openstack_flavor: m1.large
openstack_network: ci-net
system_user: runner-manager
base_dir: /var/lib/runner-manager
"#
    }

    fn parse(yaml: &str) -> Result<Config, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()?;
        let cfg = settings.try_deserialize::<Config>()?;
        cfg.validate()?;
        Ok(cfg)
    }

    #[test]
    fn minimal_document_parses() {
        let cfg = parse(minimal_yaml()).unwrap();
        assert_eq!(cfg.prefix, "mgr-a");
        assert_eq!(
            cfg.github_path,
            GithubPath::Repo {
                owner: "my-org".into(),
                repo: "my-repo".into()
            }
        );
        assert_eq!(cfg.runner_count, 3);
        assert_eq!(cfg.reconcile_interval_secs, 30);
        assert!(!cfg.reactive_mode());
        assert_eq!(
            cfg.metrics_dir(),
            PathBuf::from("/var/lib/runner-manager/metrics")
        );
    }

    #[test]
    fn org_scope_and_reactive_block() {
        let yaml = format!(
            "{}\ngithub_runner_group: default\nreactive:\n  queue_uri: amqp://mq/\n  queue_name: mgr-a\n  supported_labels: [large, x64]\n",
            minimal_yaml().replace("github_path: my-org/my-repo", "github_path: my-org")
        );
        let cfg = parse(&yaml).unwrap();
        assert_eq!(
            cfg.github_path,
            GithubPath::Org {
                org: "my-org".into()
            }
        );
        assert!(cfg.reactive_mode());
    }

    #[test]
    fn runner_group_is_rejected_for_repo_scope() {
        let yaml = format!("{}\ngithub_runner_group: default\n", minimal_yaml());
        assert!(matches!(parse(&yaml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn empty_prefix_is_rejected() {
        let yaml = minimal_yaml().replace("prefix: mgr-a", "prefix: \"\"");
        assert!(matches!(parse(&yaml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn github_path_rejects_extra_segments() {
        assert!("a/b/c".parse::<GithubPath>().is_err());
        assert!("".parse::<GithubPath>().is_err());
        assert!("/repo".parse::<GithubPath>().is_err());
    }
}
