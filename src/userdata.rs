//! Cloud-init userdata for runner VMs: the boot script that installs and
//! registers the agent, plus the pre/post-job hooks that write metric files.

use serde::Serialize;

use crate::config::{Config, GithubPath};
use crate::naming::InstanceName;

#[derive(Debug, Serialize)]
pub struct UserData {
    pub write_files: Vec<WriteFile>,
    pub runcmd: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct WriteFile {
    pub path: String,
    pub content: String,
    pub permissions: String,
}

fn github_url(path: &GithubPath) -> String {
    match path {
        GithubPath::Repo { owner, repo } => format!("https://github.com/{owner}/{repo}"),
        GithubPath::Org { org } => format!("https://github.com/{org}"),
    }
}

impl UserData {
    pub fn for_runner(config: &Config, name: &InstanceName, registration_token: &str) -> Self {
        let group_flag = config
            .github_runner_group
            .as_deref()
            .map(|group| format!("--runnergroup '{group}'"))
            .unwrap_or_default();

        let setup = include_str!("../scripts/setup-runner.sh")
            .replace("___GITHUB_URL___", &github_url(&config.github_path))
            .replace("___REGISTRATION_TOKEN___", registration_token)
            .replace("___RUNNER_NAME___", name.as_str())
            .replace("___LABELS___", &config.runner_labels.join(","))
            .replace("___RUNNER_GROUP_FLAG___", &group_flag);

        let mut write_files = vec![
            WriteFile {
                path: "/opt/setup-runner.sh".into(),
                content: setup,
                permissions: "0755".into(),
            },
            WriteFile {
                path: "/opt/pre-job.sh".into(),
                content: include_str!("../scripts/pre-job.sh").into(),
                permissions: "0755".into(),
            },
            WriteFile {
                path: "/opt/post-job.sh".into(),
                content: include_str!("../scripts/post-job.sh").into(),
                permissions: "0755".into(),
            },
            WriteFile {
                path: "/etc/runner-env".into(),
                content: runner_env(config),
                permissions: "0600".into(),
            },
        ];

        if !config.ssh_debug_connections.is_empty() {
            write_files.push(WriteFile {
                path: "/home/ubuntu/.ssh-debug-info".into(),
                content: ssh_debug_info(config),
                permissions: "0644".into(),
            });
        }

        Self {
            write_files,
            runcmd: vec!["/opt/setup-runner.sh".into()],
        }
    }

    pub fn to_user_data(&self) -> serde_yaml::Result<String> {
        Ok(format!("#cloud-config\n{}", serde_yaml::to_string(self)?))
    }
}

// Environment consumed by setup-runner.sh and the job hooks. Only the
// configured knobs appear; the scripts treat absence as "feature off".
fn runner_env(config: &Config) -> String {
    let mut lines = vec![];

    if let Some(proxy) = &config.proxy {
        if let Some(http) = &proxy.http {
            lines.push(format!("HTTP_PROXY={http}"));
        }
        if let Some(https) = &proxy.https {
            lines.push(format!("HTTPS_PROXY={https}"));
        }
        if let Some(no_proxy) = &proxy.no_proxy {
            lines.push(format!("NO_PROXY={no_proxy}"));
        }
    }
    if let Some(mirror) = &config.dockerhub_mirror {
        lines.push(format!("DOCKERHUB_MIRROR={mirror}"));
    }
    if let Some(aproxy) = &config.aproxy_redirect_address {
        lines.push(format!("APROXY_ADDRESS={aproxy}"));
    }
    if let Some(policy) = &config.repo_policy_compliance {
        lines.push(format!("REPO_POLICY_URL={}", policy.url));
        lines.push(format!("REPO_POLICY_TOKEN={}", policy.token));
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

fn ssh_debug_info(config: &Config) -> String {
    let mut out = String::new();
    for connection in &config.ssh_debug_connections {
        out.push_str(&format!(
            "{}:{} rsa={} ed25519={}\n",
            connection.host,
            connection.port,
            connection.rsa_fingerprint.as_deref().unwrap_or("-"),
            connection.ed25519_fingerprint.as_deref().unwrap_or("-"),
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OpenStackCredentials, RepoPolicyCompliance};
    use std::path::PathBuf;

    fn test_config() -> Config {
        Config {
            name: "unit-0".into(),
            prefix: "mgr-a".into(),
            github_token: "ghp_test".into(),
            github_path: GithubPath::Repo {
                owner: "my-org".into(),
                repo: "my-repo".into(),
            },
            github_runner_group: None,
            runner_count: 1,
            runner_labels: vec!["self-hosted".into(), "large".into()],
            openstack: OpenStackCredentials {
                auth_url: "https://keystone.example/v3".into(),
                project_name: "ci".into(),
                username: "svc".into(),
                password: "secret".into(),
                user_domain_name: "Default".into(),
                project_domain_name: "Default".into(),
                region_name: "RegionOne".into(),
            },
            openstack_image: "runner-jammy".into(),
            openstack_flavor: "m1.large".into(),
            openstack_network: "ci-net".into(),
            system_user: "runner-manager".into(),
            base_dir: PathBuf::from("/var/lib/runner-manager"),
            ssh_keys_dir: None,
            reconcile_interval_secs: 30,
            proxy: None,
            dockerhub_mirror: None,
            repo_policy_compliance: None,
            aproxy_redirect_address: None,
            reactive: None,
            ssh_debug_connections: vec![],
        }
    }

    #[test]
    fn placeholders_are_substituted() {
        let config = test_config();
        let name = InstanceName::parse("mgr-a", "mgr-a-abc12").unwrap();
        let data = UserData::for_runner(&config, &name, "AABBCC");

        let setup = &data.write_files[0].content;
        assert!(setup.contains("--url \"https://github.com/my-org/my-repo\""));
        assert!(setup.contains("--token \"AABBCC\""));
        assert!(setup.contains("--name \"mgr-a-abc12\""));
        assert!(setup.contains("--labels \"self-hosted,large\""));
        assert!(!setup.contains("___"));
    }

    #[test]
    fn runner_group_flag_only_for_org_scope() {
        let mut config = test_config();
        config.github_path = GithubPath::Org {
            org: "my-org".into(),
        };
        config.github_runner_group = Some("default".into());

        let name = InstanceName::parse("mgr-a", "mgr-a-abc12").unwrap();
        let data = UserData::for_runner(&config, &name, "T");
        assert!(data.write_files[0]
            .content
            .contains("--runnergroup 'default'"));
    }

    #[test]
    fn optional_features_flow_into_runner_env() {
        let mut config = test_config();
        config.proxy = Some(crate::config::ProxyConfig {
            http: Some("http://proxy.example:3128".into()),
            https: None,
            no_proxy: Some("10.0.0.0/8".into()),
        });
        config.dockerhub_mirror = Some("https://mirror.example".into());
        config.repo_policy_compliance = Some(RepoPolicyCompliance {
            url: "https://rpc.example".into(),
            token: "rpc-token".into(),
        });

        let name = InstanceName::parse("mgr-a", "mgr-a-abc12").unwrap();
        let data = UserData::for_runner(&config, &name, "T");
        let env = &data.write_files[3].content;
        assert!(env.contains("HTTP_PROXY=http://proxy.example:3128"));
        assert!(env.contains("NO_PROXY=10.0.0.0/8"));
        assert!(!env.contains("HTTPS_PROXY"));
        assert!(env.contains("DOCKERHUB_MIRROR=https://mirror.example"));
        assert!(env.contains("REPO_POLICY_URL=https://rpc.example"));
        assert!(!env.contains("APROXY_ADDRESS"));
    }

    #[test]
    fn output_is_cloud_config_yaml() {
        let config = test_config();
        let name = InstanceName::parse("mgr-a", "mgr-a-abc12").unwrap();
        let rendered = UserData::for_runner(&config, &name, "T")
            .to_user_data()
            .unwrap();

        assert!(rendered.starts_with("#cloud-config\n"));
        assert!(rendered.contains("write_files:"));
        assert!(rendered.contains("runcmd:"));
    }
}
