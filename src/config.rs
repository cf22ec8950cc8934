use crate::client::ClientConfig;
use crate::operator::Declaration;
use crate::retry::RetryPolicy;
use anyhow::Context;
use indexmap::IndexMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub client: ClientConfig,

    #[serde(default)]
    pub retry: RetryPolicy,

    /// Interval between reconcile passes
    #[serde(default, with = "humantime_serde")]
    pub interval: Option<Duration>,

    /// Run a single pass and exit
    #[serde(default)]
    pub once: bool,

    /// Where to keep reconciliation state, in memory when unset
    #[serde(default)]
    pub state_file: Option<PathBuf>,

    #[serde(default)]
    pub resources: IndexMap<String, Declaration>,
}

pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    serde_yaml::from_reader(file).with_context(|| format!("Failed to parse {}", path.display()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse() {
        let config: Config = serde_yaml::from_str(
            r#"
client:
  url: https://slb.example.com/api
  region: eu-central-1
  accessKey: key
  secretKey: secret
  requestTimeout: 30s
retry:
  timeout: 10m
interval: 1m
stateFile: /var/lib/reconciler/state.json
resources:
  web:
    type: listener
    load_balancer_id: lb-1
    protocol: http
    frontend_port: 80
    backend_port: 8080
    bandwidth: -1
    sticky_session: "on"
    sticky_session_type: insert
    cookie_timeout: 86400
    x_forwarded_for:
      retrieve_slb_ip: true
  network:
    type: vpc
    import: eu-central-1:vpc-1
    vpc_name: main
    tags:
      env: prod
"#,
        )
        .unwrap();

        assert_eq!(config.client.region, "eu-central-1");
        assert_eq!(config.client.request_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.retry.timeout, Duration::from_secs(600));
        assert_eq!(config.retry.poll_interval, Duration::from_secs(3));
        assert_eq!(config.interval, Some(Duration::from_secs(60)));
        assert!(!config.once);
        assert_eq!(config.resources.len(), 2);

        let web = &config.resources["web"];
        assert_eq!(web.kind, "listener");
        assert_eq!(web.desired.get_i64("bandwidth"), Some(-1));
        assert_eq!(web.desired.get_str("sticky_session"), Some("on"));
        assert!(web.desired.get("x_forwarded_for").unwrap().as_map().is_some());

        let network = &config.resources["network"];
        assert_eq!(network.import.as_deref(), Some("eu-central-1:vpc-1"));
        assert!(!network.desired.contains("import"));
    }

    #[test]
    fn load_missing_file() {
        let err = load("/nonexistent/reconciler.yaml").unwrap_err();
        assert!(err.to_string().contains("Failed to open"), "{err}");
    }
}
