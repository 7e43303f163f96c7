use std::env;
use std::fs;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::{Captures, Regex};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub logger: LoggerConfig,
    pub http: HttpConfig,
    pub dns: DnsConfig,
    #[serde(default)]
    pub switcher: SwitcherConfig,
    pub limiter: LimiterConfig,
    pub resolver: ResolverConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggerConfig {
    pub name: String,
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    pub host: String,
    pub port: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DnsConfig {
    pub host: String,
    pub port: String,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SwitcherConfig {
    #[serde(default)]
    pub settings: Vec<SwitchRuleConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SwitchRuleConfig {
    /// Either a domain name or a regular expression wrapped in slashes.
    pub source: String,
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub answer: Option<AnswerConfig>,
    /// Switches granted per client within the limiter TTL; 0 disables limiting.
    #[serde(rename = "maxCount")]
    pub max_count: u32,
    pub ttl: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnswerConfig {
    #[serde(default)]
    pub a: Option<Ipv4Addr>,
    #[serde(default)]
    pub aaaa: Option<Ipv6Addr>,
    #[serde(default)]
    pub cname: Option<String>,
    #[serde(default)]
    pub https: Option<HttpsAnswerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpsAnswerConfig {
    #[serde(default)]
    pub priority: u16,
    pub target: String,
    #[serde(default)]
    pub alpn: Vec<String>,
    #[serde(default, rename = "ipv4hint")]
    pub ipv4_hint: Vec<Ipv4Addr>,
    #[serde(default, rename = "ipv6hint")]
    pub ipv6_hint: Vec<Ipv6Addr>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimiterConfig {
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolverConfig {
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// "random" or "round-robin"; anything else is rejected at startup.
    pub mode: String,
    pub nameservers: Vec<NameserverConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NameserverConfig {
    /// "host:port" of the upstream resolver.
    pub address: String,
    /// "udp" or "tcp"; empty or missing means udp.
    #[serde(default)]
    pub network: String,
}

pub fn load(path: &Path) -> Result<Config> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let raw = expand_env(&raw);
    let config: Config = serde_yaml::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;

    Ok(config)
}

/// Replaces `${VAR}` references with the process environment; unset
/// variables expand to the empty string.
fn expand_env(raw: &str) -> String {
    let placeholder = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern");

    placeholder
        .replace_all(raw, |caps: &Captures<'_>| {
            env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_CONFIG: &str = r#"
logger:
  name: masquerade-dns
  debug: true

http:
  host: 127.0.0.1
  port: "9000"

dns:
  host: 127.0.0.1
  port: "5053"
  timeout: 5s

switcher:
  settings:
    - source: foo.example
      destination: 10.0.0.1
      maxCount: 0
      ttl: 60
    - source: /^ads\./
      answer:
        a: 0.0.0.0
        https:
          priority: 1
          target: svc.example
          alpn: [h3, h2]
          ipv4hint: [10.0.0.3]
      maxCount: 2
      ttl: 300

limiter:
  ttl: 10s

resolver:
  timeout: 250ms
  mode: round-robin
  nameservers:
    - address: 1.1.1.1:53
    - address: 8.8.8.8:53
      network: tcp
"#;

    #[test]
    fn full_config_parses() {
        let config: Config = serde_yaml::from_str(FULL_CONFIG).expect("parse config");

        assert_eq!(config.logger.name, "masquerade-dns");
        assert!(config.logger.debug);
        assert_eq!(config.http.port, "9000");
        assert_eq!(config.dns.timeout, Duration::from_secs(5));
        assert_eq!(config.limiter.ttl, Duration::from_secs(10));
        assert_eq!(config.resolver.timeout, Duration::from_millis(250));
        assert_eq!(config.resolver.mode, "round-robin");
        assert_eq!(config.resolver.nameservers.len(), 2);
        assert_eq!(config.resolver.nameservers[0].network, "");
        assert_eq!(config.resolver.nameservers[1].network, "tcp");

        let rules = &config.switcher.settings;
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].destination.as_deref(), Some("10.0.0.1"));
        assert_eq!(rules[0].max_count, 0);
        assert_eq!(rules[1].source, "/^ads\\./");

        let answer = rules[1].answer.as_ref().expect("typed answer");
        assert_eq!(answer.a, Some(Ipv4Addr::new(0, 0, 0, 0)));
        let https = answer.https.as_ref().expect("https answer");
        assert_eq!(https.priority, 1);
        assert_eq!(https.target, "svc.example");
        assert_eq!(https.alpn, vec!["h3".to_string(), "h2".to_string()]);
        assert_eq!(https.ipv4_hint, vec![Ipv4Addr::new(10, 0, 0, 3)]);
        assert!(https.ipv6_hint.is_empty());
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let raw = r#"
logger:
  name: masquerade-dns
http:
  host: 127.0.0.1
  port: "9000"
dns:
  host: 127.0.0.1
  port: "5053"
limiter:
  ttl: 10s
resolver:
  timeout: 1s
  mode: random
  nameservers:
    - address: 1.1.1.1:53
"#;
        // dns.timeout is absent
        assert!(serde_yaml::from_str::<Config>(raw).is_err());
    }

    #[test]
    fn missing_rule_ttl_is_rejected() {
        let raw = r#"
settings:
  - source: foo.example
    destination: 10.0.0.1
    maxCount: 0
"#;
        assert!(serde_yaml::from_str::<SwitcherConfig>(raw).is_err());
    }

    #[test]
    fn logger_debug_defaults_to_false() {
        let config: LoggerConfig =
            serde_yaml::from_str("name: masquerade-dns").expect("parse logger config");
        assert!(!config.debug);
    }

    #[test]
    fn switcher_section_defaults_to_empty() {
        let config: SwitcherConfig = serde_yaml::from_str("{}").expect("parse switcher config");
        assert!(config.settings.is_empty());
    }

    #[test]
    fn env_placeholders_are_expanded() {
        env::set_var("MASQUERADE_TEST_PORT", "5353");
        let expanded = expand_env("port: \"${MASQUERADE_TEST_PORT}\"");
        assert_eq!(expanded, "port: \"5353\"");
        env::remove_var("MASQUERADE_TEST_PORT");
    }

    #[test]
    fn unset_env_placeholder_expands_empty() {
        env::remove_var("MASQUERADE_TEST_UNSET");
        let expanded = expand_env("host: \"${MASQUERADE_TEST_UNSET}\"");
        assert_eq!(expanded, "host: \"\"");
    }
}
