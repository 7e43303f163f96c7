use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use hickory_proto::rr::Name;
use regex::Regex;

use crate::config::{AnswerConfig, HttpsAnswerConfig, SwitchRuleConfig, SwitcherConfig};

/// A switch rule compiled from configuration. Immutable after load; the
/// config order is preserved and is the evaluation order.
#[derive(Debug, Clone)]
pub struct SwitchRule {
    pub source: SourceMatcher,
    /// Raw config text of the source; limiter key part and log field.
    pub source_text: String,
    pub answer: RuleAnswer,
    pub max_count: u32,
    pub ttl: u32,
}

/// Sources wrapped in slashes are regular expressions, everything else is an
/// exact domain name. Both forms are resolved once at load.
#[derive(Debug, Clone)]
pub enum SourceMatcher {
    Exact(String),
    Regex(Regex),
}

#[derive(Debug, Clone)]
pub enum RuleAnswer {
    /// A single destination string: IP literal or CNAME target.
    Destination(Destination),
    /// Typed answers; the variant matching the query type is used.
    Typed(TypedAnswer),
}

#[derive(Debug, Clone)]
pub enum Destination {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
    Cname(Name),
}

#[derive(Debug, Clone, Default)]
pub struct TypedAnswer {
    pub a: Option<Ipv4Addr>,
    pub aaaa: Option<Ipv6Addr>,
    pub cname: Option<Name>,
    pub https: Option<HttpsAnswer>,
}

#[derive(Debug, Clone)]
pub struct HttpsAnswer {
    pub priority: u16,
    pub target: Name,
    pub alpn: Vec<String>,
    pub ipv4_hint: Vec<Ipv4Addr>,
    pub ipv6_hint: Vec<Ipv6Addr>,
}

pub fn compile(config: &SwitcherConfig) -> Result<Vec<SwitchRule>> {
    config
        .settings
        .iter()
        .map(|rule| {
            SwitchRule::from_config(rule)
                .with_context(|| format!("switch rule {:?}", rule.source))
        })
        .collect()
}

impl SwitchRule {
    fn from_config(rule: &SwitchRuleConfig) -> Result<Self> {
        Ok(Self {
            source: SourceMatcher::compile(&rule.source)?,
            source_text: rule.source.clone(),
            answer: RuleAnswer::from_config(rule)?,
            max_count: rule.max_count,
            ttl: rule.ttl,
        })
    }
}

impl SourceMatcher {
    fn compile(source: &str) -> Result<Self> {
        if source.starts_with('/') && source.ends_with('/') {
            let inner = source.trim_matches('/');
            let regex = Regex::new(inner)
                .with_context(|| format!("compile source expression: {inner}"))?;

            return Ok(Self::Regex(regex));
        }

        Ok(Self::Exact(fqdn(source).to_ascii_lowercase()))
    }

    /// `qname` is the lowercased FQDN of the question. Regex sources run an
    /// unanchored search over it.
    pub fn matches(&self, qname: &str) -> bool {
        match self {
            Self::Exact(name) => name == qname,
            Self::Regex(regex) => regex.is_match(qname),
        }
    }
}

impl RuleAnswer {
    fn from_config(rule: &SwitchRuleConfig) -> Result<Self> {
        let destination = rule.destination.as_deref().filter(|d| !d.is_empty());

        match (destination, rule.answer.as_ref()) {
            (Some(_), Some(_)) => bail!("destination and answer are mutually exclusive"),
            (None, None) => bail!("rule needs a destination or an answer"),
            (Some(destination), None) => {
                Ok(Self::Destination(Destination::parse(destination)?))
            }
            (None, Some(answer)) => Ok(Self::Typed(TypedAnswer::from_config(answer)?)),
        }
    }
}

impl Destination {
    fn parse(destination: &str) -> Result<Self> {
        match destination.parse::<IpAddr>() {
            Ok(IpAddr::V4(addr)) => Ok(Self::V4(addr)),
            Ok(IpAddr::V6(addr)) => Ok(Self::V6(addr)),
            Err(_) => Ok(Self::Cname(parse_target(destination)?)),
        }
    }
}

impl TypedAnswer {
    fn from_config(answer: &AnswerConfig) -> Result<Self> {
        Ok(Self {
            a: answer.a,
            aaaa: answer.aaaa,
            cname: answer
                .cname
                .as_deref()
                .filter(|t| !t.is_empty())
                .map(parse_target)
                .transpose()?,
            https: answer
                .https
                .as_ref()
                .map(HttpsAnswer::from_config)
                .transpose()?,
        })
    }
}

impl HttpsAnswer {
    fn from_config(answer: &HttpsAnswerConfig) -> Result<Self> {
        Ok(Self {
            priority: answer.priority,
            target: parse_target(&answer.target)?,
            alpn: answer.alpn.clone(),
            ipv4_hint: answer.ipv4_hint.clone(),
            ipv6_hint: answer.ipv6_hint.clone(),
        })
    }
}

/// Domain name in FQDN text form: a trailing dot is appended when missing.
pub fn fqdn(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{name}.")
    }
}

fn parse_target(target: &str) -> Result<Name> {
    Name::from_str(&fqdn(target)).with_context(|| format!("invalid target name: {target}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule_config(raw: &str) -> SwitchRuleConfig {
        serde_yaml::from_str(raw).expect("parse rule config")
    }

    #[test]
    fn exact_source_is_normalized_to_lowercase_fqdn() {
        let matcher = SourceMatcher::compile("Foo.Example").expect("compile");
        assert!(matcher.matches("foo.example."));
        assert!(!matcher.matches("bar.example."));
    }

    #[test]
    fn trailing_dot_source_is_kept_as_is() {
        let matcher = SourceMatcher::compile("foo.example.").expect("compile");
        assert!(matcher.matches("foo.example."));
    }

    #[test]
    fn slash_wrapped_source_compiles_as_regex() {
        let matcher = SourceMatcher::compile("/^ads\\./").expect("compile");
        assert!(matcher.matches("ads.example."));
        assert!(!matcher.matches("www.example."));
    }

    #[test]
    fn regex_source_is_an_unanchored_search() {
        let matcher = SourceMatcher::compile("/example\\.com/").expect("compile");
        assert!(matcher.matches("sub.example.com."));
        assert!(matcher.matches("example.com.evil.test."));
    }

    #[test]
    fn bad_regex_fails_compilation() {
        assert!(SourceMatcher::compile("/((/").is_err());
    }

    #[test]
    fn destination_parses_ipv4() {
        let rule = rule_config("{source: a.test, destination: 10.0.0.1, maxCount: 0, ttl: 60}");
        let compiled = SwitchRule::from_config(&rule).expect("compile");
        assert!(matches!(
            compiled.answer,
            RuleAnswer::Destination(Destination::V4(addr)) if addr == Ipv4Addr::new(10, 0, 0, 1)
        ));
    }

    #[test]
    fn destination_parses_ipv6() {
        let rule = rule_config("{source: a.test, destination: \"2001:db8::1\", maxCount: 0, ttl: 60}");
        let compiled = SwitchRule::from_config(&rule).expect("compile");
        assert!(matches!(
            compiled.answer,
            RuleAnswer::Destination(Destination::V6(addr))
                if addr == "2001:db8::1".parse::<Ipv6Addr>().unwrap()
        ));
    }

    #[test]
    fn non_ip_destination_becomes_fqdn_cname_target() {
        let rule = rule_config("{source: a.test, destination: cdn.example, maxCount: 0, ttl: 60}");
        let compiled = SwitchRule::from_config(&rule).expect("compile");
        match compiled.answer {
            RuleAnswer::Destination(Destination::Cname(target)) => {
                assert_eq!(target.to_string(), "cdn.example.");
            }
            other => panic!("unexpected answer: {other:?}"),
        }
    }

    #[test]
    fn destination_and_answer_together_are_rejected() {
        let rule = rule_config(
            "{source: a.test, destination: 10.0.0.1, answer: {a: 10.0.0.2}, maxCount: 0, ttl: 60}",
        );
        assert!(SwitchRule::from_config(&rule).is_err());
    }

    #[test]
    fn rule_without_destination_or_answer_is_rejected() {
        let rule = rule_config("{source: a.test, maxCount: 0, ttl: 60}");
        assert!(SwitchRule::from_config(&rule).is_err());
    }

    #[test]
    fn empty_destination_counts_as_unset() {
        let rule = rule_config(
            "{source: a.test, destination: \"\", answer: {a: 10.0.0.2}, maxCount: 0, ttl: 60}",
        );
        let compiled = SwitchRule::from_config(&rule).expect("compile");
        assert!(matches!(compiled.answer, RuleAnswer::Typed(_)));
    }

    #[test]
    fn https_answer_target_is_fqdn_normalized() {
        let rule = rule_config(
            "{source: a.test, answer: {https: {priority: 1, target: svc.example}}, maxCount: 0, ttl: 300}",
        );
        let compiled = SwitchRule::from_config(&rule).expect("compile");
        match compiled.answer {
            RuleAnswer::Typed(typed) => {
                let https = typed.https.expect("https answer");
                assert_eq!(https.priority, 1);
                assert_eq!(https.target.to_string(), "svc.example.");
                assert!(https.alpn.is_empty());
            }
            other => panic!("unexpected answer: {other:?}"),
        }
    }

    #[test]
    fn compile_preserves_config_order() {
        let config: SwitcherConfig = serde_yaml::from_str(
            r#"
settings:
  - source: /^ads\./
    destination: 0.0.0.0
    maxCount: 0
    ttl: 30
  - source: /.*/
    destination: 1.1.1.1
    maxCount: 0
    ttl: 30
"#,
        )
        .expect("parse switcher config");

        let rules = compile(&config).expect("compile rules");
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].source_text, "/^ads\\./");
        assert_eq!(rules[1].source_text, "/.*/");
    }

    #[test]
    fn fqdn_appends_single_trailing_dot() {
        assert_eq!(fqdn("example.com"), "example.com.");
        assert_eq!(fqdn("example.com."), "example.com.");
    }
}
