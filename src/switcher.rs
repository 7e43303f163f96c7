use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use anyhow::Result;
use hickory_proto::op::Message;
use hickory_proto::rr::rdata::svcb::{Alpn, IpHint, SvcParamKey, SvcParamValue, SVCB};
use hickory_proto::rr::rdata::{A, AAAA, CNAME, HTTPS};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use tracing::{info, warn};

use crate::config::SwitcherConfig;
use crate::limiter::Limiter;
use crate::metrics::Metrics;
use crate::proto;
use crate::rule::{self, Destination, HttpsAnswer, RuleAnswer, SwitchRule, TypedAnswer};
use crate::trace::TraceId;

/// Matches questions against the configured rules and synthesizes
/// authoritative-style answers. Returns `None` when the query should go
/// upstream instead: no rule matched, the limiter said stop, or the request
/// carried no question.
pub struct Switcher {
    rules: Vec<SwitchRule>,
    metrics: Arc<Metrics>,
    limiter: Arc<Limiter>,
}

impl Switcher {
    pub fn new(
        config: &SwitcherConfig,
        metrics: Arc<Metrics>,
        limiter: Arc<Limiter>,
    ) -> Result<Self> {
        Ok(Self {
            rules: rule::compile(config)?,
            metrics,
            limiter,
        })
    }

    pub fn switch(&self, trace_id: &TraceId, addr: IpAddr, req: &Message) -> Option<Message> {
        let Some(question) = req.queries().first() else {
            warn!(trace_id = %trace_id, "handle DNS request without question");

            return None;
        };

        let qname = question.name().to_string().to_ascii_lowercase();

        for rule in &self.rules {
            if !rule.source.matches(&qname) {
                continue;
            }

            if self.limiter.limit(addr, &rule.source_text, rule.max_count) {
                info!(trace_id = %trace_id, source = %rule.source_text, "limit DNS request");
                self.metrics.inc_limited_requests();

                return None;
            }

            info!(trace_id = %trace_id, source = %rule.source_text, "switch DNS request");
            self.metrics.inc_switched_requests(addr);

            let mut resp = proto::reply_to(req);
            for answer in synthesize(
                question.name(),
                question.query_type(),
                &rule.answer,
                rule.ttl,
            ) {
                resp.add_answer(answer);
            }

            return Some(resp);
        }

        None
    }
}

/// Answer records for a matched rule. A destination always yields its own
/// record type; a typed answer yields the variant matching the query type,
/// or nothing.
fn synthesize(name: &Name, qtype: RecordType, answer: &RuleAnswer, ttl: u32) -> Vec<Record> {
    match answer {
        RuleAnswer::Destination(Destination::V4(addr)) => vec![make_a(name, *addr, ttl)],
        RuleAnswer::Destination(Destination::V6(addr)) => vec![make_aaaa(name, *addr, ttl)],
        RuleAnswer::Destination(Destination::Cname(target)) => {
            vec![make_cname(name, target.clone(), ttl)]
        }
        RuleAnswer::Typed(typed) => synthesize_typed(name, qtype, typed, ttl),
    }
}

fn synthesize_typed(
    name: &Name,
    qtype: RecordType,
    answer: &TypedAnswer,
    ttl: u32,
) -> Vec<Record> {
    match qtype {
        RecordType::A => answer
            .a
            .map(|addr| make_a(name, addr, ttl))
            .into_iter()
            .collect(),
        RecordType::AAAA => answer
            .aaaa
            .map(|addr| make_aaaa(name, addr, ttl))
            .into_iter()
            .collect(),
        RecordType::CNAME => answer
            .cname
            .clone()
            .map(|target| make_cname(name, target, ttl))
            .into_iter()
            .collect(),
        RecordType::HTTPS => answer
            .https
            .as_ref()
            .map(|https| make_https(name, https, ttl))
            .into_iter()
            .collect(),
        _ => Vec::new(),
    }
}

fn make_a(name: &Name, addr: Ipv4Addr, ttl: u32) -> Record {
    Record::from_rdata(name.clone(), ttl, RData::A(A(addr)))
}

fn make_aaaa(name: &Name, addr: Ipv6Addr, ttl: u32) -> Record {
    Record::from_rdata(name.clone(), ttl, RData::AAAA(AAAA(addr)))
}

fn make_cname(name: &Name, target: Name, ttl: u32) -> Record {
    Record::from_rdata(name.clone(), ttl, RData::CNAME(CNAME(target)))
}

fn make_https(name: &Name, answer: &HttpsAnswer, ttl: u32) -> Record {
    let mut params = Vec::new();

    if !answer.alpn.is_empty() {
        params.push((
            SvcParamKey::Alpn,
            SvcParamValue::Alpn(Alpn(answer.alpn.clone())),
        ));
    }
    if !answer.ipv4_hint.is_empty() {
        params.push((
            SvcParamKey::Ipv4Hint,
            SvcParamValue::Ipv4Hint(IpHint(answer.ipv4_hint.iter().copied().map(A).collect())),
        ));
    }
    if !answer.ipv6_hint.is_empty() {
        params.push((
            SvcParamKey::Ipv6Hint,
            SvcParamValue::Ipv6Hint(IpHint(answer.ipv6_hint.iter().copied().map(AAAA).collect())),
        ));
    }

    Record::from_rdata(
        name.clone(),
        ttl,
        RData::HTTPS(HTTPS(SVCB::new(
            answer.priority,
            answer.target.clone(),
            params,
        ))),
    )
}
