//! DNS forwarder for the interception stack.
//!
//! The guest's resolver points at the gateway; every UDP query on port 53
//! lands here. Names the allowlist permits are resolved on the host and
//! answered with real addresses; everything else gets NXDOMAIN, so denied
//! hosts fail at name resolution before a TCP SYN is ever sent. When
//! private-address blocking is on, private addresses are dropped from
//! answers too; a name that resolves only to private space is NXDOMAIN.
//!
//! Resolution blocks, so [`handle_query`] runs on the stack's dedicated DNS
//! worker thread, never inside the poll loop.

use crate::net::policy::PolicyEngine;
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::{rdata, RData, Record, RecordType};
use std::net::{IpAddr, ToSocketAddrs};
use tracing::{debug, trace};

/// Answer TTL for forwarded names.
const ANSWER_TTL: u32 = 60;

/// Handle one raw DNS query, returning the raw response.
///
/// Returns `None` only when the datagram is unparseable enough that no
/// response id can be recovered.
pub fn handle_query(data: &[u8], policy: &PolicyEngine) -> Option<Vec<u8>> {
    let query = match Message::from_vec(data) {
        Ok(query) => query,
        Err(e) => {
            trace!("dropping unparseable DNS query: {e}");
            return None;
        }
    };

    let mut response = Message::new();
    response
        .set_id(query.id())
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(query.recursion_desired())
        .set_recursion_available(true);

    let Some(question) = query.queries().first().cloned() else {
        response.set_response_code(ResponseCode::FormErr);
        return response.to_vec().ok();
    };
    response.add_query(question.clone());

    let name = question.name().to_utf8();
    let host = name.trim_end_matches('.');

    let verdict = policy.evaluate(host, None);
    if !verdict.allow {
        debug!(host, reason = verdict.reason.as_str(), "DNS query denied");
        response.set_response_code(ResponseCode::NXDomain);
        return response.to_vec().ok();
    }

    match question.query_type() {
        RecordType::A => {
            let mut addrs = resolve(host);
            // Never hand the guest a private address to go talk to; the
            // same rule the stack and MITM apply at connect time.
            if policy.block_private_ips() {
                let resolved = addrs.len();
                addrs.retain(|addr| !crate::net::policy::is_private(*addr));
                if addrs.len() < resolved {
                    debug!(host, "dropped private addresses from DNS answer");
                }
            }
            if addrs.is_empty() {
                response.set_response_code(ResponseCode::NXDomain);
            }
            for addr in addrs {
                if let IpAddr::V4(v4) = addr {
                    response.add_answer(Record::from_rdata(
                        question.name().clone(),
                        ANSWER_TTL,
                        RData::A(rdata::A(v4)),
                    ));
                }
            }
        }
        // The stack is IPv4-only; an empty NoError answer steers clients to A.
        RecordType::AAAA => {}
        _ => {
            response.set_response_code(ResponseCode::NotImp);
        }
    }

    response.to_vec().ok()
}

/// Host-side resolution of an allowed name.
fn resolve(host: &str) -> Vec<IpAddr> {
    match (host, 0u16).to_socket_addrs() {
        Ok(addrs) => addrs.map(|a| a.ip()).collect(),
        Err(e) => {
            debug!(host, "host resolution failed: {e}");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::NetworkConfig;
    use hickory_proto::op::Query;
    use hickory_proto::rr::Name;
    use std::collections::HashMap;
    use std::str::FromStr;

    fn engine(hosts: &[&str]) -> PolicyEngine {
        engine_with(hosts, true)
    }

    fn engine_with(hosts: &[&str], block_private_ips: bool) -> PolicyEngine {
        PolicyEngine::new(&NetworkConfig {
            allowed_hosts: hosts.iter().map(|s| s.to_string()).collect(),
            block_private_ips,
            secrets: HashMap::new(),
        })
    }

    fn query_for(host: &str, record_type: RecordType) -> Vec<u8> {
        let mut message = Message::new();
        message.set_id(0x1234);
        message.set_message_type(MessageType::Query);
        message.set_recursion_desired(true);
        message.add_query(Query::query(
            Name::from_str(&format!("{host}.")).unwrap(),
            record_type,
        ));
        message.to_vec().unwrap()
    }

    #[test]
    fn test_denied_name_gets_nxdomain() {
        let policy = engine(&["example.com"]);
        let raw = handle_query(&query_for("blocked.test", RecordType::A), &policy).unwrap();
        let response = Message::from_vec(&raw).unwrap();
        assert_eq!(response.id(), 0x1234);
        assert_eq!(response.response_code(), ResponseCode::NXDomain);
        assert!(response.answers().is_empty());
    }

    #[test]
    fn test_localhost_resolves_but_policy_denies() {
        // localhost is resolvable, but an empty allowlist denies it.
        let policy = engine(&[]);
        let raw = handle_query(&query_for("localhost", RecordType::A), &policy).unwrap();
        let response = Message::from_vec(&raw).unwrap();
        assert_eq!(response.response_code(), ResponseCode::NXDomain);
    }

    #[test]
    fn test_allowed_name_answers_a_records() {
        // localhost resolves locally; private blocking is off so the
        // loopback answer comes through.
        let policy = engine_with(&["localhost"], false);
        let raw = handle_query(&query_for("localhost", RecordType::A), &policy).unwrap();
        let response = Message::from_vec(&raw).unwrap();
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert!(response
            .answers()
            .iter()
            .any(|r| matches!(r.data(), Some(RData::A(_)))));
    }

    #[test]
    fn test_private_answers_filtered_when_blocking() {
        // The name is allowlisted, but every address it resolves to is
        // private: the guest gets NXDOMAIN, not a loopback to dial.
        let policy = engine(&["localhost"]);
        let raw = handle_query(&query_for("localhost", RecordType::A), &policy).unwrap();
        let response = Message::from_vec(&raw).unwrap();
        assert_eq!(response.response_code(), ResponseCode::NXDomain);
        assert!(response.answers().is_empty());
    }

    #[test]
    fn test_aaaa_answers_empty_noerror() {
        let policy = engine(&["localhost"]);
        let raw = handle_query(&query_for("localhost", RecordType::AAAA), &policy).unwrap();
        let response = Message::from_vec(&raw).unwrap();
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert!(response.answers().is_empty());
    }

    #[test]
    fn test_garbage_query_dropped() {
        let policy = engine(&["*"]);
        assert!(handle_query(&[0xff, 0x00, 0x01], &policy).is_none());
    }
}
