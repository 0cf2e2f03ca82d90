//! Validated query results.

use std::time::{Duration, Instant};

use hickory_proto::op::Message;
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};

use crate::cache::Expiring;
use crate::error::{ResolveError, Result};
use crate::zone::parent_name;

/// Upper bound on CNAME hops followed inside one response.
const MAX_CNAME_CHAIN: usize = 16;

/// The result of a successful resolution.
///
/// Holds the full response message alongside the RRset that answers the
/// question (after following any CNAME chain in the answer section).
#[derive(Debug, Clone)]
pub struct Answer {
    qname: Name,
    rtype: RecordType,
    rclass: DNSClass,
    canonical_name: Name,
    records: Vec<Record>,
    response: Message,
    expiration: Instant,
}

impl Answer {
    /// Builds an answer from `response`, failing with `NoAnswer` when the
    /// response has no RRset for the question.
    pub fn new(qname: Name, rtype: RecordType, rclass: DNSClass, response: Message) -> Result<Self> {
        Self::from_response(qname, rtype, rclass, response, true)
    }

    pub fn from_response(
        qname: Name,
        rtype: RecordType,
        rclass: DNSClass,
        response: Message,
        raise_on_no_answer: bool,
    ) -> Result<Self> {
        Self::from_response_at(qname, rtype, rclass, response, raise_on_no_answer, Instant::now())
    }

    pub(crate) fn from_response_at(
        qname: Name,
        rtype: RecordType,
        rclass: DNSClass,
        response: Message,
        raise_on_no_answer: bool,
        now: Instant,
    ) -> Result<Self> {
        let mut min_ttl: Option<u32> = None;
        let mut canonical = qname.clone();
        let mut records = Vec::new();

        for _ in 0..MAX_CNAME_CHAIN {
            let rrset = find_rrset(response.answers(), &canonical, rclass, rtype);
            if !rrset.is_empty() {
                min_ttl = fold_min(min_ttl, rrset.iter().map(|r| r.ttl()));
                records = rrset;
                break;
            }
            if rtype == RecordType::CNAME {
                break;
            }
            let cnames = find_rrset(response.answers(), &canonical, rclass, RecordType::CNAME);
            let Some(target) = cnames.iter().find_map(cname_target) else {
                break;
            };
            min_ttl = fold_min(min_ttl, cnames.iter().map(|r| r.ttl()));
            canonical = target;
        }

        if records.is_empty() {
            if raise_on_no_answer {
                return Err(ResolveError::NoAnswer { name: qname, rtype });
            }
            min_ttl = fold_min(min_ttl, negative_ttl(&response, &canonical, rclass));
        }

        let ttl = Duration::from_secs(u64::from(min_ttl.unwrap_or(0)));
        Ok(Self {
            qname,
            rtype,
            rclass,
            canonical_name: canonical,
            records,
            response,
            expiration: now + ttl,
        })
    }

    pub fn qname(&self) -> &Name {
        &self.qname
    }

    pub fn rtype(&self) -> RecordType {
        self.rtype
    }

    pub fn rclass(&self) -> DNSClass {
        self.rclass
    }

    /// Owner name of the answering RRset; differs from `qname` when a CNAME
    /// chain was followed.
    pub fn canonical_name(&self) -> &Name {
        &self.canonical_name
    }

    /// The answering RRset. Empty only when built with `raise_on_no_answer`
    /// turned off.
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn has_records(&self) -> bool {
        !self.records.is_empty()
    }

    pub fn response(&self) -> &Message {
        &self.response
    }

    pub fn expiration(&self) -> Instant {
        self.expiration
    }

    /// Time left before the answer goes stale.
    pub fn remaining_ttl(&self) -> Duration {
        self.expiration.saturating_duration_since(Instant::now())
    }
}

impl Expiring for Answer {
    fn expiration(&self) -> Instant {
        self.expiration
    }
}

fn find_rrset(section: &[Record], name: &Name, rclass: DNSClass, rtype: RecordType) -> Vec<Record> {
    section
        .iter()
        .filter(|r| r.record_type() == rtype && r.dns_class() == rclass && r.name() == name)
        .cloned()
        .collect()
}

fn cname_target(record: &Record) -> Option<Name> {
    match record.data() {
        Some(RData::CNAME(cname)) => Some(cname.0.clone()),
        _ => None,
    }
}

fn fold_min(current: Option<u32>, ttls: impl IntoIterator<Item = u32>) -> Option<u32> {
    ttls.into_iter().fold(current, |acc, ttl| Some(acc.map_or(ttl, |m| m.min(ttl))))
}

/// TTL bound for an empty answer: the SOA of the closest enclosing zone in the
/// authority section, limited by its MINIMUM field.
fn negative_ttl(response: &Message, name: &Name, rclass: DNSClass) -> Option<u32> {
    let mut owner = name.clone();
    loop {
        let soa = response.name_servers().iter().find(|r| {
            r.record_type() == RecordType::SOA && r.dns_class() == rclass && r.name() == &owner
        });
        if let Some(record) = soa {
            let minimum = match record.data() {
                Some(RData::SOA(soa)) => soa.minimum(),
                _ => record.ttl(),
            };
            return Some(record.ttl().min(minimum));
        }
        if owner.is_root() {
            return None;
        }
        owner = parent_name(&owner);
    }
}
