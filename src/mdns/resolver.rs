//! In-memory name table answering A/AAAA questions.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};

use hickory_server::proto::rr::rdata::{A, AAAA};
use hickory_server::proto::rr::{Name, RData, Record, RecordType};

use super::server::Responder;

/// TTL attached to every answer, in seconds.
pub const DEFAULT_TTL: u32 = 120;

/// Maps fully-qualified lowercase names (`host.local.`) to addresses.
///
/// A name is either absent or maps to a non-empty address list.
#[derive(Debug, Default)]
pub struct Resolver {
    domains: Mutex<HashMap<String, Vec<IpAddr>>>,
}

impl Resolver {
    pub fn new() -> Self {
        Self::default()
    }

    fn domains(&self) -> MutexGuard<'_, HashMap<String, Vec<IpAddr>>> {
        self.domains.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `name`, replacing any previous address list.
    ///
    /// An empty address list removes the name instead.
    pub fn register(&self, name: &str, addresses: &[IpAddr]) {
        let name = normalize(name);
        let mut domains = self.domains();
        if addresses.is_empty() {
            domains.remove(&name);
        } else {
            domains.insert(name, addresses.to_vec());
        }
    }

    pub fn deregister(&self, name: &str) {
        self.domains().remove(&normalize(name));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.domains().contains_key(&normalize(name))
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.domains().keys().cloned().collect();
        names.sort();
        names
    }

    /// Build the answer records for `name`.
    ///
    /// The lookup uses the textual form of `name` as-is; callers are
    /// expected to lowercase query names before asking.
    pub fn answer(&self, name: &Name, record_type: RecordType) -> Vec<Record> {
        let domains = self.domains();
        let Some(addresses) = domains.get(&name.to_string()) else {
            return Vec::new();
        };

        let rdata: Vec<RData> = match record_type {
            RecordType::A => addresses
                .iter()
                .filter_map(|ip| ipv4_of(ip).map(|v4| RData::A(A(v4))))
                .collect(),
            RecordType::AAAA => addresses
                .iter()
                .filter_map(|ip| match ip {
                    IpAddr::V6(v6) if v6.to_ipv4_mapped().is_none() => {
                        Some(RData::AAAA(AAAA(*v6)))
                    }
                    _ => None,
                })
                .collect(),
            _ => return Vec::new(),
        };

        rdata
            .into_iter()
            .map(|data| Record::from_rdata(name.clone(), DEFAULT_TTL, data))
            .collect()
    }
}

impl Responder for Resolver {
    fn answer(&self, name: &Name, record_type: RecordType) -> Vec<Record> {
        Resolver::answer(self, name, record_type)
    }
}

fn ipv4_of(ip: &IpAddr) -> Option<std::net::Ipv4Addr> {
    match ip {
        IpAddr::V4(v4) => Some(*v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    }
}

/// Lowercase `name` and make it fully qualified.
pub fn normalize(name: &str) -> String {
    let mut name = name.to_ascii_lowercase();
    if !name.ends_with('.') {
        name.push('.');
    }
    name
}
