//! Geographic access control for discovery responses
//!
//! A requester's address is resolved to a continent and its most specific
//! subdivision (state, province, ...) through a [`GeoLookup`], then checked
//! against the [`AccessPolicy`]. Rules are tried from most to least specific:
//!
//! 1. subdivision allow-list (exclusive: when it applies, it alone decides)
//! 2. subdivision deny-list
//! 3. continent allow-list
//! 4. continent deny-list (permits everyone it does not name)
//! 5. otherwise deny
//!
//! Lookup failures deny and are written to the [`ErrorLog`].

use crate::config::{AccessPolicy, ListRule};
use crate::error::GeoError;
use crate::error_log::ErrorLog;
use log::debug;
use maxminddb::{geoip2, Reader};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

/// Where an address is located. Any part may be unknown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeoLocation {
    /// Two-letter continent code, e.g. `EU`
    pub continent_code: Option<String>,
    /// English continent name, e.g. `Europe`
    pub continent_name: Option<String>,
    /// English name of the most specific subdivision
    pub subdivision: Option<String>,
}

impl GeoLocation {
    fn continent_in(&self, rule: &ListRule) -> bool {
        [&self.continent_code, &self.continent_name]
            .into_iter()
            .flatten()
            .any(|value| rule.contains(value))
    }
}

/// Resolves addresses to locations. Shared read-only between mirrors.
pub trait GeoLookup: Send + Sync {
    fn lookup(&self, ip: IpAddr) -> Result<GeoLocation, GeoError>;
}

/// Lookup backed by a MaxMind GeoLite2/GeoIP2 City database held in memory.
pub struct MaxMindLookup {
    reader: Reader<Vec<u8>>,
}

impl MaxMindLookup {
    pub fn open(path: &Path) -> Result<Self, GeoError> {
        let reader = Reader::open_readfile(path).map_err(|e| GeoError::Open {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { reader })
    }
}

impl GeoLookup for MaxMindLookup {
    fn lookup(&self, ip: IpAddr) -> Result<GeoLocation, GeoError> {
        let city: geoip2::City = self
            .reader
            .lookup(ip)
            .map_err(|e| GeoError::Lookup(e.to_string()))?;

        let continent = city.continent.as_ref();
        let subdivision = city.subdivisions.as_ref().and_then(|list| list.last());

        Ok(GeoLocation {
            continent_code: continent.and_then(|c| c.code).map(str::to_owned),
            continent_name: continent
                .and_then(|c| c.names.as_ref())
                .and_then(|names| names.get("en"))
                .map(|name| (*name).to_owned()),
            subdivision: subdivision
                .and_then(|s| s.names.as_ref())
                .and_then(|names| names.get("en"))
                .map(|name| (*name).to_owned()),
        })
    }
}

/// Stand-in used when the database could not be loaded. Every lookup fails.
#[derive(Debug, Clone)]
pub struct UnavailableLookup {
    reason: String,
}

impl UnavailableLookup {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl GeoLookup for UnavailableLookup {
    fn lookup(&self, _ip: IpAddr) -> Result<GeoLocation, GeoError> {
        Err(GeoError::Unavailable(self.reason.clone()))
    }
}

/// Decides whether a requester gets a discovery response.
#[derive(Clone)]
pub struct GeoAccessFilter {
    policy: Arc<AccessPolicy>,
    lookup: Arc<dyn GeoLookup>,
    error_log: Arc<ErrorLog>,
}

impl GeoAccessFilter {
    pub fn new(
        policy: Arc<AccessPolicy>,
        lookup: Arc<dyn GeoLookup>,
        error_log: Arc<ErrorLog>,
    ) -> Self {
        Self {
            policy,
            lookup,
            error_log,
        }
    }

    /// Runs the full decision. The lookup is skipped when no rule is enabled.
    pub fn is_allowed(&self, ip: IpAddr) -> bool {
        if !self.policy.any_enabled() {
            return true;
        }

        let location = match self.lookup.lookup(ip) {
            Ok(location) => location,
            Err(e) => {
                self.error_log.record(&format!("is_allowed({})", ip), e);
                return false;
            }
        };

        debug!(
            "{} resolved to continent {:?} / {:?}, subdivision {:?}",
            ip, location.continent_code, location.continent_name, location.subdivision
        );

        permits(&self.policy, &location)
    }
}

/// Applies the rule precedence to an already resolved location.
pub fn permits(policy: &AccessPolicy, location: &GeoLocation) -> bool {
    if policy.subdivision_allow.enabled {
        if let Some(subdivision) = &location.subdivision {
            return policy.subdivision_allow.contains(subdivision);
        }
    }

    if policy.subdivision_deny.enabled {
        if let Some(subdivision) = &location.subdivision {
            if policy.subdivision_deny.contains(subdivision) {
                return false;
            }
        }
    }

    if policy.continent_allow.enabled && location.continent_in(&policy.continent_allow) {
        return true;
    }

    if policy.continent_deny.enabled {
        return !location.continent_in(&policy.continent_deny);
    }

    false
}
