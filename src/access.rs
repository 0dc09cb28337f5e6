//! Origin and IP admission control with a pending-approval workflow.
//!
//! The allowed origins, allowed IPs and pending domains are guarded as a
//! single unit behind one [`RwLock`], since approval moves an entry from the
//! pending map into the allowed list. The containers are never handed out;
//! callers only see the atomic operations below and owned snapshots.
//!
//! Origin comparisons are ASCII case-insensitive. Pending entries are keyed
//! by the lowercased origin, so `https://App.example` and
//! `https://app.example` accumulate into the same entry.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::metrics::Metrics;

/// Origin entry that allows every origin.
pub const WILDCARD_ORIGIN: &str = "*";

/// Why a client was refused admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// An IP allow-list is configured and the client is not on it.
    IpNotAllowed,
    /// The request carries no `Origin` header.
    OriginRequired,
    /// The origin is unknown and has been queued for approval.
    OriginPending,
}

impl DenyReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::IpNotAllowed => "ip_not_allowed",
            Self::OriginRequired => "origin_required",
            Self::OriginPending => "origin_pending",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IpNotAllowed => f.write_str("client IP is not allowed"),
            Self::OriginRequired => f.write_str("an Origin header is required"),
            Self::OriginPending => f.write_str(
                "origin not allowed; your domain is pending approval, contact the administrator",
            ),
        }
    }
}

/// Failure of an administrative domain operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainError {
    AlreadyExists,
    NotFound,
    NotPending,
    AlreadyApproved,
}

impl DomainError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::AlreadyExists => "domain_exists",
            Self::NotFound => "domain_not_found",
            Self::NotPending => "domain_not_pending",
            Self::AlreadyApproved => "domain_already_approved",
        }
    }
}

impl fmt::Display for DomainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyExists => f.write_str("domain already exists"),
            Self::NotFound => f.write_str("domain not found"),
            Self::NotPending => f.write_str("domain not found in pending list"),
            Self::AlreadyApproved => f.write_str("domain already approved"),
        }
    }
}

impl std::error::Error for DomainError {}

/// An origin that asked for access and has not been approved yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingDomain {
    /// The origin as first seen.
    pub domain: String,
    pub request_count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Owned copy of the admission state for the admin surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdmissionSnapshot {
    pub allowed_origins: Vec<String>,
    pub allowed_ips: Vec<IpAddr>,
    /// Pending domains ordered by their lowercased name.
    pub pending: Vec<PendingDomain>,
}

#[derive(Debug, Default)]
struct AdmissionState {
    allowed_origins: Vec<String>,
    allowed_ips: Vec<IpAddr>,
    pending: BTreeMap<String, PendingDomain>,
}

impl AdmissionState {
    fn wildcard(&self) -> bool {
        self.allowed_origins.is_empty()
            || self.allowed_origins.iter().any(|o| o == WILDCARD_ORIGIN)
    }

    fn origin_position(&self, origin: &str) -> Option<usize> {
        self.allowed_origins
            .iter()
            .position(|allowed| allowed.eq_ignore_ascii_case(origin))
    }
}

/// Validates clients against the allow-lists and manages pending origins.
#[derive(Debug)]
pub struct AccessGate {
    state: RwLock<AdmissionState>,
    require_origin: bool,
    metrics: Arc<Metrics>,
}

impl AccessGate {
    /// Creates a gate seeded with the configured allow-lists.
    ///
    /// With `require_origin` unset, requests without an `Origin` header skip
    /// the origin check entirely instead of being refused.
    pub fn new(
        allowed_origins: Vec<String>,
        allowed_ips: Vec<IpAddr>,
        require_origin: bool,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            state: RwLock::new(AdmissionState {
                allowed_origins,
                allowed_ips,
                pending: BTreeMap::new(),
            }),
            require_origin,
            metrics,
        }
    }

    /// Decides whether a client may proceed.
    ///
    /// Checks run in order: IP allow-list, presence of `Origin`, wildcard or
    /// empty origin list, then a case-insensitive origin match. An unmatched
    /// origin is recorded as pending before the denial is returned.
    pub fn validate(&self, ip: IpAddr, origin: Option<&str>) -> Result<(), DenyReason> {
        self.validate_at(ip, origin, Utc::now())
    }

    fn validate_at(
        &self,
        ip: IpAddr,
        origin: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), DenyReason> {
        let state = self.state.read();

        if !state.allowed_ips.is_empty() && !state.allowed_ips.contains(&ip) {
            self.metrics.record_blocked_ip();
            warn!(%ip, "client IP not in allow-list");
            return Err(DenyReason::IpNotAllowed);
        }

        let Some(origin) = origin else {
            if self.require_origin {
                debug!(%ip, "request without Origin header");
                return Err(DenyReason::OriginRequired);
            }
            return Ok(());
        };

        if state.wildcard() || state.origin_position(origin).is_some() {
            return Ok(());
        }
        drop(state);

        // The origin may have been approved since the read lock was released.
        let mut state = self.state.write();
        if state.wildcard() || state.origin_position(origin).is_some() {
            return Ok(());
        }
        let entry = state
            .pending
            .entry(origin.to_ascii_lowercase())
            .and_modify(|pending| {
                pending.request_count += 1;
                pending.last_seen = now;
            })
            .or_insert_with(|| PendingDomain {
                domain: origin.to_owned(),
                request_count: 1,
                first_seen: now,
                last_seen: now,
            });

        warn!(
            origin,
            request_count = entry.request_count,
            "origin not allowed, recorded as pending"
        );
        Err(DenyReason::OriginPending)
    }

    /// Adds `domain` to the allowed origins.
    ///
    /// A pending entry for the same domain is dropped, since a domain is
    /// never both allowed and pending. Like the other domain operations,
    /// surrounding whitespace is ignored.
    pub fn add_domain(&self, domain: &str) -> Result<(), DomainError> {
        let domain = domain.trim();
        let mut state = self.state.write();
        if state.origin_position(domain).is_some() {
            return Err(DomainError::AlreadyExists);
        }
        state.allowed_origins.push(domain.to_owned());
        state.pending.remove(&domain.to_ascii_lowercase());
        info!(domain, "domain added to allow-list");
        Ok(())
    }

    pub fn remove_domain(&self, domain: &str) -> Result<(), DomainError> {
        let domain = domain.trim();
        let mut state = self.state.write();
        let idx = state
            .origin_position(domain)
            .ok_or(DomainError::NotFound)?;
        state.allowed_origins.remove(idx);
        info!(domain, "domain removed from allow-list");
        Ok(())
    }

    /// Moves a pending domain into the allowed origins in one step.
    pub fn approve_domain(&self, domain: &str) -> Result<(), DomainError> {
        let domain = domain.trim();
        let key = domain.to_ascii_lowercase();
        let mut state = self.state.write();
        if !state.pending.contains_key(&key) {
            return Err(DomainError::NotPending);
        }
        if state.origin_position(domain).is_some() {
            return Err(DomainError::AlreadyApproved);
        }
        if let Some(pending) = state.pending.remove(&key) {
            info!(
                domain = %pending.domain,
                request_count = pending.request_count,
                "pending domain approved"
            );
            state.allowed_origins.push(pending.domain);
        }
        Ok(())
    }

    pub fn snapshot(&self) -> AdmissionSnapshot {
        let state = self.state.read();
        AdmissionSnapshot {
            allowed_origins: state.allowed_origins.clone(),
            allowed_ips: state.allowed_ips.clone(),
            pending: state.pending.values().cloned().collect(),
        }
    }
}
