//! Per-session filter table with idle expiry.
//!
//! A session groups one clamped particle filter per tracked beacon under an
//! opaque 8-character base64 token. Sessions are created lazily on first
//! request, refreshed on every use, and swept lazily: at most once every
//! sweep interval, expired entries are dropped while the table lock is held.
//! A request always re-bumps its session's expiry under that same lock, so
//! sweeping never races an active request.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use base64::Engine as _;
use rand::RngCore;

use crate::filter::{ClampedParticleFilter, FilterParams, Limits};

/// Idle lifetime of a session.
pub const SESSION_TTL: Duration = Duration::from_secs(30);

/// Minimum interval between expiry sweeps.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Random bytes per token; 6 bytes render as exactly 8 base64 characters.
const TOKEN_BYTES: usize = 6;

struct FilterSession {
    per_beacon: HashMap<i64, ClampedParticleFilter>,
    expires_at: Instant,
}

struct SessionTableInner {
    sessions: HashMap<String, FilterSession>,
    next_sweep: Instant,
}

/// Table of live filter sessions, keyed by token.
pub struct SessionTable {
    inner: Mutex<SessionTableInner>,
    params: FilterParams,
}

impl SessionTable {
    /// Create an empty table using the given filter parameters for new
    /// sessions.
    #[must_use]
    pub fn new(params: FilterParams) -> Self {
        Self {
            inner: Mutex::new(SessionTableInner {
                sessions: HashMap::new(),
                next_sweep: Instant::now() + SWEEP_INTERVAL,
            }),
            params,
        }
    }

    /// Run every beacon's observation through its session filter.
    ///
    /// Resolves `token` (allocating a fresh session when it is absent or
    /// unknown, including tokens that were reaped), aligns the session's
    /// filters with exactly the requested beacons, bumps the expiry, and
    /// returns the token together with the smoothed points in input order.
    #[allow(clippy::expect_used)]
    pub fn smooth(
        &self,
        token: Option<&str>,
        limits: Limits,
        observations: &[(i64, [f64; 2])],
    ) -> (String, Vec<[f64; 2]>) {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("Mutex poisoned");

        if now >= inner.next_sweep {
            inner.sessions.retain(|_, session| session.expires_at >= now);
            inner.next_sweep = now + SWEEP_INTERVAL;
        }

        let token = match token {
            Some(existing) if inner.sessions.contains_key(existing) => existing.to_string(),
            _ => {
                let fresh = loop {
                    let candidate = random_token();
                    if !inner.sessions.contains_key(&candidate) {
                        break candidate;
                    }
                };
                inner.sessions.insert(
                    fresh.clone(),
                    FilterSession { per_beacon: HashMap::new(), expires_at: now + SESSION_TTL },
                );
                fresh
            },
        };

        let session = inner.sessions.get_mut(&token).expect("session inserted above");
        session.expires_at = now + SESSION_TTL;

        // Filter set tracks exactly the beacons of this request
        session
            .per_beacon
            .retain(|beacon, _| observations.iter().any(|(b, _)| b == beacon));

        let smoothed = observations
            .iter()
            .map(|&(beacon, point)| {
                session
                    .per_beacon
                    .entry(beacon)
                    .or_insert_with(|| ClampedParticleFilter::new(limits, self.params))
                    .update(point)
            })
            .collect();

        (token, smoothed)
    }

    /// Number of live sessions (test support).
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("Mutex poisoned").sessions.len()
    }

    /// True when no session is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Force-expire every session and make the next call sweep (test
    /// support for the reaping path).
    #[allow(clippy::expect_used)]
    pub fn expire_all(&self) {
        let mut inner = self.inner.lock().expect("Mutex poisoned");
        let past = Instant::now() - Duration::from_secs(1);
        for session in inner.sessions.values_mut() {
            session.expires_at = past;
        }
        inner.next_sweep = past;
    }
}

fn random_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::STANDARD.encode(bytes)
}
