// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Credential rotation: selecting an API key or OAuth token for a provider
//! across multiple stored credentials, with usage-based exhaustion tracking,
//! failure backoff, and session-sticky selection.
//!
//! This module owns in-memory rotation state only. Durable storage is
//! provided by [`crate::credential_store`].

use std::collections::HashMap;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Provider identifier, e.g. `"openai-codex"` or `"anthropic"`. Distinct from
/// the model-driver ids in [`crate::registry`] — a credential provider may
/// back several driver ids, or be an OAuth-only login with no driver of its
/// own (e.g. a subscription login used purely for usage probing).
pub type Provider = String;

/// A single stored secret: either a static API key or an OAuth token set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Credential {
    ApiKey {
        secret: String,
    },
    OAuth {
        access: String,
        refresh: String,
        expires_at_ms: i64,
        #[serde(default)]
        account_id: Option<String>,
        #[serde(default)]
        email: Option<String>,
        #[serde(default)]
        project_id: Option<String>,
        #[serde(default)]
        enterprise_url: Option<String>,
    },
}

impl Credential {
    pub fn kind(&self) -> CredentialKind {
        match self {
            Credential::ApiKey { .. } => CredentialKind::ApiKey,
            Credential::OAuth { .. } => CredentialKind::OAuth,
        }
    }

    /// Best-effort stable identity used for OAuth dedup, independent of the
    /// numeric row id: account_id, else lowercased email, else JWT subject
    /// extracted from the access token, else the same from the refresh token.
    fn identity(&self) -> Option<String> {
        match self {
            Credential::ApiKey { .. } => None,
            Credential::OAuth {
                account_id,
                email,
                access,
                refresh,
                ..
            } => account_id
                .clone()
                .or_else(|| email.as_ref().map(|e| e.to_lowercase()))
                .or_else(|| jwt_identity(access))
                .or_else(|| jwt_identity(refresh)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    ApiKey,
    OAuth,
}

/// A credential together with the stable numeric id it was stored under.
/// Ids never change once assigned and are never reused after removal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredCredential {
    pub id: u64,
    pub credential: Credential,
}

/// `(provider, credential kind)` key used to index blocked-until and
/// round-robin state maps.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PtKey(Provider, CredentialKind);

/// Redacted view of one stored credential for display purposes. See
/// [`CredentialRotator::summarize`].
#[derive(Debug, Clone, Serialize)]
pub struct CredentialSummary {
    pub id: u64,
    pub kind: CredentialKind,
    pub blocked: bool,
    pub blocked_until_ms: Option<i64>,
}

// ── Usage reports ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UsageAmount {
    pub used: Option<f64>,
    pub limit: Option<f64>,
    pub remaining: Option<f64>,
    pub used_fraction: Option<f64>,
    pub remaining_fraction: Option<f64>,
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UsageWindow {
    pub resets_at_ms: Option<i64>,
    pub reset_in_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UsageScope {
    pub account_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageLimit {
    pub id: String,
    #[serde(default)]
    pub amount: UsageAmount,
    #[serde(default)]
    pub window: UsageWindow,
    #[serde(default)]
    pub scope: UsageScope,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UsageMetadata {
    pub email: Option<String>,
    pub account_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageReport {
    pub limits: Vec<UsageLimit>,
    #[serde(default)]
    pub metadata: UsageMetadata,
    pub fetched_at_ms: i64,
    pub expires_at_ms: Option<i64>,
}

impl UsageReport {
    /// True if any limit in this report indicates exhaustion.
    pub fn is_exhausted(&self) -> bool {
        self.limits.iter().any(limit_is_exhausted)
    }

    /// Smallest future reset time across exhausted limits, if any resolve.
    fn earliest_reset_ms(&self, now_ms: i64) -> Option<i64> {
        self.limits
            .iter()
            .filter(|l| limit_is_exhausted(l))
            .filter_map(|l| {
                let from_resets_at = l
                    .window
                    .resets_at_ms
                    .filter(|&r| r > now_ms);
                let from_reset_in = l
                    .window
                    .reset_in_ms
                    .filter(|&d| d > 0)
                    .map(|d| now_ms + d);
                match (from_resets_at, from_reset_in) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (Some(a), None) => Some(a),
                    (None, Some(b)) => Some(b),
                    (None, None) => None,
                }
            })
            .min()
    }

    fn identity(&self) -> Option<String> {
        self.metadata
            .account_id
            .clone()
            .or_else(|| self.metadata.email.as_ref().map(|e| e.to_lowercase()))
    }

    fn expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms.is_some_and(|e| e <= now_ms)
    }

    /// Merge another report sharing this one's identity: union the limits and
    /// fill in any metadata the base report is missing.
    fn merge_with(mut self, other: UsageReport) -> UsageReport {
        self.limits.extend(other.limits);
        if self.metadata.email.is_none() {
            self.metadata.email = other.metadata.email;
        }
        if self.metadata.account_id.is_none() {
            self.metadata.account_id = other.metadata.account_id;
        }
        self.fetched_at_ms = self.fetched_at_ms.max(other.fetched_at_ms);
        self
    }
}

fn limit_is_exhausted(l: &UsageLimit) -> bool {
    if l.status.as_deref() == Some("exhausted") {
        return true;
    }
    let a = &l.amount;
    if a.used_fraction.is_some_and(|f| f >= 1.0) {
        return true;
    }
    if a.remaining_fraction.is_some_and(|f| f <= 0.0) {
        return true;
    }
    if let (Some(used), Some(limit)) = (a.used, a.limit) {
        if used >= limit {
            return true;
        }
    }
    if a.remaining.is_some_and(|r| r <= 0.0) {
        return true;
    }
    if a.unit.as_deref() == Some("percent") && a.used.is_some_and(|u| u >= 100.0) {
        return true;
    }
    false
}

/// Deduplicate reports that share an identity (account_id or lowercased
/// email), merging their limits. Base report per group is the one with more
/// limits, ties broken by the later `fetched_at_ms`.
pub fn dedupe_usage_reports(reports: Vec<UsageReport>) -> Vec<UsageReport> {
    let mut by_identity: HashMap<String, UsageReport> = HashMap::new();
    let mut anonymous = Vec::new();
    for r in reports {
        match r.identity() {
            Some(id) => {
                by_identity
                    .entry(id)
                    .and_modify(|existing| {
                        let existing_is_base = existing.limits.len() > r.limits.len()
                            || (existing.limits.len() == r.limits.len()
                                && existing.fetched_at_ms >= r.fetched_at_ms);
                        let (base, extra) = if existing_is_base {
                            (existing.clone(), r.clone())
                        } else {
                            (r.clone(), existing.clone())
                        };
                        *existing = base.merge_with(extra);
                    })
                    .or_insert(r);
            }
            None => anonymous.push(r),
        }
    }
    let mut out: Vec<UsageReport> = by_identity.into_values().collect();
    out.extend(anonymous);
    out
}

// ── FNV-1a ──────────────────────────────────────────────────────────────────

const FNV_OFFSET_BASIS: u32 = 2166136261;
const FNV_PRIME: u32 = 16777619;

fn fnv1a(s: &str) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in s.as_bytes() {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Session-sticky starting index into a bucket of length `n`.
pub fn hash_index(session: &str, n: usize) -> usize {
    if n == 0 {
        return 0;
    }
    (fnv1a(session) % n as u32) as usize
}

// ── JWT identity extraction ─────────────────────────────────────────────────

/// Best-effort extraction of an identity (email, then account_id/accountId/
/// user_id/sub) from a JWT's unverified payload segment. Never panics on a
/// malformed token; returns `None` instead.
fn jwt_identity(token: &str) -> Option<String> {
    let payload_b64 = token.split('.').nth(1)?;
    let bytes = base64_url_decode(payload_b64)?;
    let value: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    let obj = value.as_object()?;
    for key in ["email", "account_id", "accountId", "user_id", "sub"] {
        if let Some(s) = obj.get(key).and_then(|v| v.as_str()) {
            let s = s.to_string();
            return Some(if key == "email" { s.to_lowercase() } else { s });
        }
    }
    None
}

fn base64_url_decode(input: &str) -> Option<Vec<u8>> {
    const ALPHABET: &[u8] =
        b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";
    let mut table = [255u8; 256];
    for (i, &c) in ALPHABET.iter().enumerate() {
        table[c as usize] = i as u8;
    }
    let mut bits: u32 = 0;
    let mut bit_count = 0u32;
    let mut out = Vec::with_capacity(input.len() * 3 / 4 + 3);
    for c in input.bytes() {
        if c == b'=' {
            break;
        }
        let v = table[c as usize];
        if v == 255 {
            return None;
        }
        bits = (bits << 6) | v as u32;
        bit_count += 6;
        if bit_count >= 8 {
            bit_count -= 8;
            out.push((bits >> bit_count) as u8);
        }
    }
    Some(out)
}

// ── Failure classification ──────────────────────────────────────────────────

/// Whether an OAuth refresh/auth failure is definitive (credential should be
/// dropped) or transient (credential should be blocked temporarily and
/// retried later).
pub fn is_definitive_failure(message: &str, http_status: Option<u16>) -> bool {
    static PATTERN: &str =
        r"(?i)invalid_grant|invalid_token|revoked|unauthorized|expired.*refresh|refresh.*expired";
    let re = Regex::new(PATTERN).expect("static regex is valid");
    if re.is_match(message) {
        return true;
    }
    matches!(http_status, Some(401) | Some(403))
}

// ── OAuth refresh ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access: String,
    pub refresh: Option<String>,
    pub expires_at_ms: i64,
}

#[derive(Debug, Clone)]
pub enum RefreshError {
    /// Network/timeout/5xx or ambiguous 401/403 — credential should be
    /// blocked temporarily, not removed.
    Transient(String),
    /// `invalid_grant` or equivalent — credential should be removed.
    Definitive(String),
}

impl RefreshError {
    pub fn message(&self) -> &str {
        match self {
            RefreshError::Transient(m) | RefreshError::Definitive(m) => m,
        }
    }
}

#[async_trait]
pub trait OAuthRefresher: Send + Sync {
    async fn refresh(
        &self,
        provider: &str,
        credential: &Credential,
    ) -> Result<RefreshedToken, RefreshError>;
}

/// Refresher that always fails transiently; useful when no refresh endpoint
/// is configured for a provider.
pub struct NoopRefresher;

#[async_trait]
impl OAuthRefresher for NoopRefresher {
    async fn refresh(
        &self,
        _provider: &str,
        _credential: &Credential,
    ) -> Result<RefreshedToken, RefreshError> {
        Err(RefreshError::Transient("no refresher configured".into()))
    }
}

/// Fetches a usage report for a single credential.
#[async_trait]
pub trait UsageProbe: Send + Sync {
    async fn fetch(
        &self,
        provider: &str,
        credential: &Credential,
    ) -> anyhow::Result<UsageReport>;
}

// ── Rotation state ───────────────────────────────────────────────────────────

const NEAR_EXPIRY_WINDOW_MS: i64 = 60_000;
const DEFAULT_BLOCK_MS: i64 = 60_000;
const TRANSIENT_BLOCK_MS: i64 = 5 * 60_000;
const USAGE_CACHE_DEFAULT_MS: i64 = 5 * 60_000;

/// Owns all per-provider rotation state: stored credentials, blocked
/// indices, session affinity, round-robin counters, runtime overrides and
/// cached usage reports.
///
/// Not internally synchronized — per the single-instance ownership model,
/// callers share one instance behind a `tokio::sync::Mutex`.
#[derive(Default)]
pub struct CredentialRotator {
    buckets: HashMap<Provider, Vec<StoredCredential>>,
    next_id: u64,
    blocked_until: HashMap<PtKey, HashMap<usize, i64>>,
    session_affinity: HashMap<(Provider, String), (CredentialKind, usize)>,
    round_robin: HashMap<PtKey, usize>,
    runtime_overrides: HashMap<Provider, String>,
    usage_cache: HashMap<(Provider, String), UsageReport>,
    #[allow(clippy::type_complexity)]
    user_resolver: Option<Box<dyn Fn(&str) -> Option<String> + Send + Sync>>,
}

impl CredentialRotator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_user_resolver<F>(&mut self, resolver: F)
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.user_resolver = Some(Box::new(resolver));
    }

    pub fn set_runtime_override(&mut self, provider: &str, key: String) {
        self.runtime_overrides.insert(provider.to_string(), key);
    }

    pub fn clear_runtime_override(&mut self, provider: &str) {
        self.runtime_overrides.remove(provider);
    }

    pub fn list_providers(&self) -> Vec<Provider> {
        self.buckets.keys().cloned().collect()
    }

    pub fn has_auth(&self, provider: &str) -> bool {
        self.runtime_overrides.contains_key(provider)
            || self
                .buckets
                .get(provider)
                .is_some_and(|b| !b.is_empty())
    }

    /// Redacted per-credential status for `provider`: id, kind, and blocked
    /// state only — never the secret itself. Intended for `credentials
    /// status` display; a freshly-constructed rotator (as every CLI
    /// invocation is) has no block/affinity history yet, so this only
    /// reflects activity accumulated within the current process.
    pub fn summarize(&self, provider: &str, now_ms: i64) -> Vec<CredentialSummary> {
        let Some(bucket) = self.buckets.get(provider) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for kind in [CredentialKind::ApiKey, CredentialKind::OAuth] {
            let filtered: Vec<&StoredCredential> =
                bucket.iter().filter(|c| c.credential.kind() == kind).collect();
            let blocked_map = self.blocked_until.get(&PtKey(provider.to_string(), kind));
            for (index, c) in filtered.iter().enumerate() {
                let until = blocked_map.and_then(|m| m.get(&index)).copied();
                out.push(CredentialSummary {
                    id: c.id,
                    kind,
                    blocked: until.is_some_and(|u| u > now_ms),
                    blocked_until_ms: until,
                });
            }
        }
        out
    }

    /// Number of sessions currently sticky to some credential of `provider`.
    pub fn affinity_sessions(&self, provider: &str) -> usize {
        self.session_affinity.keys().filter(|(p, _)| p == provider).count()
    }

    /// Store credentials for `provider`, assigning each a stable numeric id.
    /// OAuth credentials are deduplicated against existing entries by
    /// identity: when a newer credential shares an identity with an existing
    /// one, the existing (older) entry is removed and rotation state for the
    /// provider is reset.
    pub fn store_credentials(
        &mut self,
        provider: &str,
        creds: Vec<Credential>,
    ) -> Vec<StoredCredential> {
        let bucket = self.buckets.entry(provider.to_string()).or_default();
        for c in creds {
            let id = self.next_id;
            self.next_id += 1;
            bucket.push(StoredCredential {
                id,
                credential: c,
            });
        }
        dedupe_oauth_bucket(bucket);
        self.blocked_until.retain(|k, _| k.0 != provider);
        self.session_affinity.retain(|k, _| k.0 != provider);
        self.round_robin.retain(|k, _| k.0 != provider);
        self.buckets.get(provider).cloned().unwrap_or_default()
    }

    fn purge_expired_blocks(&mut self, now_ms: i64) {
        for indices in self.blocked_until.values_mut() {
            indices.retain(|_, &mut until| until > now_ms);
        }
    }

    /// Mark the currently-selected credential for `(provider, session)` as
    /// usage-exhausted. Returns `true` if a session affinity entry existed
    /// and was blocked.
    pub fn mark_usage_exhausted(
        &mut self,
        provider: &str,
        session: &str,
        retry_after_ms: Option<i64>,
        now_ms: i64,
    ) -> bool {
        let Some(&(kind, index)) = self
            .session_affinity
            .get(&(provider.to_string(), session.to_string()))
        else {
            return false;
        };
        let until = now_ms + retry_after_ms.unwrap_or(DEFAULT_BLOCK_MS);
        self.blocked_until
            .entry(PtKey(provider.to_string(), kind))
            .or_default()
            .insert(index, until);
        info!(provider, session, index, until, "credential usage-exhausted, blocking");
        true
    }

    fn block(&mut self, provider: &str, kind: CredentialKind, index: usize, until_ms: i64) {
        self.blocked_until
            .entry(PtKey(provider.to_string(), kind))
            .or_default()
            .insert(index, until_ms);
    }

    fn is_blocked(&self, provider: &str, kind: CredentialKind, index: usize, now_ms: i64) -> bool {
        self.blocked_until
            .get(&PtKey(provider.to_string(), kind))
            .and_then(|m| m.get(&index))
            .is_some_and(|&until| until > now_ms)
    }

    fn remove_credential(&mut self, provider: &str, id: u64) {
        if let Some(bucket) = self.buckets.get_mut(provider) {
            bucket.retain(|c| c.id != id);
        }
        self.blocked_until.retain(|k, _| k.0 != provider);
        self.session_affinity.retain(|k, _| k.0 != provider);
        self.round_robin.retain(|k, _| k.0 != provider);
    }

    /// Resolve the API key (or OAuth access token) to use for `provider` on
    /// behalf of `session`, refreshing near-expiry OAuth credentials as
    /// needed via `refresher`.
    pub async fn resolve_key(
        &mut self,
        provider: &str,
        session: Option<&str>,
        now_ms: i64,
        refresher: &dyn OAuthRefresher,
    ) -> Option<String> {
        if let Some(key) = self.runtime_overrides.get(provider) {
            return Some(key.clone());
        }

        self.purge_expired_blocks(now_ms);

        // Open question (b): API-key credentials are tried to exhaustion
        // (including their own rotation/backoff walk) before OAuth is
        // considered at all.
        for kind in [CredentialKind::ApiKey, CredentialKind::OAuth] {
            if let Some(key) = self
                .resolve_for_kind(provider, kind, session, now_ms, refresher)
                .await
            {
                return Some(key);
            }
        }

        if let Some(env) = crate::registry::get_driver(provider).and_then(|d| d.default_api_key_env)
        {
            if let Ok(v) = std::env::var(env) {
                return Some(v);
            }
        }
        self.user_resolver.as_ref().and_then(|f| f(provider))
    }

    async fn resolve_for_kind(
        &mut self,
        provider: &str,
        kind: CredentialKind,
        session: Option<&str>,
        now_ms: i64,
        refresher: &dyn OAuthRefresher,
    ) -> Option<String> {
        let n = self
            .buckets
            .get(provider)
            .map(|b| b.iter().filter(|c| c.credential.kind() == kind).count())
            .unwrap_or(0);
        if n == 0 {
            return None;
        }

        let start = self.starting_index(provider, kind, session, n);

        if let Some(key) = self
            .walk(provider, kind, session, start, n, now_ms, refresher, true)
            .await
        {
            return Some(key);
        }
        // All candidates blocked/failed: retry from the same start without
        // the skip filter, so callers still get *something* rather than
        // nothing when every credential looks exhausted.
        self.walk(provider, kind, session, start, n, now_ms, refresher, false)
            .await
    }

    fn starting_index(
        &mut self,
        provider: &str,
        kind: CredentialKind,
        session: Option<&str>,
        n: usize,
    ) -> usize {
        if let Some(s) = session {
            if let Some(&(affinity_kind, index)) = self
                .session_affinity
                .get(&(provider.to_string(), s.to_string()))
            {
                if affinity_kind == kind && index < n {
                    return index;
                }
            }
            return hash_index(s, n);
        }
        let key = PtKey(provider.to_string(), kind);
        let counter = self.round_robin.entry(key).or_insert(0);
        let idx = *counter % n;
        *counter = (*counter + 1) % n.max(1);
        idx
    }

    #[allow(clippy::too_many_arguments)]
    async fn walk(
        &mut self,
        provider: &str,
        kind: CredentialKind,
        session: Option<&str>,
        start: usize,
        n: usize,
        now_ms: i64,
        refresher: &dyn OAuthRefresher,
        skip_blocked: bool,
    ) -> Option<String> {
        for step in 0..n {
            let index = (start + step) % n;
            if skip_blocked && self.is_blocked(provider, kind, index, now_ms) {
                continue;
            }
            let id_and_cred = self
                .buckets
                .get(provider)
                .and_then(|b| {
                    b.iter()
                        .filter(|c| c.credential.kind() == kind)
                        .nth(index)
                        .map(|c| (c.id, c.credential.clone()))
                });
            let Some((id, credential)) = id_and_cred else {
                continue;
            };

            let key = match &credential {
                Credential::ApiKey { secret } => Some(secret.clone()),
                Credential::OAuth {
                    access,
                    expires_at_ms,
                    ..
                } => {
                    if *expires_at_ms - now_ms <= NEAR_EXPIRY_WINDOW_MS {
                        match refresher.refresh(provider, &credential).await {
                            Ok(refreshed) => {
                                self.apply_refresh(provider, id, refreshed.clone());
                                Some(refreshed.access)
                            }
                            Err(RefreshError::Definitive(msg)) => {
                                debug!(provider, id, msg, "oauth refresh failed definitively");
                                self.remove_credential(provider, id);
                                None
                            }
                            Err(RefreshError::Transient(msg)) => {
                                debug!(provider, id, msg, "oauth refresh failed transiently");
                                self.block(provider, kind, index, now_ms + TRANSIENT_BLOCK_MS);
                                None
                            }
                        }
                    } else {
                        Some(access.clone())
                    }
                }
            };

            if let Some(key) = key {
                if let Some(s) = session {
                    self.session_affinity
                        .insert((provider.to_string(), s.to_string()), (kind, index));
                }
                debug!(provider, index, ?kind, "selected credential");
                return Some(key);
            }
        }
        None
    }

    fn apply_refresh(&mut self, provider: &str, id: u64, refreshed: RefreshedToken) {
        if let Some(bucket) = self.buckets.get_mut(provider) {
            if let Some(entry) = bucket.iter_mut().find(|c| c.id == id) {
                if let Credential::OAuth {
                    access,
                    refresh,
                    expires_at_ms,
                    ..
                } = &mut entry.credential
                {
                    *access = refreshed.access;
                    if let Some(r) = refreshed.refresh {
                        *refresh = r;
                    }
                    *expires_at_ms = refreshed.expires_at_ms;
                }
            }
        }
    }

    /// Fetch and cache usage reports for every stored credential across all
    /// providers, merging reports that share an identity. Probe failures are
    /// logged and treated as "no data" — they never remove a credential.
    pub async fn fetch_usage_reports(
        &mut self,
        now_ms: i64,
        probe: &dyn UsageProbe,
    ) -> Vec<UsageReport> {
        let mut reports = Vec::new();
        let providers: Vec<Provider> = self.buckets.keys().cloned().collect();
        for provider in providers {
            let creds: Vec<StoredCredential> = self
                .buckets
                .get(&provider)
                .cloned()
                .unwrap_or_default();
            for sc in creds {
                let cache_key = (
                    provider.clone(),
                    sc.credential
                        .identity()
                        .unwrap_or_else(|| sc.id.to_string()),
                );
                if let Some(cached) = self.usage_cache.get(&cache_key) {
                    if !cached.expired(now_ms) {
                        reports.push(cached.clone());
                        continue;
                    }
                }
                match probe.fetch(&provider, &sc.credential).await {
                    Ok(mut report) => {
                        if report.expires_at_ms.is_none() {
                            report.expires_at_ms = Some(now_ms + USAGE_CACHE_DEFAULT_MS);
                        }
                        if report.is_exhausted() {
                            if let Some((kind, index)) = self.index_of_id(&provider, sc.id) {
                                let until = report
                                    .earliest_reset_ms(now_ms)
                                    .unwrap_or(now_ms + DEFAULT_BLOCK_MS);
                                self.block(&provider, kind, index, until);
                            }
                        }
                        self.usage_cache.insert(cache_key, report.clone());
                        reports.push(report);
                    }
                    Err(err) => {
                        debug!(provider = %provider, error = %err, "usage probe failed, no data");
                    }
                }
            }
        }
        dedupe_usage_reports(reports)
    }

    /// Find the `(kind, index-within-that-kind)` of a stored credential by
    /// its stable row id.
    fn index_of_id(&self, provider: &str, id: u64) -> Option<(CredentialKind, usize)> {
        let bucket = self.buckets.get(provider)?;
        let kind = bucket.iter().find(|c| c.id == id)?.credential.kind();
        let index = bucket
            .iter()
            .filter(|c| c.credential.kind() == kind)
            .position(|c| c.id == id)?;
        Some((kind, index))
    }
}

/// Walk an OAuth bucket newest-first, removing later duplicates that share
/// an identity with an earlier (kept) entry.
fn dedupe_oauth_bucket(bucket: &mut Vec<StoredCredential>) {
    let mut seen = std::collections::HashSet::new();
    let mut kept_rev = Vec::with_capacity(bucket.len());
    for sc in bucket.drain(..).rev() {
        match sc.credential.identity() {
            Some(identity) => {
                if seen.insert(identity) {
                    kept_rev.push(sc);
                }
            }
            None => kept_rev.push(sc),
        }
    }
    kept_rev.reverse();
    *bucket = kept_rev;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_key(secret: &str) -> Credential {
        Credential::ApiKey {
            secret: secret.to_string(),
        }
    }

    fn oauth(access: &str, account_id: &str, expires_at_ms: i64) -> Credential {
        Credential::OAuth {
            access: access.to_string(),
            refresh: format!("refresh-{access}"),
            expires_at_ms,
            account_id: Some(account_id.to_string()),
            email: None,
            project_id: None,
            enterprise_url: None,
        }
    }

    #[test]
    fn fnv_hash_is_deterministic() {
        let a = hash_index("session-X", 7);
        let b = hash_index("session-X", 7);
        assert_eq!(a, b);
        assert!(a < 7);
    }

    #[test]
    fn fnv1a_matches_32_bit_reference_constants() {
        // FNV-1a-32 of the empty string is the offset basis itself.
        assert_eq!(fnv1a(""), 2166136261);
        // Known FNV-1a-32 test vector for "a".
        assert_eq!(fnv1a("a"), 0xe40c292c);
        assert_eq!(hash_index("session-X", 7), (fnv1a("session-X") % 7) as usize);
    }

    #[test]
    fn round_robin_is_fair_over_k_times_n() {
        let mut rotator = CredentialRotator::new();
        rotator.store_credentials("p", vec![api_key("a"), api_key("b"), api_key("c")]);
        let mut counts = HashMap::new();
        for _ in 0..9 {
            let idx = rotator.starting_index("p", CredentialKind::ApiKey, None, 3);
            *counts.entry(idx).or_insert(0) += 1;
        }
        assert_eq!(counts.len(), 3);
        for v in counts.values() {
            assert_eq!(*v, 3);
        }
    }

    #[test]
    fn dedupe_keeps_first_occurrence_walking_newest_first() {
        let mut bucket = vec![
            StoredCredential { id: 0, credential: oauth("old", "acct-1", 1_000) },
            StoredCredential { id: 1, credential: oauth("new", "acct-1", 2_000) },
        ];
        dedupe_oauth_bucket(&mut bucket);
        assert_eq!(bucket.len(), 1);
        assert_eq!(bucket[0].id, 1);
    }

    #[tokio::test]
    async fn resolve_key_runtime_override_wins_unconditionally() {
        let mut rotator = CredentialRotator::new();
        rotator.store_credentials("p", vec![api_key("a")]);
        rotator.set_runtime_override("p", "override-key".into());
        let key = rotator
            .resolve_key("p", None, 0, &NoopRefresher)
            .await
            .unwrap();
        assert_eq!(key, "override-key");
    }

    #[tokio::test]
    async fn resolve_key_prefers_api_key_over_oauth() {
        let mut rotator = CredentialRotator::new();
        rotator.store_credentials("p", vec![oauth("tok", "acct-1", 1_000_000_000)]);
        rotator.store_credentials("p", vec![api_key("the-key")]);
        let key = rotator
            .resolve_key("p", None, 0, &NoopRefresher)
            .await
            .unwrap();
        assert_eq!(key, "the-key");
    }

    #[tokio::test]
    async fn mark_usage_exhausted_blocks_session_affinity_index() {
        let mut rotator = CredentialRotator::new();
        rotator.store_credentials(
            "openai-codex",
            vec![oauth("a0", "id0", 1_000_000_000), oauth("a1", "id1", 1_000_000_000), oauth("a2", "id2", 1_000_000_000)],
        );
        let n = 3usize;
        let expected_start = hash_index("S1", n);
        let first = rotator
            .resolve_key("openai-codex", Some("S1"), 0, &NoopRefresher)
            .await
            .unwrap();
        assert_eq!(first, format!("a{expected_start}"));

        let blocked = rotator.mark_usage_exhausted("openai-codex", "S1", None, 0);
        assert!(blocked);

        let second = rotator
            .resolve_key("openai-codex", Some("S1"), 1, &NoopRefresher)
            .await
            .unwrap();
        assert_ne!(second, first);
    }

    #[test]
    fn usage_report_exhausted_on_used_fraction() {
        let report = UsageReport {
            limits: vec![UsageLimit {
                id: "primary".into(),
                amount: UsageAmount {
                    used_fraction: Some(1.0),
                    ..Default::default()
                },
                window: UsageWindow::default(),
                scope: UsageScope::default(),
                status: None,
            }],
            metadata: UsageMetadata::default(),
            fetched_at_ms: 0,
            expires_at_ms: None,
        };
        assert!(report.is_exhausted());
    }

    #[test]
    fn usage_report_earliest_reset_prefers_resets_at_when_future() {
        let report = UsageReport {
            limits: vec![UsageLimit {
                id: "primary".into(),
                amount: UsageAmount {
                    used: Some(100.0),
                    limit: Some(100.0),
                    ..Default::default()
                },
                window: UsageWindow {
                    resets_at_ms: Some(5_000),
                    reset_in_ms: Some(10_000),
                },
                scope: UsageScope::default(),
                status: None,
            }],
            metadata: UsageMetadata::default(),
            fetched_at_ms: 0,
            expires_at_ms: None,
        };
        assert_eq!(report.earliest_reset_ms(0), Some(5_000));
    }

    #[test]
    fn is_definitive_failure_matches_invalid_grant() {
        assert!(is_definitive_failure("invalid_grant: token revoked", None));
        assert!(!is_definitive_failure("connection reset by peer", None));
        assert!(is_definitive_failure("forbidden", Some(403)));
    }

    #[test]
    fn jwt_identity_best_effort_never_panics_on_garbage() {
        assert_eq!(jwt_identity("not-a-jwt"), None);
        assert_eq!(jwt_identity("a.b"), None);
        assert_eq!(jwt_identity(""), None);
    }

    #[test]
    fn dedupe_usage_reports_merges_by_identity() {
        let a = UsageReport {
            limits: vec![UsageLimit {
                id: "a".into(),
                amount: UsageAmount::default(),
                window: UsageWindow::default(),
                scope: UsageScope::default(),
                status: None,
            }],
            metadata: UsageMetadata {
                account_id: Some("acct".into()),
                email: None,
            },
            fetched_at_ms: 10,
            expires_at_ms: None,
        };
        let b = UsageReport {
            limits: vec![
                UsageLimit {
                    id: "a".into(),
                    amount: UsageAmount::default(),
                    window: UsageWindow::default(),
                    scope: UsageScope::default(),
                    status: None,
                },
                UsageLimit {
                    id: "b".into(),
                    amount: UsageAmount::default(),
                    window: UsageWindow::default(),
                    scope: UsageScope::default(),
                    status: None,
                },
            ],
            metadata: UsageMetadata {
                account_id: Some("acct".into()),
                email: None,
            },
            fetched_at_ms: 20,
            expires_at_ms: None,
        };
        let merged = dedupe_usage_reports(vec![a, b]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].limits.len(), 3);
    }
}
