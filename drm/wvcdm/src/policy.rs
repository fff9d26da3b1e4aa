//! Per-session policy state machine: decides at every instant whether keys
//! may decrypt, when a renewal must be fetched, and when the license
//! expires.

use std::sync::Arc;

use wvcdm_proto::{License, LicenseIdentification, LicenseType as ProtoLicenseType};
use wvcdm_proto::widevine_pssh_data::EntitledKey;

use crate::clock::WallClock;
use crate::constants::HDCP_DEVICE_CHECK_INTERVAL;
use crate::error::{CdmError, CdmResult};
use crate::events::EventListener;
use crate::key_status::{LicenseKeys, UNSPECIFIED_VIDEO_RESOLUTION};
use crate::tce::CryptoSession;
use crate::types::{
    HdcpVersion, KeyAllowedUsage, KeyStatus, QueryMap, SessionId, QUERY_KEY_LICENSE_DURATION_REMAINING,
    QUERY_KEY_LICENSE_TYPE, QUERY_KEY_PERSIST_ALLOWED, QUERY_KEY_PLAYBACK_DURATION_REMAINING,
    QUERY_KEY_PLAY_ALLOWED, QUERY_KEY_RENEWAL_SERVER_URL, QUERY_KEY_RENEW_ALLOWED,
};

const POLICY_TIMER_DURATION_SECONDS: i64 = 1;
const CLOCK_SKEW_DELTA: i64 = 5;

/// Internal sentinel; never leaves this module. `Option<i64>` is the
/// external representation of "never expires".
const NEVER_EXPIRES: i64 = i64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LicenseState {
    Initial,
    /// License start time is in the future.
    Pending,
    CanPlay,
    NeedRenewal,
    WaitingLicenseUpdate,
    Expired,
}

/// License policy fields, merged across initial response and renewals.
/// Durations of 0 mean unlimited.
#[derive(Default, Debug, Clone)]
pub struct LicensePolicy {
    pub can_play: bool,
    pub can_persist: bool,
    pub can_renew: bool,
    pub rental_duration_seconds: i64,
    pub playback_duration_seconds: i64,
    pub license_duration_seconds: i64,
    pub renewal_server_url: String,
    pub renewal_delay_seconds: i64,
    pub renewal_retry_interval_seconds: i64,
    pub renew_with_usage: bool,
    pub always_include_client_id: bool,
    pub play_start_grace_period_seconds: i64,
    pub soft_enforce_playback_duration: bool,
}

impl LicensePolicy {
    fn merge_from(&mut self, policy: &wvcdm_proto::license::Policy) {
        if let Some(v) = policy.can_play {
            self.can_play = v;
        }
        if let Some(v) = policy.can_persist {
            self.can_persist = v;
        }
        if let Some(v) = policy.can_renew {
            self.can_renew = v;
        }
        if let Some(v) = policy.rental_duration_seconds {
            self.rental_duration_seconds = v;
        }
        if let Some(v) = policy.playback_duration_seconds {
            self.playback_duration_seconds = v;
        }
        if let Some(v) = policy.license_duration_seconds {
            self.license_duration_seconds = v;
        }
        if let Some(v) = &policy.renewal_server_url {
            self.renewal_server_url = v.clone();
        }
        if let Some(v) = policy.renewal_delay_seconds {
            self.renewal_delay_seconds = v;
        }
        if let Some(v) = policy.renewal_retry_interval_seconds {
            self.renewal_retry_interval_seconds = v;
        }
        if let Some(v) = policy.renew_with_usage {
            self.renew_with_usage = v;
        }
        if let Some(v) = policy.always_include_client_id {
            self.always_include_client_id = v;
        }
        if let Some(v) = policy.play_start_grace_period_seconds {
            self.play_start_grace_period_seconds = v;
        }
        if let Some(v) = policy.soft_enforce_playback_duration {
            self.soft_enforce_playback_duration = v;
        }
    }
}

pub struct PolicyEngine {
    state: LicenseState,
    license_id: LicenseIdentification,
    policy: LicensePolicy,
    license_start_time: i64,
    playback_start_time: i64,
    last_playback_time: i64,
    grace_period_end_time: i64,
    last_expiry_time: i64,
    last_expiry_time_set: bool,
    was_expired_on_load: bool,
    next_renewal_time: i64,
    last_recorded_current_time: i64,
    current_resolution: u32,
    next_device_check: i64,
    session_id: SessionId,
    listener: Option<Arc<dyn EventListener>>,
    keys: LicenseKeys,
    clock: Arc<dyn WallClock>,
}

impl PolicyEngine {
    pub fn new(
        session_id: SessionId,
        listener: Option<Arc<dyn EventListener>>,
        crypto_session: &CryptoSession,
        clock: Arc<dyn WallClock>,
    ) -> Self {
        PolicyEngine {
            state: LicenseState::Initial,
            license_id: LicenseIdentification::default(),
            policy: LicensePolicy::default(),
            license_start_time: 0,
            playback_start_time: 0,
            last_playback_time: 0,
            grace_period_end_time: 0,
            last_expiry_time: 0,
            last_expiry_time_set: false,
            was_expired_on_load: false,
            next_renewal_time: 0,
            last_recorded_current_time: 0,
            current_resolution: UNSPECIFIED_VIDEO_RESOLUTION,
            next_device_check: 0,
            session_id,
            listener,
            keys: LicenseKeys::new(crypto_session.security_level()),
            clock,
        }
    }

    pub fn license_id(&self) -> &LicenseIdentification {
        &self.license_id
    }

    pub fn can_renew(&self) -> bool {
        self.policy.can_renew
    }

    pub fn is_license_for_future(&self) -> bool {
        self.state == LicenseState::Pending
    }

    pub fn playback_start_time(&self) -> i64 {
        self.playback_start_time
    }

    pub fn last_playback_time(&self) -> i64 {
        self.last_playback_time
    }

    pub fn grace_period_end_time(&self) -> i64 {
        self.grace_period_end_time
    }

    pub fn can_decrypt_content(&self, key_id: &[u8]) -> bool {
        self.keys.is_content_key(key_id) && self.keys.can_decrypt_content(key_id)
    }

    pub fn key_status(&self, key_id: &[u8]) -> KeyStatus {
        self.keys.key_status(key_id)
    }

    pub fn is_sufficient_output_protection(&self, key_id: &[u8]) -> bool {
        self.keys.meets_constraints(key_id)
    }

    pub fn can_use_key_for_security_level(&self, key_id: &[u8]) -> bool {
        self.keys.meets_security_level_constraints(key_id)
    }

    pub fn query_key_allowed_usage(&self, key_id: &[u8]) -> CdmResult<KeyAllowedUsage> {
        self.keys.allowed_usage(key_id).ok_or(CdmError::KeyNotFound)
    }

    // ── License ingestion ─────────────────────────────────────────────

    pub fn set_license(&mut self, license: &License, crypto_session: &CryptoSession) {
        self.license_id = license.id.clone().unwrap_or_default();
        self.policy = LicensePolicy::default();
        self.keys.set_from_license(license);
        self.update_license(license, crypto_session);
    }

    pub fn set_entitled_license_keys(&mut self, wrapped_keys: &[EntitledKey]) {
        self.keys.set_entitled_keys(wrapped_keys);
    }

    /// Install a license only to expire it: used when restoring a session
    /// for release.
    pub fn set_license_for_release(&mut self, license: &License, crypto_session: &CryptoSession) {
        self.license_id = license.id.clone().unwrap_or_default();
        self.policy = LicensePolicy::default();
        self.notify_keys_change(KeyStatus::Expired, crypto_session);
        self.update_license(license, crypto_session);
    }

    pub fn update_license(&mut self, license: &License, crypto_session: &CryptoSession) {
        let Some(policy) = &license.policy else { return };
        self.policy.merge_from(policy);

        // The start time must be present in the initial response.
        let Some(start_time) = license.license_start_time else {
            return;
        };

        // On renewal, discard the response unless the version moved forward.
        if self.state != LicenseState::Initial {
            let new_version = license.id.as_ref().and_then(|id| id.version).unwrap_or(0);
            if new_version > self.license_id.version.unwrap_or(0) {
                self.license_id = license.id.clone().unwrap_or_default();
            } else {
                return;
            }
        }

        self.license_start_time = start_time;
        self.next_renewal_time = start_time + self.policy.renewal_delay_seconds;

        let current_time = self.current_time();
        if !self.policy.can_play || self.has_license_or_playback_duration_expired(current_time) {
            self.state = LicenseState::Expired;
            self.notify_keys_change(KeyStatus::Expired, crypto_session);
            return;
        }

        if current_time >= self.license_start_time {
            self.state = LicenseState::CanPlay;
            self.notify_keys_change(KeyStatus::Usable, crypto_session);
        } else {
            self.state = LicenseState::Pending;
            self.notify_keys_change(KeyStatus::UsableInFuture, crypto_session);
        }
        self.notify_expiration_update(current_time);
    }

    // ── Playback hooks ────────────────────────────────────────────────

    /// First successful decryption. Returns false while playback is not
    /// permitted yet.
    pub fn begin_decryption(&mut self) -> bool {
        if self.playback_start_time != 0 {
            return true;
        }
        match self.state {
            LicenseState::CanPlay
            | LicenseState::NeedRenewal
            | LicenseState::WaitingLicenseUpdate => {
                self.playback_start_time = self.current_time();
                self.last_playback_time = self.playback_start_time;
                if self.policy.play_start_grace_period_seconds == 0 {
                    self.grace_period_end_time = self.playback_start_time;
                }
                if self.policy.renew_with_usage {
                    self.state = LicenseState::NeedRenewal;
                }
                self.notify_expiration_update(self.playback_start_time);
                true
            }
            _ => false,
        }
    }

    pub fn decryption_event(&mut self) {
        self.last_playback_time = self.current_time();
    }

    pub fn notify_resolution(&mut self, width: u32, height: u32, crypto_session: &CryptoSession) {
        self.current_resolution = width * height;
        self.check_device_hdcp_status(crypto_session);
    }

    /// Force expiry, e.g. when the key set is being released elsewhere.
    pub fn notify_session_expiration(&mut self, crypto_session: &CryptoSession) {
        self.state = LicenseState::Expired;
        self.notify_keys_change(KeyStatus::Expired, crypto_session);
    }

    /// Reinstall persisted playback timestamps during offline restore.
    pub fn restore_playback_times(
        &mut self,
        playback_start_time: i64,
        last_playback_time: i64,
        grace_period_end_time: i64,
    ) {
        self.playback_start_time = playback_start_time.max(0);
        self.last_playback_time = last_playback_time.max(0);
        self.grace_period_end_time = grace_period_end_time;

        // With a grace period in play, a zero grace end means playback has
        // effectively not begun; otherwise it holds the start time to use.
        if self.policy.play_start_grace_period_seconds != 0 {
            self.playback_start_time = grace_period_end_time;
        }

        let current_time = self.current_time();
        let expiry_time = self.expiry_time(current_time, true);
        self.was_expired_on_load = expiry_time != NEVER_EXPIRES && expiry_time < current_time;

        self.notify_expiration_update(current_time);
    }

    // ── Timer ─────────────────────────────────────────────────────────

    pub fn on_timer_event(&mut self, crypto_session: &CryptoSession) {
        self.last_recorded_current_time += POLICY_TIMER_DURATION_SECONDS;
        let current_time = self.current_time();

        // Once past the grace period the expiration changes shape.
        if self.grace_period_end_time == 0 && self.has_playback_started(current_time) {
            self.grace_period_end_time = self.playback_start_time;
            self.notify_expiration_update(current_time);
        }

        // License expiration trumps all.
        if self.has_license_or_playback_duration_expired(current_time)
            && self.state != LicenseState::Expired
        {
            self.state = LicenseState::Expired;
            self.notify_keys_change(KeyStatus::Expired, crypto_session);
            return;
        }

        self.check_device_hdcp_status_on_timer(current_time, crypto_session);

        let mut renewal_needed = false;
        match self.state {
            LicenseState::CanPlay => {
                if self.has_renewal_delay_expired(current_time) {
                    renewal_needed = true;
                }
                // HDCP may have changed; force a recheck through the
                // usable-status override.
                self.notify_keys_change(KeyStatus::Usable, crypto_session);
            }
            LicenseState::NeedRenewal => {
                renewal_needed = true;
            }
            LicenseState::WaitingLicenseUpdate => {
                if self.has_renewal_retry_interval_expired(current_time) {
                    renewal_needed = true;
                }
            }
            LicenseState::Pending => {
                if current_time >= self.license_start_time {
                    self.state = LicenseState::CanPlay;
                    self.notify_keys_change(KeyStatus::Usable, crypto_session);
                }
            }
            LicenseState::Initial | LicenseState::Expired => {}
        }

        if renewal_needed {
            self.state = LicenseState::WaitingLicenseUpdate;
            self.next_renewal_time = current_time + self.policy.renewal_retry_interval_seconds;
            if let Some(listener) = &self.listener {
                listener.on_session_renewal_needed(&self.session_id);
            }
        }
    }

    // ── Durations ─────────────────────────────────────────────────────

    pub fn has_playback_started(&self, current_time: i64) -> bool {
        if self.playback_start_time == 0 {
            return false;
        }
        current_time - self.playback_start_time >= self.policy.play_start_grace_period_seconds
    }

    pub fn has_license_or_playback_duration_expired(&self, current_time: i64) -> bool {
        let expiry_time = self.expiry_time(current_time, false);
        expiry_time != NEVER_EXPIRES && expiry_time <= current_time
    }

    pub fn license_or_playback_duration_remaining(&self) -> i64 {
        let current_time = self.current_time_read_only();
        let expiry_time = self.expiry_time(current_time, false);
        if expiry_time == NEVER_EXPIRES {
            return i64::MAX;
        }
        (expiry_time - current_time).max(0)
    }

    pub fn seconds_since_started(&self) -> Option<i64> {
        if self.playback_start_time == 0 {
            return None;
        }
        let elapsed = self.current_time_read_only() - self.playback_start_time;
        (elapsed >= 0).then_some(elapsed)
    }

    pub fn seconds_since_last_played(&self) -> Option<i64> {
        if self.last_playback_time == 0 {
            return None;
        }
        let elapsed = self.current_time_read_only() - self.last_playback_time;
        (elapsed >= 0).then_some(elapsed)
    }

    fn hard_license_expiry_time(&self) -> i64 {
        if self.policy.license_duration_seconds > 0 {
            self.license_start_time + self.policy.license_duration_seconds
        } else {
            NEVER_EXPIRES
        }
    }

    fn rental_expiry_time(&self) -> i64 {
        let hard_limit = self.hard_license_expiry_time();
        if self.policy.rental_duration_seconds == 0 {
            return hard_limit;
        }
        let expiry_time = self.license_start_time + self.policy.rental_duration_seconds;
        if hard_limit == NEVER_EXPIRES {
            expiry_time
        } else {
            hard_limit.min(expiry_time)
        }
    }

    fn expiry_time(&self, current_time: i64, ignore_soft_enforce_playback_duration: bool) -> i64 {
        if !self.has_playback_started(current_time) {
            return self.rental_expiry_time();
        }
        let hard_limit = self.hard_license_expiry_time();
        if self.policy.playback_duration_seconds == 0 {
            return hard_limit;
        }
        if !ignore_soft_enforce_playback_duration
            && !self.was_expired_on_load
            && self.policy.soft_enforce_playback_duration
        {
            return hard_limit;
        }
        let expiry_time = self.playback_start_time + self.policy.playback_duration_seconds;
        if hard_limit == NEVER_EXPIRES {
            expiry_time
        } else {
            hard_limit.min(expiry_time)
        }
    }

    fn license_or_rental_duration_remaining(&self, current_time: i64) -> i64 {
        if self.has_license_or_playback_duration_expired(current_time) {
            return 0;
        }
        let license_expiry_time = self.rental_expiry_time();
        if license_expiry_time == NEVER_EXPIRES {
            return i64::MAX;
        }
        if license_expiry_time < current_time {
            return 0;
        }
        let policy_license_duration = self.policy.license_duration_seconds;
        if policy_license_duration == 0 {
            license_expiry_time - current_time
        } else {
            (license_expiry_time - current_time).min(policy_license_duration)
        }
    }

    fn playback_duration_remaining(&self, current_time: i64) -> i64 {
        let playback_duration = self.policy.playback_duration_seconds;
        if playback_duration == 0 {
            return i64::MAX;
        }
        if self.playback_start_time == 0 {
            return playback_duration;
        }
        let playback_expiry_time = playback_duration + self.playback_start_time;
        if playback_expiry_time < current_time {
            return 0;
        }
        (playback_expiry_time - current_time).min(playback_duration)
    }

    fn has_renewal_delay_expired(&self, current_time: i64) -> bool {
        self.policy.can_renew
            && self.policy.renewal_delay_seconds > 0
            && self.license_start_time + self.policy.renewal_delay_seconds <= current_time
    }

    fn has_renewal_retry_interval_expired(&self, current_time: i64) -> bool {
        self.policy.can_renew
            && self.policy.renewal_retry_interval_seconds > 0
            && self.next_renewal_time <= current_time
    }

    // ── Queries ───────────────────────────────────────────────────────

    pub fn query(&self) -> QueryMap {
        let mut response = QueryMap::new();
        if self.state == LicenseState::Initial {
            return response;
        }
        let current_time = self.current_time_read_only();

        let license_type = match self.license_id.r#type.and_then(|t| ProtoLicenseType::try_from(t).ok())
        {
            Some(ProtoLicenseType::Streaming) => "Streaming",
            _ => "Offline",
        };
        response.insert(QUERY_KEY_LICENSE_TYPE, license_type.to_owned());
        response.insert(
            QUERY_KEY_PLAY_ALLOWED,
            self.policy.can_play.to_string(),
        );
        response.insert(
            QUERY_KEY_PERSIST_ALLOWED,
            self.policy.can_persist.to_string(),
        );
        response.insert(QUERY_KEY_RENEW_ALLOWED, self.policy.can_renew.to_string());
        response.insert(
            QUERY_KEY_LICENSE_DURATION_REMAINING,
            self.license_or_rental_duration_remaining(current_time).to_string(),
        );
        response.insert(
            QUERY_KEY_PLAYBACK_DURATION_REMAINING,
            self.playback_duration_remaining(current_time).to_string(),
        );
        response.insert(
            QUERY_KEY_RENEWAL_SERVER_URL,
            self.policy.renewal_server_url.clone(),
        );
        response
    }

    // ── Device state ──────────────────────────────────────────────────

    fn check_device_hdcp_status_on_timer(
        &mut self,
        current_time: i64,
        crypto_session: &CryptoSession,
    ) {
        if current_time >= self.next_device_check {
            self.check_device_hdcp_status(crypto_session);
            self.next_device_check = current_time + HDCP_DEVICE_CHECK_INTERVAL;
        }
    }

    fn check_device_hdcp_status(&mut self, crypto_session: &CryptoSession) {
        if self.keys.is_empty() {
            return;
        }
        let current_hdcp = crypto_session
            .hdcp_capabilities()
            .map(|(current, _max)| current)
            .unwrap_or(HdcpVersion::None);
        self.keys.apply_constraints(self.current_resolution, current_hdcp);
    }

    // ── Events ────────────────────────────────────────────────────────

    /// Apply a status to the current keys. A `Usable` target forces a
    /// device HDCP recheck first, which may override individual keys to
    /// `OutputNotAllowed`.
    fn notify_keys_change(&mut self, new_status: KeyStatus, crypto_session: &CryptoSession) {
        if new_status == KeyStatus::Usable {
            self.check_device_hdcp_status(crypto_session);
        }
        let (keys_changed, has_new_usable_key) = self.keys.apply_status_change(new_status);
        if keys_changed && let Some(listener) = &self.listener {
            let statuses = self.keys.extract_key_statuses();
            listener.on_session_keys_change(&self.session_id, &statuses, has_new_usable_key);
        }
    }

    fn notify_expiration_update(&mut self, current_time: i64) {
        let expiry_time = self.expiry_time(current_time, false);
        if !self.last_expiry_time_set || expiry_time != self.last_expiry_time {
            self.last_expiry_time = expiry_time;
            if let Some(listener) = &self.listener {
                let expiry = (expiry_time != NEVER_EXPIRES).then_some(expiry_time);
                listener.on_expiration_update(&self.session_id, expiry);
            }
        }
        self.last_expiry_time_set = true;
    }

    // ── Clock guard ───────────────────────────────────────────────────

    /// Wall clock guarded against rollback: a jump backwards larger than
    /// the skew delta reads as time not moving.
    fn current_time(&mut self) -> i64 {
        let mut current_time = self.clock.now();
        if current_time + CLOCK_SKEW_DELTA < self.last_recorded_current_time {
            current_time = self.last_recorded_current_time;
        } else {
            self.last_recorded_current_time = current_time;
        }
        current_time
    }

    /// Same guard without recording, for read-only queries.
    fn current_time_read_only(&self) -> i64 {
        let current_time = self.clock.now();
        if current_time + CLOCK_SKEW_DELTA < self.last_recorded_current_time {
            self.last_recorded_current_time
        } else {
            current_time
        }
    }
}
