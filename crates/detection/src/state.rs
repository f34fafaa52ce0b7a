use chrono::{DateTime, Duration, Utc};
use mintwatch_core_types::{TokenProfile, TokenState};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct StateParams {
    pub hot_ttl_seconds: u64,
    pub warm_ttl_seconds: u64,
    pub alert_cooldown_seconds: u64,
}

#[derive(Debug, Default)]
pub struct TickTransitions {
    pub demoted_to_warm: Vec<String>,
    pub demoted_to_cold: Vec<String>,
}

/// COLD/WARM/HOT lifecycle per mint. COLD mints carry no profile at all;
/// WARM appears on first activity; HOT only via a trigger fire. Demotions
/// happen on the detector tick so expiry is observed within one tick.
pub struct StateManager {
    hot_ttl_seconds: AtomicU64,
    warm_ttl_seconds: u64,
    alert_cooldown_seconds: u64,
    profiles: Mutex<HashMap<String, TokenProfile>>,
    backfill_tx: mpsc::Sender<String>,
}

impl StateManager {
    pub fn new(params: StateParams, backfill_capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (backfill_tx, backfill_rx) = mpsc::channel(backfill_capacity.max(16));
        (
            Self {
                hot_ttl_seconds: AtomicU64::new(params.hot_ttl_seconds),
                warm_ttl_seconds: params.warm_ttl_seconds,
                alert_cooldown_seconds: params.alert_cooldown_seconds,
                profiles: Mutex::new(HashMap::new()),
                backfill_tx,
            },
            backfill_rx,
        )
    }

    /// HOT TTL is hot-reloadable; new promotions and refreshes pick up the
    /// updated value, already-scheduled expiries keep theirs.
    pub fn set_hot_ttl_seconds(&self, seconds: u64) {
        self.hot_ttl_seconds.store(seconds, Ordering::Relaxed);
    }

    pub fn hot_ttl_seconds(&self) -> u64 {
        self.hot_ttl_seconds.load(Ordering::Relaxed)
    }

    /// First swap or mint-touch moves a COLD mint to WARM; any activity
    /// refreshes the inactivity clock.
    pub fn note_activity(&self, mint: &str, now: DateTime<Utc>) -> TokenState {
        let mut profiles = self.lock();
        let profile = profiles.entry(mint.to_string()).or_insert_with(|| {
            debug!(mint, "token transitioned to WARM");
            TokenProfile {
                mint: mint.to_string(),
                state: TokenState::Warm,
                first_seen: now,
                state_since: now,
                hot_ttl_expires_at: None,
                last_activity_at: now,
                last_alert_at: None,
            }
        });
        profile.last_activity_at = now;
        profile.state
    }

    /// Trigger fired: WARM (or COLD, straight through) becomes HOT. A fire
    /// while already HOT refreshes the TTL instead. Returns true when the
    /// mint was newly promoted, in which case a backfill job is queued.
    pub fn promote_hot(&self, mint: &str, now: DateTime<Utc>) -> bool {
        let expires_at = now + Duration::seconds(self.hot_ttl_seconds() as i64);
        let newly_hot = {
            let mut profiles = self.lock();
            let profile = profiles.entry(mint.to_string()).or_insert_with(|| TokenProfile {
                mint: mint.to_string(),
                state: TokenState::Warm,
                first_seen: now,
                state_since: now,
                hot_ttl_expires_at: None,
                last_activity_at: now,
                last_alert_at: None,
            });
            if profile.state == TokenState::Hot {
                profile.hot_ttl_expires_at = Some(expires_at);
                false
            } else {
                profile.state = TokenState::Hot;
                profile.state_since = now;
                profile.hot_ttl_expires_at = Some(expires_at);
                true
            }
        };

        if newly_hot {
            info!(mint, "token promoted to HOT");
            if let Err(error) = self.backfill_tx.try_send(mint.to_string()) {
                warn!(mint, error = %error, "backfill queue full, skipping backfill");
            }
        }
        newly_hot
    }

    /// Detector-tick sweep: HOT past its TTL drops to WARM, WARM past the
    /// inactivity TTL drops off entirely (COLD keeps no profile).
    pub fn tick(&self, now: DateTime<Utc>) -> TickTransitions {
        let mut transitions = TickTransitions::default();
        let mut profiles = self.lock();

        for profile in profiles.values_mut() {
            if profile.state == TokenState::Hot {
                let expired = profile
                    .hot_ttl_expires_at
                    .is_some_and(|expires_at| now >= expires_at);
                if expired {
                    profile.state = TokenState::Warm;
                    profile.state_since = now;
                    profile.hot_ttl_expires_at = None;
                    transitions.demoted_to_warm.push(profile.mint.clone());
                }
            }
        }

        let warm_cutoff = now - Duration::seconds(self.warm_ttl_seconds as i64);
        profiles.retain(|mint, profile| {
            let expired = profile.state == TokenState::Warm && profile.last_activity_at < warm_cutoff;
            if expired {
                transitions.demoted_to_cold.push(mint.clone());
            }
            !expired
        });

        for mint in &transitions.demoted_to_warm {
            info!(mint, "token demoted HOT -> WARM");
        }
        for mint in &transitions.demoted_to_cold {
            debug!(mint, "token demoted WARM -> COLD");
        }
        transitions
    }

    pub fn state_of(&self, mint: &str) -> TokenState {
        self.lock()
            .get(mint)
            .map(|profile| profile.state)
            .unwrap_or(TokenState::Cold)
    }

    pub fn is_hot(&self, mint: &str) -> bool {
        self.state_of(mint) == TokenState::Hot
    }

    /// Mints worth evaluating on the detector tick (WARM and HOT).
    pub fn active_mints(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn hot_mints(&self) -> Vec<String> {
        self.lock()
            .values()
            .filter(|profile| profile.state == TokenState::Hot)
            .map(|profile| profile.mint.clone())
            .collect()
    }

    /// Per-mint alert gate, independent of state transitions.
    pub fn cooldown_allows_alert(&self, mint: &str, now: DateTime<Utc>) -> bool {
        let cooldown = Duration::seconds(self.alert_cooldown_seconds as i64);
        self.lock()
            .get(mint)
            .and_then(|profile| profile.last_alert_at)
            .map(|last| now - last >= cooldown)
            .unwrap_or(true)
    }

    pub fn note_alert(&self, mint: &str, now: DateTime<Utc>) {
        if let Some(profile) = self.lock().get_mut(mint) {
            profile.last_alert_at = Some(now);
        }
    }

    pub fn profile(&self, mint: &str) -> Option<TokenProfile> {
        self.lock().get(mint).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, TokenProfile>> {
        self.profiles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (StateManager, mpsc::Receiver<String>) {
        StateManager::new(
            StateParams {
                hot_ttl_seconds: 3_600,
                warm_ttl_seconds: 1_800,
                alert_cooldown_seconds: 300,
            },
            16,
        )
    }

    #[test]
    fn first_activity_moves_cold_to_warm() {
        let (manager, _rx) = manager();
        assert_eq!(manager.state_of("MintM"), TokenState::Cold);
        manager.note_activity("MintM", Utc::now());
        assert_eq!(manager.state_of("MintM"), TokenState::Warm);
    }

    #[test]
    fn promotion_schedules_backfill_once() {
        let (manager, mut rx) = manager();
        let now = Utc::now();
        manager.note_activity("MintM", now);

        assert!(manager.promote_hot("MintM", now));
        assert!(!manager.promote_hot("MintM", now), "refire refreshes TTL only");
        assert_eq!(rx.try_recv().expect("backfill queued"), "MintM");
        assert!(rx.try_recv().is_err(), "no second backfill on refresh");
    }

    #[test]
    fn hot_demotes_to_warm_exactly_at_expiry() {
        let (manager, _rx) = manager();
        let now = Utc::now();
        manager.note_activity("MintM", now);
        manager.promote_hot("MintM", now);

        let just_before = now + Duration::seconds(3_599);
        assert!(manager.tick(just_before).demoted_to_warm.is_empty());

        let at_expiry = now + Duration::seconds(3_600);
        let transitions = manager.tick(at_expiry);
        assert_eq!(transitions.demoted_to_warm, vec!["MintM".to_string()]);
        assert_eq!(manager.state_of("MintM"), TokenState::Warm);
    }

    #[test]
    fn warm_expires_to_cold_after_inactivity() {
        let (manager, _rx) = manager();
        let now = Utc::now();
        manager.note_activity("MintM", now);

        let later = now + Duration::seconds(1_801);
        let transitions = manager.tick(later);
        assert_eq!(transitions.demoted_to_cold, vec!["MintM".to_string()]);
        assert_eq!(manager.state_of("MintM"), TokenState::Cold);
    }

    #[test]
    fn refiring_while_hot_extends_the_ttl() {
        let (manager, _rx) = manager();
        let now = Utc::now();
        manager.note_activity("MintM", now);
        manager.promote_hot("MintM", now);

        let midway = now + Duration::seconds(1_800);
        manager.promote_hot("MintM", midway);

        let original_expiry = now + Duration::seconds(3_600);
        assert!(manager.tick(original_expiry).demoted_to_warm.is_empty());
        assert!(manager.is_hot("MintM"));
    }

    #[test]
    fn cooldown_gates_repeat_alerts() {
        let (manager, _rx) = manager();
        let now = Utc::now();
        manager.note_activity("MintM", now);

        assert!(manager.cooldown_allows_alert("MintM", now));
        manager.note_alert("MintM", now);
        assert!(!manager.cooldown_allows_alert("MintM", now + Duration::seconds(60)));
        assert!(manager.cooldown_allows_alert("MintM", now + Duration::seconds(300)));
    }
}
