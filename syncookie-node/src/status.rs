use crate::error::{Result, SyncookieError};
use crate::secret::SecretKey;
use parking_lot::RwLock;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use syncookie_common::SLOT_COUNT;
use tracing::{debug, info, warn};

/// Operating mode of the cookie mechanism
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncookieMode {
    /// Never issue cookies
    Never,
    /// Issue cookies for every SYN
    Always,
    /// Issue cookies while the half-open count is above the watermarks
    Adaptive,
}

impl SyncookieMode {
    pub fn from_flags(enabled: bool, adaptive: bool) -> Self {
        match (enabled, adaptive) {
            (false, _) => SyncookieMode::Never,
            (true, false) => SyncookieMode::Always,
            (true, true) => SyncookieMode::Adaptive,
        }
    }
}

/// Result of the flood check for one SYN
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FloodCheck {
    Never,
    Always,
    ActiveAdaptive,
    InactiveAdaptive,
}

impl FloodCheck {
    /// Whether the SYN must be answered with a cookie
    pub fn cookies_required(self) -> bool {
        matches!(self, FloodCheck::Always | FloodCheck::ActiveAdaptive)
    }
}

/// Flood check outcome plus whether the caller must wake the rotation task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FloodDecision {
    pub check: FloodCheck,
    pub kick_rotation: bool,
}

/// Outcome of one key rotation tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationOutcome {
    /// A fresh key was installed in `slot`; the next tick must be scheduled
    Rotated { slot: usize },
    /// Nothing is in flight and the mechanism is inactive; keys were wiped
    Stopped,
}

pub(crate) struct KeyState {
    pub(crate) mode: SyncookieMode,
    pub(crate) hiwat: u64,
    pub(crate) lowat: u64,
    pub(crate) current: usize,
    pub(crate) keys: [SecretKey; SLOT_COUNT],
}

impl KeyState {
    /// Flip to the other slot and give it a fresh key and an empty in-flight count
    fn install_new_key<R: RngCore + CryptoRng>(&mut self, in_flight: &[AtomicU64; SLOT_COUNT], rng: &mut R) {
        self.current = (self.current + 1) & 1;
        in_flight[self.current].store(0, Ordering::SeqCst);
        self.keys[self.current].refill(rng);
    }
}

/// Point-in-time view of the status, for reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub mode: SyncookieMode,
    pub active: bool,
    pub hiwat: u64,
    pub lowat: u64,
    pub current_slot: usize,
    pub in_flight: [u64; SLOT_COUNT],
    pub cookies_sent: u64,
    pub cookies_validated: u64,
    pub keys_present: bool,
}

/// SYN cookie state of one network context
pub struct SyncookieStatus {
    /// Mode, watermarks, current slot and key material. Packet paths take the read side;
    /// configuration changes and rotation take the write side.
    pub(crate) keys: RwLock<KeyState>,
    /// Set from the fast path under the read side only, so the write is best effort
    pub(crate) active: AtomicBool,
    // Counters stay outside the lock
    pub(crate) in_flight: [AtomicU64; SLOT_COUNT],
    pub(crate) sent: AtomicU64,
    pub(crate) validated: AtomicU64,
}

fn check_watermarks(hiwat: u64, lowat: u64) -> Result<()> {
    if lowat >= hiwat {
        return Err(SyncookieError::InvalidWatermarks { hiwat, lowat });
    }
    Ok(())
}

impl SyncookieStatus {
    /// Create the status in mode `Never` with zeroed keys
    pub fn new(hiwat: u64, lowat: u64) -> Result<Self> {
        check_watermarks(hiwat, lowat)?;
        Ok(Self {
            keys: RwLock::new(KeyState {
                mode: SyncookieMode::Never,
                hiwat,
                lowat,
                current: 0,
                keys: [SecretKey::zeroed(), SecretKey::zeroed()],
            }),
            active: AtomicBool::new(false),
            in_flight: [AtomicU64::new(0), AtomicU64::new(0)],
            sent: AtomicU64::new(0),
            validated: AtomicU64::new(0),
        })
    }

    /// Decide whether a SYN is answered with a cookie.
    ///
    /// Runs on the packet path under the read lock only. In adaptive mode a half-open count
    /// above `hiwat` flips `active` on; minting the key needs the write lock, so that is left
    /// to the rotation task, which the caller must wake when `kick_rotation` is set.
    pub fn check_flood(&self, recreated: bool, half_open: u64) -> FloodDecision {
        let quiet = |check| FloodDecision {
            check,
            kick_rotation: false,
        };

        if recreated {
            return quiet(FloodCheck::Never);
        }

        let keys = self.keys.read();
        match keys.mode {
            SyncookieMode::Never => quiet(FloodCheck::Never),
            SyncookieMode::Always => quiet(FloodCheck::Always),
            SyncookieMode::Adaptive => {
                if self.active.load(Ordering::Relaxed) {
                    return quiet(FloodCheck::ActiveAdaptive);
                }
                if half_open > keys.hiwat
                    && self
                        .active
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
                        .is_ok()
                {
                    warn!(
                        half_open = half_open,
                        hiwat = keys.hiwat,
                        "SYN flood detected, enabling syncookies"
                    );
                    return FloodDecision {
                        check: FloodCheck::ActiveAdaptive,
                        kick_rotation: true,
                    };
                }
                if self.active.load(Ordering::Relaxed) {
                    quiet(FloodCheck::ActiveAdaptive)
                } else {
                    quiet(FloodCheck::InactiveAdaptive)
                }
            }
        }
    }

    /// Change mode and watermarks.
    ///
    /// Watermarks are validated before anything is touched. Entering `Always` mints a key
    /// and forces `active`; the return value tells the caller to re-arm the rotation timer.
    pub fn set_mode<R: RngCore + CryptoRng>(
        &self,
        mode: SyncookieMode,
        hiwat: u64,
        lowat: u64,
        rng: &mut R,
    ) -> Result<bool> {
        check_watermarks(hiwat, lowat)?;

        let mut keys = self.keys.write();
        keys.hiwat = hiwat;
        keys.lowat = lowat;

        if keys.mode == mode {
            return Ok(false);
        }

        info!(from = ?keys.mode, to = ?mode, hiwat, lowat, "Syncookie mode changed");
        keys.mode = mode;

        if mode == SyncookieMode::Always {
            keys.install_new_key(&self.in_flight, rng);
            self.active.store(true, Ordering::SeqCst);
            return Ok(true);
        }
        Ok(false)
    }

    /// One key rotation tick.
    ///
    /// Deactivates when the flood has subsided (or the mode is `Never`), wipes both keys and
    /// stops once nothing is in flight, and otherwise installs a fresh key in the other slot.
    /// The previously current slot is left untouched so cookies issued just before the tick
    /// stay verifiable for one more interval.
    pub fn rotate<R: RngCore + CryptoRng>(&self, half_open: u64, rng: &mut R) -> RotationOutcome {
        let mut keys = self.keys.write();
        let in_flight = self.in_flight_counts();

        if self.active.load(Ordering::SeqCst) {
            let load = half_open
                .saturating_add(in_flight[0])
                .saturating_add(in_flight[1]);
            let subsided = keys.mode == SyncookieMode::Adaptive && load < keys.lowat;
            if subsided || keys.mode == SyncookieMode::Never {
                self.active.store(false, Ordering::SeqCst);
                info!(half_open, in_flight = ?in_flight, "Syncookies disabled");
            }
        }

        if !self.active.load(Ordering::SeqCst) && in_flight == [0, 0] {
            for key in keys.keys.iter_mut() {
                key.wipe();
            }
            debug!("Nothing in flight, syncookie keys wiped");
            return RotationOutcome::Stopped;
        }

        keys.install_new_key(&self.in_flight, rng);
        debug!(slot = keys.current, "Syncookie key rotated");
        RotationOutcome::Rotated { slot: keys.current }
    }

    /// Deactivate and wipe key material regardless of outstanding cookies
    pub fn quiesce(&self) {
        let mut keys = self.keys.write();
        self.active.store(false, Ordering::SeqCst);
        for key in keys.keys.iter_mut() {
            key.wipe();
        }
        for counter in &self.in_flight {
            counter.store(0, Ordering::SeqCst);
        }
    }

    pub fn mode(&self) -> SyncookieMode {
        self.keys.read().mode
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// (hiwat, lowat)
    pub fn watermarks(&self) -> (u64, u64) {
        let keys = self.keys.read();
        (keys.hiwat, keys.lowat)
    }

    pub fn current_slot(&self) -> usize {
        self.keys.read().current
    }

    pub fn in_flight(&self, slot: usize) -> u64 {
        self.in_flight[slot & 1].load(Ordering::SeqCst)
    }

    pub fn in_flight_counts(&self) -> [u64; SLOT_COUNT] {
        [self.in_flight(0), self.in_flight(1)]
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let keys = self.keys.read();
        StatusSnapshot {
            mode: keys.mode,
            active: self.is_active(),
            hiwat: keys.hiwat,
            lowat: keys.lowat,
            current_slot: keys.current,
            in_flight: self.in_flight_counts(),
            cookies_sent: self.sent.load(Ordering::Relaxed),
            cookies_validated: self.validated.load(Ordering::Relaxed),
            keys_present: keys.keys.iter().any(|k| !k.is_zero()),
        }
    }
}
