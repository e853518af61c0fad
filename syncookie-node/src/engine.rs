use crate::config::NodeConfig;
use crate::cookie;
use crate::error::Result;
use crate::handshake::HalfOpenCounter;
use crate::mac::{KeyedMac, SipHash128};
use crate::packet::{ConnectionDescriptor, SyntheticSegment, TcpFlags, TcpSegment};
use crate::rotation::{KeyRotator, RotationSchedule};
use crate::status::{FloodCheck, RotationOutcome, StatusSnapshot, SyncookieMode, SyncookieStatus};
use crate::wire::SegmentSender;
use metrics::{counter, gauge};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Current SYN cookie configuration as reported to management clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncookieSettings {
    pub enabled: bool,
    pub adaptive: bool,
    #[serde(rename = "highwater")]
    pub hiwat: u64,
    #[serde(rename = "lowwater")]
    pub lowat: u64,
    #[serde(rename = "halfopen_states")]
    pub half_open_count: u64,
    pub active: bool,
}

pub struct SyncookieEngine {
    status: Arc<SyncookieStatus>,
    prf: Box<dyn KeyedMac>,
    half_open: Arc<dyn HalfOpenCounter>,
    sender: Arc<dyn SegmentSender>,
    schedule: Arc<RotationSchedule>,
    key_lifetime: Duration,
    default_mss: u16,
    synthetic_ttl: u8,
}

impl SyncookieEngine {
    /// Build the engine and apply the configured startup mode
    pub fn new(
        config: &NodeConfig,
        half_open: Arc<dyn HalfOpenCounter>,
        sender: Arc<dyn SegmentSender>,
    ) -> Result<Self> {
        Self::with_mac(config, half_open, sender, Box::new(SipHash128))
    }

    pub fn with_mac(
        config: &NodeConfig,
        half_open: Arc<dyn HalfOpenCounter>,
        sender: Arc<dyn SegmentSender>,
        prf: Box<dyn KeyedMac>,
    ) -> Result<Self> {
        let settings = &config.syncookies;
        let engine = Self {
            status: Arc::new(SyncookieStatus::new(settings.hiwat, settings.lowat)?),
            prf,
            half_open,
            sender,
            schedule: Arc::new(RotationSchedule::new()),
            key_lifetime: config.key_lifetime(),
            default_mss: config.network.default_mss,
            synthetic_ttl: config.network.synthetic_ttl,
        };
        engine.apply_mode(settings.mode(), settings.hiwat, settings.lowat)?;
        Ok(engine)
    }

    /// Spawn the key rotator for this engine
    pub fn spawn_rotator(&self, cancel: CancellationToken) -> KeyRotator {
        KeyRotator::spawn(
            Arc::clone(&self.status),
            Arc::clone(&self.half_open),
            Arc::clone(&self.schedule),
            self.key_lifetime,
            cancel,
        )
    }

    /// Whether the SYN in `conn` must be answered with a cookie
    pub fn check_flood(&self, conn: &ConnectionDescriptor) -> FloodCheck {
        let decision = self
            .status
            .check_flood(conn.recreated, self.half_open.half_open_count());
        if decision.kick_rotation {
            self.schedule.kick();
            gauge!("syncookies_active", 1.0);
        }
        decision.check
    }

    /// Cookie ISN for a SYN-ACK answering `conn`, advertising `mss`
    pub fn generate(&self, conn: &ConnectionDescriptor, mss: u16) -> u32 {
        let iss = self.status.generate(self.prf.as_ref(), conn, mss);
        counter!("syncookies_sent_total", 1);
        iss
    }

    /// Answer the SYN in `conn` with a cookie SYN-ACK; returns the ISN sent
    pub fn send_cookie_synack(&self, conn: &ConnectionDescriptor) -> Result<u32> {
        let mss = conn.effective_mss(self.default_mss);
        let iss = self.generate(conn, mss);

        let synack = TcpSegment {
            src: conn.dst,
            dst: conn.src,
            sport: conn.dport,
            dport: conn.sport,
            seq: iss,
            ack: conn.seq.wrapping_add(1),
            flags: TcpFlags::SYN | TcpFlags::ACK,
            window: 0,
            mss: Some(mss),
            wscale: None,
            sack_permitted: false,
            ttl: self.synthetic_ttl,
            recreated: false,
        };
        self.sender.send_segment(&synack)?;

        debug!(
            src = %conn.src,
            sport = conn.sport,
            dport = conn.dport,
            mss,
            "Cookie SYN-ACK sent"
        );
        Ok(iss)
    }

    /// Whether `conn` acknowledges one of our cookies, without consuming it
    pub fn check_cookie(&self, conn: &ConnectionDescriptor) -> bool {
        self.status.check(self.prf.as_ref(), conn)
    }

    /// Verify and consume the cookie acknowledged by `conn`
    pub fn validate_cookie(&self, conn: &ConnectionDescriptor) -> bool {
        let valid = self.status.validate(self.prf.as_ref(), conn);
        if valid {
            counter!("syncookies_validated_total", 1);
        } else {
            counter!("syncookies_rejected_total", 1);
        }
        debug!(src = %conn.src, sport = conn.sport, valid, "Cookie ACK checked");
        valid
    }

    /// SYN equivalent to the one `conn`'s cookie was issued for
    pub fn recreate_syn(&self, conn: &ConnectionDescriptor, ttl: u8) -> Option<SyntheticSegment> {
        cookie::recreate_syn(conn, ttl)
    }

    pub fn get_config(&self) -> SyncookieSettings {
        let (hiwat, lowat) = self.status.watermarks();
        let mode = self.status.mode();
        SyncookieSettings {
            enabled: mode != SyncookieMode::Never,
            adaptive: mode == SyncookieMode::Adaptive,
            hiwat,
            lowat,
            half_open_count: self.half_open.half_open_count(),
            active: self.status.is_active(),
        }
    }

    /// Change mode and watermarks. Fails without side effects when `lowat >= hiwat`.
    pub fn set_config(&self, enabled: bool, adaptive: bool, hiwat: u64, lowat: u64) -> Result<()> {
        self.apply_mode(SyncookieMode::from_flags(enabled, adaptive), hiwat, lowat)
    }

    fn apply_mode(&self, mode: SyncookieMode, hiwat: u64, lowat: u64) -> Result<()> {
        let rearm = self.status.set_mode(mode, hiwat, lowat, &mut OsRng)?;
        if rearm {
            self.schedule.rearm();
        }
        gauge!("syncookies_active", if self.status.is_active() { 1.0 } else { 0.0 });
        Ok(())
    }

    /// Run one rotation tick inline, outside the rotator task
    pub fn rotate_keys(&self) -> RotationOutcome {
        let outcome = self
            .status
            .rotate(self.half_open.half_open_count(), &mut OsRng);
        gauge!("syncookies_active", if self.status.is_active() { 1.0 } else { 0.0 });
        outcome
    }

    pub fn stats(&self) -> StatusSnapshot {
        self.status.snapshot()
    }

    /// Context teardown: deactivate and wipe all key material
    pub fn shutdown(&self) {
        self.status.quiesce();
        gauge!("syncookies_active", 0.0);
        info!("Syncookie engine shut down");
    }

    pub fn schedule(&self) -> &Arc<RotationSchedule> {
        &self.schedule
    }

    pub fn synthetic_ttl(&self) -> u8 {
        self.synthetic_ttl
    }
}
