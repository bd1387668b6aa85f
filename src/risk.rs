// =============================================================================
// Risk Gate — pre-submission checks and the kill switch
// =============================================================================
//
// Every order submission passes through the gate first. Any failed check
// refuses the submission and names the failing gate so the event log can
// record it. The kill switch is a file flag: its presence (or a contained
// truthy value) disables all submissions process-wide.
// =============================================================================

use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::warn;

use crate::journal::Intent;
use crate::types::StreamState;

// ---------------------------------------------------------------------------
// Kill switch
// ---------------------------------------------------------------------------

/// File-flag kill switch.
#[derive(Debug, Clone)]
pub struct KillSwitch {
    path: PathBuf,
}

impl KillSwitch {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// True when the flag file exists, unless its content is an explicit
    /// falsy value ("false" / "0" / "off").
    pub fn engaged(&self) -> bool {
        if !self.path.exists() {
            return false;
        }
        match std::fs::read_to_string(&self.path) {
            Ok(content) => {
                let content = content.trim().to_lowercase();
                !matches!(content.as_str(), "false" | "0" | "off")
            }
            // Unreadable flag file counts as engaged: fail closed.
            Err(_) => true,
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

/// Why a submission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GateRefusal {
    KillSwitchEngaged,
    NoActiveTradingDate,
    TradingDateMismatch,
    StreamNotArmed,
    OutsideSessionWindow,
    RecoveryModeActive,
    IncompleteIntent,
}

impl std::fmt::Display for GateRefusal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::KillSwitchEngaged => write!(f, "kill_switch_engaged"),
            Self::NoActiveTradingDate => write!(f, "no_active_trading_date"),
            Self::TradingDateMismatch => write!(f, "trading_date_mismatch"),
            Self::StreamNotArmed => write!(f, "stream_not_armed"),
            Self::OutsideSessionWindow => write!(f, "outside_session_window"),
            Self::RecoveryModeActive => write!(f, "recovery_mode_active"),
            Self::IncompleteIntent => write!(f, "incomplete_intent"),
        }
    }
}

/// Everything the gate needs to judge one submission.
#[derive(Debug, Clone, Copy)]
pub struct GateContext {
    pub utc_now: DateTime<Utc>,
    /// Engine's active trading date, if one is set.
    pub active_trading_date: Option<NaiveDate>,
    pub stream_state: StreamState,
    /// UTC session window the submission must fall inside.
    pub session_start_utc: DateTime<Utc>,
    pub session_end_utc: DateTime<Utc>,
    /// Disconnect/recovery mode blocks everything except fail-closed flattens.
    pub recovery_active: bool,
    /// True when this submission IS a fail-closed flatten.
    pub fail_closed_flatten: bool,
}

/// Pre-submission check chain.
#[derive(Debug, Clone)]
pub struct RiskGate {
    kill_switch: KillSwitch,
}

impl RiskGate {
    pub fn new(kill_switch: KillSwitch) -> Self {
        Self { kill_switch }
    }

    pub fn kill_switch(&self) -> &KillSwitch {
        &self.kill_switch
    }

    /// Run every gate in order; the first failure wins.
    pub fn check(&self, intent: &Intent, ctx: &GateContext) -> Result<(), GateRefusal> {
        if self.kill_switch.engaged() {
            return Self::refuse(intent, GateRefusal::KillSwitchEngaged);
        }

        let Some(active_date) = ctx.active_trading_date else {
            return Self::refuse(intent, GateRefusal::NoActiveTradingDate);
        };
        if active_date != intent.trading_date {
            return Self::refuse(intent, GateRefusal::TradingDateMismatch);
        }

        if matches!(
            ctx.stream_state,
            StreamState::PreHydration | StreamState::SuspendedDataInsufficient
        ) {
            return Self::refuse(intent, GateRefusal::StreamNotArmed);
        }

        if ctx.utc_now < ctx.session_start_utc || ctx.utc_now > ctx.session_end_utc {
            return Self::refuse(intent, GateRefusal::OutsideSessionWindow);
        }

        if ctx.recovery_active && !ctx.fail_closed_flatten {
            return Self::refuse(intent, GateRefusal::RecoveryModeActive);
        }

        if !intent.protectives_complete() {
            return Self::refuse(intent, GateRefusal::IncompleteIntent);
        }

        Ok(())
    }

    fn refuse(intent: &Intent, refusal: GateRefusal) -> Result<(), GateRefusal> {
        warn!(
            intent_id = %intent.intent_id,
            stream = %intent.stream_id,
            gate = %refusal,
            "submission refused by risk gate"
        );
        Err(refusal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::intent::{intent_id, IntentIdentity};
    use crate::types::{Direction, OrderKind, SessionTag};
    use chrono::TimeZone;

    fn intent() -> Intent {
        let identity = IntentIdentity {
            trading_date: NaiveDate::from_ymd_opt(2024, 6, 11).unwrap(),
            stream_id: "ES-0730",
            canonical_instrument: "ES",
            session: SessionTag::S1,
            slot_time_local: "07:30",
            direction: Direction::Long,
            entry_price: 4500.25,
            stop_price: 4495.25,
            target_price: 4510.00,
            be_trigger_price: 4506.5875,
        };
        Intent {
            intent_id: intent_id(&identity),
            trading_date: identity.trading_date,
            stream_id: "ES-0730".into(),
            canonical_instrument: "ES".into(),
            session: SessionTag::S1,
            slot_time_local: "07:30".into(),
            direction: Direction::Long,
            entry_price: 4500.25,
            stop_price: 4495.25,
            target_price: 4510.00,
            be_trigger_price: 4506.5875,
            execution_instrument: "MES".into(),
            quantity: 1,
            tick_size: 0.25,
            contract_multiplier: 5.0,
            order_kind: OrderKind::StopMarket,
            oco_group_id: None,
            slot_instance_key: "ES-0730_07:30_2024-06-11".into(),
            slippage_per_contract: 0.0,
            commission_per_contract: 0.0,
            fees_per_contract: 0.0,
        }
    }

    fn ctx() -> GateContext {
        GateContext {
            utc_now: Utc.with_ymd_and_hms(2024, 6, 11, 12, 30, 0).unwrap(),
            active_trading_date: Some(NaiveDate::from_ymd_opt(2024, 6, 11).unwrap()),
            stream_state: StreamState::RangeLocked,
            session_start_utc: Utc.with_ymd_and_hms(2024, 6, 11, 7, 0, 0).unwrap(),
            session_end_utc: Utc.with_ymd_and_hms(2024, 6, 11, 21, 0, 0).unwrap(),
            recovery_active: false,
            fail_closed_flatten: false,
        }
    }

    fn gate(dir: &tempfile::TempDir) -> RiskGate {
        RiskGate::new(KillSwitch::new(dir.path().join("KILL")))
    }

    #[test]
    fn all_gates_clear() {
        let dir = tempfile::tempdir().unwrap();
        assert!(gate(&dir).check(&intent(), &ctx()).is_ok());
    }

    #[test]
    fn kill_switch_file_blocks() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("KILL"), "").unwrap();
        assert_eq!(
            gate(&dir).check(&intent(), &ctx()),
            Err(GateRefusal::KillSwitchEngaged)
        );
    }

    #[test]
    fn kill_switch_falsy_content_does_not_block() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("KILL"), "false").unwrap();
        assert!(gate(&dir).check(&intent(), &ctx()).is_ok());
    }

    #[test]
    fn trading_date_mismatch_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = ctx();
        c.active_trading_date = Some(NaiveDate::from_ymd_opt(2024, 6, 12).unwrap());
        assert_eq!(
            gate(&dir).check(&intent(), &c),
            Err(GateRefusal::TradingDateMismatch)
        );

        c.active_trading_date = None;
        assert_eq!(
            gate(&dir).check(&intent(), &c),
            Err(GateRefusal::NoActiveTradingDate)
        );
    }

    #[test]
    fn pre_hydration_stream_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = ctx();
        c.stream_state = StreamState::PreHydration;
        assert_eq!(
            gate(&dir).check(&intent(), &c),
            Err(GateRefusal::StreamNotArmed)
        );
    }

    #[test]
    fn outside_session_window_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = ctx();
        c.utc_now = Utc.with_ymd_and_hms(2024, 6, 11, 23, 0, 0).unwrap();
        assert_eq!(
            gate(&dir).check(&intent(), &c),
            Err(GateRefusal::OutsideSessionWindow)
        );
    }

    #[test]
    fn recovery_mode_allows_only_fail_closed_flatten() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = ctx();
        c.recovery_active = true;
        assert_eq!(
            gate(&dir).check(&intent(), &c),
            Err(GateRefusal::RecoveryModeActive)
        );

        c.fail_closed_flatten = true;
        assert!(gate(&dir).check(&intent(), &c).is_ok());
    }

    #[test]
    fn incomplete_intent_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let mut i = intent();
        i.stop_price = f64::NAN;
        assert_eq!(
            gate(&dir).check(&i, &ctx()),
            Err(GateRefusal::IncompleteIntent)
        );
    }
}
