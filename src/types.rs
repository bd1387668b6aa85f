// =============================================================================
// Shared types used across the Meridian breakout engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Direction of a breakout entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// The opposing direction (used to cancel the other bracket leg).
    pub fn opposite(self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }

    /// +1.0 for long, -1.0 for short. Used in P&L and trigger arithmetic.
    pub fn sign(self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LONG" => Ok(Self::Long),
            "SHORT" => Ok(Self::Short),
            other => Err(format!("unknown direction: {other}")),
        }
    }
}

/// Where a bar came from. The derived ordering is the dedup precedence: a bar
/// from a higher source replaces a lower one at the same minute key, never
/// the reverse.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum BarSource {
    File,
    Historical,
    Live,
}

impl std::fmt::Display for BarSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File => write!(f, "FILE"),
            Self::Historical => write!(f, "HISTORICAL"),
            Self::Live => write!(f, "LIVE"),
        }
    }
}

/// How an order is expressed to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    Limit,
    StopMarket,
}

impl std::fmt::Display for OrderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market => write!(f, "MARKET"),
            Self::Limit => write!(f, "LIMIT"),
            Self::StopMarket => write!(f, "STOP_MARKET"),
        }
    }
}

/// Which protective order produced an exit fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitKind {
    Stop,
    Target,
}

impl std::fmt::Display for ExitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stop => write!(f, "STOP"),
            Self::Target => write!(f, "TARGET"),
        }
    }
}

impl std::str::FromStr for ExitKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STOP" => Ok(Self::Stop),
            "TARGET" => Ok(Self::Target),
            other => Err(format!("unknown exit kind: {other}")),
        }
    }
}

/// Intraday session a stream belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionTag {
    S1,
    S2,
}

impl SessionTag {
    /// Wall time at which the session's range window opens.
    pub fn range_start_local(self) -> &'static str {
        match self {
            Self::S1 => "02:00",
            Self::S2 => "08:30",
        }
    }
}

impl std::fmt::Display for SessionTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::S1 => write!(f, "S1"),
            Self::S2 => write!(f, "S2"),
        }
    }
}

impl std::str::FromStr for SessionTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "S1" => Ok(Self::S1),
            "S2" => Ok(Self::S2),
            other => Err(format!("unknown session tag: {other}")),
        }
    }
}

/// Lifecycle state of a stream on a trading date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamState {
    PreHydration,
    Armed,
    RangeBuilding,
    RangeLocked,
    Done,
    SuspendedDataInsufficient,
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PreHydration => write!(f, "PRE_HYDRATION"),
            Self::Armed => write!(f, "ARMED"),
            Self::RangeBuilding => write!(f, "RANGE_BUILDING"),
            Self::RangeLocked => write!(f, "RANGE_LOCKED"),
            Self::Done => write!(f, "DONE"),
            Self::SuspendedDataInsufficient => write!(f, "SUSPENDED_DATA_INSUFFICIENT"),
        }
    }
}

impl std::str::FromStr for StreamState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PRE_HYDRATION" => Ok(Self::PreHydration),
            "ARMED" => Ok(Self::Armed),
            "RANGE_BUILDING" => Ok(Self::RangeBuilding),
            "RANGE_LOCKED" => Ok(Self::RangeLocked),
            "DONE" => Ok(Self::Done),
            "SUSPENDED_DATA_INSUFFICIENT" => Ok(Self::SuspendedDataInsufficient),
            other => Err(format!("unknown stream state: {other}")),
        }
    }
}

/// Round a price to the nearest multiple of `tick_size`.
///
/// Prices from bar data are expected to already be tick-aligned; this guards
/// derived prices (breakout levels, stops, targets) against float drift.
pub fn round_to_tick(price: f64, tick_size: f64) -> f64 {
    if tick_size <= 0.0 {
        return price;
    }
    (price / tick_size).round() * tick_size
}
