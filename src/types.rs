// =============================================================================
// Shared types used across the imbalance engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Closed set of normalized exchange identifiers. Unknown venue codes never
/// reach this type — they are discarded during normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VenueCode {
    Nyse,
    Nasdaq,
    Memx,
    Iex,
    NyseArca,
    CboeEdgx,
    Miax,
    CboeBzx,
    CboeByx,
    MiaxSapphire,
    CboeEdga,
    NyseAmex,
    Cincinnati,
    Box,
    NasdaqPhlx,
}

impl VenueCode {
    /// Normalize a raw venue code string (uppercased, aliases resolved) into
    /// a closed `VenueCode`, or `None` if it does not belong to the enum.
    pub fn normalize(raw: &str) -> Option<Self> {
        let upper = raw.trim().to_uppercase();
        let canonical = match upper.as_str() {
            "NSDQ" => "NASDAQ",
            other => other,
        };
        match canonical {
            "NYSE" => Some(Self::Nyse),
            "NASDAQ" => Some(Self::Nasdaq),
            "MEMX" => Some(Self::Memx),
            "IEXG" | "IEX" => Some(Self::Iex),
            "ARCX" | "NYSE_ARCA" => Some(Self::NyseArca),
            "EDGX" | "CBOE_EDGX" => Some(Self::CboeEdgx),
            "MIAX" => Some(Self::Miax),
            "BATX" | "CBOE_BZX" => Some(Self::CboeBzx),
            "BATY" | "CBOE_BYX" => Some(Self::CboeByx),
            "MWSE" | "MIAX_SAPPHIRE" => Some(Self::MiaxSapphire),
            "EDGA" | "CBOE_EDGA" => Some(Self::CboeEdga),
            "AMEX" | "NYSE_AMEX" => Some(Self::NyseAmex),
            "CINN" | "CINCINNATI" => Some(Self::Cincinnati),
            "BOSX" | "BOX" => Some(Self::Box),
            "PHLX" | "NASDAQ_PHLX" => Some(Self::NasdaqPhlx),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nyse => "NYSE",
            Self::Nasdaq => "NASDAQ",
            Self::Memx => "MEMX",
            Self::Iex => "IEX",
            Self::NyseArca => "NYSE_ARCA",
            Self::CboeEdgx => "CBOE_EDGX",
            Self::Miax => "MIAX",
            Self::CboeBzx => "CBOE_BZX",
            Self::CboeByx => "CBOE_BYX",
            Self::MiaxSapphire => "MIAX_SAPPHIRE",
            Self::CboeEdga => "CBOE_EDGA",
            Self::NyseAmex => "NYSE_AMEX",
            Self::Cincinnati => "CINCINNATI",
            Self::Box => "BOX",
            Self::NasdaqPhlx => "NASDAQ_PHLX",
        }
    }
}

impl std::fmt::Display for VenueCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Direction of a detected order-book imbalance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    AskHeavy,
    BidHeavy,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AskHeavy => write!(f, "ask-heavy"),
            Self::BidHeavy => write!(f, "bid-heavy"),
        }
    }
}

/// Order side as submitted to the executor. `Short`/`Cover` are distinct from
/// `Sell`/`Buy` because the decision engine's flip-only rules branch on them
/// separately (closing an existing side vs. opening the opposite one).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
    Short,
    Cover,
}

impl Side {
    /// Signed position delta per unit quantity: BUY/COVER add, SELL/SHORT
    /// subtract.
    pub fn position_sign(&self) -> f64 {
        match self {
            Self::Buy | Self::Cover => 1.0,
            Self::Sell | Self::Short => -1.0,
        }
    }

    /// Whether the reference price for a limit order should use the ask
    /// (buying side) or the bid (selling side).
    pub fn uses_ask_reference(&self) -> bool {
        matches!(self, Self::Buy | Self::Cover)
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
            Self::Short => write!(f, "SHORT"),
            Self::Cover => write!(f, "COVER"),
        }
    }
}

/// Fill state machine for a submitted limit order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
    Timeout,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Cancelled | Self::Rejected | Self::Expired | Self::Timeout
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::PartiallyFilled => "PARTIALLY_FILLED",
            Self::Filled => "FILLED",
            Self::Cancelled => "CANCELLED",
            Self::Rejected => "REJECTED",
            Self::Expired => "EXPIRED",
            Self::Timeout => "TIMEOUT",
        };
        write!(f, "{s}")
    }
}

/// What to do when a limit order fails to fill within its timeout window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeoutPolicy {
    Market,
    Reprice,
    Abandon,
}

impl std::fmt::Display for TimeoutPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market => write!(f, "MARKET"),
            Self::Reprice => write!(f, "REPRICE"),
            Self::Abandon => write!(f, "ABANDON"),
        }
    }
}

impl std::str::FromStr for TimeoutPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "MARKET" => Ok(Self::Market),
            "REPRICE" => Ok(Self::Reprice),
            "ABANDON" => Ok(Self::Abandon),
            other => Err(format!("unrecognised timeout policy: {other}")),
        }
    }
}
