//! KRX session clock.
//!
//! Regular session 09:00-15:20 KST, closing call auction 15:20-15:30,
//! pre-open auction 08:30-09:00, weekends closed. Entries are permitted
//! only in the regular session; exits are additionally deferred (not
//! denied outright) during the call auction.

use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, Timelike, Utc};

/// Korea Standard Time. Fixed UTC+9, no DST.
pub fn kst() -> FixedOffset {
    FixedOffset::east_opt(9 * 3600).expect("KST offset")
}

pub fn now_kst() -> DateTime<FixedOffset> {
    Utc::now().with_timezone(&kst())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketStatus {
    Closed,
    PreMarket,
    Open,
    CallAuction,
}

impl MarketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketStatus::Closed => "CLOSED",
            MarketStatus::PreMarket => "PRE_MARKET",
            MarketStatus::Open => "OPEN",
            MarketStatus::CallAuction => "CALL_AUCTION",
        }
    }
}

/// Why an order was refused by the session gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionDenial {
    Closed,
    PreMarket,
    CallAuction,
}

impl SessionDenial {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionDenial::Closed => "MARKET_CLOSED",
            SessionDenial::PreMarket => "PRE_MARKET",
            SessionDenial::CallAuction => "CALL_AUCTION",
        }
    }
}

const MARKET_OPEN: (u32, u32) = (9, 0);
const AUCTION_START: (u32, u32) = (15, 20);
const MARKET_CLOSE: (u32, u32) = (15, 30);
const PRE_MARKET_START: (u32, u32) = (8, 30);

fn t(hm: (u32, u32)) -> NaiveTime {
    NaiveTime::from_hms_opt(hm.0, hm.1, 0).expect("valid time")
}

pub fn market_status(at: DateTime<FixedOffset>) -> MarketStatus {
    // Saturday / Sunday.
    if at.weekday().number_from_monday() >= 6 {
        return MarketStatus::Closed;
    }
    let time = at.time().with_nanosecond(0).unwrap_or(at.time());
    if time >= t(PRE_MARKET_START) && time < t(MARKET_OPEN) {
        MarketStatus::PreMarket
    } else if time >= t(MARKET_OPEN) && time < t(AUCTION_START) {
        MarketStatus::Open
    } else if time >= t(AUCTION_START) && time < t(MARKET_CLOSE) {
        MarketStatus::CallAuction
    } else {
        MarketStatus::Closed
    }
}

/// New entries: regular session only.
pub fn entry_allowed(at: DateTime<FixedOffset>) -> Result<(), SessionDenial> {
    match market_status(at) {
        MarketStatus::Open => Ok(()),
        MarketStatus::PreMarket => Err(SessionDenial::PreMarket),
        MarketStatus::CallAuction => Err(SessionDenial::CallAuction),
        MarketStatus::Closed => Err(SessionDenial::Closed),
    }
}

/// Exits: regular session only, but a `CallAuction` denial signals the
/// caller to defer (pending-exit) rather than drop the exit.
pub fn exit_allowed(at: DateTime<FixedOffset>) -> Result<(), SessionDenial> {
    match market_status(at) {
        MarketStatus::Open => Ok(()),
        MarketStatus::CallAuction => Err(SessionDenial::CallAuction),
        MarketStatus::PreMarket => Err(SessionDenial::PreMarket),
        MarketStatus::Closed => Err(SessionDenial::Closed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<FixedOffset> {
        // 2026-07-31 is a Friday.
        kst().with_ymd_and_hms(2026, 7, 31, h, m, 0).unwrap()
    }

    #[test]
    fn test_session_windows() {
        assert_eq!(market_status(at(8, 29)), MarketStatus::Closed);
        assert_eq!(market_status(at(8, 30)), MarketStatus::PreMarket);
        assert_eq!(market_status(at(9, 0)), MarketStatus::Open);
        assert_eq!(market_status(at(15, 19)), MarketStatus::Open);
        assert_eq!(market_status(at(15, 20)), MarketStatus::CallAuction);
        assert_eq!(market_status(at(15, 29)), MarketStatus::CallAuction);
        assert_eq!(market_status(at(15, 30)), MarketStatus::Closed);
    }

    #[test]
    fn test_weekend_is_closed() {
        let saturday = kst().with_ymd_and_hms(2026, 8, 1, 10, 0, 0).unwrap();
        assert_eq!(market_status(saturday), MarketStatus::Closed);
    }

    #[test]
    fn test_entry_gate() {
        assert!(entry_allowed(at(10, 0)).is_ok());
        assert_eq!(entry_allowed(at(15, 25)), Err(SessionDenial::CallAuction));
        assert_eq!(entry_allowed(at(8, 45)), Err(SessionDenial::PreMarket));
        assert_eq!(entry_allowed(at(16, 0)), Err(SessionDenial::Closed));
    }

    #[test]
    fn test_exit_gate_defers_in_auction() {
        assert!(exit_allowed(at(10, 0)).is_ok());
        assert_eq!(exit_allowed(at(15, 25)), Err(SessionDenial::CallAuction));
        assert_eq!(exit_allowed(at(17, 0)), Err(SessionDenial::Closed));
    }
}
