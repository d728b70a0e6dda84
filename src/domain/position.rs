use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionDirection {
    Long,
    Short,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Signaled,
    Confirmed,
    Assumed,
    Skipped,
    Monitoring,
    ExitSignaled,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Book {
    Ai,
    Human,
}

impl Book {
    pub fn as_str(&self) -> &'static str {
        match self {
            Book::Ai => "ai",
            Book::Human => "human",
        }
    }
}

/// A tracked holding in one of the two books, keyed by ticker.
///
/// Invariant (enforced by the portfolio tracker, not here): per book and
/// ticker, at most one position with status not in {closed, skipped}.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub ticker: String,
    pub direction: PositionDirection,
    #[serde(default)]
    pub size: Option<Decimal>,
    pub entry_price: Decimal,
    #[serde(default)]
    pub current_price: Option<Decimal>,
    #[serde(default)]
    pub pnl: Option<Decimal>,
    #[serde(default)]
    pub pnl_percent: Option<Decimal>,
    pub status: PositionStatus,
    pub portfolio: Book,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_id: Option<String>,
    pub opened_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realized_pnl: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realized_pnl_percent: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmed_via: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_notes: Option<String>,
}

impl Position {
    /// `pnl = (price - entry) * size` for long, `(entry - price) * size` for
    /// short; percent against `entry * size` (size defaults to 1).
    pub fn update_pnl(&mut self, current_price: Decimal) {
        self.current_price = Some(current_price);
        let size = self.size.unwrap_or(Decimal::ONE);
        let pnl = match self.direction {
            PositionDirection::Long => (current_price - self.entry_price) * size,
            PositionDirection::Short => (self.entry_price - current_price) * size,
        };
        let basis = self.entry_price * size;
        let pnl_percent = if basis.is_zero() {
            Decimal::ZERO
        } else {
            pnl / basis * Decimal::from(100)
        };
        self.pnl = Some(pnl);
        self.pnl_percent = Some(pnl_percent);
    }

    pub fn is_open(&self) -> bool {
        !matches!(self.status, PositionStatus::Closed | PositionStatus::Skipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn base_position(direction: PositionDirection, entry: Decimal) -> Position {
        Position {
            ticker: "NVDA".into(),
            direction,
            size: Some(dec!(1)),
            entry_price: entry,
            current_price: None,
            pnl: None,
            pnl_percent: None,
            status: PositionStatus::Monitoring,
            portfolio: Book::Ai,
            signal_id: None,
            opened_at: Utc::now(),
            closed_at: None,
            close_price: None,
            realized_pnl: None,
            realized_pnl_percent: None,
            confirmed_at: None,
            confirmed_via: None,
            user_notes: None,
        }
    }

    #[test]
    fn long_pnl_is_price_minus_entry_times_size() {
        let mut p = base_position(PositionDirection::Long, dec!(100));
        p.update_pnl(dec!(110));
        assert_eq!(p.pnl, Some(dec!(10)));
        assert_eq!(p.pnl_percent, Some(dec!(10)));
    }

    #[test]
    fn short_pnl_is_entry_minus_price_times_size() {
        let mut p = base_position(PositionDirection::Short, dec!(100));
        p.update_pnl(dec!(90));
        assert_eq!(p.pnl, Some(dec!(10)));
        assert_eq!(p.pnl_percent, Some(dec!(10)));
    }

    #[test]
    fn is_open_excludes_closed_and_skipped() {
        let mut p = base_position(PositionDirection::Long, dec!(100));
        assert!(p.is_open());
        p.status = PositionStatus::Closed;
        assert!(!p.is_open());
        p.status = PositionStatus::Skipped;
        assert!(!p.is_open());
    }
}
