//! Dual portfolio tracker: an always-on AI paper book and a user-driven
//! human book, each keyed by ticker under `positions/<book>/`. Grounded
//! on `risk/portfolio.py`'s `PortfolioTracker`.

use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::domain::context::PortfolioSummary;
use crate::domain::errors::StoreError;
use crate::domain::position::{Book, Position, PositionDirection, PositionStatus};
use crate::domain::signal::{Direction, Signal};
use crate::infrastructure::store::Store;

pub struct PortfolioTracker {
    store: Arc<Store>,
}

fn position_direction(direction: Direction) -> PositionDirection {
    match direction {
        Direction::Buy => PositionDirection::Long,
        Direction::Sell | Direction::Hold => PositionDirection::Short,
    }
}

impl PortfolioTracker {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    fn subdir(book: Book) -> String {
        format!("positions/{}", book.as_str())
    }

    /// Rolls up every not-closed-or-skipped position in a book. Sector
    /// exposure is left empty: positions don't carry a sector field, same
    /// gap as the source this is grounded on.
    pub async fn summary(&self, book: Book) -> Result<PortfolioSummary, StoreError> {
        let all: Vec<Position> = self.store.list_json(&Self::subdir(book)).await?;
        let open: Vec<Position> = all.into_iter().filter(Position::is_open).collect();

        let total_pnl: Decimal = open.iter().filter_map(|p| p.pnl).sum();
        let total_value: Decimal = open
            .iter()
            .map(|p| p.current_price.unwrap_or(p.entry_price) * p.size.unwrap_or(Decimal::ONE))
            .sum();
        let total_pnl_percent = if total_value.is_zero() {
            Decimal::ZERO
        } else {
            total_pnl / total_value * Decimal::from(100)
        };

        Ok(PortfolioSummary {
            portfolio_type: book.as_str().to_string(),
            total_value,
            cash: Decimal::ZERO,
            positions: open,
            total_pnl,
            total_pnl_percent,
            sector_exposure: HashMap::new(),
            today_approved_count: 0,
        })
    }

    pub async fn get_position(&self, book: Book, ticker: &str) -> Result<Option<Position>, StoreError> {
        self.store.read_json(&Self::subdir(book), ticker).await
    }

    pub async fn list_positions(&self, book: Book) -> Result<Vec<Position>, StoreError> {
        self.store.list_json(&Self::subdir(book)).await
    }

    /// Always executed on approval; the AI book mirrors every approved
    /// signal regardless of what the human does with it.
    pub async fn ai_open_position(&self, signal: &Signal) -> Result<Position, StoreError> {
        let position = Position {
            ticker: signal.ticker.clone(),
            direction: position_direction(signal.direction),
            size: None,
            entry_price: signal.entry_target.unwrap_or(Decimal::ZERO),
            current_price: None,
            pnl: None,
            pnl_percent: None,
            status: PositionStatus::Monitoring,
            portfolio: Book::Ai,
            signal_id: Some(signal.id.clone()),
            opened_at: Utc::now(),
            closed_at: None,
            close_price: None,
            realized_pnl: None,
            realized_pnl_percent: None,
            confirmed_at: None,
            confirmed_via: None,
            user_notes: None,
        };
        self.store.write_json("positions/ai", &signal.ticker, &position).await?;
        Ok(position)
    }

    pub async fn ai_close_position(&self, ticker: &str, close_price: Decimal) -> Result<Option<Position>, StoreError> {
        self.close_position(Book::Ai, ticker, close_price, None).await
    }

    pub async fn human_confirm_position(
        &self,
        signal: &Signal,
        entry_price: Decimal,
        size: Option<Decimal>,
        via: impl Into<String>,
        notes: Option<String>,
    ) -> Result<Position, StoreError> {
        let position = Position {
            ticker: signal.ticker.clone(),
            direction: position_direction(signal.direction),
            size,
            entry_price,
            current_price: None,
            pnl: None,
            pnl_percent: None,
            status: PositionStatus::Confirmed,
            portfolio: Book::Human,
            signal_id: Some(signal.id.clone()),
            opened_at: Utc::now(),
            closed_at: None,
            close_price: None,
            realized_pnl: None,
            realized_pnl_percent: None,
            confirmed_at: Some(Utc::now()),
            confirmed_via: Some(via.into()),
            user_notes: notes,
        };
        self.store.write_json("positions/human", &signal.ticker, &position).await?;
        Ok(position)
    }

    pub async fn human_skip_position(
        &self,
        signal: &Signal,
        via: impl Into<String>,
        notes: Option<String>,
    ) -> Result<Position, StoreError> {
        let position = Position {
            ticker: signal.ticker.clone(),
            direction: position_direction(signal.direction),
            size: None,
            entry_price: signal.entry_target.unwrap_or(Decimal::ZERO),
            current_price: None,
            pnl: None,
            pnl_percent: None,
            status: PositionStatus::Skipped,
            portfolio: Book::Human,
            signal_id: Some(signal.id.clone()),
            opened_at: Utc::now(),
            closed_at: None,
            close_price: None,
            realized_pnl: None,
            realized_pnl_percent: None,
            confirmed_at: Some(Utc::now()),
            confirmed_via: Some(via.into()),
            user_notes: notes,
        };
        self.store.write_json("positions/human", &signal.ticker, &position).await?;
        Ok(position)
    }

    pub async fn human_close_position(
        &self,
        ticker: &str,
        close_price: Decimal,
        via: impl Into<String>,
    ) -> Result<Option<Position>, StoreError> {
        self.close_position(Book::Human, ticker, close_price, Some(via.into())).await
    }

    /// A human trade the AI never signaled; `signal_id` stays `None` so
    /// the learning task can recognize it as `human_initiated`.
    pub async fn human_initiated_trade(
        &self,
        ticker: impl Into<String>,
        direction: PositionDirection,
        entry_price: Decimal,
        size: Option<Decimal>,
        via: impl Into<String>,
        notes: Option<String>,
    ) -> Result<Position, StoreError> {
        let ticker = ticker.into();
        let position = Position {
            ticker: ticker.clone(),
            direction,
            size,
            entry_price,
            current_price: None,
            pnl: None,
            pnl_percent: None,
            status: PositionStatus::Confirmed,
            portfolio: Book::Human,
            signal_id: None,
            opened_at: Utc::now(),
            closed_at: None,
            close_price: None,
            realized_pnl: None,
            realized_pnl_percent: None,
            confirmed_at: Some(Utc::now()),
            confirmed_via: Some(via.into()),
            user_notes: notes,
        };
        self.store.write_json("positions/human", &ticker, &position).await?;
        Ok(position)
    }

    async fn close_position(
        &self,
        book: Book,
        ticker: &str,
        close_price: Decimal,
        via: Option<String>,
    ) -> Result<Option<Position>, StoreError> {
        let Some(mut position) = self.get_position(book, ticker).await? else {
            return Ok(None);
        };

        position.status = PositionStatus::Closed;
        position.close_price = Some(close_price);
        position.closed_at = Some(Utc::now());
        if via.is_some() {
            position.confirmed_via = via;
        }

        let size = position.size.unwrap_or(Decimal::ONE);
        let realized_pnl = match position.direction {
            PositionDirection::Long => (close_price - position.entry_price) * size,
            PositionDirection::Short => (position.entry_price - close_price) * size,
        };
        let basis = position.entry_price * size;
        position.realized_pnl_percent = if basis.is_zero() {
            Some(Decimal::ZERO)
        } else {
            Some(realized_pnl / basis * Decimal::from(100))
        };
        position.realized_pnl = Some(realized_pnl);

        self.store.write_json(&Self::subdir(book), ticker, &position).await?;
        Ok(Some(position))
    }

    /// Refreshes the live price and derived P&L for every open position in
    /// a book, without changing status. Used by the monitoring loop.
    pub async fn mark_to_market(&self, book: Book, prices: &HashMap<String, Decimal>) -> Result<(), StoreError> {
        for mut position in self.list_positions(book).await? {
            if !position.is_open() {
                continue;
            }
            if let Some(price) = prices.get(&position.ticker) {
                position.update_pnl(*price);
                self.store.write_json(&Self::subdir(book), &position.ticker, &position).await?;
            }
        }
        Ok(())
    }

    /// Background loop that keeps `mark_to_market` fed from the store's
    /// latest cached price per open ticker, in both books. Without this
    /// running, `current_price`/`pnl` never leave `None` outside of
    /// hand-built fixtures and `DrawdownRule` can never see a nonzero
    /// `total_pnl`.
    pub async fn run_mark_to_market_loop(self: Arc<Self>, interval: std::time::Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            for book in [Book::Ai, Book::Human] {
                if let Err(e) = self.mark_to_market_from_store(book).await {
                    warn!(error = %e, book = book.as_str(), "failed to mark positions to market");
                }
            }
        }
    }

    async fn mark_to_market_from_store(&self, book: Book) -> Result<(), StoreError> {
        let open: Vec<Position> = self.list_positions(book).await?.into_iter().filter(Position::is_open).collect();
        let mut prices = HashMap::new();
        for position in &open {
            if let Ok(Some(price)) = self.store.latest_price(&position.ticker, None).await {
                prices.insert(position.ticker.clone(), price);
            }
        }
        self.mark_to_market(book, &prices).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tempfile::tempdir;

    async fn temp_tracker() -> PortfolioTracker {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(dir.keep()).await.unwrap());
        PortfolioTracker::new(store)
    }

    #[tokio::test]
    async fn ai_open_then_close_computes_realized_pnl() {
        let tracker = temp_tracker().await;
        let mut signal = Signal::new_proposed("NVDA", Direction::Buy, "earnings beat", 0.8, "cor_1");
        signal.entry_target = Some(dec!(100));

        tracker.ai_open_position(&signal).await.unwrap();
        let closed = tracker.ai_close_position("NVDA", dec!(120)).await.unwrap().unwrap();

        assert_eq!(closed.status, PositionStatus::Closed);
        assert_eq!(closed.realized_pnl, Some(dec!(20)));
    }

    #[tokio::test]
    async fn summary_excludes_closed_and_skipped() {
        let tracker = temp_tracker().await;
        let signal = Signal::new_proposed("AAPL", Direction::Buy, "catalyst", 0.9, "cor_1");
        tracker.ai_open_position(&signal).await.unwrap();
        tracker.ai_close_position("AAPL", dec!(10)).await.unwrap();

        let summary = tracker.summary(Book::Ai).await.unwrap();
        assert!(summary.positions.is_empty());
    }

    #[tokio::test]
    async fn human_initiated_trade_has_no_signal_id() {
        let tracker = temp_tracker().await;
        let position = tracker
            .human_initiated_trade("MSFT", PositionDirection::Long, dec!(300), None, "telegram", None)
            .await
            .unwrap();
        assert!(position.signal_id.is_none());
        assert_eq!(position.status, PositionStatus::Confirmed);
    }

    #[tokio::test]
    async fn missing_position_close_returns_none() {
        let tracker = temp_tracker().await;
        assert!(tracker.ai_close_position("GOOG", dec!(1)).await.unwrap().is_none());
    }
}
