use crate::broker::OrderStatus;
use crate::models::{Direction, ExitReason, Position, PositionStatus, TargetHit, Timeframe};
use crate::Result;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use uuid::Uuid;

/// Postgres persistence for positions
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to Postgres and run migrations
    ///
    /// # Arguments
    /// * `database_url` - Postgres connection URL
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!("Connected to Postgres at {}", database_url);

        Ok(Self { pool })
    }

    /// Upsert a position; called on open and again on every close
    pub async fn save_position(&self, position: &Position) -> Result<()> {
        let status_str = match position.status {
            PositionStatus::Open => "Open",
            PositionStatus::Closed => "Closed",
        };
        let direction_str = match position.direction {
            Direction::Long => "Long",
            Direction::Short => "Short",
        };
        let exit_reason_str = position.exit_reason.map(|r| match r {
            ExitReason::StopLoss => "StopLoss",
            ExitReason::TargetHit => "TargetHit",
            ExitReason::ForceClosed => "ForceClosed",
        });
        let order_status_str = position.order_status.map(|s| match s {
            OrderStatus::Pending => "Pending",
            OrderStatus::Working => "Working",
            OrderStatus::Filled => "Filled",
            OrderStatus::Cancelled => "Cancelled",
            OrderStatus::Rejected => "Rejected",
        });
        let targets_hit = serde_json::to_string(&position.targets_hit)?;

        sqlx::query(
            r#"
            INSERT INTO positions (
                id, symbol, timeframe, direction, entry_time, entry_price,
                size, initial_stop, stop, target, target_timeframe,
                risk_amount, profit_loss, profit_loss_pct,
                max_favorable_excursion, max_adverse_excursion,
                targets_hit, status, exit_price, exit_time, exit_reason,
                order_id, order_status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                    $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23)
            ON CONFLICT (id) DO UPDATE SET
                timeframe = EXCLUDED.timeframe,
                stop = EXCLUDED.stop,
                target = EXCLUDED.target,
                target_timeframe = EXCLUDED.target_timeframe,
                profit_loss = EXCLUDED.profit_loss,
                profit_loss_pct = EXCLUDED.profit_loss_pct,
                max_favorable_excursion = EXCLUDED.max_favorable_excursion,
                max_adverse_excursion = EXCLUDED.max_adverse_excursion,
                targets_hit = EXCLUDED.targets_hit,
                status = EXCLUDED.status,
                exit_price = EXCLUDED.exit_price,
                exit_time = EXCLUDED.exit_time,
                exit_reason = EXCLUDED.exit_reason,
                order_id = EXCLUDED.order_id,
                order_status = EXCLUDED.order_status,
                updated_at = NOW()
            "#,
        )
        .bind(position.id)
        .bind(&position.symbol)
        .bind(position.timeframe.to_string())
        .bind(direction_str)
        .bind(position.entry_time)
        .bind(position.entry_price)
        .bind(position.size)
        .bind(position.initial_stop)
        .bind(position.stop)
        .bind(position.target)
        .bind(position.target_timeframe.map(|tf| tf.to_string()))
        .bind(position.risk_amount)
        .bind(position.profit_loss)
        .bind(position.profit_loss_pct)
        .bind(position.max_favorable_excursion)
        .bind(position.max_adverse_excursion)
        .bind(targets_hit)
        .bind(status_str)
        .bind(position.exit_price)
        .bind(position.exit_time)
        .bind(exit_reason_str)
        .bind(&position.order_id)
        .bind(order_status_str)
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            "Saved position {} for {} to Postgres",
            position.id,
            position.symbol
        );

        Ok(())
    }

    /// Load all positions, oldest entry first
    pub async fn load_positions(&self) -> Result<Vec<Position>> {
        let rows = sqlx::query(
            r#"
            SELECT id, symbol, timeframe, direction, entry_time, entry_price,
                   size, initial_stop, stop, target, target_timeframe,
                   risk_amount, profit_loss, profit_loss_pct,
                   max_favorable_excursion, max_adverse_excursion,
                   targets_hit, status, exit_price, exit_time, exit_reason,
                   order_id, order_status
            FROM positions
            ORDER BY entry_time ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut positions = Vec::with_capacity(rows.len());
        for row in rows {
            positions.push(Self::row_to_position(&row)?);
        }

        tracing::info!("Loaded {} positions from Postgres", positions.len());

        Ok(positions)
    }

    /// Total realized profit and loss over closed positions
    pub async fn total_realized_pnl(&self) -> Result<f64> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(profit_loss), 0) as total_pnl
            FROM positions
            WHERE status = 'Closed'
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let total_pnl: rust_decimal::Decimal = row.get("total_pnl");
        Ok(total_pnl.to_string().parse()?)
    }

    fn row_to_position(row: &sqlx::postgres::PgRow) -> Result<Position> {
        let id: Uuid = row.get("id");
        let symbol: String = row.get("symbol");
        let timeframe_str: String = row.get("timeframe");
        let direction_str: String = row.get("direction");
        let entry_time: DateTime<Utc> = row.get("entry_time");
        let entry_price: rust_decimal::Decimal = row.get("entry_price");
        let size: rust_decimal::Decimal = row.get("size");
        let initial_stop: rust_decimal::Decimal = row.get("initial_stop");
        let stop: rust_decimal::Decimal = row.get("stop");
        let target: rust_decimal::Decimal = row.get("target");
        let target_timeframe_str: Option<String> = row.get("target_timeframe");
        let risk_amount: rust_decimal::Decimal = row.get("risk_amount");
        let profit_loss: rust_decimal::Decimal = row.get("profit_loss");
        let profit_loss_pct: rust_decimal::Decimal = row.get("profit_loss_pct");
        let mfe: rust_decimal::Decimal = row.get("max_favorable_excursion");
        let mae: rust_decimal::Decimal = row.get("max_adverse_excursion");
        let targets_hit_json: String = row.get("targets_hit");
        let status_str: String = row.get("status");
        let exit_price: Option<rust_decimal::Decimal> = row.get("exit_price");
        let exit_time: Option<DateTime<Utc>> = row.get("exit_time");
        let exit_reason_str: Option<String> = row.get("exit_reason");
        let order_id: Option<String> = row.get("order_id");
        let order_status_str: Option<String> = row.get("order_status");

        let timeframe: Timeframe = timeframe_str.parse()?;
        let target_timeframe = target_timeframe_str
            .map(|s| s.parse::<Timeframe>())
            .transpose()?;

        let direction = match direction_str.as_str() {
            "Long" => Direction::Long,
            "Short" => Direction::Short,
            _ => return Err("Invalid direction".into()),
        };

        let status = match status_str.as_str() {
            "Open" => PositionStatus::Open,
            "Closed" => PositionStatus::Closed,
            _ => return Err("Invalid position status".into()),
        };

        let exit_reason = match exit_reason_str.as_deref() {
            Some("StopLoss") => Some(ExitReason::StopLoss),
            Some("TargetHit") => Some(ExitReason::TargetHit),
            Some("ForceClosed") => Some(ExitReason::ForceClosed),
            None => None,
            _ => return Err("Invalid exit reason".into()),
        };

        let order_status = match order_status_str.as_deref() {
            Some("Pending") => Some(OrderStatus::Pending),
            Some("Working") => Some(OrderStatus::Working),
            Some("Filled") => Some(OrderStatus::Filled),
            Some("Cancelled") => Some(OrderStatus::Cancelled),
            Some("Rejected") => Some(OrderStatus::Rejected),
            None => None,
            _ => return Err("Invalid order status".into()),
        };

        let targets_hit: Vec<TargetHit> = serde_json::from_str(&targets_hit_json)?;

        let entry_price: f64 = entry_price.to_string().parse()?;
        let size: f64 = size.to_string().parse()?;
        let profit_loss: f64 = profit_loss.to_string().parse()?;

        Ok(Position {
            id,
            symbol,
            timeframe,
            direction,
            entry_time,
            entry_price,
            size,
            initial_stop: initial_stop.to_string().parse()?,
            stop: stop.to_string().parse()?,
            target: target.to_string().parse()?,
            target_timeframe,
            risk_amount: risk_amount.to_string().parse()?,
            current_price: exit_price
                .as_ref()
                .map(|p| p.to_string().parse())
                .transpose()?
                .unwrap_or(entry_price),
            market_value: size * entry_price,
            profit_loss,
            profit_loss_pct: profit_loss_pct.to_string().parse()?,
            max_favorable_excursion: mfe.to_string().parse()?,
            max_adverse_excursion: mae.to_string().parse()?,
            targets_hit,
            status,
            exit_price: exit_price.map(|p| p.to_string().parse()).transpose()?,
            exit_time,
            exit_reason,
            order_id,
            order_status,
        })
    }

    /// Delete all positions (testing only)
    #[cfg(test)]
    pub async fn clear_all_positions(&self) -> Result<()> {
        sqlx::query("DELETE FROM positions").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn get_test_db() -> PostgresStore {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/ladderbot_test".to_string());

        PostgresStore::new(&database_url)
            .await
            .expect("Failed to connect to test database")
    }

    fn test_position() -> Position {
        Position {
            id: Uuid::new_v4(),
            symbol: "ES".to_string(),
            timeframe: Timeframe::H1,
            direction: Direction::Long,
            entry_time: Utc::now(),
            entry_price: 5000.0,
            size: 2.0,
            initial_stop: 4950.0,
            stop: 4950.0,
            target: 5100.0,
            target_timeframe: Some(Timeframe::H4),
            risk_amount: 100.0,
            current_price: 5000.0,
            market_value: 10000.0,
            profit_loss: 0.0,
            profit_loss_pct: 0.0,
            max_favorable_excursion: 0.0,
            max_adverse_excursion: 0.0,
            targets_hit: Vec::new(),
            status: PositionStatus::Open,
            exit_price: None,
            exit_time: None,
            exit_reason: None,
            order_id: Some("G-1".to_string()),
            order_status: Some(OrderStatus::Filled),
        }
    }

    #[tokio::test]
    #[ignore] // Requires Postgres running
    async fn test_save_and_load_position() {
        let db = get_test_db().await;
        db.clear_all_positions().await.unwrap();

        let position = test_position();
        db.save_position(&position).await.unwrap();

        let positions = db.load_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].id, position.id);
        assert_eq!(positions[0].timeframe, Timeframe::H1);
        assert_eq!(positions[0].direction, Direction::Long);
        assert_eq!(positions[0].order_id, Some("G-1".to_string()));

        db.clear_all_positions().await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Postgres running
    async fn test_update_on_close() {
        let db = get_test_db().await;
        db.clear_all_positions().await.unwrap();

        let mut position = test_position();
        db.save_position(&position).await.unwrap();

        position.status = PositionStatus::Closed;
        position.exit_price = Some(5100.0);
        position.exit_time = Some(Utc::now());
        position.exit_reason = Some(ExitReason::TargetHit);
        position.profit_loss = 200.0;
        position.targets_hit.push(TargetHit {
            timeframe: Timeframe::H1,
            price: 5100.0,
            time: Utc::now(),
        });
        db.save_position(&position).await.unwrap();

        let positions = db.load_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].status, PositionStatus::Closed);
        assert_eq!(positions[0].exit_reason, Some(ExitReason::TargetHit));
        assert_eq!(positions[0].targets_hit.len(), 1);

        let total = db.total_realized_pnl().await.unwrap();
        assert_eq!(total, 200.0);

        db.clear_all_positions().await.unwrap();
    }
}
