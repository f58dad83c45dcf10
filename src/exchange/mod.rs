//! Exchange surface
//!
//! The engine only ever talks to this trait: a balance probe for
//! reconciliation and an order-placement call. The live CLOB client is an
//! external collaborator; the shipped `PaperExchange` fills instantly at the
//! requested price and supports failure injection so the order-failure paths
//! stay testable.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::models::Side;

/// One order as the engine submits it
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub window_id: String,
    pub market_id: String,
    pub token_id: String,
    pub side: Side,
    pub size: f64,
    pub limit_price: f64,
}

#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Token balance on the exchange; 0 when the position is absent
    async fn get_balance(&self, token_id: &str) -> Result<f64>;

    /// Place an order, returning the exchange order id
    async fn place_order(&self, order: &OrderRequest) -> Result<String>;
}

/// In-process exchange: instant fills, per-token balances, injectable faults
#[derive(Default)]
pub struct PaperExchange {
    balances: RwLock<HashMap<String, f64>>,
    fail_orders: AtomicBool,
    fail_balances: AtomicBool,
    orders_placed: AtomicU64,
}

impl PaperExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_balance(&self, token_id: &str, balance: f64) {
        self.balances.write().insert(token_id.to_string(), balance);
    }

    /// Make subsequent place_order calls fail (until reset)
    pub fn fail_order_calls(&self, fail: bool) {
        self.fail_orders.store(fail, Ordering::Relaxed);
    }

    /// Make subsequent get_balance calls fail (until reset)
    pub fn fail_balance_calls(&self, fail: bool) {
        self.fail_balances.store(fail, Ordering::Relaxed);
    }

    pub fn orders_placed(&self) -> u64 {
        self.orders_placed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    async fn get_balance(&self, token_id: &str) -> Result<f64> {
        if self.fail_balances.load(Ordering::Relaxed) {
            return Err(EngineError::Api("injected balance failure".into()));
        }
        let balance = self.balances.read().get(token_id).copied().unwrap_or(0.0);
        debug!(token_id, balance, "paper balance probe");
        Ok(balance)
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<String> {
        if self.fail_orders.load(Ordering::Relaxed) {
            return Err(EngineError::Api("injected order failure".into()));
        }
        if !(order.size > 0.0 && order.size.is_finite()) {
            return Err(EngineError::Api(format!(
                "rejected order size {}",
                order.size
            )));
        }
        if !(order.limit_price > 0.0 && order.limit_price <= 1.0) {
            return Err(EngineError::Api(format!(
                "rejected order price {}",
                order.limit_price
            )));
        }

        *self
            .balances
            .write()
            .entry(order.token_id.clone())
            .or_insert(0.0) += order.size;
        self.orders_placed.fetch_add(1, Ordering::Relaxed);

        let order_id = format!("paper-{}", Uuid::new_v4());
        info!(
            order_id = %order_id,
            window_id = %order.window_id,
            token_id = %order.token_id,
            side = order.side.as_str(),
            size = order.size,
            price = order.limit_price,
            "paper order filled"
        );
        Ok(order_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(token: &str) -> OrderRequest {
        OrderRequest {
            window_id: "btc-15m-2026-01-31-10:00".into(),
            market_id: "m-1".into(),
            token_id: token.into(),
            side: Side::Long,
            size: 25.0,
            limit_price: 0.55,
        }
    }

    #[tokio::test]
    async fn fills_accumulate_balances() {
        let ex = PaperExchange::new();
        assert_eq!(ex.get_balance("t-1").await.unwrap(), 0.0);
        ex.place_order(&order("t-1")).await.unwrap();
        ex.place_order(&order("t-1")).await.unwrap();
        assert_eq!(ex.get_balance("t-1").await.unwrap(), 50.0);
        assert_eq!(ex.orders_placed(), 2);
    }

    #[tokio::test]
    async fn injected_failures_surface_as_api_errors() {
        let ex = PaperExchange::new();
        ex.fail_order_calls(true);
        let err = ex.place_order(&order("t-1")).await.unwrap_err();
        assert_eq!(err.code(), "API_ERROR");
        ex.fail_order_calls(false);
        ex.place_order(&order("t-1")).await.unwrap();

        ex.fail_balance_calls(true);
        assert_eq!(
            ex.get_balance("t-1").await.unwrap_err().code(),
            "API_ERROR"
        );
    }

    #[tokio::test]
    async fn rejects_degenerate_orders() {
        let ex = PaperExchange::new();
        let mut bad = order("t-1");
        bad.size = 0.0;
        assert!(ex.place_order(&bad).await.is_err());
        let mut bad = order("t-1");
        bad.limit_price = 1.5;
        assert!(ex.place_order(&bad).await.is_err());
    }
}
