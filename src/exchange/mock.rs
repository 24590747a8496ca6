//! Paper venue for dry runs and tests.
//!
//! Fills market orders immediately against the stored best bid/ask, keeps
//! asset balances and net derivative contracts, and supports injected
//! faults so the executor's failure paths can be driven.

use super::error::{VenueError, VenueResult};
use super::traits::VenueAdapter;
use super::types::*;
use anyhow::Context;
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// A fill recorded by the paper venue.
#[derive(Debug, Clone, PartialEq)]
pub struct PaperFill {
    pub id: String,
    pub pair: String,
    pub side: OrderSide,
    pub amount: Decimal,
    pub price: Decimal,
    pub reduce_only: bool,
}

#[derive(Debug, Default)]
struct PaperBook {
    balances: HashMap<String, Decimal>,
    /// Net contracts per derivative pair, negative when short
    net_contracts: HashMap<String, Decimal>,
    fills: Vec<PaperFill>,
    fees_paid: Decimal,
}

#[derive(Debug, Default)]
struct FaultPlan {
    reject_next: HashMap<String, u32>,
    order_delay: HashMap<String, Duration>,
    /// One-shot fraction of the next order on a pair that fills
    partial_fill: HashMap<String, Decimal>,
    balance_unavailable: bool,
    positions_unavailable: bool,
}

/// Simulated venue implementing [`VenueAdapter`].
pub struct MockVenue {
    name: String,
    book: Arc<RwLock<PaperBook>>,
    tickers: Arc<RwLock<HashMap<String, Ticker>>>,
    markets: Arc<RwLock<HashMap<String, MarketInfo>>>,
    faults: Arc<RwLock<FaultPlan>>,
    order_id_counter: AtomicU64,
    /// Taker fee charged in the quote (spot) or settle (derivative) asset
    fee_rate: Decimal,
}

impl MockVenue {
    /// Create a new paper venue with no balances and no markets.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into().to_lowercase(),
            book: Arc::new(RwLock::new(PaperBook::default())),
            tickers: Arc::new(RwLock::new(HashMap::new())),
            markets: Arc::new(RwLock::new(HashMap::new())),
            faults: Arc::new(RwLock::new(FaultPlan::default())),
            order_id_counter: AtomicU64::new(1),
            fee_rate: dec!(0.0005),
        }
    }

    /// Override the taker fee rate.
    pub fn with_fee_rate(mut self, fee_rate: Decimal) -> Self {
        self.fee_rate = fee_rate;
        self
    }

    pub async fn set_ticker(&self, pair: &str, ticker: Ticker) {
        self.tickers.write().await.insert(pair.to_string(), ticker);
    }

    /// Set best bid and ask for a pair.
    pub async fn set_quote(&self, pair: &str, bid: Decimal, ask: Decimal) {
        self.set_ticker(pair, Ticker::from_quote(bid, ask)).await;
    }

    pub async fn set_balance(&self, asset: &str, free: Decimal) {
        self.book.write().await.balances.insert(asset.to_string(), free);
    }

    pub async fn set_market(&self, pair: &str, contract_size: Decimal) {
        self.markets
            .write()
            .await
            .insert(pair.to_string(), MarketInfo { contract_size });
    }

    /// Seed an existing short of `contracts` on a derivative pair.
    pub async fn set_short_contracts(&self, pair: &str, contracts: Decimal) {
        self.book
            .write()
            .await
            .net_contracts
            .insert(pair.to_string(), -contracts.abs());
    }

    /// Reject the next `count` orders on `pair`.
    pub async fn reject_next_orders(&self, pair: &str, count: u32) {
        self.faults
            .write()
            .await
            .reject_next
            .insert(pair.to_string(), count);
    }

    /// Hold every order on `pair` for `delay` before filling it.
    pub async fn delay_orders(&self, pair: &str, delay: Duration) {
        self.faults
            .write()
            .await
            .order_delay
            .insert(pair.to_string(), delay);
    }

    /// Fill only `fraction` of the next order on `pair`.
    pub async fn partial_fill_next(&self, pair: &str, fraction: Decimal) {
        self.faults
            .write()
            .await
            .partial_fill
            .insert(pair.to_string(), fraction);
    }

    pub async fn set_balance_unavailable(&self, unavailable: bool) {
        self.faults.write().await.balance_unavailable = unavailable;
    }

    pub async fn set_positions_unavailable(&self, unavailable: bool) {
        self.faults.write().await.positions_unavailable = unavailable;
    }

    /// All fills so far, oldest first.
    pub async fn fills(&self) -> Vec<PaperFill> {
        self.book.read().await.fills.clone()
    }

    /// Short contracts currently held on a derivative pair.
    pub async fn short_contracts(&self, pair: &str) -> Decimal {
        let net = self
            .book
            .read()
            .await
            .net_contracts
            .get(pair)
            .copied()
            .unwrap_or(Decimal::ZERO);
        if net < Decimal::ZERO {
            -net
        } else {
            Decimal::ZERO
        }
    }

    pub async fn balance_of(&self, asset: &str) -> Decimal {
        self.book
            .read()
            .await
            .balances
            .get(asset)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    pub async fn fees_paid(&self) -> Decimal {
        self.book.read().await.fees_paid
    }

    /// Load balances, markets, shorts and tickers from a scenario.
    pub async fn load_scenario(&self, scenario: &PaperScenario) {
        {
            let mut book = self.book.write().await;
            for (asset, amount) in &scenario.balances {
                book.balances.insert(asset.clone(), *amount);
            }
            for (pair, contracts) in &scenario.short_contracts {
                book.net_contracts.insert(pair.clone(), -contracts.abs());
            }
        }
        self.markets.write().await.extend(scenario.markets.clone());
        self.refresh_tickers(scenario).await;
    }

    /// Replace tickers only, leaving balances and positions untouched.
    pub async fn refresh_tickers(&self, scenario: &PaperScenario) {
        let mut tickers = self.tickers.write().await;
        for (pair, ticker) in &scenario.tickers {
            tickers.insert(pair.clone(), ticker.clone());
        }
    }

    fn next_order_id(&self) -> String {
        format!(
            "{}-{}",
            self.name,
            self.order_id_counter.fetch_add(1, Ordering::SeqCst)
        )
    }

    async fn fill_spot(
        &self,
        pair: &str,
        base: &str,
        quote: &str,
        side: OrderSide,
        amount: Decimal,
        price: Decimal,
    ) -> VenueResult<Decimal> {
        let mut book = self.book.write().await;
        let notional = amount * price;
        let fee = notional * self.fee_rate;
        let base_free = book.balances.get(base).copied().unwrap_or(Decimal::ZERO);
        let quote_free = book.balances.get(quote).copied().unwrap_or(Decimal::ZERO);

        match side {
            OrderSide::Buy => {
                if quote_free < notional + fee {
                    return Err(VenueError::InsufficientBalance(format!(
                        "{pair}: need {} {quote}, have {quote_free}",
                        notional + fee
                    )));
                }
                book.balances.insert(quote.to_string(), quote_free - notional - fee);
                book.balances.insert(base.to_string(), base_free + amount);
            }
            OrderSide::Sell => {
                if base_free < amount {
                    return Err(VenueError::InsufficientBalance(format!(
                        "{pair}: need {amount} {base}, have {base_free}"
                    )));
                }
                book.balances.insert(base.to_string(), base_free - amount);
                book.balances.insert(quote.to_string(), quote_free + notional - fee);
            }
        }
        book.fees_paid += fee;
        Ok(amount)
    }

    async fn fill_derivative(
        &self,
        pair: &str,
        settle: &str,
        side: OrderSide,
        amount: Decimal,
        price: Decimal,
        options: OrderOptions,
    ) -> VenueResult<Decimal> {
        let contract_size = self
            .markets
            .read()
            .await
            .get(pair)
            .map(|m| m.contract_size)
            .ok_or_else(|| VenueError::MarketUnavailable(pair.to_string()))?;

        let mut book = self.book.write().await;
        let net = book.net_contracts.get(pair).copied().unwrap_or(Decimal::ZERO);

        let filled = if options.reduce_only {
            let reducible = match side {
                OrderSide::Buy if net < Decimal::ZERO => -net,
                OrderSide::Sell if net > Decimal::ZERO => net,
                _ => Decimal::ZERO,
            };
            if reducible.is_zero() {
                return Err(VenueError::OrderRejected(format!(
                    "{pair}: reduce-only {side} with nothing to reduce"
                )));
            }
            amount.min(reducible)
        } else {
            amount
        };

        let fee = filled * contract_size * price * self.fee_rate;
        let settle_free = book.balances.get(settle).copied().unwrap_or(Decimal::ZERO);
        if settle_free < fee {
            return Err(VenueError::InsufficientBalance(format!(
                "{pair}: fee {fee} exceeds {settle_free} {settle}"
            )));
        }
        book.balances.insert(settle.to_string(), settle_free - fee);
        book.fees_paid += fee;

        let new_net = match side {
            OrderSide::Buy => net + filled,
            OrderSide::Sell => net - filled,
        };
        book.net_contracts.insert(pair.to_string(), new_net);
        Ok(filled)
    }
}

/// Splits `BASE/QUOTE` or `BASE/QUOTE:SETTLE`.
fn split_pair(pair: &str) -> VenueResult<(&str, &str, Option<&str>)> {
    let (market, settle) = match pair.split_once(':') {
        Some((market, settle)) => (market, Some(settle)),
        None => (pair, None),
    };
    let (base, quote) = market
        .split_once('/')
        .ok_or_else(|| VenueError::MarketUnavailable(pair.to_string()))?;
    Ok((base, quote, settle))
}

#[async_trait]
impl VenueAdapter for MockVenue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_ticker(&self, pair: &str) -> VenueResult<Ticker> {
        self.tickers
            .read()
            .await
            .get(pair)
            .cloned()
            .ok_or_else(|| VenueError::MarketUnavailable(pair.to_string()))
    }

    async fn get_balance(&self, asset: &str) -> VenueResult<Balance> {
        if self.faults.read().await.balance_unavailable {
            return Err(VenueError::Transport("balance endpoint unavailable".into()));
        }
        Ok(Balance::free_only(self.balance_of(asset).await))
    }

    async fn create_market_order(
        &self,
        pair: &str,
        side: OrderSide,
        amount: Decimal,
        options: OrderOptions,
    ) -> VenueResult<OrderAck> {
        if amount <= Decimal::ZERO {
            return Err(VenueError::OrderRejected(format!(
                "{pair}: non-positive amount {amount}"
            )));
        }

        let (delay, fraction) = {
            let mut faults = self.faults.write().await;
            if let Some(remaining) = faults.reject_next.get_mut(pair) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(VenueError::OrderRejected(format!(
                        "{pair}: rejected by venue"
                    )));
                }
            }
            (
                faults.order_delay.get(pair).copied(),
                faults.partial_fill.remove(pair),
            )
        };
        if let Some(delay) = delay {
            debug!(%pair, ?delay, "Paper order delayed");
            tokio::time::sleep(delay).await;
        }

        let ticker = self.get_ticker(pair).await?;
        let price = match side {
            OrderSide::Buy => ticker.require_ask(pair)?,
            OrderSide::Sell => ticker.require_bid(pair)?,
        };

        let amount = match fraction {
            Some(fraction) => (amount * fraction).round_dp(8),
            None => amount,
        };
        let (base, quote, settle) = split_pair(pair)?;
        let filled = match settle {
            Some(settle) => {
                self.fill_derivative(pair, settle, side, amount, price, options)
                    .await?
            }
            None => self.fill_spot(pair, base, quote, side, amount, price).await?,
        };

        let id = self.next_order_id();
        self.book.write().await.fills.push(PaperFill {
            id: id.clone(),
            pair: pair.to_string(),
            side,
            amount: filled,
            price,
            reduce_only: options.reduce_only,
        });

        info!(
            venue = %self.name,
            order_id = %id,
            %pair,
            %side,
            amount = %filled,
            %price,
            reduce_only = options.reduce_only,
            "Paper order filled"
        );

        Ok(OrderAck {
            id,
            filled,
            status: if fraction.is_some() {
                OrderStatus::PartiallyFilled
            } else {
                OrderStatus::Filled
            },
        })
    }

    async fn get_positions(&self) -> VenueResult<Vec<VenuePosition>> {
        if self.faults.read().await.positions_unavailable {
            return Err(VenueError::Transport("positions endpoint unavailable".into()));
        }

        let book = self.book.read().await;
        let markets = self.markets.read().await;
        let tickers = self.tickers.read().await;

        let mut positions: Vec<VenuePosition> = book
            .net_contracts
            .iter()
            .filter(|(_, net)| !net.is_zero())
            .map(|(pair, net)| {
                let mark_price = tickers
                    .get(pair)
                    .and_then(|t| t.last.or_else(|| t.require_mid(pair).ok()));
                let contract_size = markets.get(pair).map(|m| m.contract_size);
                let contracts = net.abs();
                VenuePosition {
                    symbol: pair.clone(),
                    side: if *net < Decimal::ZERO {
                        PositionSide::Short
                    } else {
                        PositionSide::Long
                    },
                    contracts,
                    notional: mark_price
                        .zip(contract_size)
                        .map(|(mark, cs)| contracts * cs * mark),
                    mark_price,
                }
            })
            .collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(positions)
    }

    async fn get_markets(&self) -> VenueResult<HashMap<String, MarketInfo>> {
        Ok(self.markets.read().await.clone())
    }
}

/// Starting state for one paper venue.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PaperScenario {
    #[serde(default)]
    pub tickers: HashMap<String, Ticker>,
    #[serde(default)]
    pub balances: HashMap<String, Decimal>,
    #[serde(default)]
    pub markets: HashMap<String, MarketInfo>,
    #[serde(default)]
    pub short_contracts: HashMap<String, Decimal>,
}

/// Paper scenario file: one section per venue.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PaperWorld {
    #[serde(default)]
    pub local: PaperScenario,
    #[serde(default)]
    pub derivative: PaperScenario,
}

impl PaperWorld {
    /// Read a scenario file (JSON).
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading paper scenario {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("parsing paper scenario {}", path.display()))
    }
}
