//! Korea Investment & Securities Open API client.
//!
//! Typed request/response over the KIS REST surface. The client owns the
//! OAuth token lifecycle, retries non-order calls with exponential backoff,
//! and tracks a network-outage flag the execution loop consumes. Order
//! submissions are never auto-retried; retries happen only through the
//! synchronizer after a confirmed terminal state.

use crate::domain::entities::candle::DailyBar;
use crate::domain::entities::mode::TradingMode;
use crate::domain::entities::order::OrderType;
use crate::domain::repositories::broker::{
    AccountBalance, Broker, BrokerError, BrokerResult, ExecutionReport, ExecutionStatus, Holding,
    OrderAck, Quote, VolumeRankRow,
};
use crate::domain::services::market_hours::now_kst;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, NaiveDate};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const PAPER_BASE_URL: &str = "https://openapivts.koreainvestment.com:29443";
const REAL_BASE_URL: &str = "https://openapi.koreainvestment.com:9443";

const HTTP_TIMEOUT: Duration = Duration::from_secs(15);
const FILL_POLL_INTERVAL: Duration = Duration::from_secs(2);
const BALANCE_CACHE_AGE: Duration = Duration::from_secs(10);
const OUTAGE_WINDOW: Duration = Duration::from_secs(60);
/// Refresh when this close to expiry.
const TOKEN_REFRESH_MARGIN_MINUTES: i64 = 10;

/// Transaction ids differ between the paper server and the live server for
/// account-scoped calls; quote endpoints share one id.
#[derive(Debug, Clone)]
struct TrIds {
    buy: &'static str,
    sell: &'static str,
    balance: &'static str,
    order_status: &'static str,
    order_cancel: &'static str,
}

const TR_PRICE: &str = "FHKST01010100";
const TR_DAILY_OHLCV: &str = "FHKST03010100";
const TR_VOLUME_RANK: &str = "FHPST01710000";

fn tr_ids_for(mode: TradingMode) -> TrIds {
    if mode.is_paper_server() {
        TrIds {
            buy: "VTTC0802U",
            sell: "VTTC0801U",
            balance: "VTTC8434R",
            order_status: "VTTC8001R",
            order_cancel: "VTTC0803U",
        }
    } else {
        TrIds {
            buy: "TTTC0802U",
            sell: "TTTC0801U",
            balance: "TTTC8434R",
            order_status: "TTTC8001R",
            order_cancel: "TTTC0803U",
        }
    }
}

#[derive(Debug, Clone)]
pub struct KisConfig {
    pub app_key: String,
    pub app_secret: String,
    pub account_no: String,
    pub account_product_code: String,
    pub base_url: String,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl KisConfig {
    pub fn for_mode(
        mode: TradingMode,
        app_key: String,
        app_secret: String,
        account_no: String,
        account_product_code: String,
    ) -> Self {
        let base_url = if mode.is_paper_server() {
            PAPER_BASE_URL.to_string()
        } else {
            REAL_BASE_URL.to_string()
        };
        KisConfig {
            app_key,
            app_secret,
            account_no,
            account_product_code,
            base_url,
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Default)]
struct TokenState {
    access_token: Option<String>,
    expires_at: Option<DateTime<FixedOffset>>,
    issued_on: Option<NaiveDate>,
}

/// Whether the cached token must be re-issued: missing, within the refresh
/// margin of expiry, or issued on a previous calendar day.
fn token_needs_refresh(state: &TokenState, now: DateTime<FixedOffset>) -> bool {
    let (Some(_), Some(expires_at), Some(issued_on)) =
        (&state.access_token, state.expires_at, state.issued_on)
    else {
        return true;
    };
    if now >= expires_at - ChronoDuration::minutes(TOKEN_REFRESH_MARGIN_MINUTES) {
        return true;
    }
    issued_on != now.date_naive()
}

/// Continuous-failure tracker behind the network-outage flag.
#[derive(Debug, Default)]
struct OutageTracker {
    failing_since: Option<Instant>,
}

impl OutageTracker {
    fn record_failure(&mut self, now: Instant) {
        if self.failing_since.is_none() {
            self.failing_since = Some(now);
        }
    }

    fn record_success(&mut self) {
        self.failing_since = None;
    }

    fn is_outage(&self, now: Instant, window: Duration) -> bool {
        match self.failing_since {
            Some(since) => now.duration_since(since) >= window,
            None => false,
        }
    }
}

#[derive(Debug, Clone)]
struct OrderSnapshot {
    exec_qty: i64,
    remain_qty: i64,
    avg_price: f64,
}

pub struct KisClient {
    http: reqwest::Client,
    cfg: KisConfig,
    tr: TrIds,
    token: Mutex<TokenState>,
    outage: std::sync::Mutex<OutageTracker>,
    balance_cache: Mutex<Option<(Instant, AccountBalance)>>,
}

impl KisClient {
    pub fn new(mode: TradingMode, cfg: KisConfig) -> BrokerResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| BrokerError::Transient(format!("http client build failed: {}", e)))?;
        info!("[KIS] client ready: {} ({})", cfg.base_url, mode);
        Ok(KisClient {
            http,
            cfg,
            tr: tr_ids_for(mode),
            token: Mutex::new(TokenState::default()),
            outage: std::sync::Mutex::new(OutageTracker::default()),
            balance_cache: Mutex::new(None),
        })
    }

    fn note_failure(&self) {
        self.outage.lock().unwrap().record_failure(Instant::now());
    }

    fn note_success(&self) {
        self.outage.lock().unwrap().record_success();
    }

    /// Cached token, refreshed inside a single-holder lock when within the
    /// margin of expiry or when the KST day has rolled.
    async fn ensure_token(&self) -> BrokerResult<String> {
        let mut state = self.token.lock().await;
        if !token_needs_refresh(&state, now_kst()) {
            if let Some(token) = state.access_token.clone() {
                return Ok(token);
            }
        }

        info!("[KIS] requesting access token");
        let url = format!("{}/oauth2/tokenP", self.cfg.base_url);
        let body = json!({
            "grant_type": "client_credentials",
            "appkey": self.cfg.app_key,
            "appsecret": self.cfg.app_secret,
        });
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                self.note_failure();
                BrokerError::Auth(format!("token request failed: {}", e))
            })?;
        let data: Value = response
            .json()
            .await
            .map_err(|e| BrokerError::Auth(format!("token response unreadable: {}", e)))?;

        let Some(token) = data.get("access_token").and_then(|v| v.as_str()) else {
            return Err(BrokerError::Auth(format!("token issue rejected: {}", data)));
        };
        let expires_in = data
            .get("expires_in")
            .and_then(|v| v.as_i64())
            .unwrap_or(86_400);
        let now = now_kst();
        let expires_at = now + ChronoDuration::seconds(expires_in);
        state.access_token = Some(token.to_string());
        state.expires_at = Some(expires_at);
        state.issued_on = Some(now.date_naive());
        self.note_success();
        info!("[KIS] token issued, expires {}", expires_at);
        Ok(token.to_string())
    }

    async fn auth_headers(&self, tr_id: &str) -> BrokerResult<Vec<(&'static str, String)>> {
        let token = self.ensure_token().await?;
        Ok(vec![
            ("content-type", "application/json; charset=utf-8".to_string()),
            ("authorization", format!("Bearer {}", token)),
            ("appkey", self.cfg.app_key.clone()),
            ("appsecret", self.cfg.app_secret.clone()),
            ("tr_id", tr_id.to_string()),
        ])
    }

    /// GET with retry/backoff. Only for idempotent reads; order submission
    /// goes through `post_once`.
    async fn get_with_retry(
        &self,
        path: &str,
        tr_id: &str,
        params: &[(&str, String)],
    ) -> BrokerResult<Value> {
        let url = format!("{}{}", self.cfg.base_url, path);
        let mut last_err = BrokerError::Transient("no attempt made".into());

        for attempt in 0..=self.cfg.max_retries {
            if attempt > 0 {
                let backoff = self.cfg.retry_base_delay * 2u32.pow(attempt - 1);
                tokio::time::sleep(backoff).await;
            }
            let headers = self.auth_headers(tr_id).await?;
            let mut request = self.http.get(&url).query(params);
            for (name, value) in &headers {
                request = request.header(*name, value.as_str());
            }
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    match response.json::<Value>().await {
                        Ok(data) => {
                            self.note_success();
                            return Ok(data);
                        }
                        Err(e) => {
                            last_err = BrokerError::Transient(format!("bad response body: {}", e));
                        }
                    }
                }
                Ok(response) => {
                    last_err =
                        BrokerError::Transient(format!("http status {}", response.status()));
                }
                Err(e) => {
                    last_err = BrokerError::Transient(format!("request failed: {}", e));
                }
            }
            self.note_failure();
        }
        Err(last_err)
    }

    /// Single-attempt POST used for order submission and cancel.
    async fn post_once(&self, path: &str, tr_id: &str, body: &Value) -> BrokerResult<Value> {
        let url = format!("{}{}", self.cfg.base_url, path);
        let headers = self.auth_headers(tr_id).await?;
        let mut request = self.http.post(&url).json(body);
        for (name, value) in &headers {
            request = request.header(*name, value.as_str());
        }
        let response = request.send().await.map_err(|e| {
            self.note_failure();
            BrokerError::Submit(format!("request failed: {}", e))
        })?;
        if !response.status().is_success() {
            self.note_failure();
            return Err(BrokerError::Submit(format!(
                "http status {}",
                response.status()
            )));
        }
        self.note_success();
        response
            .json::<Value>()
            .await
            .map_err(|e| BrokerError::Submit(format!("bad response body: {}", e)))
    }

    async fn place_order(
        &self,
        symbol: &str,
        qty: i64,
        price: i64,
        order_type: OrderType,
        is_buy: bool,
    ) -> BrokerResult<OrderAck> {
        let tr_id = if is_buy { self.tr.buy } else { self.tr.sell };
        let body = json!({
            "CANO": self.cfg.account_no,
            "ACNT_PRDT_CD": self.cfg.account_product_code,
            "PDNO": symbol,
            "ORD_DVSN": order_type.kis_code(),
            "ORD_QTY": qty.to_string(),
            "ORD_UNPR": if price > 0 { price.to_string() } else { "0".to_string() },
        });
        let side = if is_buy { "buy" } else { "sell" };
        info!("[KIS] {} order: {} x{}", side, symbol, qty);

        let data = self
            .post_once("/uapi/domestic-stock/v1/trading/order-cash", tr_id, &body)
            .await?;

        let accepted = data.get("rt_cd").and_then(|v| v.as_str()) == Some("0");
        let order_no = data
            .pointer("/output/ODNO")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let message = data
            .get("msg1")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        if accepted {
            info!("[KIS] {} order accepted: {}", side, order_no);
        } else {
            warn!("[KIS] {} order rejected: {}", side, message);
        }
        Ok(OrderAck {
            accepted,
            order_no,
            message,
        })
    }

    /// Current fill figures for one order. The daily-fills endpoint reports
    /// quantities cumulatively.
    async fn order_snapshot(&self, order_no: &str) -> BrokerResult<Option<OrderSnapshot>> {
        let today = now_kst().format("%Y%m%d").to_string();
        let params = [
            ("CANO", self.cfg.account_no.clone()),
            ("ACNT_PRDT_CD", self.cfg.account_product_code.clone()),
            ("INQR_STRT_DT", today.clone()),
            ("INQR_END_DT", today),
            ("SLL_BUY_DVSN_CD", "00".to_string()),
            ("INQR_DVSN", "00".to_string()),
            ("PDNO", String::new()),
            ("CCLD_DVSN", "00".to_string()),
            ("ORD_GNO_BRNO", String::new()),
            ("ODNO", order_no.to_string()),
            ("INQR_DVSN_3", "00".to_string()),
            ("INQR_DVSN_1", String::new()),
            ("CTX_AREA_FK100", String::new()),
            ("CTX_AREA_NK100", String::new()),
        ];
        let data = self
            .get_with_retry(
                "/uapi/domestic-stock/v1/trading/inquire-daily-ccld",
                self.tr.order_status,
                &params,
            )
            .await?;
        if data.get("rt_cd").and_then(|v| v.as_str()) != Some("0") {
            return Err(BrokerError::Transient(format!(
                "order status query failed: {}",
                msg_of(&data)
            )));
        }
        let Some(rows) = data.get("output1").and_then(|v| v.as_array()) else {
            return Ok(None);
        };
        let row = rows
            .iter()
            .find(|r| r.get("odno").and_then(|v| v.as_str()) == Some(order_no));
        Ok(row.map(|r| {
            let order_qty = field_i64(r, "ord_qty");
            let exec_qty = field_i64(r, "tot_ccld_qty");
            OrderSnapshot {
                exec_qty,
                remain_qty: order_qty - exec_qty,
                avg_price: field_f64(r, "avg_prvs"),
            }
        }))
    }
}

fn msg_of(data: &Value) -> String {
    data.get("msg1")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown error")
        .to_string()
}

fn field_f64(row: &Value, key: &str) -> f64 {
    match row.get(key) {
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn field_i64(row: &Value, key: &str) -> i64 {
    match row.get(key) {
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
        _ => 0,
    }
}

#[async_trait]
impl Broker for KisClient {
    async fn get_current_price(&self, symbol: &str) -> BrokerResult<Quote> {
        let params = [
            ("FID_COND_MRKT_DIV_CODE", "J".to_string()),
            ("FID_INPUT_ISCD", symbol.to_string()),
        ];
        let data = self
            .get_with_retry(
                "/uapi/domestic-stock/v1/quotations/inquire-price",
                TR_PRICE,
                &params,
            )
            .await?;
        if data.get("rt_cd").and_then(|v| v.as_str()) != Some("0") {
            return Err(BrokerError::Transient(format!(
                "price query failed: {}",
                msg_of(&data)
            )));
        }
        let output = data.get("output").cloned().unwrap_or(Value::Null);
        let current_price = field_f64(&output, "stck_prpr");
        if current_price <= 0.0 {
            return Err(BrokerError::NoQuote(symbol.to_string()));
        }
        Ok(Quote {
            symbol: symbol.to_string(),
            current_price,
            open_price: field_f64(&output, "stck_oprc"),
            high_price: field_f64(&output, "stck_hgpr"),
            low_price: field_f64(&output, "stck_lwpr"),
            volume: field_i64(&output, "acml_vol"),
            change_rate: field_f64(&output, "prdy_ctrt"),
        })
    }

    async fn get_daily_ohlcv(&self, symbol: &str, count: usize) -> BrokerResult<Vec<DailyBar>> {
        let end = now_kst().format("%Y%m%d").to_string();
        let start = (now_kst() - ChronoDuration::days(2 * count as i64 + 30))
            .format("%Y%m%d")
            .to_string();
        let params = [
            ("FID_COND_MRKT_DIV_CODE", "J".to_string()),
            ("FID_INPUT_ISCD", symbol.to_string()),
            ("FID_INPUT_DATE_1", start),
            ("FID_INPUT_DATE_2", end),
            ("FID_PERIOD_DIV_CODE", "D".to_string()),
            ("FID_ORG_ADJ_PRC", "0".to_string()),
        ];
        let data = self
            .get_with_retry(
                "/uapi/domestic-stock/v1/quotations/inquire-daily-itemchartprice",
                TR_DAILY_OHLCV,
                &params,
            )
            .await?;
        if data.get("rt_cd").and_then(|v| v.as_str()) != Some("0") {
            return Err(BrokerError::Transient(format!(
                "ohlcv query failed: {}",
                msg_of(&data)
            )));
        }
        let mut bars = Vec::new();
        if let Some(rows) = data.get("output2").and_then(|v| v.as_array()) {
            for row in rows {
                let Some(date_str) = row.get("stck_bsop_date").and_then(|v| v.as_str()) else {
                    continue;
                };
                let Ok(date) = NaiveDate::parse_from_str(date_str, "%Y%m%d") else {
                    continue;
                };
                let close = field_f64(row, "stck_clpr");
                if close <= 0.0 {
                    continue;
                }
                bars.push(DailyBar {
                    date,
                    open: field_f64(row, "stck_oprc"),
                    high: field_f64(row, "stck_hgpr"),
                    low: field_f64(row, "stck_lwpr"),
                    close,
                    volume: field_i64(row, "acml_vol"),
                });
            }
        }
        // Descending trading-day order, newest first.
        bars.sort_by(|a, b| b.date.cmp(&a.date));
        bars.dedup_by_key(|b| b.date);
        bars.truncate(count);
        Ok(bars)
    }

    async fn get_account_balance(&self) -> BrokerResult<AccountBalance> {
        {
            let cache = self.balance_cache.lock().await;
            if let Some((at, balance)) = cache.as_ref() {
                if at.elapsed() < BALANCE_CACHE_AGE {
                    debug!("[KIS] balance served from cache");
                    return Ok(balance.clone());
                }
            }
        }

        let params = [
            ("CANO", self.cfg.account_no.clone()),
            ("ACNT_PRDT_CD", self.cfg.account_product_code.clone()),
            ("AFHR_FLPR_YN", "N".to_string()),
            ("OFL_YN", String::new()),
            ("INQR_DVSN", "02".to_string()),
            ("UNPR_DVSN", "01".to_string()),
            ("FUND_STTL_ICLD_YN", "N".to_string()),
            ("FNCG_AMT_AUTO_RDPT_YN", "N".to_string()),
            ("PRCS_DVSN", "00".to_string()),
            ("CTX_AREA_FK100", String::new()),
            ("CTX_AREA_NK100", String::new()),
        ];
        let data = self
            .get_with_retry(
                "/uapi/domestic-stock/v1/trading/inquire-balance",
                self.tr.balance,
                &params,
            )
            .await?;
        if data.get("rt_cd").and_then(|v| v.as_str()) != Some("0") {
            return Err(BrokerError::Transient(format!(
                "balance query failed: {}",
                msg_of(&data)
            )));
        }

        let mut holdings = Vec::new();
        if let Some(rows) = data.get("output1").and_then(|v| v.as_array()) {
            for row in rows {
                let quantity = field_i64(row, "hldg_qty");
                if quantity <= 0 {
                    continue;
                }
                holdings.push(Holding {
                    stock_code: row
                        .get("pdno")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                    stock_name: row
                        .get("prdt_name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                    quantity,
                    avg_price: field_f64(row, "pchs_avg_pric"),
                    current_price: field_f64(row, "prpr"),
                });
            }
        }
        let totals = data
            .get("output2")
            .and_then(|v| v.as_array())
            .and_then(|rows| rows.first().cloned())
            .unwrap_or(Value::Null);
        let balance = AccountBalance {
            cash: field_f64(&totals, "dnca_tot_amt"),
            total_equity: field_f64(&totals, "tot_evlu_amt"),
            total_pnl: field_f64(&totals, "evlu_pfls_smtl_amt"),
            holdings,
        };

        *self.balance_cache.lock().await = Some((Instant::now(), balance.clone()));
        Ok(balance)
    }

    async fn place_buy(
        &self,
        symbol: &str,
        qty: i64,
        price: i64,
        order_type: OrderType,
    ) -> BrokerResult<OrderAck> {
        self.place_order(symbol, qty, price, order_type, true).await
    }

    async fn place_sell(
        &self,
        symbol: &str,
        qty: i64,
        price: i64,
        order_type: OrderType,
    ) -> BrokerResult<OrderAck> {
        self.place_order(symbol, qty, price, order_type, false).await
    }

    async fn wait_for_execution(
        &self,
        order_no: &str,
        expected_qty: i64,
        timeout: Duration,
    ) -> BrokerResult<ExecutionReport> {
        let started = Instant::now();
        let mut last_exec_qty = 0i64;
        let mut last_avg_price = 0.0f64;
        info!(
            "[KIS] waiting for fill: order={} expected={} timeout={:?}",
            order_no, expected_qty, timeout
        );

        while started.elapsed() < timeout {
            match self.order_snapshot(order_no).await {
                Ok(Some(snapshot)) => {
                    if snapshot.exec_qty >= expected_qty {
                        info!(
                            "[KIS] filled: {} x{} @ {:.0}",
                            order_no, snapshot.exec_qty, snapshot.avg_price
                        );
                        return Ok(ExecutionReport {
                            status: ExecutionStatus::Filled,
                            filled_qty: snapshot.exec_qty,
                            avg_price: snapshot.avg_price,
                        });
                    }
                    if snapshot.exec_qty > last_exec_qty {
                        info!(
                            "[KIS] partial fill progressing: {}/{}",
                            snapshot.exec_qty, expected_qty
                        );
                    }
                    last_exec_qty = snapshot.exec_qty;
                    last_avg_price = snapshot.avg_price;
                }
                Ok(None) => {}
                Err(e) => warn!("[KIS] fill poll failed: {}", e),
            }
            tokio::time::sleep(FILL_POLL_INTERVAL).await;
        }

        warn!("[KIS] fill wait timed out after {:?}", timeout);
        match self.order_snapshot(order_no).await {
            Ok(Some(snapshot)) => {
                if snapshot.exec_qty > 0 {
                    if snapshot.remain_qty > 0 {
                        if let Err(e) = self.cancel_order(order_no).await {
                            warn!("[KIS] remainder cancel failed: {}", e);
                        }
                    }
                    Ok(ExecutionReport {
                        status: ExecutionStatus::Partial,
                        filled_qty: snapshot.exec_qty,
                        avg_price: snapshot.avg_price,
                    })
                } else {
                    if let Err(e) = self.cancel_order(order_no).await {
                        warn!("[KIS] cancel failed: {}", e);
                    }
                    Ok(ExecutionReport {
                        status: ExecutionStatus::Cancelled,
                        filled_qty: 0,
                        avg_price: 0.0,
                    })
                }
            }
            Ok(None) | Err(_) => Ok(ExecutionReport {
                status: ExecutionStatus::Timeout,
                filled_qty: last_exec_qty,
                avg_price: last_avg_price,
            }),
        }
    }

    async fn cancel_order(&self, order_no: &str) -> BrokerResult<()> {
        let body = json!({
            "CANO": self.cfg.account_no,
            "ACNT_PRDT_CD": self.cfg.account_product_code,
            "KRX_FWDG_ORD_ORGNO": "",
            "ORGN_ODNO": order_no,
            "ORD_DVSN": "00",
            "RVSE_CNCL_DVSN_CD": "02",
            "ORD_QTY": "0",
            "ORD_UNPR": "0",
            "QTY_ALL_ORD_YN": "Y",
        });
        info!("[KIS] cancelling order {}", order_no);
        let data = self
            .post_once(
                "/uapi/domestic-stock/v1/trading/order-rvsecncl",
                self.tr.order_cancel,
                &body,
            )
            .await
            .map_err(|e| BrokerError::Cancel(e.to_string()))?;
        if data.get("rt_cd").and_then(|v| v.as_str()) == Some("0") {
            Ok(())
        } else {
            Err(BrokerError::Cancel(msg_of(&data)))
        }
    }

    async fn volume_ranking(&self, top_n: usize) -> BrokerResult<Vec<VolumeRankRow>> {
        let params = [
            ("FID_COND_MRKT_DIV_CODE", "J".to_string()),
            ("FID_COND_SCR_DIV_CODE", "20171".to_string()),
            ("FID_INPUT_ISCD", "0000".to_string()),
            ("FID_DIV_CLS_CODE", "0".to_string()),
            ("FID_BLNG_CLS_CODE", "3".to_string()),
            ("FID_TRGT_CLS_CODE", "111111111".to_string()),
            ("FID_TRGT_EXLS_CLS_CODE", "000000".to_string()),
            ("FID_INPUT_PRICE_1", String::new()),
            ("FID_INPUT_PRICE_2", String::new()),
            ("FID_VOL_CNT", String::new()),
            ("FID_INPUT_DATE_1", String::new()),
        ];
        let data = self
            .get_with_retry(
                "/uapi/domestic-stock/v1/quotations/volume-rank",
                TR_VOLUME_RANK,
                &params,
            )
            .await?;
        if data.get("rt_cd").and_then(|v| v.as_str()) != Some("0") {
            return Err(BrokerError::Transient(format!(
                "volume rank query failed: {}",
                msg_of(&data)
            )));
        }
        let mut rows = Vec::new();
        if let Some(items) = data.get("output").and_then(|v| v.as_array()) {
            for item in items.iter().take(top_n) {
                let code = item
                    .get("mksc_shrn_iscd")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                if code.is_empty() {
                    continue;
                }
                rows.push(VolumeRankRow {
                    stock_code: code,
                    stock_name: item
                        .get("hts_kor_isnm")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                    trade_value: field_f64(item, "acml_tr_pbmn"),
                    volume: field_i64(item, "acml_vol"),
                    market_cap: None,
                    change_rate: field_f64(item, "prdy_ctrt"),
                    is_suspended: false,
                    is_management: false,
                });
            }
        }
        Ok(rows)
    }

    fn is_network_outage(&self) -> bool {
        self.outage
            .lock()
            .unwrap()
            .is_outage(Instant::now(), OUTAGE_WINDOW)
    }
}
