//! Payment watcher backed by a wallet-transaction indexer.
//!
//! Polls `{server}/api/v1/wallets/{wallet}/transactions` until a transaction
//! shows up whose memo is the poll id and whose amount is the expected amount.
//! The overall deadline comes from the activity options of the caller.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::actors::poll::{PaymentReceipt, PaymentRequest, PaymentWatcher};
use crate::durable::ActivityError;

use super::status_error;

const AMOUNT_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WalletTransaction {
    #[serde(alias = "signature", alias = "txn_id")]
    pub transaction_id: String,
    #[serde(default)]
    pub memo: Option<String>,
    pub amount: f64,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TransactionsBody {
    List(Vec<WalletTransaction>),
    Wrapped { transactions: Vec<WalletTransaction> },
}

/// First transaction paying exactly `request.expected_amount` with the poll id as memo.
pub fn find_matching_payment(
    transactions: &[WalletTransaction],
    request: &PaymentRequest,
) -> Option<PaymentReceipt> {
    transactions
        .iter()
        .find(|txn| {
            txn.memo.as_deref().map(str::trim) == Some(request.workflow_id.as_str())
                && (txn.amount - request.expected_amount).abs() < AMOUNT_TOLERANCE
        })
        .map(|txn| PaymentReceipt {
            transaction_id: txn.transaction_id.clone(),
            amount: txn.amount,
        })
}

#[derive(Debug, Clone)]
pub struct HttpPaymentWatcher {
    http: reqwest::Client,
    poll_interval: Duration,
}

impl HttpPaymentWatcher {
    pub fn new() -> Result<Self, ActivityError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ActivityError::non_retryable("HttpClientError", e.to_string()))?;
        Ok(Self {
            http,
            poll_interval: Duration::from_secs(5),
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn fetch(&self, request: &PaymentRequest) -> Result<Vec<WalletTransaction>, ActivityError> {
        let url = format!(
            "{}/api/v1/wallets/{}/transactions",
            request.server_url.trim_end_matches('/'),
            request.wallet
        );
        let response = self
            .http
            .get(&url)
            .query(&[("network", request.network.as_str())])
            .send()
            .await
            .map_err(|e| ActivityError::retryable(format!("failed to query transactions: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error("payment server", status, &body));
        }
        let body: TransactionsBody = response.json().await.map_err(|e| {
            ActivityError::retryable(format!("failed to decode transactions: {e}"))
        })?;
        Ok(match body {
            TransactionsBody::List(list) => list,
            TransactionsBody::Wrapped { transactions } => transactions,
        })
    }
}

#[async_trait]
impl PaymentWatcher for HttpPaymentWatcher {
    async fn wait_for_payment(&self, request: &PaymentRequest) -> Result<PaymentReceipt, ActivityError> {
        tracing::info!(
            wallet = %request.wallet,
            memo = %request.workflow_id,
            amount = request.expected_amount,
            network = %request.network,
            "Watching wallet for payment"
        );
        loop {
            match self.fetch(request).await {
                Ok(transactions) => {
                    if let Some(receipt) = find_matching_payment(&transactions, request) {
                        tracing::info!(transaction_id = %receipt.transaction_id, "Matching payment found");
                        return Ok(receipt);
                    }
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(error = %e, "Transaction query failed, will poll again");
                }
                Err(e) => return Err(e),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
