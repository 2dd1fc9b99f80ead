//! HTTP chain client that publishes signed transactions
//!
//! The chain-specific submitter lives behind `broadcaster_url`:
//! - POST {url}/transactions with a [`SignedTransaction`], answering a
//!   [`BroadcastReceipt`]; resubmitting an identical transaction is accepted
//! - GET {url}/transactions/:txid answering `{ "confirmed": bool }`

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument};
use xmr_bridge_core::chain::{BroadcastError, BroadcastReceipt, Broadcaster, SignedTransaction};
use xmr_bridge_core::mpc::async_trait;

#[derive(Debug, Deserialize)]
struct ConfirmationResponse {
    confirmed: bool,
}

pub struct HttpBroadcaster {
    client: Client,
    url: String,
}

impl HttpBroadcaster {
    pub fn new(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            url: url.trim_end_matches('/').to_string(),
        })
    }
}

/// Client errors are final, everything else is worth retrying
async fn classify(response: reqwest::Response) -> BroadcastError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
        BroadcastError::Rejected(format!("{}: {}", status, body))
    } else {
        BroadcastError::Unavailable(format!("{}: {}", status, body))
    }
}

#[async_trait]
impl Broadcaster for HttpBroadcaster {
    #[instrument(skip(self, transaction), fields(chain_reference = %transaction.chain_reference))]
    async fn broadcast(
        &self,
        transaction: &SignedTransaction,
    ) -> Result<BroadcastReceipt, BroadcastError> {
        let response = self
            .client
            .post(format!("{}/transactions", self.url))
            .json(transaction)
            .send()
            .await
            .map_err(|e| BroadcastError::Unavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(classify(response).await);
        }
        let receipt: BroadcastReceipt = response
            .json()
            .await
            .map_err(|e| BroadcastError::Unavailable(format!("malformed receipt: {}", e)))?;
        debug!(txid = %receipt.txid, "Transaction submitted");
        Ok(receipt)
    }

    async fn is_confirmed(&self, txid: &str) -> Result<bool, BroadcastError> {
        let response = self
            .client
            .get(format!("{}/transactions/{}", self.url, txid))
            .send()
            .await
            .map_err(|e| BroadcastError::Unavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(classify(response).await);
        }
        let body: ConfirmationResponse = response
            .json()
            .await
            .map_err(|e| BroadcastError::Unavailable(e.to_string()))?;
        Ok(body.confirmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use xmr_bridge_core::chain::BurnEvent;
    use xmr_bridge_core::request::{RequestKind, TransactionRequest};
    use xmr_bridge_core::Signature;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn transaction(amount: u64) -> SignedTransaction {
        let request = TransactionRequest::withdrawal(&BurnEvent {
            chain_reference: "burn-9".into(),
            amount,
            destination_address: format!("5{}", "A".repeat(94)),
        });
        SignedTransaction::new(&request, Signature::new([1; 32], [2; 32]))
    }

    fn chain() -> Router {
        Router::new()
            .route(
                "/transactions",
                post(|Json(tx): Json<SignedTransaction>| async move {
                    if tx.amount == 0 {
                        return Err((AxumStatus::BAD_REQUEST, "zero amount"));
                    }
                    if tx.amount == 1 {
                        return Err((AxumStatus::BAD_GATEWAY, "daemon down"));
                    }
                    assert_eq!(tx.kind, RequestKind::Withdrawal);
                    Ok(Json(serde_json::json!({ "txid": "ab".repeat(32) })))
                }),
            )
            .route(
                "/transactions/:txid",
                get(|Path(txid): Path<String>| async move {
                    Json(serde_json::json!({ "confirmed": txid.starts_with("ab") }))
                }),
            )
    }

    #[tokio::test]
    async fn test_broadcast_outcomes() {
        let url = serve(chain()).await;
        let broadcaster = HttpBroadcaster::new(&url, Duration::from_secs(5)).unwrap();

        let receipt = broadcaster.broadcast(&transaction(10)).await.unwrap();
        assert_eq!(receipt.txid, "ab".repeat(32));
        assert!(!receipt.confirmed);
        assert!(broadcaster.is_confirmed(&receipt.txid).await.unwrap());

        assert!(matches!(
            broadcaster.broadcast(&transaction(0)).await,
            Err(BroadcastError::Rejected(_))
        ));
        assert!(matches!(
            broadcaster.broadcast(&transaction(1)).await,
            Err(BroadcastError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_chain_client_is_retryable() {
        let broadcaster =
            HttpBroadcaster::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        assert!(matches!(
            broadcaster.is_confirmed("00").await,
            Err(BroadcastError::Unavailable(_))
        ));
    }
}
