//! Lightning (BOLT11) melt handler

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use super::{MeltExecution, MeltMethodHandler};
use crate::errors::{NutErrorCode, WalletError, WalletResult};
use crate::mint_client::{MeltQuoteResponse, MintConnector};
use crate::types::{BlindedOutput, CashuProof, MeltOperation, MeltQuote, MeltQuoteState, PaymentMethod};

/// Pays BOLT11 invoices through the mint connector
pub struct Bolt11Handler {
    connector: Arc<dyn MintConnector>,
}

impl Bolt11Handler {
    pub fn new(connector: Arc<dyn MintConnector>) -> Self {
        Self { connector }
    }

    fn from_response(response: MeltQuoteResponse) -> MeltExecution {
        match response.state {
            MeltQuoteState::Paid => MeltExecution::Paid {
                change: response.change,
                preimage: response.payment_preimage,
            },
            MeltQuoteState::Pending => MeltExecution::Pending,
            MeltQuoteState::Unpaid => MeltExecution::Failed {
                reason: "Lightning payment failed".to_string(),
            },
        }
    }
}

#[async_trait]
impl MeltMethodHandler for Bolt11Handler {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::Bolt11
    }

    fn validate_quote(&self, quote: &MeltQuote) -> WalletResult<()> {
        let request = quote.request.trim().to_lowercase();
        if request.is_empty() {
            return Err(WalletError::validation("Invoice is empty"));
        }
        if !request.starts_with("ln") {
            return Err(WalletError::validation(format!(
                "Not a BOLT11 invoice: {}",
                quote.request
            )));
        }
        if quote.amount == 0 {
            return Err(WalletError::validation("Melt quote amount is zero"));
        }
        Ok(())
    }

    fn method_data(&self, quote: &MeltQuote) -> serde_json::Value {
        json!({ "invoice": quote.request })
    }

    async fn request_quote(&self, mint_url: &str, request: &str) -> WalletResult<MeltQuoteResponse> {
        Ok(self
            .connector
            .create_melt_quote(mint_url, PaymentMethod::Bolt11, request.trim())
            .await?)
    }

    async fn execute(
        &self,
        op: &MeltOperation,
        quote: &MeltQuote,
        inputs: &[CashuProof],
        change_outputs: &[BlindedOutput],
    ) -> WalletResult<MeltExecution> {
        match self
            .connector
            .melt(
                &op.mint_url,
                PaymentMethod::Bolt11,
                &quote.quote_id,
                inputs,
                change_outputs,
            )
            .await
        {
            Ok(response) => Ok(Self::from_response(response)),
            Err(e) => match e.code {
                // The mint refused before spending anything
                Some(
                    NutErrorCode::LightningError
                    | NutErrorCode::QuoteExpired
                    | NutErrorCode::TransactionUnbalanced
                    | NutErrorCode::UnsupportedUnit
                    | NutErrorCode::InvoiceAlreadyPaid,
                ) => Ok(MeltExecution::Failed { reason: e.message }),
                // No answer; the outcome is decided by a later check
                None => {
                    log::warn!("Melt {} got no answer from the mint: {}", op.id, e.message);
                    Ok(MeltExecution::Pending)
                }
                Some(_) => Err(e.into()),
            },
        }
    }

    async fn check_pending(&self, op: &MeltOperation, quote: &MeltQuote) -> WalletResult<MeltExecution> {
        let response = self
            .connector
            .check_melt_quote(&op.mint_url, PaymentMethod::Bolt11, &quote.quote_id)
            .await?;
        Ok(Self::from_response(response))
    }
}
