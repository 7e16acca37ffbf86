//! Order creation and order queries.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::error::LedgerError;
use crate::pricing::PricingOracle;
use crate::store::LedgerStoreRef;
use crate::types::{
    BundleSize, DeliveryStatus, EntrySource, MAX_AMOUNT, Network, Order, PaymentMethod,
    PaymentStatus, Transaction, TransactionType, new_payment_ref,
};
use crate::wallet::{Committed, WalletService, mutate_balance};

/// The request to buy a bundle.
#[derive(Debug, Clone, Deserialize)]
pub struct NewOrder {
    pub user_id: Uuid,
    pub network: Network,
    pub bundle_gb: u32,
    /// The number the bundle is delivered to.
    pub phone: String,
    pub payment_method: PaymentMethod,
}

#[derive(Clone)]
pub struct OrderService {
    store: LedgerStoreRef,
    pricing: PricingOracle,
    wallet: WalletService,
}

impl OrderService {
    pub fn new(store: LedgerStoreRef, pricing: PricingOracle, wallet: WalletService) -> Self {
        Self {
            store,
            pricing,
            wallet,
        }
    }

    /// Creates an order priced at the current price per GB.
    ///
    /// Wallet orders are debited and settled in the same atomic write that
    /// creates them; gateway orders are stored pending, awaiting the gateway.
    pub async fn create_order(&self, req: NewOrder) -> Result<Order, LedgerError> {
        let size = BundleSize::new(req.bundle_gb)?;
        let price = self.pricing.current_price_per_unit().await?;
        let amount = Decimal::from(size.gb())
            .checked_mul(price)
            .filter(|a| *a <= MAX_AMOUNT)
            .ok_or(LedgerError::InvalidPrice(price))?;

        let mut order = Order {
            id: Uuid::new_v4(),
            user_id: req.user_id,
            network: req.network,
            bundle_gb: size.gb(),
            amount,
            phone: req.phone,
            payment_ref: new_payment_ref(req.payment_method),
            payment_status: PaymentStatus::Pending,
            delivery_status: DeliveryStatus::Pending,
            payment_method: req.payment_method,
            created_at: Utc::now(),
        };

        match req.payment_method {
            PaymentMethod::Gateway => {
                if self.store.user(req.user_id).await?.is_none() {
                    return Err(LedgerError::UserNotFound(req.user_id));
                }
                self.store.insert_order(&order).await?;
                info!(order_id = %order.id, payment_ref = %order.payment_ref, %amount, "gateway order awaiting payment");
                Ok(order)
            }
            PaymentMethod::Wallet => {
                order.payment_status = PaymentStatus::Paid;
                let committed = mutate_balance(self.store.as_ref(), req.user_id, |user| {
                    if user.wallet_balance < amount {
                        return Err(LedgerError::InsufficientFunds {
                            required: amount,
                            available: user.wallet_balance,
                        });
                    }
                    let entry = Transaction::completed(
                        user.id,
                        TransactionType::Purchase,
                        -amount,
                        EntrySource::Wallet,
                        order.purchase_reference(),
                    );
                    Ok((entry, Some(order.clone())))
                })
                .await?;

                match committed {
                    Committed::Applied { balance, .. } => {
                        info!(order_id = %order.id, user_id = %order.user_id, %amount, %balance, "wallet order paid");
                    }
                    Committed::Replayed(_) => {
                        return Err(anyhow::anyhow!(
                            "purchase reference {} already on the ledger",
                            order.purchase_reference()
                        )
                        .into());
                    }
                }

                self.wallet.reward_after_settlement(&order).await;
                Ok(order)
            }
        }
    }

    pub async fn order(&self, id: Uuid) -> Result<Order, LedgerError> {
        self.store
            .order(id)
            .await?
            .ok_or_else(|| LedgerError::OrderNotFound(id.to_string()))
    }

    /// Orders newest first, optionally only those of one user.
    pub async fn orders(&self, user_id: Option<Uuid>) -> Result<Vec<Order>, LedgerError> {
        Ok(self.store.orders(user_id).await?)
    }
}
