use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LedgerError;

/// The currency every amount in the ledger is denominated in.
pub const CURRENCY: &str = "GHS";

/// Bundle denominations the shop sells, in GB.
pub const BUNDLE_SIZES_GB: [u32; 15] = [1, 2, 3, 4, 5, 6, 8, 10, 15, 20, 25, 30, 40, 50, 100];

/// Declares a closed set of values stored as lowercase text columns.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(anyhow::anyhow!(
                        "unknown {} value: {other}",
                        stringify!($name)
                    )),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

text_enum!(
    /// The role of an account holder.
    Role { User => "user", Admin => "admin", Agent => "agent" }
);

text_enum!(
    /// The mobile network a bundle is delivered on.
    Network { Mtn => "MTN", Telecel => "Telecel", At => "AT" }
);

text_enum!(
    /// The payment state of an order. Only `Pending -> Paid` is ever written.
    PaymentStatus { Pending => "pending", Paid => "paid", Failed => "failed" }
);

text_enum!(
    /// The delivery state of an order. `Pending -> Delivered` only.
    DeliveryStatus { Pending => "pending", Delivered => "delivered" }
);

text_enum!(
    /// How an order is paid for.
    PaymentMethod { Wallet => "wallet", Gateway => "gateway" }
);

text_enum!(
    /// The kind of ledger entry.
    TransactionType { Purchase => "purchase", Topup => "topup", Reward => "reward" }
);

text_enum!(
    /// The state of a ledger entry.
    TransactionStatus { Pending => "pending", Completed => "completed" }
);

text_enum!(
    /// Where the money of a ledger entry moved.
    ///
    /// Only `Wallet` entries contribute to the cached wallet balance; `Gateway`
    /// entries record purchases settled off-wallet.
    EntrySource { Wallet => "wallet", Gateway => "gateway" }
);

/// A validated bundle size in GB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleSize(u32);

impl BundleSize {
    pub fn new(gb: u32) -> Result<Self, LedgerError> {
        if BUNDLE_SIZES_GB.contains(&gb) {
            Ok(Self(gb))
        } else {
            Err(LedgerError::InvalidBundle(gb))
        }
    }

    pub fn gb(&self) -> u32 {
        self.0
    }
}

/// The largest value a money column (`NUMERIC(14, 2)`) holds.
pub const MAX_AMOUNT: Decimal = Decimal::from_parts(0x107A_3FFF, 0x5AF3, 0, false, 2);

/// The largest price per GB the settings row (`NUMERIC(10, 2)`) holds.
pub const MAX_PRICE_PER_GB: Decimal = Decimal::from_parts(0x540B_E3FF, 0x2, 0, false, 2);

/// Whole pesewas only.
fn fits_minor_units(value: Decimal) -> bool {
    value.normalize().scale() <= 2
}

/// A strictly positive monetary amount in whole pesewas, no larger than
/// `MAX_AMOUNT`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Amount(Decimal);

impl Amount {
    pub fn new(value: Decimal) -> Result<Self, LedgerError> {
        if value > Decimal::ZERO && value <= MAX_AMOUNT && fits_minor_units(value) {
            Ok(Self(value))
        } else {
            Err(LedgerError::InvalidAmount(value))
        }
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

/// Validates an operator-set price per GB.
pub fn validate_price(price: Decimal) -> Result<Decimal, LedgerError> {
    if price > Decimal::ZERO && price <= MAX_PRICE_PER_GB && fits_minor_units(price) {
        Ok(price)
    } else {
        Err(LedgerError::InvalidPrice(price))
    }
}

/// `balance + delta`, or `None` when the result leaves `0..=MAX_AMOUNT`.
pub fn apply_delta(balance: Decimal, delta: Decimal) -> Option<Decimal> {
    balance
        .checked_add(delta)
        .filter(|b| !b.is_sign_negative() && *b <= MAX_AMOUNT)
}

/// An account holder's profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// The ID of the user, issued by the identity provider.
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub phone: Option<String>,
    pub role: Role,
    /// Cached sum of the user's wallet-sourced ledger entries.
    pub wallet_balance: Decimal,
    /// The user's own code to hand out to friends.
    pub referral_code: String,
    /// The user who referred this one, if any.
    pub referred_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// A bundle order. `amount` is frozen at creation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub user_id: Uuid,
    pub network: Network,
    pub bundle_gb: u32,
    pub amount: Decimal,
    /// The number the bundle is delivered to.
    pub phone: String,
    /// Unique payment reference, the idempotency key for settlement.
    pub payment_ref: String,
    pub payment_status: PaymentStatus,
    pub delivery_status: DeliveryStatus,
    pub payment_method: PaymentMethod,
    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn is_paid(&self) -> bool {
        self.payment_status == PaymentStatus::Paid
    }

    /// The reference of the purchase entry that settles this order.
    pub fn purchase_reference(&self) -> String {
        format!("TXN-{}", self.payment_ref)
    }

    /// The reference of the referral reward paid out for this order.
    pub fn reward_reference(&self) -> String {
        format!("RWD-{}", self.payment_ref)
    }
}

/// An append-only ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    /// Signed: negative for debits, positive for credits.
    pub amount: Decimal,
    pub status: TransactionStatus,
    pub source: EntrySource,
    /// Unique across the ledger.
    pub reference: String,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    /// Builds a completed entry stamped with the current time.
    pub fn completed(
        user_id: Uuid,
        kind: TransactionType,
        amount: Decimal,
        source: EntrySource,
        reference: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            kind,
            amount,
            status: TransactionStatus::Completed,
            source,
            reference: reference.into(),
            created_at: Utc::now(),
        }
    }
}

/// The singleton settings row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub price_per_gb: Decimal,
    pub referrals_enabled: bool,
    /// Bumped on every write; writers compare-and-swap on it.
    pub version: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            price_per_gb: Decimal::from(6),
            referrals_enabled: false,
            version: 1,
        }
    }
}

/// Generates a payment reference for a new order.
pub fn new_payment_ref(method: PaymentMethod) -> String {
    let prefix = match method {
        PaymentMethod::Wallet => "ORD",
        PaymentMethod::Gateway => "PAY",
    };
    format!("{prefix}-{}", Uuid::new_v4().simple())
}

/// Generates a 6-character upper-case referral code.
pub fn new_referral_code() -> String {
    Uuid::new_v4().simple().to_string()[..6].to_uppercase()
}
