//! Payment records.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Gateway {
    Sslcommerz,
    Stripe,
}

impl std::fmt::Display for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sslcommerz => write!(f, "sslcommerz"),
            Self::Stripe => write!(f, "stripe"),
        }
    }
}

impl std::str::FromStr for Gateway {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sslcommerz" => Ok(Self::Sslcommerz),
            "stripe" => Ok(Self::Stripe),
            _ => Err(format!("Unknown gateway: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
    Cancelled,
    Refunded,
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Paid => write!(f, "paid"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Refunded => write!(f, "refunded"),
        }
    }
}

impl From<String> for PaymentStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "paid" => Self::Paid,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            "refunded" => Self::Refunded,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Payment {
    pub id: String,
    /// Our transaction id, sent to the gateway and echoed back in callbacks
    pub transaction_id: String,
    pub user_id: String,
    pub course_id: String,
    pub amount_minor: i64,
    pub currency: String,
    pub gateway: String,
    pub gateway_transaction_id: Option<String>,
    pub status: String,
    pub invoice_number: String,
    #[serde(skip_serializing)]
    pub gateway_payload: Option<String>,
    pub paid_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Payment {
    pub fn status_enum(&self) -> PaymentStatus {
        PaymentStatus::from(self.status.clone())
    }
}

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub course_id: String,
    pub gateway: Gateway,
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    /// None when the course was free and the enrollment is already active
    pub payment_id: Option<String>,
    pub redirect_url: Option<String>,
    pub enrolled: bool,
}

/// Issued once per paid payment
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Invoice {
    pub id: String,
    pub payment_id: String,
    pub invoice_number: String,
    pub user_id: String,
    pub amount_minor: i64,
    pub currency: String,
    pub issued_at: String,
}
