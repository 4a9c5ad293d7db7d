use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Latest quote for one tracked token, keyed by the price source's id.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TokenPrice {
    pub id: String,
    pub usd_price: f64,
    pub change_24h: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct PricePoint {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PriceHistoryPoint {
    pub id: Uuid,
    pub symbol: String,
    pub price: f64,
    pub price_ts: DateTime<Utc>,
    pub source: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct YieldPoolSnapshot {
    pub pool_id: String,
    pub protocol: String,
    pub chain: String,
    pub symbol: String,
    pub tvl_usd: f64,
    pub apy: f64,
    pub apy_base: Option<f64>,
    pub apy_reward: Option<f64>,
    pub il_7d: Option<f64>,
    pub is_stable: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ProtocolTvl {
    pub name: String,
    pub tvl: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} `{value}`")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value.trim().to_lowercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    _ => Err(ParseEnumError {
                        kind: $kind,
                        value: value.to_string(),
                    }),
                }
            }
        }
    };
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    Price,
    Apr,
    Allowance,
}

string_enum!(AlertType, "alert type", {
    Price => "price",
    Apr => "apr",
    Allowance => "allowance",
});

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Active,
    Paused,
    TriggeredCooldown,
}

string_enum!(AlertStatus, "alert status", {
    Active => "active",
    Paused => "paused",
    TriggeredCooldown => "triggered_cooldown",
});

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    Above,
    Below,
}

string_enum!(Comparator, "comparator", {
    Above => "above",
    Below => "below",
});

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannel {
    Email,
    Telegram,
    Webhook,
}

string_enum!(NotificationChannel, "notification channel", {
    Email => "email",
    Telegram => "telegram",
    Webhook => "webhook",
});

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct AlertConditions {
    pub comparator: Comparator,
    pub threshold: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct NotificationTarget {
    pub channel: NotificationChannel,
    pub destination: String,
}

/// User-defined alert. Created and edited by the user-facing API; the worker
/// only touches `last_triggered_at` and `trigger_count`.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Alert {
    pub id: Uuid,
    pub user_id: Uuid,
    pub r#type: AlertType,
    pub status: AlertStatus,
    /// Token id for `price`, pool id for `apr`, spender/token pair for `allowance`.
    pub target: String,
    pub conditions: AlertConditions,
    pub notification: NotificationTarget,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub trigger_count: i64,
    pub created_at: DateTime<Utc>,
}

/// Append-only record of one trigger.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AlertHistoryEntry {
    pub id: Uuid,
    pub alert_id: Uuid,
    pub triggered_at: DateTime<Utc>,
    pub conditions_snapshot: serde_json::Value,
    pub triggered_value: f64,
    pub notification_sent: bool,
    pub notification_error: Option<String>,
}
