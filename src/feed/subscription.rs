//! Subscription control messages

use crate::decoder::{ExchangeType, SubscriptionMode};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Subscribe or unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionAction {
    Unsubscribe,
    Subscribe,
}

impl SubscriptionAction {
    pub fn as_u8(self) -> u8 {
        match self {
            SubscriptionAction::Unsubscribe => 0,
            SubscriptionAction::Subscribe => 1,
        }
    }
}

impl Serialize for SubscriptionAction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for SubscriptionAction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match u8::deserialize(deserializer)? {
            0 => Ok(SubscriptionAction::Unsubscribe),
            1 => Ok(SubscriptionAction::Subscribe),
            other => Err(serde::de::Error::custom(format!(
                "invalid subscription action {}",
                other
            ))),
        }
    }
}

/// Tokens of one exchange segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenList {
    pub exchange_type: ExchangeType,
    pub tokens: Vec<String>,
}

impl TokenList {
    pub fn new(exchange_type: ExchangeType, tokens: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            exchange_type,
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionParams {
    #[serde(with = "mode_code")]
    pub mode: SubscriptionMode,
    pub token_list: Vec<TokenList>,
}

/// Control message sent over the stream to (un)subscribe instruments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    #[serde(rename = "correlationID")]
    pub correlation_id: String,
    pub action: SubscriptionAction,
    pub params: SubscriptionParams,
}

impl SubscriptionRequest {
    pub fn subscribe(
        correlation_id: impl Into<String>,
        mode: SubscriptionMode,
        token_list: Vec<TokenList>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            action: SubscriptionAction::Subscribe,
            params: SubscriptionParams { mode, token_list },
        }
    }

    pub fn unsubscribe(
        correlation_id: impl Into<String>,
        mode: SubscriptionMode,
        token_list: Vec<TokenList>,
    ) -> Self {
        Self {
            action: SubscriptionAction::Unsubscribe,
            ..Self::subscribe(correlation_id, mode, token_list)
        }
    }

    /// Every token across all segments
    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.params
            .token_list
            .iter()
            .flat_map(|list| list.tokens.iter().map(String::as_str))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Subscription mode as its wire integer
mod mode_code {
    use crate::decoder::SubscriptionMode;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(mode: &SubscriptionMode, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(mode.as_u8())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SubscriptionMode, D::Error> {
        let code = u8::deserialize(deserializer)?;
        SubscriptionMode::try_from(code)
            .map_err(|c| serde::de::Error::custom(format!("invalid subscription mode {}", c)))
    }
}
