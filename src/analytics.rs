use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use std::str::FromStr;
use crate::error::AgentError;

// The fixed set of analytics functions the agent can call
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AnalyticsFunction {
    #[serde(rename = "getSpendingByVendor")]
    SpendingByVendor,
    #[serde(rename = "getSpendingByCategory")]
    SpendingByCategory,
    #[serde(rename = "getSpendingByTime")]
    SpendingByTime,
    #[serde(rename = "getTopMerchants")]
    TopMerchants,
}

impl AnalyticsFunction {
    pub const ALL: [AnalyticsFunction; 4] = [
        Self::SpendingByVendor,
        Self::SpendingByCategory,
        Self::SpendingByTime,
        Self::TopMerchants,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::SpendingByVendor => "getSpendingByVendor",
            Self::SpendingByCategory => "getSpendingByCategory",
            Self::SpendingByTime => "getSpendingByTime",
            Self::TopMerchants => "getTopMerchants",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::SpendingByVendor => "Total spending at a specific vendor or merchant",
            Self::SpendingByCategory => "Total spending in a category such as coffee, food or gas",
            Self::SpendingByTime => "Total spending within a time period such as this month or last year",
            Self::TopMerchants => "The merchants the user spends the most at",
        }
    }

    // JSON schema of the arguments, as declared to the model
    pub fn parameters(self) -> Value {
        match self {
            Self::SpendingByVendor => json!({
                "type": "object",
                "properties": {
                    "vendor": {"type": "string", "description": "Merchant name"},
                    "period": {"type": "string", "description": "Optional period, e.g. this_month"}
                },
                "required": ["vendor"]
            }),
            Self::SpendingByCategory => json!({
                "type": "object",
                "properties": {
                    "category": {"type": "string", "description": "Spending category"},
                    "period": {"type": "string", "description": "Optional period, e.g. last_month"}
                },
                "required": ["category"]
            }),
            Self::SpendingByTime => json!({
                "type": "object",
                "properties": {
                    "period": {"type": "string", "description": "Period such as this_month, last_year"}
                },
                "required": ["period"]
            }),
            Self::TopMerchants => json!({
                "type": "object",
                "properties": {
                    "limit": {"type": "integer", "description": "How many merchants to return"},
                    "period": {"type": "string"}
                }
            }),
        }
    }
}

impl fmt::Display for AnalyticsFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AnalyticsFunction {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|f| f.name() == s.trim())
            .ok_or_else(|| AgentError::UnknownFunction { name: s.to_string() })
    }
}

// External analytics collaborator: (userId, params) -> result
#[async_trait]
pub trait AnalyticsBackend: Send + Sync {
    async fn call(
        &self,
        function: AnalyticsFunction,
        user_id: &str,
        params: &Value,
    ) -> anyhow::Result<Value>;
}

// Analytics service reached over HTTP
pub struct HttpAnalyticsBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAnalyticsBackend {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        // add http:// if not present
        let base_url = if base_url.starts_with("http") {
            base_url.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", base_url.trim_end_matches('/'))
        };
        Self { client, base_url }
    }

    pub fn endpoint(&self, function: AnalyticsFunction) -> String {
        format!("{}/analytics/{}", self.base_url, function.name())
    }
}

#[async_trait]
impl AnalyticsBackend for HttpAnalyticsBackend {
    async fn call(
        &self,
        function: AnalyticsFunction,
        user_id: &str,
        params: &Value,
    ) -> anyhow::Result<Value> {
        let url = self.endpoint(function);
        let res = self
            .client
            .post(&url)
            .json(&json!({ "userId": user_id, "params": params }))
            .send()
            .await
            .with_context(|| format!("request to {} failed", url))?
            .error_for_status()
            .with_context(|| format!("{} returned an error status", url))?;

        res.json::<Value>()
            .await
            .with_context(|| format!("invalid JSON from {}", url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for f in AnalyticsFunction::ALL {
            assert_eq!(f.name().parse::<AnalyticsFunction>().unwrap(), f);
            assert_eq!(serde_json::to_value(f).unwrap(), Value::String(f.name().into()));
        }
        assert!(matches!(
            "dropTables".parse::<AnalyticsFunction>(),
            Err(AgentError::UnknownFunction { .. })
        ));
    }

    #[test]
    fn http_backend_normalizes_base_url() {
        let backend = HttpAnalyticsBackend::new(reqwest::Client::new(), "localhost:3000/");
        assert_eq!(
            backend.endpoint(AnalyticsFunction::TopMerchants),
            "http://localhost:3000/analytics/getTopMerchants"
        );
        let backend = HttpAnalyticsBackend::new(reqwest::Client::new(), "https://api.example.com");
        assert_eq!(
            backend.endpoint(AnalyticsFunction::SpendingByVendor),
            "https://api.example.com/analytics/getSpendingByVendor"
        );
    }
}
