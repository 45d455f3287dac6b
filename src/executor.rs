use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, warn};
use crate::analytics::{AnalyticsBackend, AnalyticsFunction};
use crate::error::{AgentError, AgentResult};
use crate::metrics::TOOL_CALLS;
use crate::models::FunctionCall;

const TOTAL_FIELDS: &[&str] = &["total", "amount", "sum", "totalSpent"];
const BREAKDOWN_FIELDS: &[&str] = &["breakdown", "items", "merchants", "categories", "results"];
const COUNT_FIELDS: &[&str] = &["count", "transactions", "transactionCount"];
const LABEL_FIELDS: &[&str] = &["name", "vendor", "merchant", "category", "period"];

// Common shape of every analytics result
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct NormalizedResult {
    pub total: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breakdown: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
}

// Runs analytics functions against the backend, one attempt each
pub struct FunctionExecutor {
    backend: Arc<dyn AnalyticsBackend>,
}

impl FunctionExecutor {
    pub fn new(backend: Arc<dyn AnalyticsBackend>) -> Self {
        Self { backend }
    }

    pub async fn execute(&self, name: &str, args: &Value, user_id: &str) -> AgentResult<NormalizedResult> {
        let function = name.parse::<AnalyticsFunction>()?;
        self.execute_function(function, args, user_id).await
    }

    pub async fn execute_function(
        &self,
        function: AnalyticsFunction,
        args: &Value,
        user_id: &str,
    ) -> AgentResult<NormalizedResult> {
        TOOL_CALLS.inc();
        debug!(%function, user_id, %args, "executing analytics function");

        let raw = self
            .backend
            .call(function, user_id, args)
            .await
            .map_err(|e| {
                warn!(%function, error = %e, "analytics call failed");
                AgentError::Execution {
                    function: function.name().to_string(),
                    message: format!("{:#}", e),
                }
            })?;

        normalize(&raw).ok_or_else(|| AgentError::Execution {
            function: function.name().to_string(),
            message: format!("unexpected result shape: {}", raw),
        })
    }
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_start_matches('$').parse().ok(),
        _ => None,
    }
}

fn first_field<'a>(obj: &'a serde_json::Map<String, Value>, fields: &[&str]) -> Option<&'a Value> {
    fields.iter().find_map(|f| obj.get(*f))
}

fn row_amount(row: &Value) -> f64 {
    match row {
        Value::Object(obj) => first_field(obj, TOTAL_FIELDS).and_then(number).unwrap_or(0.0),
        other => number(other).unwrap_or(0.0),
    }
}

// Fold the collaborator's result into {total, breakdown?, count?}
pub fn normalize(raw: &Value) -> Option<NormalizedResult> {
    match raw {
        Value::Null => Some(NormalizedResult {
            total: 0.0,
            breakdown: None,
            count: Some(0),
        }),
        Value::Number(_) | Value::String(_) => number(raw).map(|total| NormalizedResult {
            total,
            breakdown: None,
            count: None,
        }),
        Value::Array(rows) => Some(NormalizedResult {
            total: rows.iter().map(row_amount).sum(),
            count: Some(rows.len() as u64),
            breakdown: Some(rows.clone()),
        }),
        Value::Object(obj) => {
            let breakdown = first_field(obj, BREAKDOWN_FIELDS)
                .and_then(Value::as_array)
                .cloned();
            let total = first_field(obj, TOTAL_FIELDS)
                .and_then(number)
                .or_else(|| breakdown.as_ref().map(|rows| rows.iter().map(row_amount).sum()))?;
            let count = first_field(obj, COUNT_FIELDS)
                .and_then(Value::as_u64)
                .or_else(|| breakdown.as_ref().map(|rows| rows.len() as u64));
            Some(NormalizedResult {
                total,
                breakdown,
                count,
            })
        }
        Value::Bool(_) => None,
    }
}

fn money(amount: f64) -> String {
    format!("${:.2}", amount)
}

fn period_suffix(args: &Value) -> String {
    args.get("period")
        .and_then(Value::as_str)
        .map(|p| format!(" {}", p.replace('_', " ")))
        .unwrap_or_default()
}

fn row_label(row: &Value) -> Option<&str> {
    row.as_object()
        .and_then(|obj| first_field(obj, LABEL_FIELDS))
        .and_then(Value::as_str)
}

// Human-readable answer plus insights for one executed call
pub fn summarize(call: &FunctionCall, result: &NormalizedResult) -> (String, Vec<String>) {
    let args = &call.arguments;
    let period = period_suffix(args);
    let arg = |key: &str| args.get(key).and_then(Value::as_str).unwrap_or("").to_string();

    let message = match call.name.parse::<AnalyticsFunction>() {
        Ok(AnalyticsFunction::SpendingByVendor) if arg("vendor").is_empty() => {
            format!("You spent {}{}.", money(result.total), period)
        }
        Ok(AnalyticsFunction::SpendingByVendor) => {
            format!("You spent {} at {}{}.", money(result.total), arg("vendor"), period)
        }
        Ok(AnalyticsFunction::SpendingByCategory) => {
            format!("You spent {} on {}{}.", money(result.total), arg("category"), period)
        }
        Ok(AnalyticsFunction::SpendingByTime) if period.is_empty() => {
            format!("You spent {} in total.", money(result.total))
        }
        Ok(AnalyticsFunction::SpendingByTime) => {
            format!("You spent {}{}.", money(result.total), period)
        }
        Ok(AnalyticsFunction::TopMerchants) => {
            let shown = result.breakdown.as_ref().map(Vec::len).unwrap_or(0);
            format!(
                "Here are your top {} merchants{}, totalling {}.",
                shown,
                period,
                money(result.total)
            )
        }
        Err(_) => format!("Total: {}.", money(result.total)),
    };

    let mut insights = Vec::new();
    match result.count {
        Some(0) => insights.push("No matching receipts found.".to_string()),
        Some(n) if result.total > 0.0 => insights.push(format!(
            "Across {} transaction{}, averaging {} each.",
            n,
            if n == 1 { "" } else { "s" },
            money(result.total / n as f64)
        )),
        _ => {}
    }
    if let Some(top) = result.breakdown.as_ref().and_then(|rows| rows.first()) {
        if let Some(label) = row_label(top) {
            insights.push(format!("Largest: {} ({}).", label, money(row_amount(top))));
        }
    }

    (message, insights)
}

// The `data` payload of an AgentResponse
pub fn response_data(call: &FunctionCall, result: &NormalizedResult) -> Value {
    let mut data = json!({
        "function": call.name,
        "parameters": call.arguments,
        "total": result.total,
    });
    if let Some(breakdown) = &result.breakdown {
        data["breakdown"] = json!(breakdown);
    }
    if let Some(count) = result.count {
        data["count"] = json!(count);
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::CountingBackend;

    #[test]
    fn normalizes_bare_numbers_and_strings() {
        assert_eq!(normalize(&json!(45.92)).unwrap().total, 45.92);
        assert_eq!(normalize(&json!("$12.50")).unwrap().total, 12.5);
        assert!(normalize(&json!("n/a")).is_none());
        assert!(normalize(&json!(true)).is_none());
    }

    #[test]
    fn normalizes_objects_with_alternate_field_names() {
        let result = normalize(&json!({"amount": 30, "items": [{"vendor": "Target", "amount": 30}], "transactions": 4}))
            .unwrap();
        assert_eq!(result.total, 30.0);
        assert_eq!(result.count, Some(4));
        assert_eq!(result.breakdown.unwrap().len(), 1);

        // total derived from rows when absent
        let result = normalize(&json!({"merchants": [{"total": 10.0}, {"total": 5.5}]})).unwrap();
        assert_eq!(result.total, 15.5);
        assert_eq!(result.count, Some(2));

        assert!(normalize(&json!({"unrelated": 1})).is_none());
    }

    #[test]
    fn normalizes_row_arrays_and_null() {
        let result = normalize(&json!([{"name": "A", "total": 2.0}, {"name": "B", "amount": 3.0}])).unwrap();
        assert_eq!(result.total, 5.0);
        assert_eq!(result.count, Some(2));

        let empty = normalize(&Value::Null).unwrap();
        assert_eq!(empty.total, 0.0);
        assert_eq!(empty.count, Some(0));
    }

    #[tokio::test]
    async fn execute_calls_backend_once_and_normalizes() {
        let backend = Arc::new(CountingBackend::returning(json!({"total": 45.92, "count": 3})));
        let executor = FunctionExecutor::new(backend.clone());

        let result = executor
            .execute("getSpendingByVendor", &json!({"vendor": "Chick-fil-A"}), "U1")
            .await
            .unwrap();

        assert_eq!(result.total, 45.92);
        assert_eq!(backend.calls(), 1);
        assert_eq!(backend.last_user().as_deref(), Some("U1"));
    }

    #[tokio::test]
    async fn backend_failure_becomes_execution_error_without_retry() {
        let backend = Arc::new(CountingBackend::failing("connection refused"));
        let executor = FunctionExecutor::new(backend.clone());

        let err = executor
            .execute("getTopMerchants", &json!({}), "U1")
            .await
            .unwrap_err();

        assert_eq!(backend.calls(), 1);
        match err {
            AgentError::Execution { function, message } => {
                assert_eq!(function, "getTopMerchants");
                assert!(message.contains("connection refused"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_function_never_reaches_backend() {
        let backend = Arc::new(CountingBackend::returning(json!(1)));
        let executor = FunctionExecutor::new(backend.clone());

        let err = executor.execute("deleteReceipts", &json!({}), "U1").await.unwrap_err();
        assert!(matches!(err, AgentError::UnknownFunction { .. }));
        assert_eq!(backend.calls(), 0);
    }

    #[test]
    fn summaries_read_naturally() {
        let call = FunctionCall {
            name: "getSpendingByVendor".into(),
            arguments: json!({"vendor": "Chick-fil-A", "period": "this_month"}),
        };
        let result = NormalizedResult {
            total: 45.92,
            breakdown: None,
            count: Some(4),
        };
        let (message, insights) = summarize(&call, &result);
        assert_eq!(message, "You spent $45.92 at Chick-fil-A this month.");
        assert_eq!(insights, vec!["Across 4 transactions, averaging $11.48 each.".to_string()]);

        let call = FunctionCall {
            name: "getTopMerchants".into(),
            arguments: json!({"limit": 5}),
        };
        let result = normalize(&json!([{"merchant": "Costco", "total": 300.0}, {"merchant": "Target", "total": 100.0}]))
            .unwrap();
        let (message, insights) = summarize(&call, &result);
        assert_eq!(message, "Here are your top 2 merchants, totalling $400.00.");
        assert!(insights.contains(&"Largest: Costco ($300.00).".to_string()));

        let call = FunctionCall {
            name: "getSpendingByVendor".into(),
            arguments: json!({}),
        };
        let (message, _) = summarize(&call, &NormalizedResult { total: 12.0, breakdown: None, count: None });
        assert_eq!(message, "You spent $12.00.");
    }

    #[test]
    fn data_payload_carries_total_and_call() {
        let call = FunctionCall {
            name: "getSpendingByCategory".into(),
            arguments: json!({"category": "coffee"}),
        };
        let result = NormalizedResult {
            total: 9.5,
            breakdown: None,
            count: Some(2),
        };
        let data = response_data(&call, &result);
        assert_eq!(data["total"], json!(9.5));
        assert_eq!(data["function"], json!("getSpendingByCategory"));
        assert_eq!(data["count"], json!(2));
        assert!(data.get("breakdown").is_none());
    }
}
