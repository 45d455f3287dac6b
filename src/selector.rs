use serde_json::{Map, Value, json};
use crate::analytics::AnalyticsFunction;
use crate::models::FunctionCall;

// keyword routing: first rule with a phrase in the query wins, vendor otherwise

// (phrase as matched, value passed to analytics)
const VENDORS: &[(&str, &str)] = &[
    ("chick-fil-a", "Chick-fil-A"),
    ("chickfila", "Chick-fil-A"),
    ("starbucks", "Starbucks"),
    ("dunkin", "Dunkin'"),
    ("mcdonald's", "McDonald's"),
    ("mcdonalds", "McDonald's"),
    ("chipotle", "Chipotle"),
    ("subway", "Subway"),
    ("walmart", "Walmart"),
    ("target", "Target"),
    ("costco", "Costco"),
    ("kroger", "Kroger"),
    ("whole foods", "Whole Foods"),
    ("trader joe's", "Trader Joe's"),
    ("trader joes", "Trader Joe's"),
    ("amazon", "Amazon"),
    ("home depot", "Home Depot"),
    ("cvs", "CVS"),
    ("walgreens", "Walgreens"),
    ("shell", "Shell"),
    ("chevron", "Chevron"),
    ("exxon", "Exxon"),
    ("uber", "Uber"),
    ("lyft", "Lyft"),
    ("netflix", "Netflix"),
];

const CATEGORIES: &[(&str, &str)] = &[
    ("coffee", "coffee"),
    ("food", "food"),
    ("gas", "gas"),
    ("fuel", "gas"),
    ("groceries", "groceries"),
    ("grocery", "groceries"),
    ("restaurants", "restaurants"),
    ("restaurant", "restaurants"),
    ("dining", "restaurants"),
    ("entertainment", "entertainment"),
    ("travel", "travel"),
    ("shopping", "shopping"),
    ("utilities", "utilities"),
    ("transportation", "transportation"),
    ("healthcare", "healthcare"),
    ("subscriptions", "subscriptions"),
];

const PERIODS: &[(&str, &str)] = &[
    ("today", "today"),
    ("yesterday", "yesterday"),
    ("this week", "this_week"),
    ("last week", "last_week"),
    ("this month", "this_month"),
    ("last month", "last_month"),
    ("this quarter", "this_quarter"),
    ("last quarter", "last_quarter"),
    ("this year", "this_year"),
    ("last year", "last_year"),
    ("past 30 days", "past_30_days"),
    ("past 7 days", "past_7_days"),
];

const SUPERLATIVES: &[(&str, &str)] = &[
    ("biggest", "biggest"),
    ("largest", "largest"),
    ("top", "top"),
    ("most", "most"),
    ("highest", "highest"),
];

// words that introduce a merchant nobody listed above
const VENDOR_MARKERS: &[&str] = &["at", "from", "in"];

// what can follow a marker without being a merchant
const NOT_VENDORS: &[&str] = &["total", "all", "general", "the past", "my"];

const DEFAULT_TOP_LIMIT: u64 = 5;

#[derive(Clone, Debug, PartialEq)]
pub struct RoutingRule {
    // (phrase, canonical value)
    pub keywords: &'static [(&'static str, &'static str)],
    pub function: AnalyticsFunction,
}

impl RoutingRule {
    // Canonical value of the first phrase present in the query
    pub fn first_match(&self, normalized: &str) -> Option<&'static str> {
        lookup(normalized, self.keywords)
    }
}

// Priority order: vendor, category, time, superlative
pub const DEFAULT_RULES: [RoutingRule; 4] = [
    RoutingRule { keywords: VENDORS, function: AnalyticsFunction::SpendingByVendor },
    RoutingRule { keywords: CATEGORIES, function: AnalyticsFunction::SpendingByCategory },
    RoutingRule { keywords: PERIODS, function: AnalyticsFunction::SpendingByTime },
    RoutingRule { keywords: SUPERLATIVES, function: AnalyticsFunction::TopMerchants },
];

#[derive(Clone, Debug)]
pub struct FunctionSelector {
    rules: Vec<RoutingRule>,
    fallback: AnalyticsFunction,
}

impl Default for FunctionSelector {
    fn default() -> Self {
        Self::new(DEFAULT_RULES.to_vec(), AnalyticsFunction::SpendingByVendor)
    }
}

impl FunctionSelector {
    pub fn new(rules: Vec<RoutingRule>, fallback: AnalyticsFunction) -> Self {
        Self { rules, fallback }
    }

    pub fn rules(&self) -> &[RoutingRule] {
        &self.rules
    }

    pub fn select(&self, query: &str) -> AnalyticsFunction {
        let normalized = normalize_query(query);
        self.rules
            .iter()
            .find(|rule| rule.first_match(&normalized).is_some())
            .map(|rule| rule.function)
            .unwrap_or(self.fallback)
    }

    // Pick the function and synthesize its arguments from the query text
    pub fn route(&self, query: &str) -> FunctionCall {
        let function = self.select(query);
        FunctionCall {
            name: function.name().to_string(),
            arguments: extract_arguments(function, &normalize_query(query)),
        }
    }
}

pub fn select(query: &str) -> AnalyticsFunction {
    FunctionSelector::default().select(query)
}

pub fn normalize_query(text: &str) -> String {
    text.trim()
        .to_lowercase()
        .replace(['\u{2018}', '\u{2019}'], "'")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

// Byte offset of `phrase` in `haystack` on word boundaries ("gas" is not in "vegas")
fn phrase_start(haystack: &str, phrase: &str) -> Option<usize> {
    haystack.match_indices(phrase).map(|(start, _)| start).find(|&start| {
        let end = start + phrase.len();
        let before = haystack[..start].chars().next_back();
        let after = haystack[end..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}

fn contains_phrase(haystack: &str, phrase: &str) -> bool {
    phrase_start(haystack, phrase).is_some()
}

fn lookup(normalized: &str, table: &'static [(&'static str, &'static str)]) -> Option<&'static str> {
    table
        .iter()
        .find(|(phrase, _)| contains_phrase(normalized, phrase))
        .map(|(_, value)| *value)
}

// "top 3 merchants" -> 3
fn top_limit(normalized: &str) -> u64 {
    let words: Vec<&str> = normalized.split_whitespace().collect();
    words
        .windows(2)
        .filter(|w| w[0] == "top")
        .find_map(|w| w[1].trim_matches(|c: char| !c.is_ascii_digit()).parse::<u64>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_TOP_LIMIT)
}

fn title_case(phrase: &str) -> String {
    phrase
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

// "how much at panera bread last month?" -> "Panera Bread"
fn unlisted_vendor(normalized: &str) -> Option<String> {
    let words: Vec<&str> = normalized.split_whitespace().collect();

    words
        .iter()
        .enumerate()
        .filter(|(_, w)| VENDOR_MARKERS.contains(*w))
        .find_map(|(i, _)| {
            let candidate: Vec<&str> = words[i + 1..]
                .iter()
                .take_while(|w| !VENDOR_MARKERS.contains(*w))
                .copied()
                .collect();
            let mut candidate = candidate.join(" ");
            if let Some(cut) = PERIODS.iter().filter_map(|(p, _)| phrase_start(&candidate, p)).min() {
                candidate.truncate(cut);
            }
            let candidate = candidate.trim().trim_end_matches(['?', '.', '!', ',', ';', ':']).trim();
            let candidate = candidate.strip_prefix("the ").unwrap_or(candidate);

            if candidate.is_empty() || NOT_VENDORS.contains(&candidate) {
                None
            } else {
                Some(title_case(candidate))
            }
        })
}

pub fn extract_arguments(function: AnalyticsFunction, normalized: &str) -> Value {
    let mut args = Map::new();

    match function {
        AnalyticsFunction::SpendingByVendor => {
            // left out when no merchant can be picked from the text
            let vendor = lookup(normalized, VENDORS)
                .map(str::to_string)
                .or_else(|| unlisted_vendor(normalized));
            if let Some(vendor) = vendor {
                args.insert("vendor".into(), json!(vendor));
            }
        }
        AnalyticsFunction::SpendingByCategory => {
            if let Some(category) = lookup(normalized, CATEGORIES) {
                args.insert("category".into(), json!(category));
            }
        }
        AnalyticsFunction::SpendingByTime => {}
        AnalyticsFunction::TopMerchants => {
            args.insert("limit".into(), json!(top_limit(normalized)));
        }
    }

    if let Some(period) = lookup(normalized, PERIODS) {
        args.insert("period".into(), json!(period));
    }
    Value::Object(args)
}
