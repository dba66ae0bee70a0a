use serde::{Deserialize, Serialize};

/// Token and cost accounting as reported by the completions API.
///
/// Every field is optional; backends differ in what they report. Some
/// older backends send `cost` instead of `total_cost`, which is treated
/// as `total_cost` whenever the latter is absent.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Usage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost: Option<f64>,
    // Legacy alias for `total_cost`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

fn add_tokens(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (None, None) => None,
        _ => Some(a.unwrap_or(0) + b.unwrap_or(0)),
    }
}

fn add_costs(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (None, None) => None,
        _ => Some(a.unwrap_or(0.0) + b.unwrap_or(0.0)),
    }
}

impl Usage {
    /// The total cost with the legacy `cost` alias resolved.
    pub fn effective_total_cost(&self) -> Option<f64> {
        self.total_cost.or(self.cost)
    }

    /// Normalizes the legacy alias away: `total_cost` holds the effective
    /// value and `cost` is cleared.
    pub fn normalized(mut self) -> Self {
        self.total_cost = self.effective_total_cost();
        self.cost = None;
        self
    }

    /// Field-wise sum. Fields absent on both sides stay absent; a field
    /// present on either side counts the missing side as zero.
    pub fn merge(&mut self, other: &Usage) {
        self.prompt_tokens = add_tokens(self.prompt_tokens, other.prompt_tokens);
        self.completion_tokens = add_tokens(self.completion_tokens, other.completion_tokens);
        self.total_tokens = add_tokens(self.total_tokens, other.total_tokens);
        self.prompt_cost = add_costs(self.prompt_cost, other.prompt_cost);
        self.completion_cost = add_costs(self.completion_cost, other.completion_cost);
        self.total_cost = add_costs(self.effective_total_cost(), other.effective_total_cost());
        self.cost = None;
    }
}

/// Per-session accounting: the most recent turn's usage plus running totals.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UsageStats {
    pub last: Option<Usage>,
    pub total: Option<Usage>,
}

impl UsageStats {
    /// Records one turn's usage: it becomes `last` and is merged into
    /// `total`.
    pub fn record(&mut self, turn: Usage) {
        let turn = turn.normalized();
        let mut total = self.total.take().unwrap_or_default();
        total.merge(&turn);
        self.total = Some(total);
        self.last = Some(turn);
    }

    pub fn reset(&mut self) {
        self.last = None;
        self.total = None;
    }
}
