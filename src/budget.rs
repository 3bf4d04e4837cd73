//! Budget Engine
//!
//! Checks budgets before a request is forwarded and debits them after it
//! completes. Spend is exact decimal, never floats.
//!
//! Threshold alerts fire at most once per budget per active period, whether
//! the crossing happens at pre-check (projected spend) or at debit (actual
//! spend). The fired-threshold set lives under the same per-budget mutex as
//! the spend counter, so pre-check and debit emission are serialized.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::Store;

/// Alert thresholds (percent of budget used) checked for every budget, in
/// addition to the budget's own warning/critical thresholds.
pub const DEFAULT_ALERT_THRESHOLDS: [u8; 4] = [50, 75, 90, 100];

/// Budget scope, ordered by specificity: the most specific scopes are
/// evaluated first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetScope {
    PerModel,
    PerAgent,
    PerWorkflow,
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetPeriod {
    Daily,
    Weekly,
    Monthly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetAction {
    Alert,
    Warn,
    Block,
    DowngradeModel,
}

/// One spend cap. Mutated only by the engine (debit, reset) after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Budget {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub scope: BudgetScope,
    /// Agent id for per-agent scope, model-id prefix for per-model scope
    pub scope_identifier: Option<String>,
    pub period: BudgetPeriod,
    pub limit_usd: Decimal,
    pub current_spend_usd: Decimal,
    pub warning_threshold_percent: u8,
    pub critical_threshold_percent: u8,
    pub action_on_breach: BudgetAction,
    pub downgrade_model: Option<String>,
    pub reset_at: DateTime<Utc>,
    pub is_active: bool,
}

impl Budget {
    pub fn percent_used(&self) -> Decimal {
        if self.limit_usd.is_zero() {
            return Decimal::ZERO;
        }
        self.current_spend_usd / self.limit_usd * Decimal::ONE_HUNDRED
    }

    pub fn remaining_usd(&self) -> Decimal {
        (self.limit_usd - self.current_spend_usd).max(Decimal::ZERO)
    }

    /// Does this budget constrain the given request?
    pub fn applies_to(&self, agent_id: Option<&str>, model: Option<&str>) -> bool {
        match self.scope {
            BudgetScope::Global => true,
            BudgetScope::PerAgent => match (agent_id, self.scope_identifier.as_deref()) {
                (Some(agent), Some(scope)) => agent == scope,
                _ => false,
            },
            BudgetScope::PerModel => match (model, self.scope_identifier.as_deref()) {
                (Some(model), Some(prefix)) => model.starts_with(prefix),
                _ => false,
            },
            // Workflow metadata is not available on the proxy path.
            BudgetScope::PerWorkflow => false,
        }
    }

    /// ok | warning | critical, for status reporting.
    pub fn status_level(&self) -> &'static str {
        let percent = self.percent_used();
        if percent >= Decimal::from(self.critical_threshold_percent) {
            "critical"
        } else if percent >= Decimal::from(self.warning_threshold_percent) {
            "warning"
        } else {
            "ok"
        }
    }
}

/// Budget plus its per-period fired-threshold set, guarded by one mutex.
pub struct BudgetCell {
    pub budget: Budget,
    pub fired_thresholds: HashSet<u8>,
}

pub struct BudgetEntry {
    pub cell: std::sync::Mutex<BudgetCell>,
}

impl BudgetEntry {
    pub fn new(budget: Budget) -> Self {
        Self {
            cell: std::sync::Mutex::new(BudgetCell {
                budget,
                fired_thresholds: HashSet::new(),
            }),
        }
    }

    pub fn snapshot(&self) -> Budget {
        self.cell
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .budget
            .clone()
    }
}

/// Result of a pre-check.
#[derive(Debug, Clone, PartialEq)]
pub enum BudgetDecision {
    Allow,
    Warn {
        budget_name: String,
        percent_used: f64,
    },
    Downgrade {
        target_model: String,
    },
    Block {
        budget_name: String,
        remaining_usd: Decimal,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Warning,
    Critical,
    Breach,
}

#[derive(Debug, Clone, Serialize)]
pub struct BudgetAlert {
    pub budget_id: Uuid,
    pub budget_name: String,
    pub threshold_percent: u8,
    pub current_percent: f64,
    pub current_spend_usd: Decimal,
    pub limit_usd: Decimal,
    pub kind: AlertKind,
}

type AlertHook = Box<dyn Fn(&BudgetAlert) + Send + Sync>;

/// Model substitutions applied when a downgrade budget has no explicit
/// target. Falls through to the unmodified model.
const DOWNGRADE_MAP: &[(&str, &str)] = &[
    ("claude-opus-4-5", "claude-sonnet-4-5"),
    ("claude-opus-4", "claude-sonnet-4"),
    ("claude-sonnet-4-5", "claude-haiku-4-5"),
    ("claude-sonnet-4", "claude-haiku-4-5"),
    ("gpt-4o", "gpt-4o-mini"),
    ("gpt-4-turbo", "gpt-4o-mini"),
    ("gpt-4", "gpt-4o-mini"),
    ("o1", "o3-mini"),
    ("o1-mini", "o3-mini"),
    ("gemini-2.5-pro-preview", "gemini-2.0-flash"),
    ("gemini-1.5-pro", "gemini-1.5-flash"),
    ("mistral-large-2411", "mistral-small-2402"),
    ("deepseek-reasoner", "deepseek-chat"),
];

/// Engine for budget checking and enforcement.
pub struct BudgetEngine {
    store: Arc<Store>,
    alert_hook: Option<AlertHook>,
}

impl BudgetEngine {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            alert_hook: None,
        }
    }

    /// Install a callback invoked for every alert. Best-effort only: the
    /// engine never lets a hook failure reach the request path.
    pub fn with_alert_hook(mut self, hook: AlertHook) -> Self {
        self.alert_hook = Some(hook);
        self
    }

    /// Pre-check: may this request proceed, and under what condition?
    ///
    /// Budgets are evaluated most-specific first; the first non-Allow
    /// decision wins. Expired periods are reset before their value is used.
    pub fn check_budget(
        &self,
        user_id: Uuid,
        agent_id: Option<&str>,
        model: &str,
        estimated_cost: Decimal,
    ) -> BudgetDecision {
        let entries = self.store.budgets_for(user_id);
        let now = Utc::now();

        for entry in entries {
            let mut cell = entry
                .cell
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());

            if !cell.budget.is_active || !cell.budget.applies_to(agent_id, Some(model)) {
                continue;
            }

            maybe_reset(&mut cell, now);

            let projected = cell.budget.current_spend_usd + estimated_cost;
            let projected_percent = if cell.budget.limit_usd.is_zero() {
                Decimal::ZERO
            } else {
                projected / cell.budget.limit_usd * Decimal::ONE_HUNDRED
            };

            // Fire every not-yet-fired threshold the projection reaches.
            for threshold in threshold_ladder(&cell.budget) {
                if projected_percent >= Decimal::from(threshold)
                    && !cell.fired_thresholds.contains(&threshold)
                {
                    cell.fired_thresholds.insert(threshold);
                    let alert = build_alert(&cell.budget, threshold, projected_percent);
                    self.emit(&alert);
                }
            }

            if projected > cell.budget.limit_usd {
                match cell.budget.action_on_breach {
                    BudgetAction::Block => {
                        return BudgetDecision::Block {
                            budget_name: cell.budget.name.clone(),
                            remaining_usd: cell.budget.remaining_usd(),
                        };
                    }
                    BudgetAction::DowngradeModel => {
                        return BudgetDecision::Downgrade {
                            target_model: downgrade_target(&cell.budget, model),
                        };
                    }
                    BudgetAction::Warn => {
                        return BudgetDecision::Warn {
                            budget_name: cell.budget.name.clone(),
                            percent_used: decimal_percent(projected_percent),
                        };
                    }
                    // Alert-only budgets never gate the request.
                    BudgetAction::Alert => {}
                }
            } else if projected_percent >= Decimal::from(cell.budget.warning_threshold_percent) {
                return BudgetDecision::Warn {
                    budget_name: cell.budget.name.clone(),
                    percent_used: decimal_percent(projected_percent),
                };
            }
        }

        BudgetDecision::Allow
    }

    /// Debit actual cost against every applicable budget, firing any
    /// threshold crossed by the increment.
    pub fn debit(
        &self,
        user_id: Uuid,
        cost: Decimal,
        agent_id: Option<&str>,
        model: Option<&str>,
    ) -> Vec<BudgetAlert> {
        let entries = self.store.budgets_for(user_id);
        let mut alerts = Vec::new();

        for entry in entries {
            let mut cell = entry
                .cell
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());

            if !cell.budget.is_active || !cell.budget.applies_to(agent_id, model) {
                continue;
            }

            let previous_percent = cell.budget.percent_used();
            cell.budget.current_spend_usd += cost;
            let new_percent = cell.budget.percent_used();

            for threshold in threshold_ladder(&cell.budget) {
                let t = Decimal::from(threshold);
                if previous_percent < t
                    && new_percent >= t
                    && !cell.fired_thresholds.contains(&threshold)
                {
                    cell.fired_thresholds.insert(threshold);
                    let alert = build_alert(&cell.budget, threshold, new_percent);
                    self.emit(&alert);
                    alerts.push(alert);
                }
            }
        }

        alerts
    }

    /// Reset one budget: spend to zero, next boundary, thresholds cleared.
    pub fn reset(&self, budget_id: Uuid) -> bool {
        let Some(entry) = self.store.budget_entry(budget_id) else {
            return false;
        };
        let mut cell = entry
            .cell
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        reset_cell(&mut cell, Utc::now());
        true
    }

    fn emit(&self, alert: &BudgetAlert) {
        tracing::warn!(
            budget = %alert.budget_name,
            threshold = alert.threshold_percent,
            percent = alert.current_percent,
            kind = ?alert.kind,
            "budget alert"
        );
        if let Some(hook) = &self.alert_hook {
            hook(alert);
        }
    }
}

/// All thresholds watched for a budget: the standard ladder plus the
/// budget's own warning/critical marks.
fn threshold_ladder(budget: &Budget) -> Vec<u8> {
    let mut ladder: Vec<u8> = DEFAULT_ALERT_THRESHOLDS.to_vec();
    ladder.push(budget.warning_threshold_percent);
    ladder.push(budget.critical_threshold_percent);
    ladder.sort_unstable();
    ladder.dedup();
    ladder
}

fn build_alert(budget: &Budget, threshold: u8, percent: Decimal) -> BudgetAlert {
    let kind = if threshold >= 100 {
        AlertKind::Breach
    } else if threshold >= budget.critical_threshold_percent {
        AlertKind::Critical
    } else {
        AlertKind::Warning
    };
    BudgetAlert {
        budget_id: budget.id,
        budget_name: budget.name.clone(),
        threshold_percent: threshold,
        current_percent: decimal_percent(percent),
        current_spend_usd: budget.current_spend_usd,
        limit_usd: budget.limit_usd,
        kind,
    }
}

fn maybe_reset(cell: &mut BudgetCell, now: DateTime<Utc>) {
    if cell.budget.reset_at <= now {
        reset_cell(cell, now);
    }
}

fn reset_cell(cell: &mut BudgetCell, now: DateTime<Utc>) {
    cell.budget.current_spend_usd = Decimal::ZERO;
    cell.budget.reset_at = next_reset(cell.budget.period, now);
    cell.fired_thresholds.clear();
}

/// Start of the next calendar day / ISO week (Monday 00:00 UTC) / calendar
/// month. Always strictly in the future.
pub fn next_reset(period: BudgetPeriod, now: DateTime<Utc>) -> DateTime<Utc> {
    match period {
        BudgetPeriod::Daily => (now + Duration::days(1))
            .date_naive()
            .and_time(NaiveTime::MIN)
            .and_utc(),
        BudgetPeriod::Weekly => {
            let mut days = (7 - now.weekday().num_days_from_monday() as i64) % 7;
            if days == 0 {
                days = 7;
            }
            (now + Duration::days(days))
                .date_naive()
                .and_time(NaiveTime::MIN)
                .and_utc()
        }
        BudgetPeriod::Monthly => {
            let (year, month) = if now.month() == 12 {
                (now.year() + 1, 1)
            } else {
                (now.year(), now.month() + 1)
            };
            chrono::NaiveDate::from_ymd_opt(year, month, 1)
                .unwrap_or_else(|| now.date_naive())
                .and_time(NaiveTime::MIN)
                .and_utc()
        }
    }
}

fn decimal_percent(percent: Decimal) -> f64 {
    percent.to_f64().unwrap_or(0.0)
}

/// Resolve the downgrade substitute for a model under a breached budget.
fn downgrade_target(budget: &Budget, model: &str) -> String {
    if let Some(target) = &budget.downgrade_model {
        return target.clone();
    }
    if let Some((_, target)) = DOWNGRADE_MAP.iter().find(|(from, _)| *from == model) {
        return (*target).to_string();
    }
    // Versioned ids fall back to their family entry.
    let family: String = model.split('-').take(3).collect::<Vec<_>>().join("-");
    if let Some((_, target)) = DOWNGRADE_MAP.iter().find(|(from, _)| *from == family) {
        return (*target).to_string();
    }
    model.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn make_budget(limit: Decimal, spent: Decimal, action: BudgetAction) -> Budget {
        Budget {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: "test".into(),
            scope: BudgetScope::Global,
            scope_identifier: None,
            period: BudgetPeriod::Monthly,
            limit_usd: limit,
            current_spend_usd: spent,
            warning_threshold_percent: 80,
            critical_threshold_percent: 95,
            action_on_breach: action,
            downgrade_model: None,
            reset_at: Utc::now() + Duration::days(10),
            is_active: true,
        }
    }

    fn engine_with(budget: Budget) -> (BudgetEngine, Uuid, Uuid) {
        let store = Arc::new(Store::new());
        let user_id = budget.user_id;
        let budget_id = budget.id;
        store.insert_budget(budget);
        (BudgetEngine::new(store), user_id, budget_id)
    }

    #[test]
    fn allow_when_far_from_limit() {
        let (engine, user, _) = engine_with(make_budget(dec!(100), dec!(10), BudgetAction::Block));
        let decision = engine.check_budget(user, None, "claude-sonnet-4-5", dec!(0.10));
        assert_eq!(decision, BudgetDecision::Allow);
    }

    #[test]
    fn block_when_projection_exceeds_limit() {
        let (engine, user, _) = engine_with(make_budget(dec!(10), dec!(9.99), BudgetAction::Block));
        match engine.check_budget(user, None, "gpt-4o", dec!(0.10)) {
            BudgetDecision::Block { remaining_usd, .. } => {
                assert_eq!(remaining_usd, dec!(0.01));
            }
            other => panic!("expected Block, got {other:?}"),
        }
    }

    #[test]
    fn downgrade_uses_static_map_without_explicit_target() {
        let (engine, user, _) =
            engine_with(make_budget(dec!(10), dec!(9.95), BudgetAction::DowngradeModel));
        match engine.check_budget(user, None, "claude-opus-4", dec!(0.10)) {
            BudgetDecision::Downgrade { target_model } => {
                assert_eq!(target_model, "claude-sonnet-4");
            }
            other => panic!("expected Downgrade, got {other:?}"),
        }
    }

    #[test]
    fn downgrade_prefers_budget_target() {
        let mut budget = make_budget(dec!(10), dec!(9.95), BudgetAction::DowngradeModel);
        budget.downgrade_model = Some("claude-haiku-4-5".into());
        let (engine, user, _) = engine_with(budget);
        match engine.check_budget(user, None, "claude-opus-4", dec!(0.10)) {
            BudgetDecision::Downgrade { target_model } => {
                assert_eq!(target_model, "claude-haiku-4-5");
            }
            other => panic!("expected Downgrade, got {other:?}"),
        }
    }

    #[test]
    fn warn_above_warning_threshold() {
        let (engine, user, _) = engine_with(make_budget(dec!(100), dec!(85), BudgetAction::Block));
        match engine.check_budget(user, None, "gpt-4o", dec!(0.10)) {
            BudgetDecision::Warn { percent_used, .. } => {
                assert!(percent_used > 85.0);
            }
            other => panic!("expected Warn, got {other:?}"),
        }
    }

    #[test]
    fn per_model_budget_matches_by_prefix() {
        let mut budget = make_budget(dec!(10), dec!(9.99), BudgetAction::Block);
        budget.scope = BudgetScope::PerModel;
        budget.scope_identifier = Some("claude-opus".into());
        let (engine, user, _) = engine_with(budget);

        // A sonnet request is out of scope and must pass.
        let decision = engine.check_budget(user, None, "claude-sonnet-4-5", dec!(0.10));
        assert_eq!(decision, BudgetDecision::Allow);

        // An opus request is in scope and blocks.
        let decision = engine.check_budget(user, None, "claude-opus-4-5", dec!(0.10));
        assert!(matches!(decision, BudgetDecision::Block { .. }));
    }

    #[test]
    fn debit_accumulates_exactly() {
        let (engine, user, id) = engine_with(make_budget(dec!(100), dec!(10), BudgetAction::Block));
        engine.debit(user, dec!(0.0105), None, Some("claude-sonnet-4-5"));
        let entry = engine.store.budget_entry(id).unwrap();
        assert_eq!(entry.snapshot().current_spend_usd, dec!(10.0105));
    }

    #[test]
    fn threshold_fires_at_most_once_per_period() {
        let alert_count = Arc::new(AtomicUsize::new(0));
        let count = alert_count.clone();
        let budget = make_budget(dec!(100), dec!(70), BudgetAction::Alert);
        let user = budget.user_id;
        let store = Arc::new(Store::new());
        store.insert_budget(budget);
        let engine = BudgetEngine::new(store).with_alert_hook(Box::new(move |alert| {
            if alert.threshold_percent == 75 {
                count.fetch_add(1, Ordering::SeqCst);
            }
        }));

        // Crosses 75 on debit.
        engine.debit(user, dec!(6), None, None);
        // Already above 75; neither debit nor pre-check may re-fire it.
        engine.debit(user, dec!(1), None, None);
        engine.check_budget(user, None, "gpt-4o", dec!(0.10));

        assert_eq!(alert_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exact_hundred_percent_fires_once() {
        let alert_count = Arc::new(AtomicUsize::new(0));
        let count = alert_count.clone();
        let budget = make_budget(dec!(100), dec!(90), BudgetAction::Alert);
        let user = budget.user_id;
        let store = Arc::new(Store::new());
        store.insert_budget(budget);
        let engine = BudgetEngine::new(store).with_alert_hook(Box::new(move |alert| {
            if alert.threshold_percent == 100 {
                count.fetch_add(1, Ordering::SeqCst);
            }
        }));

        // Lands exactly on 100.000...%.
        engine.debit(user, dec!(10), None, None);
        engine.debit(user, dec!(0), None, None);
        engine.check_budget(user, None, "gpt-4o", dec!(0));

        assert_eq!(alert_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn debit_then_reset_then_debit() {
        let (engine, user, id) = engine_with(make_budget(dec!(100), dec!(0), BudgetAction::Block));
        engine.debit(user, dec!(2.5), None, None);
        engine.reset(id);
        engine.debit(user, dec!(2.5), None, None);
        let entry = engine.store.budget_entry(id).unwrap();
        assert_eq!(entry.snapshot().current_spend_usd, dec!(2.5));
    }

    #[test]
    fn expired_budget_resets_before_pre_check() {
        let mut budget = make_budget(dec!(100), dec!(99.99), BudgetAction::Block);
        budget.reset_at = Utc::now() - Duration::hours(1);
        let (engine, user, id) = engine_with(budget);

        // After the lazy reset the projection is far below the limit.
        let decision = engine.check_budget(user, None, "gpt-4o", dec!(0.10));
        assert_eq!(decision, BudgetDecision::Allow);

        let snapshot = engine.store.budget_entry(id).unwrap().snapshot();
        assert_eq!(snapshot.current_spend_usd, Decimal::ZERO);
        assert!(snapshot.reset_at > Utc::now());
    }

    #[test]
    fn next_reset_boundaries() {
        let now = Utc::now();
        let daily = next_reset(BudgetPeriod::Daily, now);
        let weekly = next_reset(BudgetPeriod::Weekly, now);
        let monthly = next_reset(BudgetPeriod::Monthly, now);
        assert!(daily > now);
        assert!(weekly > now);
        assert!(monthly > now);
        assert_eq!(weekly.weekday(), chrono::Weekday::Mon);
        assert_eq!(monthly.day(), 1);
    }
}
