//! Backing store
//!
//! RAM-first repository behind the narrow contract the core needs:
//! read-by-key and range-filter (API keys by hash, budgets/rules by user),
//! atomic spend increment (under the budget entry's lock), and append for
//! journal records. Nothing outside this module knows how state is held, so
//! swapping the engine never touches the pipeline.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::auth::ApiKeyRecord;
use crate::budget::{Budget, BudgetEntry};
use crate::journal::JournalRecord;
use crate::router::RoutingRule;
use crate::security::detectors::rules::CustomRule;
use crate::security::{KillRequest, QuarantinedRequest};

pub struct Store {
    /// key-hash -> record; the raw key never exists server-side
    api_keys: DashMap<String, ApiKeyRecord>,
    /// key id -> key-hash, for revocation by id
    api_key_hashes: DashMap<Uuid, String>,
    budgets: DashMap<Uuid, Arc<BudgetEntry>>,
    rules: DashMap<Uuid, RoutingRule>,
    custom_rules: DashMap<Uuid, Vec<CustomRule>>,
    journal: RwLock<Vec<JournalRecord>>,
    quarantine: DashMap<Uuid, QuarantinedRequest>,
    kill_requests: DashMap<Uuid, KillRequest>,
}

impl Store {
    pub fn new() -> Self {
        Self {
            api_keys: DashMap::new(),
            api_key_hashes: DashMap::new(),
            budgets: DashMap::new(),
            rules: DashMap::new(),
            custom_rules: DashMap::new(),
            journal: RwLock::new(Vec::new()),
            quarantine: DashMap::new(),
            kill_requests: DashMap::new(),
        }
    }

    // =========================================================================
    // API keys
    // =========================================================================

    pub fn insert_api_key(&self, record: ApiKeyRecord) {
        self.api_key_hashes.insert(record.id, record.key_hash.clone());
        self.api_keys.insert(record.key_hash.clone(), record);
    }

    pub fn api_key_by_hash(&self, key_hash: &str) -> Option<ApiKeyRecord> {
        self.api_keys.get(key_hash).map(|r| r.clone())
    }

    pub fn keys_for_user(&self, user_id: Uuid) -> Vec<ApiKeyRecord> {
        let mut keys: Vec<ApiKeyRecord> = self
            .api_keys
            .iter()
            .filter(|r| r.user_id == user_id)
            .map(|r| r.clone())
            .collect();
        keys.sort_by_key(|k| k.created_at);
        keys
    }

    /// Revoke by id, scoped to the owning user. Returns false when no such
    /// key exists for that user.
    pub fn revoke_api_key(&self, key_id: Uuid, user_id: Uuid) -> bool {
        let Some(hash) = self.api_key_hashes.get(&key_id).map(|h| h.clone()) else {
            return false;
        };
        match self.api_keys.get_mut(&hash) {
            Some(mut record) if record.user_id == user_id => {
                record.is_active = false;
                true
            }
            _ => false,
        }
    }

    pub fn touch_api_key(&self, key_hash: &str, at: DateTime<Utc>) {
        if let Some(mut record) = self.api_keys.get_mut(key_hash) {
            record.last_used_at = Some(at);
        }
    }

    // =========================================================================
    // Budgets
    // =========================================================================

    pub fn insert_budget(&self, budget: Budget) {
        self.budgets.insert(budget.id, Arc::new(BudgetEntry::new(budget)));
    }

    /// Active-or-not entries for one user, most specific scope first.
    pub fn budgets_for(&self, user_id: Uuid) -> Vec<Arc<BudgetEntry>> {
        let mut entries: Vec<(crate::budget::BudgetScope, Arc<BudgetEntry>)> = self
            .budgets
            .iter()
            .filter_map(|entry| {
                let snapshot = entry.snapshot();
                (snapshot.user_id == user_id).then(|| (snapshot.scope, entry.clone()))
            })
            .collect();
        entries.sort_by_key(|(scope, _)| *scope);
        entries.into_iter().map(|(_, entry)| entry).collect()
    }

    pub fn budget_entry(&self, budget_id: Uuid) -> Option<Arc<BudgetEntry>> {
        self.budgets.get(&budget_id).map(|e| e.clone())
    }

    /// Soft delete: the record stays, nothing applies it anymore.
    pub fn deactivate_budget(&self, budget_id: Uuid, user_id: Uuid) -> bool {
        let Some(entry) = self.budgets.get(&budget_id) else {
            return false;
        };
        let mut cell = entry.cell.lock().unwrap_or_else(|p| p.into_inner());
        if cell.budget.user_id != user_id {
            return false;
        }
        cell.budget.is_active = false;
        true
    }

    // =========================================================================
    // Routing rules
    // =========================================================================

    pub fn insert_rule(&self, rule: RoutingRule) {
        self.rules.insert(rule.id, rule);
    }

    /// Active rules for one user, ascending priority.
    pub fn rules_for(&self, user_id: Uuid) -> Vec<RoutingRule> {
        let mut rules: Vec<RoutingRule> = self
            .rules
            .iter()
            .filter(|r| r.user_id == user_id && r.is_active)
            .map(|r| r.clone())
            .collect();
        rules.sort_by_key(|r| r.priority);
        rules
    }

    pub fn disable_rule(&self, rule_id: Uuid, user_id: Uuid) -> bool {
        match self.rules.get_mut(&rule_id) {
            Some(mut rule) if rule.user_id == user_id => {
                rule.is_active = false;
                true
            }
            _ => false,
        }
    }

    pub fn record_rule_application(&self, rule_id: Uuid, savings: Decimal) {
        if let Some(mut rule) = self.rules.get_mut(&rule_id) {
            rule.times_applied += 1;
            rule.estimated_savings_usd += savings;
        }
    }

    // =========================================================================
    // Custom security rules
    // =========================================================================

    pub fn put_custom_rule(&self, rule: CustomRule) {
        self.custom_rules.entry(rule.user_id).or_default().push(rule);
    }

    pub fn custom_rules_for(&self, user_id: Uuid) -> Vec<CustomRule> {
        self.custom_rules
            .get(&user_id)
            .map(|rules| rules.clone())
            .unwrap_or_default()
    }

    // =========================================================================
    // Journal (append-only)
    // =========================================================================

    pub fn append_journal(&self, record: JournalRecord) {
        self.journal
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(record);
    }

    pub fn journal_len(&self) -> usize {
        self.journal.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Most recent `limit` records for one user, newest first.
    pub fn recent_journal(&self, user_id: Uuid, limit: usize) -> Vec<JournalRecord> {
        let journal = self.journal.read().unwrap_or_else(|p| p.into_inner());
        journal
            .iter()
            .rev()
            .filter(|r| r.user_id == user_id)
            .take(limit)
            .cloned()
            .collect()
    }

    #[cfg(test)]
    pub fn journal_snapshot(&self) -> Vec<JournalRecord> {
        self.journal.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    // =========================================================================
    // Quarantine and kill requests
    // =========================================================================

    pub fn put_quarantine(&self, entry: QuarantinedRequest) {
        self.quarantine.insert(entry.request_id, entry);
    }

    pub fn quarantine_list(&self, user_id: Uuid) -> Vec<QuarantinedRequest> {
        self.quarantine
            .iter()
            .filter(|q| q.user_id == user_id)
            .map(|q| q.clone())
            .collect()
    }

    pub fn put_kill_request(&self, kill: KillRequest) {
        self.kill_requests.insert(kill.request_id, kill);
    }

    pub fn kill_requests(&self, user_id: Uuid) -> Vec<KillRequest> {
        self.kill_requests
            .iter()
            .filter(|k| k.user_id == user_id)
            .map(|k| k.clone())
            .collect()
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{generate_api_key, Tier};
    use crate::budget::{BudgetAction, BudgetPeriod, BudgetScope};
    use rust_decimal_macros::dec;

    fn key_record(user_id: Uuid) -> ApiKeyRecord {
        let (_, hash, prefix) = generate_api_key();
        ApiKeyRecord {
            id: Uuid::new_v4(),
            user_id,
            agent_id: None,
            name: "test".into(),
            key_prefix: prefix,
            key_hash: hash,
            tier: Tier::Free,
            is_active: true,
            created_at: Utc::now(),
            last_used_at: None,
        }
    }

    #[test]
    fn revocation_is_owner_scoped() {
        let store = Store::new();
        let owner = Uuid::new_v4();
        let record = key_record(owner);
        let key_id = record.id;
        let hash = record.key_hash.clone();
        store.insert_api_key(record);

        assert!(!store.revoke_api_key(key_id, Uuid::new_v4()));
        assert!(store.api_key_by_hash(&hash).unwrap().is_active);

        assert!(store.revoke_api_key(key_id, owner));
        assert!(!store.api_key_by_hash(&hash).unwrap().is_active);
    }

    #[test]
    fn budgets_sort_most_specific_first() {
        let store = Store::new();
        let user = Uuid::new_v4();
        for (scope, identifier) in [
            (BudgetScope::Global, None),
            (BudgetScope::PerModel, Some("claude".to_string())),
            (BudgetScope::PerAgent, Some(Uuid::new_v4().to_string())),
        ] {
            store.insert_budget(Budget {
                id: Uuid::new_v4(),
                user_id: user,
                name: format!("{scope:?}"),
                scope,
                scope_identifier: identifier,
                period: BudgetPeriod::Monthly,
                limit_usd: dec!(100),
                current_spend_usd: Decimal::ZERO,
                warning_threshold_percent: 80,
                critical_threshold_percent: 95,
                action_on_breach: BudgetAction::Block,
                downgrade_model: None,
                reset_at: Utc::now() + chrono::Duration::days(1),
                is_active: true,
            });
        }

        let scopes: Vec<BudgetScope> = store
            .budgets_for(user)
            .iter()
            .map(|e| e.snapshot().scope)
            .collect();
        assert_eq!(
            scopes,
            vec![BudgetScope::PerModel, BudgetScope::PerAgent, BudgetScope::Global]
        );
    }

    #[test]
    fn journal_is_append_only_and_queryable() {
        let store = Store::new();
        let user = Uuid::new_v4();
        for i in 0..5 {
            store.append_journal(JournalRecord {
                request_id: Uuid::new_v4(),
                user_id: user,
                agent_id: None,
                provider: "anthropic".into(),
                model_original: "claude-sonnet-4-5".into(),
                model_effective: "claude-sonnet-4-5".into(),
                endpoint: "/v1/messages".into(),
                input_tokens: i,
                output_tokens: 0,
                cache_creation_tokens: 0,
                cache_read_tokens: 0,
                cost_usd: Decimal::ZERO,
                latency_ms: 0,
                status_code: 200,
                streaming: false,
                timestamp: Utc::now(),
            });
        }

        assert_eq!(store.journal_len(), 5);
        let recent = store.recent_journal(user, 3);
        assert_eq!(recent.len(), 3);
        // Newest first
        assert_eq!(recent[0].input_tokens, 4);
    }
}
