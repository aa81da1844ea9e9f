//! One synchronous check cycle: detect, queue, evaluate, report.

use crate::changes::{ChangeSet, ChangeSource};
use crate::config::Config;
use crate::detector::{detect_rule, DetectionEvent, Trigger};
use crate::error::{PolicyError, Result};
use crate::evaluator::Evaluator;
use crate::queue::{ActionResult, QueueEntry, QueueStatus, QueueStore};
use crate::report::{format_report, CheckReport, EntryReport, RuleOutcome, RuleReport};
use crate::rules::{CompareTo, Rule, RuleSet};
use crate::snapshot::ChangeProbe;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

pub struct Engine<'a> {
    root: &'a Path,
    config: &'a Config,
    queue: &'a dyn QueueStore,
    probe: &'a dyn ChangeProbe,
}

impl<'a> Engine<'a> {
    pub fn new(
        root: &'a Path,
        config: &'a Config,
        queue: &'a dyn QueueStore,
        probe: &'a dyn ChangeProbe,
    ) -> Self {
        Self {
            root,
            config,
            queue,
            probe,
        }
    }

    /// Run one check cycle over every rule.
    ///
    /// Change-source failures abort the cycle. Failures inside one rule are
    /// recorded on that rule's report and the cycle moves on.
    pub fn check(&self, rules: &RuleSet, source: &dyn ChangeSource) -> Result<CheckReport> {
        let mut change_sets: BTreeMap<CompareTo, ChangeSet> = BTreeMap::new();
        let mut reports = Vec::with_capacity(rules.len());

        for rule in rules.iter() {
            let mode = rule.effective_compare_to(self.config.default_compare_to);
            if !change_sets.contains_key(&mode) {
                change_sets.insert(mode, source.changes(mode)?);
            }
            let Some(set) = change_sets.get(&mode) else {
                continue;
            };

            let report = match self.check_rule(rule, set) {
                Ok(report) => report,
                Err(e) => {
                    warn!(rule = %rule.id, error = %e, "rule check failed");
                    RuleReport {
                        rule: rule.id.clone(),
                        title: rule.title().to_string(),
                        outcome: RuleOutcome::Error,
                        entries: Vec::new(),
                        error: Some(e.to_string()),
                    }
                }
            };
            reports.push(report);
        }

        let text = format_report(&reports, |id| rules.get(id));
        Ok(CheckReport {
            rules: reports,
            text,
        })
    }

    fn check_rule(&self, rule: &Rule, set: &ChangeSet) -> Result<RuleReport> {
        let events = detect_rule(rule, &set.files, &set.baseline)?;
        let evaluator = Evaluator::new(
            self.root,
            self.probe,
            self.queue,
            self.config.command_timeout(),
        );

        let mut outcome = RuleOutcome::Quiet;
        let mut entries = Vec::new();
        for event in events {
            let event_outcome = match event {
                DetectionEvent::Satisfied { .. } => RuleOutcome::Satisfied,
                DetectionEvent::Suppressed { .. } => RuleOutcome::Suppressed,
                DetectionEvent::Fired(trigger) => {
                    let entry = self.process_trigger(&evaluator, rule, &trigger, set)?;
                    let o = RuleOutcome::from_status(entry.status());
                    entries.push(entry);
                    o
                }
            };
            outcome = outcome.min(event_outcome);
        }

        Ok(RuleReport {
            rule: rule.id.clone(),
            title: rule.title().to_string(),
            outcome,
            entries,
            error: None,
        })
    }

    fn process_trigger(
        &self,
        evaluator: &Evaluator<'_>,
        rule: &Rule,
        trigger: &Trigger,
        set: &ChangeSet,
    ) -> Result<EntryReport> {
        self.queue.create(&QueueEntry::from_trigger(trigger))?;
        // A corrupt record discarded between create and lookup is recreated
        // on the next cycle.
        let Some(entry) = self.queue.lookup(&trigger.hash)? else {
            return Err(PolicyError::EntryNotFound(trigger.hash.clone()));
        };
        if entry.is_terminal() {
            return Ok(EntryReport {
                entry,
                evaluation: None,
            });
        }
        let evaluation = evaluator.evaluate(&entry, rule, &set.files)?;
        let entry = self.queue.lookup(&entry.hash)?.unwrap_or(entry);
        Ok(EntryReport {
            entry,
            evaluation: Some(evaluation),
        })
    }

    /// Mark every queued entry of the named prompt rules as passed.
    ///
    /// Identifiers match case-insensitively. Returns the hashes settled.
    pub fn dismiss(&self, rules: &RuleSet, rule_ids: &[&str]) -> Result<Vec<String>> {
        let mut targets = Vec::new();
        for id in rule_ids {
            let rule = rules
                .find(id)
                .ok_or_else(|| PolicyError::RuleNotFound(id.to_string()))?;
            if rule.is_prompt() {
                targets.push(rule.id.as_str());
            }
        }

        let mut settled = Vec::new();
        for entry in self.queue.list()? {
            if entry.status != QueueStatus::Queued || !targets.contains(&entry.rule.as_str()) {
                continue;
            }
            match self
                .queue
                .transition(&entry.hash, QueueStatus::Passed, Some(ActionResult::Dismissed))
            {
                Ok(true) => {
                    info!(rule = %entry.rule, hash = %entry.hash, "dismissed");
                    settled.push(entry.hash);
                }
                // Settled by another session since the listing.
                Ok(false) | Err(PolicyError::InvalidTransition { .. }) => {
                    debug!(hash = %entry.hash, "entry settled concurrently");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(settled)
    }

    /// Dismiss every rule whose marker appears in `text`.
    pub fn dismiss_from_text(&self, rules: &RuleSet, text: &str) -> Result<Vec<String>> {
        let ids: Vec<&str> = rules.dismissed_by(text).iter().map(|r| r.id.as_str()).collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.dismiss(rules, &ids)
    }

    /// Caller override: skip a queued entry.
    pub fn override_entry(&self, hash: &str, reason: &str) -> Result<bool> {
        self.queue.transition(
            hash,
            QueueStatus::Skipped,
            Some(ActionResult::Skipped {
                reason: reason.to_string(),
            }),
        )
    }
}
