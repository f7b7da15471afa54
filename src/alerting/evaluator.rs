//! Alert state machine
//!
//! For every enabled check of an instance the latest row yields a new state.
//! A different state is persisted (check state + `state_changes` entry in one
//! transaction) and then handed to the [`Notifier`]. Any state can be reached
//! from any other in a single evaluation.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, trace};

use super::rules;
use crate::notifications::Notifier;
use crate::storage::StorageBackend;
use crate::storage::schema::{MetricRow, NotificationTarget, StateChange};

pub struct AlertEvaluator {
    storage: Arc<dyn StorageBackend>,
    notifier: Notifier,
}

impl AlertEvaluator {
    pub fn new(storage: Arc<dyn StorageBackend>, notifier: Notifier) -> Self {
        Self { storage, notifier }
    }

    /// Evaluate the checks of `instance_id` against a committed row
    ///
    /// Returns the transitions that were recorded.
    #[instrument(skip(self, row), fields(datetime = %row.datetime))]
    pub async fn evaluate(&self, instance_id: i64, row: &MetricRow) -> Result<Vec<StateChange>> {
        let measurements = rules::preprocess(row);
        let checks = self
            .storage
            .instance_checks(instance_id)
            .await
            .context("failed to load checks")?;

        let mut target: Option<NotificationTarget> = None;
        let mut changes = Vec::new();

        for check in checks.iter().filter(|check| check.enabled) {
            let Some(rule) = rules::find(&check.name) else {
                trace!("no rule for check {}", check.name);
                continue;
            };
            let Some(measurement) = measurements.get(rule.name) else {
                continue;
            };

            let new_state = rule.state_for(measurement.value, check.warning, check.critical);
            if new_state == check.state {
                continue;
            }

            let change = StateChange::for_check(
                check,
                new_state,
                row.datetime,
                measurement.key.clone(),
                measurement.value,
            );
            self.storage
                .record_transition(&change)
                .await
                .with_context(|| format!("failed to record transition of {}", check.name))?;

            info!(
                "check {} went from {} to {} (value {})",
                check.name, change.old_state, change.new_state, change.value
            );

            if target.is_none() {
                target = self
                    .storage
                    .notification_target(instance_id)
                    .await
                    .context("failed to load notification target")?;
            }
            match &target {
                Some(target) => {
                    self.notifier.dispatch(target, check, &change).await;
                }
                None => debug!("instance {instance_id} has no notification target"),
            }

            changes.push(change);
        }

        Ok(changes)
    }
}
