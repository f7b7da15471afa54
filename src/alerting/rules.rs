//! Static alerting rules and the preprocessing feeding them
//!
//! Each rule reduces one probe of a [`MetricRow`] to a single value. Probes
//! holding one record per cpu, mount point or database keep the worst value
//! together with the key that produced it.

use std::collections::HashMap;

use crate::storage::CheckDefinition;
use crate::storage::schema::{CheckState, MetricRow};

/// Which side of the thresholds is bad
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    /// Alert when the value goes above the thresholds
    Above,
    /// Alert when the value goes below the thresholds
    Below,
}

impl Comparison {
    /// Whether `candidate` is worse than `current`
    fn worse(&self, candidate: f64, current: f64) -> bool {
        match self {
            Comparison::Above => candidate > current,
            Comparison::Below => candidate < current,
        }
    }

    fn crosses(&self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::Above => value > threshold,
            Comparison::Below => value < threshold,
        }
    }
}

/// Value a check is evaluated against
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub value: f64,
    /// Record that produced the value (cpu, mount point, database)
    pub key: Option<String>,
}

pub struct Rule {
    pub name: &'static str,
    pub description: &'static str,
    pub comparison: Comparison,
    pub warning: f64,
    pub critical: f64,
    /// Multiply the default thresholds by the number of cpus
    pub per_cpu: bool,
    measure: fn(&MetricRow) -> Option<Measurement>,
}

impl Rule {
    pub fn state_for(&self, value: f64, warning: f64, critical: f64) -> CheckState {
        if self.comparison.crosses(value, critical) {
            CheckState::Critical
        } else if self.comparison.crosses(value, warning) {
            CheckState::Warning
        } else {
            CheckState::Ok
        }
    }

    pub fn measure(&self, row: &MetricRow) -> Option<Measurement> {
        (self.measure)(row)
    }
}

pub static RULES: &[Rule] = &[
    Rule {
        name: "load1",
        description: "Loadaverage",
        comparison: Comparison::Above,
        warning: 2.0,
        critical: 4.0,
        per_cpu: true,
        measure: load1,
    },
    Rule {
        name: "cpu_core",
        description: "CPU usage",
        comparison: Comparison::Above,
        warning: 50.0,
        critical: 80.0,
        per_cpu: false,
        measure: cpu_core,
    },
    Rule {
        name: "memory",
        description: "Memory usage",
        comparison: Comparison::Above,
        warning: 50.0,
        critical: 80.0,
        per_cpu: false,
        measure: memory,
    },
    Rule {
        name: "swap_usage",
        description: "Swap usage",
        comparison: Comparison::Above,
        warning: 30.0,
        critical: 50.0,
        per_cpu: false,
        measure: swap_usage,
    },
    Rule {
        name: "fs",
        description: "File systems usage",
        comparison: Comparison::Above,
        warning: 80.0,
        critical: 90.0,
        per_cpu: false,
        measure: fs,
    },
    Rule {
        name: "hitratio",
        description: "Cache hit ratio",
        comparison: Comparison::Below,
        warning: 90.0,
        critical: 80.0,
        per_cpu: false,
        measure: hitratio,
    },
    Rule {
        name: "sessions_usage",
        description: "Client sessions",
        comparison: Comparison::Above,
        warning: 80.0,
        critical: 90.0,
        per_cpu: false,
        measure: sessions_usage,
    },
    Rule {
        name: "waiting",
        description: "Waiting sessions",
        comparison: Comparison::Above,
        warning: 5.0,
        critical: 10.0,
        per_cpu: false,
        measure: waiting,
    },
    Rule {
        name: "xacts_rollback",
        description: "Rollbacked transactions",
        comparison: Comparison::Above,
        warning: 10.0,
        critical: 20.0,
        per_cpu: false,
        measure: xacts_rollback,
    },
];

pub fn find(name: &str) -> Option<&'static Rule> {
    RULES.iter().find(|rule| rule.name == name)
}

/// Checks created for a newly seen instance
pub fn default_checks(cpu_count: Option<u32>) -> Vec<CheckDefinition> {
    let cpus = f64::from(cpu_count.unwrap_or(1).max(1));

    RULES
        .iter()
        .map(|rule| {
            let scale = if rule.per_cpu { cpus } else { 1.0 };
            CheckDefinition::new(
                rule.name,
                rule.warning * scale,
                rule.critical * scale,
                rule.description,
            )
        })
        .collect()
}

/// One value per check name for every rule whose probe is in the row
pub fn preprocess(row: &MetricRow) -> HashMap<&'static str, Measurement> {
    RULES
        .iter()
        .filter_map(|rule| rule.measure(row).map(|m| (rule.name, m)))
        .collect()
}

fn field(record: &serde_json::Value, name: &str) -> f64 {
    record.get(name).and_then(|v| v.as_f64()).unwrap_or(0.0)
}

fn percent(part: f64, total: f64) -> Option<f64> {
    (total > 0.0).then(|| part * 100.0 / total)
}

/// Worst value over the records of a keyed probe
fn worst_by_key(
    row: &MetricRow,
    probe: &str,
    key_field: &str,
    comparison: Comparison,
    value: impl Fn(&serde_json::Value) -> Option<f64>,
) -> Option<Measurement> {
    let mut worst: Option<Measurement> = None;

    for record in row.records(probe) {
        let Some(candidate) = value(record) else {
            continue;
        };

        if worst
            .as_ref()
            .is_none_or(|current| comparison.worse(candidate, current.value))
        {
            worst = Some(Measurement {
                value: candidate,
                key: record
                    .get(key_field)
                    .and_then(|key| key.as_str())
                    .map(str::to_string),
            });
        }
    }

    worst
}

fn load1(row: &MetricRow) -> Option<Measurement> {
    row.records("loadavg").first().map(|record| Measurement {
        value: field(record, "load1"),
        key: None,
    })
}

fn cpu_core(row: &MetricRow) -> Option<Measurement> {
    worst_by_key(row, "cpu", "cpu", Comparison::Above, |record| {
        let busy = field(record, "time_user") + field(record, "time_system");
        let total = busy
            + field(record, "time_idle")
            + field(record, "time_iowait")
            + field(record, "time_steal");
        percent(busy, total)
    })
}

fn memory(row: &MetricRow) -> Option<Measurement> {
    let record = row.records("memory").first()?;
    let used = field(record, "mem_used") - field(record, "mem_cached") - field(record, "mem_buffers");
    percent(used.max(0.0), field(record, "mem_total")).map(|value| Measurement { value, key: None })
}

fn swap_usage(row: &MetricRow) -> Option<Measurement> {
    let record = row.records("memory").first()?;
    let total = field(record, "swap_total");
    if total <= 0.0 {
        return Some(Measurement {
            value: 0.0,
            key: None,
        });
    }
    percent(field(record, "swap_used"), total).map(|value| Measurement { value, key: None })
}

fn fs(row: &MetricRow) -> Option<Measurement> {
    worst_by_key(row, "filesystems_size", "mount_point", Comparison::Above, |record| {
        percent(field(record, "used"), field(record, "total"))
    })
}

fn hitratio(row: &MetricRow) -> Option<Measurement> {
    worst_by_key(row, "blocks", "dbname", Comparison::Below, |record| {
        let hit = field(record, "blks_hit");
        percent(hit, hit + field(record, "blks_read"))
    })
}

const SESSION_STATES: &[&str] = &[
    "active",
    "waiting",
    "idle",
    "idle_in_xact",
    "idle_in_xact_aborted",
    "fastpath",
    "disabled",
];

fn sessions_usage(row: &MetricRow) -> Option<Measurement> {
    let sessions = row.records("sessions");
    if sessions.is_empty() {
        return None;
    }

    let max_connections = row.data.get("max_connections")?.as_f64()?;
    let total: f64 = sessions
        .iter()
        .map(|record| SESSION_STATES.iter().map(|state| field(record, state)).sum::<f64>())
        .sum();

    percent(total, max_connections).map(|value| Measurement { value, key: None })
}

fn waiting(row: &MetricRow) -> Option<Measurement> {
    worst_by_key(row, "sessions", "dbname", Comparison::Above, |record| {
        Some(field(record, "waiting"))
    })
}

fn xacts_rollback(row: &MetricRow) -> Option<Measurement> {
    worst_by_key(row, "xacts", "dbname", Comparison::Above, |record| {
        Some(field(record, "n_rollback"))
    })
}
