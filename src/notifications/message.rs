//! Rendering of state change notifications

use crate::storage::schema::{Check, CheckState, NotificationTarget, StateChange};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedNotification {
    pub subject: String,
    pub body: String,
    /// Single line version for SMS
    pub sms_body: String,
}

/// `rising` when leaving OK or entering CRITICAL, `falling` otherwise
pub fn direction(old: CheckState, new: CheckState) -> &'static str {
    if old == CheckState::Ok || new == CheckState::Critical {
        "rising"
    } else {
        "falling"
    }
}

fn threshold_message(check: &Check, state: CheckState) -> String {
    match state {
        CheckState::Critical => format!("critical threshold ({}) reached", check.critical),
        CheckState::Warning => format!("warning threshold ({}) reached", check.warning),
        CheckState::Ok => "back to normal".to_string(),
    }
}

pub fn render(
    target: &NotificationTarget,
    check: &Check,
    change: &StateChange,
) -> RenderedNotification {
    let subject = format!(
        "[fleetwatch] {} {} - {}",
        change.new_state, target.hostname, check.description
    );

    let value = match &change.key {
        Some(key) => format!("{} ({})", change.value, key),
        None => change.value.to_string(),
    };

    let body = format!(
        "Instance: {}:{}\n\
         Description: {}\n\
         Status: {} ({}), previous status: {}\n\
         Value: {}\n\
         {}\n\
         Date: {}\n",
        target.hostname,
        target.port,
        check.description,
        change.new_state,
        direction(change.old_state, change.new_state),
        change.old_state,
        value,
        threshold_message(check, change.new_state),
        change.at.to_rfc3339(),
    );

    let sms_body = format!(
        "{} {}:{} {} {}: {}",
        change.new_state,
        target.hostname,
        target.port,
        check.description,
        value,
        threshold_message(check, change.new_state),
    );

    RenderedNotification {
        subject,
        body,
        sms_body,
    }
}
