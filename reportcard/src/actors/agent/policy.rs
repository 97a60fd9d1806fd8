//! Turn-budget reminders and transcript truncation.

use super::tools::SUBMIT_PROFILE_TOOL;
use super::AgentConfig;

/// Reminder text for the request built after `turns_taken` completed turns.
pub fn reminder_for(turns_taken: usize, config: &AgentConfig) -> Option<String> {
    let urgent_from = config
        .max_turns
        .saturating_sub(config.urgent_reminder_margin);
    let remaining = config.max_turns.saturating_sub(turns_taken);

    if turns_taken >= urgent_from {
        Some(format!(
            "URGENT: only {remaining} turn(s) remain. Stop researching and call \
             {SUBMIT_PROFILE_TOOL} now with the most complete profile you can assemble."
        ))
    } else if turns_taken >= config.gentle_reminder_turn {
        Some(format!(
            "Reminder: you have used {turns_taken} of {} turns. Once you have enough \
             information, call {SUBMIT_PROFILE_TOOL} with the profile.",
            config.max_turns
        ))
    } else {
        None
    }
}

/// Cut `text` to at most `max` bytes on a char boundary, marking the cut.
pub fn truncate_for_log(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
