//! Reminders handler
//!
//! Creates, lists and cancels reminders from plain-language requests such as
//! "remind me to call mom tomorrow at 2pm" or "remind me to stretch every day
//! at 9am". Due reminders are delivered through `on_schedule`.
//!
//! Times are interpreted in the user's offset from UTC, taken from the
//! `utc_offset_minutes` handler setting (default 0).

use crate::db::{Recurrence, Reminder, ReminderRepository};
use crate::registry::tokenize;
use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset, NaiveTime, Offset, TimeZone, Utc};
use regex::Regex;
use sdk::handler::{CommandHelp, Handler, HandlerContext, HandlerMetadata, HandlerOutcome};
use sdk::types::{InboundMessage, ScheduledAction};
use std::sync::LazyLock;
use tracing::{info, warn};

/// Hour used when a day is named without a time
const DEFAULT_HOUR: u32 = 9;

/// Schedule phrases understood in a reminder request
struct Patterns {
    relative: Regex,
    clock: Regex,
    recurrence: Regex,
    day: Regex,
    lead: Regex,
}

static PATTERNS: LazyLock<Patterns> = LazyLock::new(|| {
    let compile = |pattern: &str| Regex::new(pattern).expect("reminder pattern is a valid regex");
    Patterns {
        relative: compile(r"(?i)\bin\s+(\d{1,4})\s*(minutes?|mins?|hours?|hrs?|days?|weeks?)\b"),
        clock: compile(r"(?i)\bat\s+(\d{1,2})(?::(\d{2}))?\s*(am|pm)?\b"),
        recurrence: compile(r"(?i)\b(?:every\s+(day|week|month)|(daily|weekly|monthly))\b"),
        day: compile(r"(?i)\b(today|tonight|tomorrow)\b"),
        lead: compile(r"(?i)^\s*(?:please\s+)?(?:remind\s+me\s+(?:to|about|that)?|don't\s+forget\s+(?:to)?|set\s+a\s+reminder\s+(?:to|for)?|reminder\s*:?)\s*"),
    }
});

/// When and how often a reminder fires
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedSchedule {
    pub due_at: DateTime<FixedOffset>,
    pub recurrence: Option<Recurrence>,
}

/// Parse the schedule out of a request, relative to `now`
///
/// Returns `None` when the text names no time at all.
pub fn parse_schedule(text: &str, now: DateTime<FixedOffset>) -> Option<ParsedSchedule> {
    let recurrence = PATTERNS.recurrence.captures(text).and_then(|caps| {
        let word = caps.get(1).or_else(|| caps.get(2))?.as_str().to_lowercase();
        match word.as_str() {
            "day" | "daily" => Some(Recurrence::Daily),
            "week" | "weekly" => Some(Recurrence::Weekly),
            "month" | "monthly" => Some(Recurrence::Monthly),
            _ => None,
        }
    });

    if let Some(caps) = PATTERNS.relative.captures(text) {
        let amount: i64 = caps[1].parse().ok()?;
        let unit = caps[2].to_lowercase();
        let offset = if unit.starts_with("min") {
            Duration::minutes(amount)
        } else if unit.starts_with('h') {
            Duration::hours(amount)
        } else if unit.starts_with('d') {
            Duration::days(amount)
        } else {
            Duration::weeks(amount)
        };
        return Some(ParsedSchedule {
            due_at: now + offset,
            recurrence,
        });
    }

    let day = PATTERNS.day.captures(text).map(|caps| caps[1].to_lowercase());
    let clock = PATTERNS.clock.captures(text).and_then(|caps| {
        let mut hour: u32 = caps[1].parse().ok()?;
        let minute: u32 = caps.get(2).map_or(Ok(0), |m| m.as_str().parse()).ok()?;
        match caps.get(3).map(|m| m.as_str().to_lowercase()).as_deref() {
            Some("pm") if hour < 12 => hour += 12,
            Some("am") if hour == 12 => hour = 0,
            _ => {}
        }
        NaiveTime::from_hms_opt(hour, minute, 0)
    });

    if day.is_none() && clock.is_none() {
        // "every day" alone starts one interval from now
        return recurrence.map(|r| ParsedSchedule {
            due_at: now + r.interval(),
            recurrence,
        });
    }

    let base_date = match day.as_deref() {
        Some("tomorrow") => now.date_naive() + Duration::days(1),
        _ => now.date_naive(),
    };
    let time = clock.unwrap_or_else(|| match day.as_deref() {
        Some("tonight") => NaiveTime::from_hms_opt(20, 0, 0).unwrap_or(NaiveTime::MIN),
        Some("today") => (now + Duration::hours(1)).time(),
        _ => NaiveTime::from_hms_opt(DEFAULT_HOUR, 0, 0).unwrap_or(NaiveTime::MIN),
    });

    let mut due_at = now
        .timezone()
        .from_local_datetime(&base_date.and_time(time))
        .single()?;

    // A bare clock time that already passed means the next day
    if day.is_none() && due_at <= now {
        due_at += Duration::days(1);
    }

    Some(ParsedSchedule { due_at, recurrence })
}

/// The thing to be reminded of, with the schedule phrases removed
pub fn extract_task(text: &str) -> String {
    let mut task = PATTERNS.lead.replace(text, "").to_string();
    for re in [&PATTERNS.relative, &PATTERNS.clock, &PATTERNS.recurrence, &PATTERNS.day] {
        task = re.replace_all(&task, "").to_string();
    }
    let task = task.split_whitespace().collect::<Vec<_>>().join(" ");
    let task = task.trim_matches(|c: char| c.is_ascii_punctuation() || c.is_whitespace());
    match task.get(..3) {
        Some(lead) if lead.eq_ignore_ascii_case("to ") => task[3..].trim().to_string(),
        _ => task.to_string(),
    }
}

fn format_due(due_at: DateTime<FixedOffset>) -> String {
    due_at.format("%B %d at %I:%M %p").to_string()
}

pub struct ReminderHandler {
    metadata: HandlerMetadata,
    reminders: ReminderRepository,
}

impl ReminderHandler {
    pub fn new(reminders: ReminderRepository) -> Self {
        Self {
            metadata: HandlerMetadata::new("reminders")
                .description("Set, list, and cancel time-based reminders")
                .keywords(&[
                    "remind",
                    "reminder",
                    "reminders",
                    "alert",
                    "notify",
                    "don't forget",
                    "scheduled",
                ])
                .priority(20)
                .intents(&["reminder", "reminders"]),
            reminders,
        }
    }

    fn offset(ctx: &HandlerContext) -> FixedOffset {
        let minutes = ctx.setting_i64("utc_offset_minutes").unwrap_or(0);
        i32::try_from(minutes.saturating_mul(60))
            .ok()
            .and_then(FixedOffset::east_opt)
            .unwrap_or_else(|| Utc.fix())
    }

    async fn create(&self, message: &str, ctx: &HandlerContext) -> anyhow::Result<String> {
        let offset = Self::offset(ctx);
        let now = Utc::now().with_timezone(&offset);

        let Some(schedule) = parse_schedule(message, now) else {
            return Ok("I need to know when to remind you. Try: 'Remind me to call mom tomorrow at 2pm' or 'Remind me in 20 minutes to check the oven'".to_string());
        };

        let task = extract_task(message);
        let task = if task.is_empty() { "Reminder".to_string() } else { task };

        let reminder = self
            .reminders
            .create(
                ctx.user_id(),
                &task,
                schedule.due_at.with_timezone(&Utc),
                schedule.recurrence,
            )
            .await?;
        info!(user = %ctx.user_id(), id = reminder.id, "Created reminder");

        let mut reply = format!("[OK] Reminder set for {}: {}", format_due(schedule.due_at), task);
        if let Some(recurrence) = schedule.recurrence {
            reply.push_str(&format!(" (repeats {})", recurrence.as_str()));
        }
        Ok(reply)
    }

    async fn list(&self, ctx: &HandlerContext) -> anyhow::Result<String> {
        let pending = self.reminders.pending_for_user(ctx.user_id()).await?;
        if pending.is_empty() {
            return Ok("You don't have any active reminders.".to_string());
        }

        let offset = Self::offset(ctx);
        let mut reply = String::from("Your reminders:\n");
        for (i, reminder) in pending.iter().enumerate() {
            reply.push_str(&format!(
                "\n{}. {} - {}",
                i + 1,
                reminder.text,
                format_due(reminder.due_at.with_timezone(&offset))
            ));
            if let Some(recurrence) = reminder.recurrence {
                reply.push_str(&format!(" ({})", recurrence.as_str()));
            }
        }
        Ok(reply)
    }

    async fn cancel(&self, tokens: &[String], ctx: &HandlerContext) -> anyhow::Result<String> {
        let pending = self.reminders.pending_for_user(ctx.user_id()).await?;
        let position = tokens
            .iter()
            .find_map(|t| t.trim_start_matches('#').parse::<usize>().ok());

        match position.and_then(|n| n.checked_sub(1)).and_then(|i| pending.get(i)) {
            Some(reminder) => {
                self.reminders.cancel(ctx.user_id(), reminder.id).await?;
                Ok(format!("[OK] Cancelled reminder: {}", reminder.text))
            }
            None if pending.is_empty() => Ok("You don't have any active reminders.".to_string()),
            None => Ok(format!(
                "Which reminder would you like to cancel? Say 'cancel reminder <number>'.\n\n{}",
                self.list(ctx).await?
            )),
        }
    }

    async fn fire(&self, reminder: &Reminder, now: DateTime<Utc>) -> anyhow::Result<()> {
        match reminder.recurrence {
            Some(recurrence) => {
                let mut next = reminder.due_at + recurrence.interval();
                while next <= now {
                    next += recurrence.interval();
                }
                self.reminders.reschedule(reminder.id, next).await
            }
            None => self.reminders.complete(reminder.id).await,
        }
    }
}

#[async_trait]
impl Handler for ReminderHandler {
    fn metadata(&self) -> &HandlerMetadata {
        &self.metadata
    }

    async fn handle(&self, message: &InboundMessage, ctx: &HandlerContext) -> HandlerOutcome {
        let tokens = tokenize(&message.text);
        let has = |words: &[&str]| tokens.iter().any(|t| words.contains(&t.as_str()));

        let result = if has(&["cancel", "delete", "remove"]) {
            self.cancel(&tokens, ctx).await
        } else if has(&["list", "show"]) || tokens.first().is_some_and(|t| t == "what") {
            self.list(ctx).await
        } else {
            self.create(&message.text, ctx).await
        };

        result.map_err(|e| format!("{:#}", e)).into()
    }

    async fn on_schedule(&self) -> Vec<ScheduledAction> {
        let now = Utc::now();
        let due = match self.reminders.due(now).await {
            Ok(due) => due,
            Err(e) => {
                warn!(error = %e, "Failed to load due reminders");
                return Vec::new();
            }
        };

        let mut actions = Vec::with_capacity(due.len());
        for reminder in due {
            if let Err(e) = self.fire(&reminder, now).await {
                warn!(id = reminder.id, error = %e, "Failed to advance reminder");
                continue;
            }
            actions.push(ScheduledAction {
                user_id: reminder.user_id.clone(),
                handler_name: self.metadata.name.clone(),
                text: format!("⏰ Reminder: {}", reminder.text),
            });
        }
        actions
    }

    fn commands(&self) -> Vec<CommandHelp> {
        vec![
            CommandHelp::new("remind me to [task] at [time]", "Create a time-based reminder"),
            CommandHelp::new("remind me to [task] every day", "Create a recurring reminder"),
            CommandHelp::new("list reminders", "Show all active reminders"),
            CommandHelp::new("cancel reminder [number]", "Remove a reminder"),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Timelike};

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<FixedOffset> {
        let offset = FixedOffset::east_opt(0).unwrap();
        offset
            .from_local_datetime(
                &NaiveDate::from_ymd_opt(y, m, d)
                    .unwrap()
                    .and_hms_opt(h, min, 0)
                    .unwrap(),
            )
            .unwrap()
    }

    #[test]
    fn test_patterns_compile() {
        let patterns = LazyLock::force(&PATTERNS);
        assert!(patterns.lead.is_match("Please remind me to stretch"));
        assert!(patterns.clock.is_match("at 7:30pm"));
        assert!(!patterns.day.is_match("yesterday"));
    }

    #[test]
    fn test_tomorrow_at_pm() {
        let now = at(2026, 3, 10, 16, 0);
        let schedule = parse_schedule("remind me to call mom tomorrow at 2pm", now).unwrap();
        assert_eq!(schedule.due_at, at(2026, 3, 11, 14, 0));
        assert_eq!(schedule.recurrence, None);
    }

    #[test]
    fn test_relative_offsets() {
        let now = at(2026, 3, 10, 16, 0);
        assert_eq!(
            parse_schedule("remind me in 20 minutes to check the oven", now)
                .unwrap()
                .due_at,
            at(2026, 3, 10, 16, 20)
        );
        assert_eq!(
            parse_schedule("in 2 days remind me to pay rent", now)
                .unwrap()
                .due_at,
            at(2026, 3, 12, 16, 0)
        );
    }

    #[test]
    fn test_past_clock_time_rolls_to_next_day() {
        let now = at(2026, 3, 10, 16, 0);
        let schedule = parse_schedule("remind me at 9:30am to stretch", now).unwrap();
        assert_eq!(schedule.due_at, at(2026, 3, 11, 9, 30));

        let later = parse_schedule("remind me at 17:45 to leave", now).unwrap();
        assert_eq!(later.due_at.hour(), 17);
        assert_eq!(later.due_at.minute(), 45);
    }

    #[test]
    fn test_recurrence() {
        let now = at(2026, 3, 10, 16, 0);
        let schedule = parse_schedule("remind me to stretch every day at 9am", now).unwrap();
        assert_eq!(schedule.recurrence, Some(Recurrence::Daily));
        assert_eq!(schedule.due_at, at(2026, 3, 11, 9, 0));

        let weekly = parse_schedule("weekly reminder to water plants", now).unwrap();
        assert_eq!(weekly.recurrence, Some(Recurrence::Weekly));
        assert_eq!(weekly.due_at, at(2026, 3, 17, 16, 0));
    }

    #[test]
    fn test_no_time_is_none() {
        let now = at(2026, 3, 10, 16, 0);
        assert!(parse_schedule("remind me to buy milk", now).is_none());
    }

    #[test]
    fn test_extract_task() {
        assert_eq!(extract_task("Remind me to call mom tomorrow at 2pm"), "call mom");
        assert_eq!(
            extract_task("remind me in 20 minutes to check the oven."),
            "check the oven"
        );
        assert_eq!(extract_task("remind me to stretch every day at 9am"), "stretch");
    }
}
