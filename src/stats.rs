//! Run statistics and the end-of-run report.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::options::MessageType;

/// Counters collected by the load generator over one run.
#[derive(Debug, Clone)]
pub struct Stats {
    pub started_at: DateTime<Utc>,
    pub sent: u64,
    pub matched: u64,
    pub no_match: u64,
    pub short_reads: u64,
    pub timeouts: u64,
    pub exhausted: u64,
    pub template_failures: u64,
    pub send_failures: u64,
    pub replies_by_type: BTreeMap<u8, u64>,
    rtt_min: Option<Duration>,
    rtt_max: Duration,
    rtt_total: Duration,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            sent: 0,
            matched: 0,
            no_match: 0,
            short_reads: 0,
            timeouts: 0,
            exhausted: 0,
            template_failures: 0,
            send_failures: 0,
            replies_by_type: BTreeMap::new(),
            rtt_min: None,
            rtt_max: Duration::ZERO,
            rtt_total: Duration::ZERO,
        }
    }

    /// Records a matched reply and how long it took.
    pub fn record_reply(&mut self, message_type: Option<MessageType>, rtt: Duration) {
        self.matched += 1;
        if let Some(message_type) = message_type {
            *self.replies_by_type.entry(message_type as u8).or_default() += 1;
        }
        self.rtt_min = Some(self.rtt_min.map_or(rtt, |min| min.min(rtt)));
        self.rtt_max = self.rtt_max.max(rtt);
        self.rtt_total += rtt;
    }

    pub fn rtt_min(&self) -> Option<Duration> {
        self.rtt_min
    }

    pub fn rtt_max(&self) -> Option<Duration> {
        self.rtt_min.map(|_| self.rtt_max)
    }

    pub fn rtt_avg(&self) -> Option<Duration> {
        let count = u32::try_from(self.matched).ok().filter(|count| *count > 0)?;
        Some(self.rtt_total / count)
    }

    pub fn elapsed(&self) -> Duration {
        (Utc::now() - self.started_at).to_std().unwrap_or_default()
    }

    /// Renders a human-readable summary of the run.
    pub fn report(&self) -> String {
        let elapsed = self.elapsed();
        let mut out = String::new();

        let _ = writeln!(out, "Started:       {}", self.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
        let _ = writeln!(out, "Elapsed:       {}", format_elapsed(elapsed));
        let _ = writeln!(out, "Sent:          {}", self.sent);
        let _ = writeln!(out, "Replies:       {}", self.matched);
        let _ = writeln!(out, "Timeouts:      {}", self.timeouts);
        let _ = writeln!(out, "Unmatched:     {}", self.no_match);
        let _ = writeln!(out, "Short reads:   {}", self.short_reads);
        let _ = writeln!(out, "Throttled:     {}", self.exhausted);
        let _ = writeln!(out, "Bad templates: {}", self.template_failures);
        let _ = writeln!(out, "Send failures: {}", self.send_failures);

        let seconds = elapsed.as_secs_f64();
        if seconds > 0.0 {
            let _ = writeln!(out, "Rate:          {:.2} req/s", self.sent as f64 / seconds);
        }

        for (code, count) in &self.replies_by_type {
            let name = MessageType::try_from(*code)
                .map(|message_type| message_type.to_string())
                .unwrap_or_else(|_| format!("type {}", code));
            let _ = writeln!(out, "  {:<14} {}", name, count);
        }

        if let (Some(min), Some(avg), Some(max)) = (self.rtt_min(), self.rtt_avg(), self.rtt_max()) {
            let _ = writeln!(
                out,
                "Response time: min {}, avg {}, max {}",
                format_elapsed(min),
                format_elapsed(avg),
                format_elapsed(max)
            );
        }
        out
    }
}

/// Formats a duration as `[[H:]MM:]SS[.ddd]`.
///
/// Hours and minutes are only shown when non-zero, milliseconds only when
/// there are some: `1:02:03`, `02:03.500`, `3.250`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    let millis = elapsed.subsec_millis();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;

    let mut out = String::new();
    if hours > 0 {
        let _ = write!(out, "{}:{:02}:{:02}", hours, minutes, seconds);
    } else if minutes > 0 {
        let _ = write!(out, "{:02}:{:02}", minutes, seconds);
    } else {
        let _ = write!(out, "{}", seconds);
    }
    if millis > 0 {
        let _ = write!(out, ".{:03}", millis);
    }
    out
}
