use crate::transaction::TransactionId;
use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use time::format_description::well_known::Rfc3339;
use time::format_description::FormatItem;
use time::{format_description, OffsetDateTime, UtcOffset};
use tracing::warn;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;

pub type Clock = Arc<dyn GlobalClock + Send + Sync>;
/// The global [Clock]
static CLOCK: Mutex<Option<Clock>> = Mutex::new(None);

/// Gets the current global clock. Creates a new [Clock] if not present.
pub fn get_global_clock(tid: &TransactionId) -> Result<Clock> {
    if let Some(rt) = CLOCK.lock().as_ref() {
        return Ok(rt.clone());
    }
    let clk: Clock = LocalTime::boxed(tid)?;
    *CLOCK.lock() = Some(clk.clone());
    Ok(clk)
}

/// Get the current [Instant]
#[inline(always)]
pub fn now() -> Instant {
    // allow here because we want all code to use this method
    #[allow(clippy::disallowed_methods)]
    Instant::now()
}

/// Wall-clock time as nanoseconds since the unix epoch.
/// Every sample and region boundary is stamped with this.
#[inline(always)]
pub fn unix_nanos() -> u64 {
    #[allow(clippy::disallowed_methods)]
    let t = OffsetDateTime::now_utc().unix_timestamp_nanos();
    t.max(0) as u64
}

/// Render a unix nanosecond timestamp as an RFC 3339 string in UTC.
pub fn iso_timestamp(unix_ns: u64) -> Result<String> {
    let t = OffsetDateTime::from_unix_timestamp_nanos(unix_ns as i128)?;
    Ok(t.format(&Rfc3339)?)
}

pub trait GlobalClock: Send + Sync {
    /// The current time, formatted for logs.
    fn now_str(&self) -> Result<String>;
    /// The current time in the local offset.
    fn now(&self) -> OffsetDateTime;
    /// Format the given time
    fn format_time(&self, time: OffsetDateTime) -> Result<String>;
}
impl FormatTime for dyn GlobalClock {
    #[inline(always)]
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        format_offset_time(self, w)
    }
}
/// Dummy wrapper for [Clock] to make logging framework happy.
pub struct ClockWrapper(pub Arc<dyn GlobalClock>);
impl FormatTime for ClockWrapper {
    #[inline(always)]
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        format_offset_time(self, w)
    }
}
impl GlobalClock for ClockWrapper {
    #[inline(always)]
    fn now_str(&self) -> Result<String> {
        self.0.now_str()
    }
    #[inline(always)]
    fn now(&self) -> OffsetDateTime {
        self.0.now()
    }
    #[inline(always)]
    fn format_time(&self, time: OffsetDateTime) -> Result<String> {
        self.0.format_time(time)
    }
}

fn format_offset_time(clock: &dyn GlobalClock, w: &mut Writer<'_>) -> std::fmt::Result {
    let s = match clock.now_str() {
        Ok(s) => s,
        Err(e) => {
            println!("time formatting error: {}", e);
            return Err(std::fmt::Error {});
        },
    };
    w.write_str(s.as_str())
}

/// A struct to serve timestamps as Local time.
/// To be used everywhere timestamps are logged externally.
struct LocalTime {
    format: Vec<FormatItem<'static>>,
    local_offset: UtcOffset,
}
impl LocalTime {
    pub fn new(tid: &TransactionId) -> Result<Self> {
        let format = format_description::parse("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond]")?;
        Ok(LocalTime {
            format,
            local_offset: load_local_offset(tid),
        })
    }
    pub fn boxed(tid: &TransactionId) -> Result<Arc<Self>> {
        Ok(Arc::new(Self::new(tid)?))
    }
}
impl GlobalClock for LocalTime {
    fn now_str(&self) -> Result<String> {
        GlobalClock::format_time(self, self.now())
    }
    fn now(&self) -> OffsetDateTime {
        #[allow(clippy::disallowed_methods)]
        OffsetDateTime::now_utc().to_offset(self.local_offset)
    }
    fn format_time(&self, time: OffsetDateTime) -> Result<String> {
        Ok(time.format(&self.format)?)
    }
}
impl FormatTime for LocalTime {
    #[inline(always)]
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        format_offset_time(self, w)
    }
}

/// The local offset can only be determined safely before extra threads exist.
/// Falls back to UTC otherwise.
fn load_local_offset(tid: &TransactionId) -> UtcOffset {
    match UtcOffset::current_local_offset() {
        Ok(o) => o,
        Err(e) => {
            warn!(tid=tid, error=%e, "Could not determine local UTC offset, logging in UTC");
            UtcOffset::UTC
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TEST_TID;

    #[test]
    fn unix_nanos_moves_forward() {
        let a = unix_nanos();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = unix_nanos();
        assert!(b > a);
    }

    #[test]
    fn iso_timestamp_of_epoch() {
        assert_eq!(iso_timestamp(0).unwrap(), "1970-01-01T00:00:00Z");
    }

    #[test]
    fn global_clock_formats() {
        let clk = get_global_clock(&TEST_TID).unwrap();
        assert!(!clk.now_str().unwrap().is_empty());
    }
}
