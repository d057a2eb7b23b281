//! Wall-clock access and the bus-visible time-of-day structure.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;

pub const RTC_TIME_SIZE: usize = 7;

const SECONDS_PER_DAY: u32 = 86_400;

/// Source of Unix time in seconds.
pub trait Clock {
    fn epoch_seconds(&self) -> u32;

    /// Whether the clock has been set from a trusted source.
    fn is_synchronized(&self) -> bool {
        true
    }
}

/// Host system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn epoch_seconds(&self) -> u32 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
            .unwrap_or(0)
    }
}

/// Settable clock for tests and simulation. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    seconds: Arc<AtomicU32>,
    synchronized: Arc<AtomicBool>,
}

impl ManualClock {
    pub fn new(seconds: u32) -> Self {
        Self {
            seconds: Arc::new(AtomicU32::new(seconds)),
            synchronized: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn set(&self, seconds: u32) {
        self.seconds.store(seconds, Ordering::Relaxed);
    }

    pub fn advance(&self, seconds: u32) {
        self.seconds.fetch_add(seconds, Ordering::Relaxed);
    }

    pub fn set_synchronized(&self, synchronized: bool) {
        self.synchronized.store(synchronized, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn epoch_seconds(&self) -> u32 {
        self.seconds.load(Ordering::Relaxed)
    }

    fn is_synchronized(&self) -> bool {
        self.synchronized.load(Ordering::Relaxed)
    }
}

/// Calendar time in the layout the bus master reads: one byte per field,
/// day of week 0 = Sunday, month 1-12, year counted from 2000.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcTime {
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u8,
    pub day_of_week: u8,
    pub day: u8,
    pub month: u8,
    pub year: u8,
}

const_assert_eq!(core::mem::size_of::<RtcTime>(), RTC_TIME_SIZE);

impl RtcTime {
    pub fn from_epoch(epoch_seconds: u32) -> Self {
        let days = epoch_seconds / SECONDS_PER_DAY;
        let secs_of_day = epoch_seconds % SECONDS_PER_DAY;
        let (year, month, day) = civil_from_days(days);

        Self {
            seconds: (secs_of_day % 60) as u8,
            minutes: (secs_of_day / 60 % 60) as u8,
            hours: (secs_of_day / 3600) as u8,
            // 1970-01-01 was a Thursday
            day_of_week: ((days + 4) % 7) as u8,
            day,
            month,
            year: year.saturating_sub(2000).min(u32::from(u8::MAX)) as u8,
        }
    }

    pub fn to_bytes(&self) -> [u8; RTC_TIME_SIZE] {
        [
            self.seconds,
            self.minutes,
            self.hours,
            self.day_of_week,
            self.day,
            self.month,
            self.year,
        ]
    }

    /// Reads the first seven bytes of `bytes`; `None` if it is shorter.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let b: &[u8; RTC_TIME_SIZE] = bytes.get(..RTC_TIME_SIZE)?.try_into().ok()?;
        Some(Self {
            seconds: b[0],
            minutes: b[1],
            hours: b[2],
            day_of_week: b[3],
            day: b[4],
            month: b[5],
            year: b[6],
        })
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

/// Days since 1970-01-01 to (year, month, day), proleptic Gregorian.
fn civil_from_days(days: u32) -> (u32, u8, u8) {
    let z = days + 719_468;
    let era = z / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u8;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u8;
    let year = yoe + era * 400 + u32::from(month <= 2);
    (year, month, day)
}

/// Shared holder for the time-of-day answer given to the bus master.
///
/// Written by the main loop, read from the bus request callback.
#[derive(Debug, Clone, Default)]
pub struct TimeOfDay {
    inner: Arc<Mutex<RtcTime>>,
}

impl TimeOfDay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> RtcTime {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self, time: RtcTime) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = time;
    }

    pub fn clear(&self) {
        self.set(RtcTime::default());
    }
}
