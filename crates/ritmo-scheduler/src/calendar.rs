//! Business-day calendar.
//!
//! Pure date arithmetic: weekends plus a holiday table (fixed month/day and
//! Easter-relative), evaluated on the local calendar date of a timezone.
//! Every computed due date lands on the configured local send time
//! (default 09:00) of the resulting business day.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;

use ritmo_core::config::{parse_time_of_day, parse_timezone, CalendarConfig};
use ritmo_core::error::{Result, RitmoError};
use ritmo_core::types::SendWindow;

/// Longest run of calendar days searched for the next business day.
const MAX_SCAN_DAYS: u32 = 366;

/// Holidays observed by a region.
#[derive(Debug, Clone, Default)]
pub struct HolidayTable {
    fixed: Vec<(u32, u32, String)>,
    movable: Vec<(i32, String)>,
}

impl HolidayTable {
    /// No holidays, weekends only.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Portuguese national holidays.
    pub fn portugal() -> Self {
        Self::empty()
            .with_fixed(1, 1, "Ano Novo")
            .with_fixed(4, 25, "Dia da Liberdade")
            .with_fixed(5, 1, "Dia do Trabalhador")
            .with_fixed(6, 10, "Dia de Portugal")
            .with_fixed(8, 15, "Assunção de Nossa Senhora")
            .with_fixed(10, 5, "Implantação da República")
            .with_fixed(11, 1, "Dia de Todos os Santos")
            .with_fixed(12, 1, "Restauração da Independência")
            .with_fixed(12, 8, "Imaculada Conceição")
            .with_fixed(12, 25, "Natal")
            .with_movable(-2, "Sexta-feira Santa")
            .with_movable(0, "Páscoa")
            .with_movable(60, "Corpo de Deus")
    }

    /// Built-in table by region code.
    pub fn for_region(region: &str) -> Result<Self> {
        match region.to_ascii_uppercase().as_str() {
            "PT" => Ok(Self::portugal()),
            "NONE" | "" => Ok(Self::empty()),
            other => Err(RitmoError::Config(format!(
                "unknown holiday region '{other}' (expected PT or none)"
            ))),
        }
    }

    pub fn with_fixed(mut self, month: u32, day: u32, name: &str) -> Self {
        self.fixed.push((month, day, name.to_string()));
        self
    }

    pub fn with_movable(mut self, easter_offset: i32, name: &str) -> Self {
        self.movable.push((easter_offset, name.to_string()));
        self
    }

    /// Name of the holiday falling on `date`, if any.
    pub fn holiday_name(&self, date: NaiveDate) -> Option<&str> {
        if let Some((_, _, name)) = self
            .fixed
            .iter()
            .find(|(m, d, _)| *m == date.month() && *d == date.day())
        {
            return Some(name);
        }
        let easter = easter_sunday(date.year())?;
        self.movable
            .iter()
            .find(|(offset, _)| easter + Duration::days(i64::from(*offset)) == date)
            .map(|(_, name)| name.as_str())
    }

    pub fn is_holiday(&self, date: NaiveDate) -> bool {
        self.holiday_name(date).is_some()
    }
}

/// Western (Gregorian) Easter Sunday: anonymous Gregorian algorithm.
pub fn easter_sunday(year: i32) -> Option<NaiveDate> {
    let a = year % 19;
    let b = year / 100;
    let c = year % 100;
    let d = b / 4;
    let e = b % 4;
    let f = (b + 8) / 25;
    let g = (b - f + 1) / 3;
    let h = (19 * a + b - d - g + 15) % 30;
    let i = c / 4;
    let k = c % 4;
    let l = (32 + 2 * e + 2 * i - h - k) % 7;
    let m = (a + 11 * h + 22 * l) / 451;
    let month = (h + l - 7 * m + 114) / 31;
    let day = (h + l - 7 * m + 114) % 31 + 1;
    NaiveDate::from_ymd_opt(year, month as u32, day as u32)
}

/// Weekends + holidays, timezone-aware.
#[derive(Debug, Clone)]
pub struct BusinessCalendar {
    holidays: HolidayTable,
    send_time: NaiveTime,
    default_tz: Tz,
}

impl BusinessCalendar {
    pub fn new(holidays: HolidayTable, send_time: NaiveTime, default_tz: Tz) -> Self {
        Self {
            holidays,
            send_time,
            default_tz,
        }
    }

    /// Build from configuration. Any malformed entry is a startup error.
    pub fn from_config(config: &CalendarConfig) -> Result<Self> {
        let mut holidays = HolidayTable::for_region(&config.region)?;
        for h in &config.fixed_holidays {
            h.validate()?;
            holidays = holidays.with_fixed(h.month, h.day, &h.name);
        }
        for h in &config.movable_holidays {
            h.validate()?;
            holidays = holidays.with_movable(h.easter_offset, &h.name);
        }
        let calendar = Self::new(
            holidays,
            parse_time_of_day(&config.send_time)?,
            parse_timezone(&config.default_timezone)?,
        );
        calendar.check_has_business_days()?;
        Ok(calendar)
    }

    /// Reject a holiday table that leaves no working day in a year.
    fn check_has_business_days(&self) -> Result<()> {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap_or_default();
        self.next_business_date(start).map(|_| ())
    }

    /// First business date on or after `date`.
    fn next_business_date(&self, mut date: NaiveDate) -> Result<NaiveDate> {
        for _ in 0..MAX_SCAN_DAYS {
            if self.is_business_date(date) {
                return Ok(date);
            }
            date = date + Duration::days(1);
        }
        Err(RitmoError::Config(format!(
            "no business day within {MAX_SCAN_DAYS} days of {date}: holiday table covers every weekday"
        )))
    }

    pub fn default_timezone(&self) -> Tz {
        self.default_tz
    }

    pub fn send_time(&self) -> NaiveTime {
        self.send_time
    }

    /// Resolve a timezone name; blank means the configured default.
    pub fn resolve_timezone(&self, name: &str) -> Result<Tz> {
        if name.trim().is_empty() {
            return Ok(self.default_tz);
        }
        name.trim()
            .parse::<Tz>()
            .map_err(|_| RitmoError::Calendar(format!("invalid timezone '{name}'")))
    }

    /// Is this local calendar date a working day?
    pub fn is_business_date(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !self.holidays.is_holiday(date)
    }

    /// Is `instant` on a working day in `tz`'s local calendar?
    pub fn is_business_day(&self, instant: DateTime<Utc>, tz: Tz) -> bool {
        self.is_business_date(instant.with_timezone(&tz).date_naive())
    }

    /// Step forward from `from`'s local date one calendar day at a time until
    /// `n` business days have been counted; the result is the configured send
    /// time on that date, as an absolute instant.
    ///
    /// `n == 0` yields the first business day on or after `from`'s date, so
    /// the result is always a business day and never decreases as `n` grows.
    ///
    /// Fails with `RitmoError::Config` if the holiday table leaves no
    /// business day within a year of any step.
    pub fn add_business_days(&self, from: DateTime<Utc>, n: u32, tz: Tz) -> Result<DateTime<Utc>> {
        let start = from.with_timezone(&tz).date_naive();
        let date = if n == 0 {
            self.next_business_date(start)?
        } else {
            let mut date = start;
            for _ in 0..n {
                date = self.next_business_date(date + Duration::days(1))?;
            }
            date
        };
        Ok(self.local_instant(date, tz))
    }

    /// `date` at the send time in `tz`.
    pub fn local_instant(&self, date: NaiveDate, tz: Tz) -> DateTime<Utc> {
        local_to_utc(date.and_time(self.send_time), tz)
    }

    /// When `window` next opens after `now`, in `tz` local time: today's
    /// opening if it is still ahead, otherwise tomorrow's.
    pub fn next_window_opening(&self, window: &SendWindow, now: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
        let local = now.with_timezone(&tz);
        let mut date = local.date_naive();
        if local.time() >= window.start {
            date = date + Duration::days(1);
        }
        local_to_utc(date.and_time(window.start), tz)
    }
}

/// A local time swallowed by a DST gap moves forward in 30-minute steps to
/// the first valid local time; an ambiguous one takes the earlier instant.
fn local_to_utc(naive: chrono::NaiveDateTime, tz: Tz) -> DateTime<Utc> {
    let mut candidate = naive;
    for _ in 0..8 {
        if let Some(t) = tz.from_local_datetime(&candidate).earliest() {
            return t.with_timezone(&Utc);
        }
        candidate += Duration::minutes(30);
    }
    Utc.from_utc_datetime(&naive)
}

impl Default for BusinessCalendar {
    fn default() -> Self {
        Self::new(
            HolidayTable::portugal(),
            NaiveTime::from_hms_opt(9, 0, 0).unwrap_or(NaiveTime::MIN),
            chrono_tz::Europe::Lisbon,
        )
    }
}
