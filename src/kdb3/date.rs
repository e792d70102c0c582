//! Packed 5 byte date/time values

use std::fmt;

use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, Timelike};

use crate::kdb3::binary;
use crate::kdb3::error::Result;

pub const PACKED_DATE_LEN: usize = 5;

/// A calendar date and time of day with one second resolution, as stored in
/// KDB records. Field order makes the derived `Ord` chronological.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PackedDate {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

/// Marks "does not expire".
pub const NEVER_EXPIRES: PackedDate = PackedDate {
    year: 2999,
    month: 12,
    day: 28,
    hour: 23,
    minute: 59,
    second: 59,
};

impl PackedDate {
    pub const fn new(year: u16, month: u8, day: u8, hour: u8, minute: u8, second: u8) -> Self {
        PackedDate { year, month, day, hour, minute, second }
    }

    /// The current local time.
    pub fn now() -> Self {
        Self::from_naive(&Local::now().naive_local())
    }

    pub fn from_naive(dt: &NaiveDateTime) -> Self {
        PackedDate {
            year: dt.year().clamp(0, 0xFFF) as u16,
            month: dt.month() as u8,
            day: dt.day() as u8,
            hour: dt.hour() as u8,
            minute: dt.minute() as u8,
            second: dt.second() as u8,
        }
    }

    /// `None` when the fields do not form a real calendar date.
    pub fn to_naive(&self) -> Option<NaiveDateTime> {
        NaiveDate::from_ymd_opt(self.year as i32, self.month as u32, self.day as u32)?
            .and_hms_opt(self.hour as u32, self.minute as u32, self.second as u32)
    }

    pub fn is_valid(&self) -> bool {
        self.to_naive().is_some()
    }

    pub fn is_never(&self) -> bool {
        *self == NEVER_EXPIRES
    }

    /// Decodes 5 packed bytes. The all-zero encoding means "no date".
    ///
    /// Layout: `00YYYYYY YYYYYYMM MMDDDDDH HHHHMMMM MMSSSSSS`
    pub fn decode(data: &[u8], offset: usize) -> Result<Option<PackedDate>> {
        let raw = binary::slice(data, offset, PACKED_DATE_LEN)?;
        let (b1, b2, b3, b4, b5) = (raw[0] as u16, raw[1] as u16, raw[2], raw[3], raw[4]);

        let year = ((b1 & 0x3F) << 6) | (b2 >> 2);
        let month = (((b2 & 0x03) as u8) << 2) | (b3 >> 6);
        let day = (b3 >> 1) & 0x1F;
        let hour = ((b3 & 0x01) << 4) | (b4 >> 4);
        let minute = ((b4 & 0x0F) << 2) | (b5 >> 6);
        let second = b5 & 0x3F;

        if year == 0 && month == 0 && day == 0 && hour == 0 && minute == 0 && second == 0 {
            return Ok(None);
        }
        Ok(Some(PackedDate::new(year, month, day, hour, minute, second)))
    }

    pub fn encode(&self) -> [u8; PACKED_DATE_LEN] {
        let (year, month, day) = (self.year, self.month, self.day);
        let (hour, minute, second) = (self.hour, self.minute, self.second);
        [
            ((year >> 6) & 0x3F) as u8,
            (((year & 0x3F) as u8) << 2) | ((month >> 2) & 0x03),
            ((month & 0x03) << 6) | ((day & 0x1F) << 1) | ((hour >> 4) & 0x01),
            ((hour & 0x0F) << 4) | ((minute >> 2) & 0x0F),
            ((minute & 0x03) << 6) | (second & 0x3F),
        ]
    }
}

impl fmt::Display for PackedDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

/// True when `expires` is set, is not [`NEVER_EXPIRES`] and lies in the past.
pub fn is_expired(expires: Option<PackedDate>) -> bool {
    match expires {
        Some(date) => !date.is_never() && date < PackedDate::now(),
        None => false,
    }
}
