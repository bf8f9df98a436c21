use std::io::Cursor;

use jiff::{Timestamp, civil::DateTime, tz::Offset};
use winstructs::security::Sid;

use crate::err::{DeserializationError, DeserializationResult};
use crate::utils::ByteCursor;

const WINDOWS_TO_UNIX_SECS: i64 = 11_644_473_600;
const FILETIME_TICKS_PER_SEC: u64 = 10_000_000;

#[inline]
pub(crate) fn filetime_to_timestamp(filetime: u64) -> Result<Timestamp, jiff::Error> {
    let secs = (filetime / FILETIME_TICKS_PER_SEC) as i64 - WINDOWS_TO_UNIX_SECS;
    let nanos = ((filetime % FILETIME_TICKS_PER_SEC) * 100) as i32;
    Timestamp::new(secs, nanos)
}

/// Renders a timestamp the way event viewers show `SystemTime`, with microsecond precision.
pub fn format_timestamp(ts: &Timestamp) -> String {
    let dt = Offset::UTC.to_datetime(*ts);
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:06}Z",
        dt.year(),
        dt.month(),
        dt.day(),
        dt.hour(),
        dt.minute(),
        dt.second(),
        dt.subsec_nanosecond() / 1_000
    )
}

pub(crate) fn read_systime(cursor: &mut ByteCursor<'_>) -> DeserializationResult<Timestamp> {
    let offset = cursor.position();
    let bytes = cursor.array::<16>("systime")?;
    systime_from_bytes(&bytes).ok_or(DeserializationError::InvalidDateTime {
        what: "systime",
        offset,
    })
}

fn systime_from_bytes(bytes: &[u8; 16]) -> Option<Timestamp> {
    let field = |i: usize| u16::from_le_bytes([bytes[i * 2], bytes[i * 2 + 1]]);
    let (year, month, day) = (field(0), field(1), field(3));
    let (hour, minute, second, millis) = (field(4), field(5), field(6), field(7));

    // An all-zero SYSTEMTIME means "unset".
    if bytes.iter().all(|&b| b == 0) {
        return filetime_to_timestamp(0).ok();
    }

    let dt = DateTime::new(
        i16::try_from(year).ok()?,
        i8::try_from(month).ok()?,
        i8::try_from(day).ok()?,
        i8::try_from(hour).ok()?,
        i8::try_from(minute).ok()?,
        i8::try_from(second).ok()?,
        i32::from(millis) * 1_000_000,
    )
    .ok()?;
    Offset::UTC.to_timestamp(dt).ok()
}

pub(crate) fn read_sid(cursor: &mut ByteCursor<'_>) -> DeserializationResult<Sid> {
    let start = cursor.pos();
    // revision, sub authority count, 6 byte authority, then 4 bytes per sub authority.
    let header = cursor.array::<8>("sid")?;
    let len = 8 + usize::from(header[1]) * 4;
    cursor.seek(start, "sid")?;
    let raw = cursor.take_bytes(len, "sid")?;

    Sid::from_reader(&mut Cursor::new(raw)).map_err(|_| DeserializationError::Truncated {
        what: "sid",
        offset: start as u64,
        need: len,
        have: raw.len(),
    })
}
