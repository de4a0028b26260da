use std::time::{SystemTime, UNIX_EPOCH};

use time::OffsetDateTime;

use crate::{Error, Result};

/// Reads the wall clock, failing with `Clock` if it cannot be expressed
/// as a duration since the UNIX epoch.
pub fn now() -> Result<SystemTime> {
    let now = SystemTime::now();
    if now.duration_since(UNIX_EPOCH).is_err() {
        return Err(Error::Clock);
    }
    Ok(now)
}

/// Formats an instant as `YYYY-MM-DD HH:MM:SS` (UTC).
pub fn time_string(at: SystemTime) -> Result<String> {
    if at.duration_since(UNIX_EPOCH).is_err() {
        return Err(Error::Clock);
    }
    let dt = OffsetDateTime::from(at);
    Ok(format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        dt.year(),
        dt.month() as u8,
        dt.day(),
        dt.hour(),
        dt.minute(),
        dt.second()
    ))
}

pub fn now_string() -> Result<String> {
    time_string(now()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn formats_epoch() {
        let at = UNIX_EPOCH + Duration::from_secs(988_989_001);
        assert_eq!(time_string(at).expect("format"), "2001-05-04 15:10:01");
    }

    #[test]
    fn now_is_formattable() {
        let s = now_string().expect("now");
        assert_eq!(s.len(), 19);
        assert_eq!(&s[4..5], "-");
        assert_eq!(&s[10..11], " ");
    }
}
