use chrono::{DateTime, Local};

/// Wall-clock format shared by session keys and per-reading timestamps.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

pub fn format_timestamp(at: DateTime<Local>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Issues session keys from the start time of each run.
///
/// Keys carry millisecond resolution. Two runs that still land on the same
/// millisecond (or a clock that stepped backwards) get a `-NNN` suffix on the
/// previous key, so keys from one generator are unique and sort in issue order.
#[derive(Debug, Default)]
pub struct SessionKeyGenerator {
    last_base: Option<String>,
    suffix: u32,
}

impl SessionKeyGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_key(&mut self) -> String {
        self.next_key_at(Local::now())
    }

    pub fn next_key_at(&mut self, at: DateTime<Local>) -> String {
        let base = format_timestamp(at);

        match &self.last_base {
            Some(previous) if base.as_str() <= previous.as_str() => {
                self.suffix += 1;
                format!("{previous}-{:03}", self.suffix)
            }
            _ => {
                self.last_base = Some(base.clone());
                self.suffix = 0;
                base
            }
        }
    }
}

/// Keys end up in file names; anything that could escape the export
/// directory is refused.
pub fn is_safe_session_key(key: &str) -> bool {
    !key.is_empty()
        && !key.contains(['/', '\\', '\0'])
        && key != "."
        && key != ".."
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn keys_have_millisecond_resolution() {
        let mut generator = SessionKeyGenerator::new();
        let at = Local.with_ymd_and_hms(2024, 7, 2, 12, 0, 0).unwrap();
        assert_eq!(generator.next_key_at(at), "2024-07-02 12:00:00.000");
    }

    #[test]
    fn same_instant_gets_disambiguated() {
        let mut generator = SessionKeyGenerator::new();
        let at = Local.with_ymd_and_hms(2024, 7, 2, 12, 0, 0).unwrap();

        let first = generator.next_key_at(at);
        let second = generator.next_key_at(at);
        let third = generator.next_key_at(at);

        assert_ne!(first, second);
        assert_ne!(second, third);
        assert!(first < second && second < third);
    }

    #[test]
    fn clock_stepping_back_stays_monotonic() {
        let mut generator = SessionKeyGenerator::new();
        let later = Local.with_ymd_and_hms(2024, 7, 2, 12, 0, 5).unwrap();
        let earlier = Local.with_ymd_and_hms(2024, 7, 2, 12, 0, 1).unwrap();

        let first = generator.next_key_at(later);
        let second = generator.next_key_at(earlier);
        assert!(second > first);

        let fresh = generator.next_key_at(Local.with_ymd_and_hms(2024, 7, 2, 12, 0, 9).unwrap());
        assert_eq!(fresh, "2024-07-02 12:00:09.000");
    }

    #[test]
    fn rejects_path_like_keys() {
        assert!(is_safe_session_key("2024-07-02 12:00:00"));
        assert!(!is_safe_session_key("../etc"));
        assert!(!is_safe_session_key("a/b"));
        assert!(!is_safe_session_key(""));
    }
}
