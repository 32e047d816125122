use std::ops::Neg;
use std::time::Duration;

pub fn parse_duration(s: &str) -> Result<Duration, String> {
    cyborgtime::parse_duration(s).map_err(|e| format!("Invalid duration: {e}"))
}

pub fn humanize_duration_core(
    duration: core::time::Duration,
) -> Result<String, time::error::ConversionRange> {
    Ok(humanize_duration(duration.try_into()?))
}

pub fn humanize_std_duration(duration: &Duration) -> String {
    if *duration < Duration::from_secs(1) {
        return format!("{} ms", duration.as_millis());
    }
    humanize_duration_core(*duration).unwrap_or_else(|_| "Time too long to display".to_string())
}

pub fn humanize_duration(mut duration: time::Duration) -> String {
    const SECONDS_IN_MINUTE: i64 = 60;
    const SECONDS_IN_HOUR: i64 = 3600;
    const SECONDS_IN_DAY: i64 = 86400;

    if duration.is_negative() {
        duration = duration.neg();
    }

    let mut remaining_seconds = duration.whole_seconds();

    let days = remaining_seconds / SECONDS_IN_DAY;
    remaining_seconds %= SECONDS_IN_DAY;
    let hours = remaining_seconds / SECONDS_IN_HOUR;
    remaining_seconds %= SECONDS_IN_HOUR;
    let minutes = remaining_seconds / SECONDS_IN_MINUTE;
    remaining_seconds %= SECONDS_IN_MINUTE;
    let seconds = remaining_seconds;

    let mut components = Vec::new();
    for (value, unit) in [(days, "day"), (hours, "hour"), (minutes, "minute")] {
        if value > 0 {
            components.push(format!("{value} {unit}{}", if value > 1 { "s" } else { "" }));
        }
    }
    if seconds > 0 || components.is_empty() {
        components.push(format!(
            "{} second{}",
            seconds,
            if seconds == 1 { "" } else { "s" }
        ));
    }

    components.join(", ")
}

/// Serde adapter writing durations the way an operator would type them into the config file
/// (`12h`, `30days`), using the same parser as the command line.
pub(crate) mod human_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(input: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let secs = input.as_secs();
        let text = if secs != 0 && secs % 86400 == 0 {
            format!("{}d", secs / 86400)
        } else if secs != 0 && secs % 3600 == 0 {
            format!("{}h", secs / 3600)
        } else if secs != 0 && secs % 60 == 0 {
            format!("{}m", secs / 60)
        } else {
            format!("{secs}s")
        };
        serializer.serialize_str(&text)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        super::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use crate::time::{humanize_duration, humanize_std_duration, parse_duration};
    use rstest::rstest;
    use std::time::Duration;

    #[rstest]
    #[case(Duration::from_millis(200), "200 ms")]
    #[case(Duration::ZERO, "0 ms")]
    #[case(Duration::from_millis(1500), "1 second")]
    #[case(Duration::from_secs(90), "1 minute, 30 seconds")]
    fn test_humanize_std_duration(#[case] input: Duration, #[case] expected: &str) {
        assert_eq!(humanize_std_duration(&input), expected);
    }

    #[rstest]
    #[case(time::Duration::ZERO, "0 seconds")]
    #[case(std::time::Duration::from_secs(60).try_into().unwrap(), "1 minute")]
    #[case(std::time::Duration::from_secs(61).try_into().unwrap(), "1 minute, 1 second")]
    #[case(std::time::Duration::from_secs(60 * 60).try_into().unwrap(), "1 hour")]
    #[case(std::time::Duration::from_secs(60 * 60 * 12).try_into().unwrap(), "12 hours")]
    #[case(std::time::Duration::from_secs(60 * 60 * 24 * 30).try_into().unwrap(), "30 days")]
    #[case(std::time::Duration::from_nanos(1).try_into().unwrap(), "0 seconds")]
    #[case(time::Duration::seconds(-90), "1 minute, 30 seconds")]
    fn test_humanize_duration(#[case] test_value: time::Duration, #[case] expected: &str) {
        let humanized = humanize_duration(test_value);
        assert_eq!(humanized, expected);
    }

    #[rstest]
    #[case("12h", Duration::from_secs(12 * 3600))]
    #[case("30days", Duration::from_secs(30 * 86400))]
    #[case("10s", Duration::from_secs(10))]
    fn test_parse_duration(#[case] input: &str, #[case] expected: Duration) {
        assert_eq!(parse_duration(input).unwrap(), expected);
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert!(parse_duration("soon").is_err());
    }
}
