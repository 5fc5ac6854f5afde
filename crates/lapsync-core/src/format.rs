//! Time display helpers for lap boards

/// `HH:MM:SS`, fractions truncated
pub fn format_hms(ms: u64) -> String {
    let hours = ms / 3_600_000;
    let minutes = (ms % 3_600_000) / 60_000;
    let seconds = (ms % 60_000) / 1000;
    format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
}

/// `HH:MM:SS.cc` with centiseconds, as shown on the running stopwatch
pub fn format_hms_centis(ms: u64) -> String {
    let centis = (ms % 1000) / 10;
    format!("{}.{:02}", format_hms(ms), centis)
}
