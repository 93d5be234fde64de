pub fn build_host() -> &'static str {
    option_env!("CONTROLFREAK_BUILD_HOST").unwrap_or("unknown")
}

pub fn build_time_raw() -> &'static str {
    option_env!("CONTROLFREAK_BUILD_TIME").unwrap_or("unknown")
}

/// `build.rs` stamps seconds since the epoch as `epoch:<secs>`; render that
/// as a UTC timestamp, pass anything else through.
pub fn format_build_time_pretty(raw: &str) -> String {
    let raw = raw.trim();
    if let Some(secs) = raw
        .strip_prefix("epoch:")
        .and_then(|e| e.trim().parse::<i64>().ok())
    {
        if let Some(dt) = chrono::DateTime::<chrono::Utc>::from_timestamp(secs, 0) {
            return dt.format("%Y-%m-%d %H:%M:%S").to_string();
        }
    }
    raw.to_string()
}

pub fn banner() -> String {
    format!(
        "controlfreak {} (built on {} at {})",
        env!("CARGO_PKG_VERSION"),
        build_host(),
        format_build_time_pretty(build_time_raw())
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_formats_as_utc() {
        assert_eq!(format_build_time_pretty("epoch:0"), "1970-01-01 00:00:00");
        assert_eq!(
            format_build_time_pretty("epoch:86400"),
            "1970-01-02 00:00:00"
        );
    }

    #[test]
    fn non_epoch_passes_through() {
        assert_eq!(format_build_time_pretty("unknown"), "unknown");
        assert_eq!(format_build_time_pretty("epoch:not-a-number"), "epoch:not-a-number");
    }

    #[test]
    fn banner_names_the_crate() {
        assert!(banner().starts_with("controlfreak "));
    }
}
