use time::OffsetDateTime;

/// Current UTC time as an RFC 3339 timestamp with second precision.
pub fn now_rfc3339() -> String {
    format_timestamp(OffsetDateTime::now_utc())
}

pub(crate) fn format_timestamp(at: OffsetDateTime) -> String {
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        at.year(),
        at.month() as u8,
        at.day(),
        at.hour(),
        at.minute(),
        at.second()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn formats_zero_padded_utc() {
        assert_eq!(
            format_timestamp(datetime!(2025-03-04 05:06:07 UTC)),
            "2025-03-04T05:06:07Z"
        );
    }
}
