//! Single-range `Range: bytes=...` handling for blob downloads.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeRequest {
    /// No usable range; serve the whole body
    Full,
    /// Inclusive byte positions
    Partial { start: u64, end: u64 },
    Unsatisfiable,
}

impl RangeRequest {
    /// Interprets a `Range` header value against a body of `total` bytes.
    /// Malformed or multi-range headers are ignored rather than rejected.
    pub fn parse(header: Option<&str>, total: u64) -> Self {
        let Some(spec) = header.and_then(|h| h.trim().strip_prefix("bytes=")) else {
            return RangeRequest::Full;
        };
        if spec.contains(',') {
            return RangeRequest::Full;
        }
        let Some((first, last)) = spec.split_once('-') else {
            return RangeRequest::Full;
        };
        let (first, last) = (first.trim(), last.trim());

        if first.is_empty() {
            // Suffix range: the last N bytes
            let Ok(suffix) = last.parse::<u64>() else {
                return RangeRequest::Full;
            };
            if suffix == 0 || total == 0 {
                return RangeRequest::Unsatisfiable;
            }
            return RangeRequest::Partial {
                start: total.saturating_sub(suffix),
                end: total - 1,
            };
        }

        let Ok(start) = first.parse::<u64>() else {
            return RangeRequest::Full;
        };
        let end = if last.is_empty() {
            None
        } else {
            match last.parse::<u64>() {
                Ok(end) if end >= start => Some(end),
                _ => return RangeRequest::Full,
            }
        };
        if start >= total {
            return RangeRequest::Unsatisfiable;
        }
        let end = end.map_or(total - 1, |e| e.min(total - 1));
        RangeRequest::Partial { start, end }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ranges() {
        assert_eq!(
            RangeRequest::parse(Some("bytes=500-999"), 2000),
            RangeRequest::Partial { start: 500, end: 999 }
        );
        assert_eq!(
            RangeRequest::parse(Some("bytes=1500-"), 2000),
            RangeRequest::Partial { start: 1500, end: 1999 }
        );
        assert_eq!(
            RangeRequest::parse(Some("bytes=-100"), 2000),
            RangeRequest::Partial { start: 1900, end: 1999 }
        );
        assert_eq!(
            RangeRequest::parse(Some("bytes=1000-5000"), 2000),
            RangeRequest::Partial { start: 1000, end: 1999 }
        );
        assert_eq!(RangeRequest::parse(Some("bytes=2000-"), 2000), RangeRequest::Unsatisfiable);
        assert_eq!(RangeRequest::parse(Some("bytes=-0"), 2000), RangeRequest::Unsatisfiable);
    }

    #[test]
    fn test_ignored_headers() {
        assert_eq!(RangeRequest::parse(None, 10), RangeRequest::Full);
        assert_eq!(RangeRequest::parse(Some("items=0-1"), 10), RangeRequest::Full);
        assert_eq!(RangeRequest::parse(Some("bytes=0-1,4-5"), 10), RangeRequest::Full);
        assert_eq!(RangeRequest::parse(Some("bytes=5-2"), 10), RangeRequest::Full);
        assert_eq!(RangeRequest::parse(Some("bytes=x-"), 10), RangeRequest::Full);
    }
}
