//! Request size validation
//!
//! Three independent limits, checked in order: body size, each header
//! entry, then the combined size of all header entries. The first
//! violation terminates validation.

use http::HeaderMap;

use crate::config::SizeLimitConfig;

/// A size-limit violation with the status code the adapter should render
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeViolation {
    /// Human-readable reason
    pub reason: String,

    /// 413 for body violations, 431 for header violations
    pub suggested_status: u16,
}

/// Validates request sizes against the configured limits
#[derive(Debug, Clone)]
pub struct SizeValidator {
    config: SizeLimitConfig,
}

impl SizeValidator {
    /// Create a validator from configuration
    pub fn new(config: SizeLimitConfig) -> Self {
        Self { config }
    }

    /// Validate a request; `Ok(())` when every limit holds
    pub fn validate(&self, headers: &HeaderMap, body_len: usize) -> Result<(), SizeViolation> {
        if body_len > self.config.max_body_bytes {
            return Err(SizeViolation {
                reason: format!(
                    "request body of {} bytes exceeds the limit of {} bytes",
                    body_len, self.config.max_body_bytes
                ),
                suggested_status: 413,
            });
        }

        let mut total = 0usize;
        for (name, value) in headers.iter() {
            // Sized as the wire form `name: value`
            let entry_len = name.as_str().len() + 2 + value.as_bytes().len();
            if entry_len > self.config.max_header_bytes {
                return Err(SizeViolation {
                    reason: format!(
                        "header '{}' of {} bytes exceeds the per-header limit of {} bytes",
                        name, entry_len, self.config.max_header_bytes
                    ),
                    suggested_status: 431,
                });
            }
            total += entry_len;
        }

        if total > self.config.max_total_headers_bytes {
            return Err(SizeViolation {
                reason: format!(
                    "headers total {} bytes, exceeding the limit of {} bytes",
                    total, self.config.max_total_headers_bytes
                ),
                suggested_status: 431,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{HeaderName, HeaderValue};

    fn validator(body: usize, header: usize, total: usize) -> SizeValidator {
        SizeValidator::new(SizeLimitConfig {
            max_body_bytes: body,
            max_header_bytes: header,
            max_total_headers_bytes: total,
        })
    }

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                name.parse::<HeaderName>().unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_within_limits() {
        let v = validator(1024, 128, 512);
        let h = headers(&[("x-request-id", "abc"), ("accept", "application/json")]);
        assert!(v.validate(&h, 100).is_ok());
    }

    #[test]
    fn test_body_too_large() {
        let v = validator(10, 128, 512);
        let violation = v.validate(&HeaderMap::new(), 11).unwrap_err();
        assert_eq!(violation.suggested_status, 413);
    }

    #[test]
    fn test_single_header_too_large() {
        let v = validator(1024, 16, 512);
        let h = headers(&[("x-large", "aaaaaaaaaaaaaaaaaaaaaaaaa")]);
        let violation = v.validate(&h, 0).unwrap_err();
        assert_eq!(violation.suggested_status, 431);
        assert!(violation.reason.contains("x-large"));
    }

    #[test]
    fn test_total_headers_too_large() {
        let v = validator(1024, 64, 40);
        let h = headers(&[("x-one", "aaaaaaaaaaaa"), ("x-two", "bbbbbbbbbbbb")]);
        let violation = v.validate(&h, 0).unwrap_err();
        assert_eq!(violation.suggested_status, 431);
        assert!(violation.reason.contains("total"));
    }

    #[test]
    fn test_body_checked_before_headers() {
        let v = validator(10, 4, 4);
        let h = headers(&[("x-large-header", "zzzzzzzzzz")]);
        let violation = v.validate(&h, 100).unwrap_err();
        assert_eq!(violation.suggested_status, 413);
    }

    #[test]
    fn test_entry_sizing_counts_separator() {
        // "a: b" is 4 bytes
        let v = validator(0, 4, 4);
        let h = headers(&[("a", "b")]);
        assert!(v.validate(&h, 0).is_ok());

        let v = validator(0, 3, 4);
        assert!(v.validate(&h, 0).is_err());
    }
}
