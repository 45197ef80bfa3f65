//! HL7 字段值转换工具
//!
//! 时间戳规范化、参考范围解析、数值解析，以及报文的快速校验。

use medbridge_core::utils::iso_now;
use serde::{Deserialize, Serialize};

/// 解析出的参考范围
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParsedRange {
    pub low: Option<f64>,
    pub high: Option<f64>,
}

/// 严格数值解析：去掉首尾空白后必须整体是有限数
pub fn parse_number(value: &str) -> Option<f64> {
    let parsed = value.trim().parse::<f64>().ok()?;
    parsed.is_finite().then_some(parsed)
}

/// HL7 时间戳 → ISO-8601 (UTC)
///
/// 支持 YYYYMMDD、YYYYMMDDHHMM、YYYYMMDDHHMMSS、YYYYMMDDHHMMSS.SSSS 等格式。
/// 只做定宽切片，不做日历校验：月份 "13" 会原样输出。
/// 空输入返回当前时间。
pub fn parse_hl7_datetime(value: &str) -> String {
    if value.is_empty() {
        return iso_now();
    }

    let digits: String = value.chars().filter(|c| c.is_ascii_digit()).collect();
    let part = |start: usize, end: usize, default: &'static str| -> String {
        let slice = slice_digits(&digits, start, end);
        if slice.is_empty() {
            default.to_string()
        } else {
            slice.to_string()
        }
    };

    format!(
        "{}-{}-{}T{}:{}:{}.{}Z",
        slice_digits(&digits, 0, 4),
        part(4, 6, "01"),
        part(6, 8, "01"),
        part(8, 10, "00"),
        part(10, 12, "00"),
        part(12, 14, "00"),
        part(14, 17, "000"),
    )
}

fn slice_digits(digits: &str, start: usize, end: usize) -> &str {
    if start >= digits.len() {
        ""
    } else {
        &digits[start..end.min(digits.len())]
    }
}

/// 解析 OBX-7 参考范围
///
/// 支持 "min-max"、"< max"、"<=max"、"> min"、">=min"。
/// 无法识别时返回 None，调用方直接省略 referenceRange。
pub fn parse_reference_range(value: &str) -> Option<ParsedRange> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }

    if trimmed.contains('-') {
        let parts: Vec<&str> = trimmed.split('-').collect();
        if let [low, high] = parts.as_slice() {
            if let (Some(low), Some(high)) = (parse_number(low), parse_number(high)) {
                return Some(ParsedRange {
                    low: Some(low),
                    high: Some(high),
                });
            }
        }
    }

    if trimmed.starts_with('<') {
        if let Some(high) = parse_number(&strip_comparators(trimmed)) {
            return Some(ParsedRange {
                low: None,
                high: Some(high),
            });
        }
    }

    if trimmed.starts_with('>') {
        if let Some(low) = parse_number(&strip_comparators(trimmed)) {
            return Some(ParsedRange {
                low: Some(low),
                high: None,
            });
        }
    }

    None
}

fn strip_comparators(value: &str) -> String {
    value
        .chars()
        .filter(|c| !matches!(c, '<' | '>' | '=') && !c.is_whitespace())
        .collect()
}

/// 快速校验：以 MSH 开头、包含字段分隔符、至少三个非空段
pub fn is_valid_hl7(message: &str) -> bool {
    if !message.starts_with("MSH") || !message.contains('|') {
        return false;
    }
    message
        .split(['\r', '\n'])
        .filter(|line| !line.trim().is_empty())
        .count()
        >= 3
}

/// 读取 MSH-9（消息类型），报文无效时返回 None
pub fn extract_message_type(message: &str) -> Option<String> {
    if !is_valid_hl7(message) {
        return None;
    }
    message
        .split(['\r', '\n'])
        .next()?
        .split('|')
        .nth(8)
        .map(|field| field.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datetime_full_precision() {
        assert_eq!(parse_hl7_datetime("20240115103045"), "2024-01-15T10:30:45.000Z");
        assert_eq!(parse_hl7_datetime("20240115103045.1234"), "2024-01-15T10:30:45.123Z");
    }

    #[test]
    fn test_datetime_defaults() {
        assert_eq!(parse_hl7_datetime("20240115"), "2024-01-15T00:00:00.000Z");
        assert_eq!(parse_hl7_datetime("202401151030"), "2024-01-15T10:30:00.000Z");
        assert_eq!(parse_hl7_datetime("2024"), "2024-01-01T00:00:00.000Z");
    }

    #[test]
    fn test_datetime_no_calendar_check() {
        assert_eq!(parse_hl7_datetime("20241345"), "2024-13-45T00:00:00.000Z");
    }

    #[test]
    fn test_datetime_strips_separators_and_zone() {
        assert_eq!(parse_hl7_datetime("2024-01-15 10:30"), "2024-01-15T10:30:00.000Z");
    }

    #[test]
    fn test_datetime_preserves_canonical_digits() {
        for input in ["19991231235959", "20250126080000", "20000229120130"] {
            let iso = parse_hl7_datetime(input);
            let digits: String = iso.chars().filter(|c| c.is_ascii_digit()).collect();
            assert_eq!(&digits[..14], input);
        }
    }

    #[test]
    fn test_reference_range_formats() {
        assert_eq!(
            parse_reference_range("70-100"),
            Some(ParsedRange { low: Some(70.0), high: Some(100.0) })
        );
        assert_eq!(
            parse_reference_range("< 100"),
            Some(ParsedRange { low: None, high: Some(100.0) })
        );
        assert_eq!(
            parse_reference_range("<=5.5"),
            Some(ParsedRange { low: None, high: Some(5.5) })
        );
        assert_eq!(
            parse_reference_range("> 70"),
            Some(ParsedRange { low: Some(70.0), high: None })
        );
        assert_eq!(
            parse_reference_range(" 3.5 - 5.1 "),
            Some(ParsedRange { low: Some(3.5), high: Some(5.1) })
        );
    }

    #[test]
    fn test_reference_range_unparseable() {
        assert_eq!(parse_reference_range("abc"), None);
        assert_eq!(parse_reference_range(""), None);
        assert_eq!(parse_reference_range("1-2-3"), None);
        assert_eq!(parse_reference_range("< high"), None);
    }

    #[test]
    fn test_reference_range_keeps_zero_bound() {
        assert_eq!(
            parse_reference_range("0-10"),
            Some(ParsedRange { low: Some(0.0), high: Some(10.0) })
        );
    }

    #[test]
    fn test_parse_number_rejects_non_finite() {
        assert_eq!(parse_number(" 95 "), Some(95.0));
        assert_eq!(parse_number("-1.5"), Some(-1.5));
        assert_eq!(parse_number("NaN"), None);
        assert_eq!(parse_number("inf"), None);
        assert_eq!(parse_number("POS"), None);
    }

    #[test]
    fn test_message_helpers() {
        let message = "MSH|^~\\&|LAB|ExtLab|||20250126||ORU^R01|MSG001|P|2.5\nPID|1||P001\nOBX|1|NM|GLU||95";
        assert!(is_valid_hl7(message));
        assert_eq!(extract_message_type(message).as_deref(), Some("ORU^R01"));

        assert!(!is_valid_hl7("PID|1||P001"));
        assert!(!is_valid_hl7("MSH|^~\\&|LAB"));
        assert_eq!(extract_message_type("MSH only"), None);
    }
}
