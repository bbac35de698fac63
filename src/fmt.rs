use rust_decimal::Decimal;

/// Format a decimal as a money amount with thousands separators: $1,234.56
pub fn money(val: Decimal) -> String {
    let negative = val.is_sign_negative() && !val.is_zero();
    let cents = format!("{:.2}", val.abs().round_dp(2));
    let (int_part, dec_part) = cents.split_once('.').unwrap_or((cents.as_str(), "00"));

    let mut with_commas = String::new();
    for (i, c) in int_part.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            with_commas.push(',');
        }
        with_commas.push(c);
    }
    let with_commas: String = with_commas.chars().rev().collect();

    if negative {
        format!("-${with_commas}.{dec_part}")
    } else {
        format!("${with_commas}.{dec_part}")
    }
}

pub fn percent(confidence: f64) -> String {
    format!("{:.0}%", confidence * 100.0)
}

pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn test_money_formatting() {
        assert_eq!(money(d("1234.56")), "$1,234.56");
        assert_eq!(money(d("-500")), "-$500.00");
        assert_eq!(money(Decimal::ZERO), "$0.00");
        assert_eq!(money(d("1000000.99")), "$1,000,000.99");
        assert_eq!(money(d("42.1")), "$42.10");
    }

    #[test]
    fn test_percent() {
        assert_eq!(percent(0.86), "86%");
        assert_eq!(percent(0.1), "10%");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
    }
}
