//! Human-readable byte quantities for labels and summaries.

const PREFIXES: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB", "PiB"];

/// Format a byte quantity with a binary SI prefix, e.g. `1.5 MiB`.
/// Negative values (diff graphs) keep their sign.
pub fn bytes_string(bytes: f64) -> String {
    let sign = if bytes < 0.0 { "-" } else { "" };
    let mut value = bytes.abs();
    let mut prefix = 0;
    while value >= 1024.0 && prefix + 1 < PREFIXES.len() {
        value /= 1024.0;
        prefix += 1;
    }
    if prefix == 0 {
        format!("{}{} {}", sign, value.round(), PREFIXES[prefix])
    } else {
        format!("{}{:.1} {}", sign, value, PREFIXES[prefix])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_bytes_string() {
        assert_eq!(bytes_string(0.0), "0 B");
        assert_eq!(bytes_string(512.0), "512 B");
        assert_eq!(bytes_string(2048.0), "2.0 KiB");
        assert_eq!(bytes_string(1_572_864.0), "1.5 MiB");
        assert_eq!(bytes_string(-2048.0), "-2.0 KiB");
    }
}
