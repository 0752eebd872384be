const SUFFIXES: [&str; 7] = [" B", " kB", " MB", " GB", " TB", " PB", " EB"];

/// Formats a byte count with binary (1024) units.
pub fn bytes(v: f64) -> String {
    if v.is_nan() {
        return "NaN".to_string();
    }
    if v < 10.0 {
        return format!("{v:2.0}B");
    }

    let mut exp = 0;
    let mut scaled = v;
    while scaled >= 1024.0 && exp < SUFFIXES.len() - 1 {
        scaled /= 1024.0;
        exp += 1;
    }
    let val = (scaled * 10.0 + 0.5).floor() / 10.0;

    if val < 10.0 {
        format!("{val:.1}{}", SUFFIXES[exp])
    } else {
        format!("{val:.0}{}", SUFFIXES[exp])
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_bytes() {
        assert_eq!(" 5B", bytes(5.0));
        assert_eq!("500 B", bytes(500.0));
        assert_eq!("2.0 kB", bytes(2048.0));
        assert_eq!("1.5 kB", bytes(1536.0));
        assert_eq!("1.0 MB", bytes(1048576.0));
        assert_eq!("30 MB", bytes(30.0 * 1048576.0));
    }
}
