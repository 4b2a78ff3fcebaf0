/// Matches a subject against a pattern with `*` (one token) and `>` (one or more trailing tokens).
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern = pattern.split('.');
    let mut subject = subject.split('.');
    loop {
        match (pattern.next(), subject.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("Math.Sum", "Math.Sum", true)]
    #[case("Math.Sum", "Math.Sub", false)]
    #[case("Math.*", "Math.Sum", true)]
    #[case("Math.*", "Math.events.Sum", false)]
    #[case("Math.>", "Math.events.Sum", true)]
    #[case("Math.>", "Math", false)]
    #[case("Math.events.*", "Math.events.elapsed", true)]
    #[case("Math", "Math.Sum", false)]
    fn matching(#[case] pattern: &str, #[case] subject: &str, #[case] expected: bool) {
        assert_eq!(subject_matches(pattern, subject), expected);
    }
}
