//! Canonical subject, stream and consumer naming.
//!
//! | what               | subject                          |
//! |--------------------|----------------------------------|
//! | method             | `<service>.<action>`             |
//! | HTTP settings RPC  | `<service>.get_http_settings`    |
//! | plain event        | `<service>.<event>`              |
//! | stream event       | `<service>.<prefix>.<event>`     |

/// Action name of the HTTP settings responder.
pub const HTTP_SETTINGS_ACTION: &str = "get_http_settings";

/// Subject token separator.
pub const DELIMITER: char = '.';

const STAR_WILDCARD: &str = "*";
const GREATER_WILDCARD: &str = ">";

#[must_use]
pub fn method_subject(service: &str, action: &str) -> String {
    format!("{service}.{action}")
}

#[must_use]
pub fn http_settings_subject(service: &str) -> String {
    method_subject(service, HTTP_SETTINGS_ACTION)
}

/// Subject of an event; stream events are namespaced by their prefix.
#[must_use]
pub fn event_subject(service: &str, prefix: Option<&str>, event: &str) -> String {
    match prefix {
        Some(prefix) => format!("{service}.{prefix}.{event}"),
        None => format!("{service}.{event}"),
    }
}

/// Upper-cases the first character.
#[must_use]
pub fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Deterministic stream name: service, each prefix segment and the action,
/// capitalised and concatenated. Wildcard actions contribute nothing.
#[must_use]
pub fn stream_name(service: &str, prefix: &str, action: &str) -> String {
    let mut name = capitalize(service);
    for segment in prefix.split(DELIMITER) {
        name.push_str(&capitalize(segment));
    }
    if !is_wildcard(action) {
        name.push_str(&capitalize(action));
    }
    name
}

/// Durable consumer name for a (caller, event) pair.
#[must_use]
pub fn consumer_name(caller: &str, event: &str) -> String {
    format!("{}{}", capitalize(caller), capitalize(event))
}

#[must_use]
pub fn is_wildcard(token: &str) -> bool {
    token == STAR_WILDCARD || token == GREATER_WILDCARD
}

/// HTTP path for a method subject: `Math.Fibonacci` becomes `/Math/Fibonacci`.
#[must_use]
pub fn http_path(subject: &str) -> String {
    let mut path = String::with_capacity(subject.len() + 1);
    path.push('/');
    path.extend(subject.chars().map(|c| if c == DELIMITER { '/' } else { c }));
    path
}

/// Inverse of [`http_path`].
#[must_use]
pub fn subject_from_path(path: &str) -> String {
    path.trim_start_matches('/').replace('/', ".")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn method_and_settings_subjects() {
        assert_eq!(method_subject("Math", "Sum"), "Math.Sum");
        assert_eq!(http_settings_subject("Math"), "Math.get_http_settings");
    }

    #[rstest]
    #[case(None, "Math.Elapsed")]
    #[case(Some("events.v1"), "Math.events.v1.Elapsed")]
    fn event_subjects(#[case] prefix: Option<&str>, #[case] expected: &str) {
        assert_eq!(event_subject("Math", prefix, "Elapsed"), expected);
    }

    #[rstest]
    #[case("elapsed", "MathEventsV1Elapsed")]
    #[case("*", "MathEventsV1")]
    #[case(">", "MathEventsV1")]
    fn stream_names(#[case] action: &str, #[case] expected: &str) {
        assert_eq!(stream_name("math", "events.v1", action), expected);
    }

    #[test]
    fn consumer_names_concatenate() {
        assert_eq!(consumer_name("billing", "elapsed"), "BillingElapsed");
    }

    #[test]
    fn capitalize_edge_cases() {
        assert_eq!(capitalize(""), "");
        assert_eq!(capitalize("a"), "A");
        assert_eq!(capitalize("Already"), "Already");
    }

    #[test]
    fn path_round_trip() {
        assert_eq!(http_path("Math.Fibonacci"), "/Math/Fibonacci");
        assert_eq!(subject_from_path("/Math/Fibonacci"), "Math.Fibonacci");
    }
}
