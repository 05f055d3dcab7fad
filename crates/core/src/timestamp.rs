use chrono::NaiveDateTime;
use regex::Regex;

/// One recognized timestamp shape: the scan pattern plus the chrono format
/// used to validate and normalize a candidate.
struct TimestampGrammar {
    pattern: Regex,
    format: &'static str,
}

/// Infers the timestamp associated with a match by scanning the content
/// before it. Grammars are tried strictly in declaration order; within a
/// grammar, candidates are tried from the closest to the match backward,
/// and the first grammar that yields a parseable candidate wins. Grammars
/// are never merged.
pub struct TimestampResolver {
    grammars: Vec<TimestampGrammar>,
}

const GRAMMARS: [(&str, &str); 10] = [
    (r"\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}", "%Y-%m-%d %H:%M:%S"),
    (r"\d{4}/\d{2}/\d{2} \d{2}:\d{2}:\d{2}", "%Y/%m/%d %H:%M:%S"),
    (r"\d{2}/\d{2}/\d{4} \d{2}:\d{2}:\d{2}", "%d/%m/%Y %H:%M:%S"),
    (r"\d{2}-\d{2}-\d{4} \d{2}:\d{2}:\d{2}", "%m-%d-%Y %H:%M:%S"),
    (r"\d{8}_\d{6}", "%Y%m%d_%H%M%S"),
    (r"\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}", "%Y-%m-%dT%H:%M:%S"),
    (r"\d{2}\.\d{2}\.\d{4} \d{2}:\d{2}:\d{2}", "%d.%m.%Y %H:%M:%S"),
    (r"\d{8} \d{2}:\d{2}:\d{2}", "%Y%m%d %H:%M:%S"),
    (r"\d{1,2}-[A-Za-z]{3}-\d{4} \d{2}:\d{2}:\d{2}", "%d-%b-%Y %H:%M:%S"),
    (r"(?:19|20)\d{10}", "%Y%m%d%H%M"),
];

impl Default for TimestampResolver {
    fn default() -> Self {
        let grammars = GRAMMARS
            .iter()
            .map(|(pattern, format)| TimestampGrammar {
                pattern: Regex::new(pattern).expect("fixed grammar pattern compiles"),
                format,
            })
            .collect();

        Self { grammars }
    }
}

impl TimestampResolver {
    /// Returns the timestamp most recently seen before `match_start`, or
    /// `None` when the prefix carries no parseable timestamp. `None` is a
    /// normal outcome, not an error.
    pub fn resolve(&self, content: &str, match_start: usize) -> Option<NaiveDateTime> {
        let prefix = &content[..match_start.min(content.len())];

        for grammar in &self.grammars {
            let candidates: Vec<_> = grammar.pattern.find_iter(prefix).collect();
            for candidate in candidates.iter().rev() {
                if let Ok(parsed) =
                    NaiveDateTime::parse_from_str(candidate.as_str(), grammar.format)
                {
                    return Some(parsed);
                }
            }
        }

        None
    }
}
