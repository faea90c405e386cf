use regex::Regex;
use std::sync::OnceLock;

fn patterns() -> &'static [(Regex, &'static str)] {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            // bold and italic markers, keeping the inner text
            (Regex::new(r"\*\*(.*?)\*\*").unwrap(), "$1"),
            (Regex::new(r"\*(.*?)\*").unwrap(), "$1"),
            // headers at line start
            (Regex::new(r"(?m)^#+\s").unwrap(), ""),
            // list bullets at line start
            (Regex::new(r"(?m)^[*-]\s").unwrap(), ""),
            // links, keeping the visible text
            (Regex::new(r"\[(.*?)\]\(.*?\)").unwrap(), "$1"),
            // collapse runs of blank lines to one paragraph break
            (Regex::new(r"\n{2,}").unwrap(), "\n\n"),
        ]
    })
}

/// Strip markdown decoration from generated itinerary text for plain-text
/// display and export. The session keeps the raw model output; this runs
/// at the presentation edge only.
pub fn strip_markdown(text: &str) -> String {
    let mut cleaned = text.replace("```", "");
    for (re, replacement) in patterns() {
        cleaned = re.replace_all(&cleaned, *replacement).into_owned();
    }
    cleaned
        .lines()
        .map(str::trim_start)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}
