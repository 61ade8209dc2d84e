//! Structural-token checks between a source text and its translation

use regex::Regex;
use std::sync::OnceLock;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"__VAR_\d+__|\{[A-Za-z_][A-Za-z0-9_]*\}|%[sdi]").expect("valid placeholder regex")
    })
}

fn number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[0-9]+").expect("valid number regex"))
}

fn url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"https?://[^\s<>"')\]]+"#).expect("valid url regex"))
}

fn push_unique(tokens: &mut Vec<String>, token: &str) {
    if !tokens.iter().any(|t| t == token) {
        tokens.push(token.to_string());
    }
}

/// Placeholders, bare numbers and URLs that must survive translation.
///
/// A digit run directly followed by a letter ("20k", "1st") is not bare.
pub fn structural_tokens(source: &str) -> Vec<String> {
    let mut tokens = Vec::new();

    for m in placeholder_re().find_iter(source) {
        push_unique(&mut tokens, m.as_str());
    }
    for m in number_re().find_iter(source) {
        let followed_by_letter = source[m.end()..]
            .chars()
            .next()
            .is_some_and(char::is_alphabetic);
        if !followed_by_letter {
            push_unique(&mut tokens, m.as_str());
        }
    }
    for m in url_re().find_iter(source) {
        let url = m.as_str().trim_end_matches(|c| matches!(c, '.' | ',' | ';' | ':' | '!' | '?'));
        push_unique(&mut tokens, url);
    }
    tokens
}

/// Tokens of `source` absent from `translation`
pub fn missing_tokens(source: &str, translation: &str) -> Vec<String> {
    structural_tokens(source)
        .into_iter()
        .filter(|token| !translation.contains(token.as_str()))
        .collect()
}

/// Whether `translation` is an acceptable rendering of `source`
pub fn validate(source: &str, translation: &str) -> bool {
    if translation.trim().is_empty() && !source.trim().is_empty() {
        return false;
    }
    missing_tokens(source, translation).is_empty()
}

/// Best-effort fix: append every missing token to the end.
/// An empty translation falls back to the source text.
pub fn repair(source: &str, translation: &str) -> String {
    if translation.trim().is_empty() {
        return source.to_string();
    }
    let missing = missing_tokens(source, translation);
    if missing.is_empty() {
        return translation.to_string();
    }
    format!("{} {}", translation.trim_end(), missing.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = "Hello {name}, you have 3 new messages";

    #[test]
    fn test_missing_placeholder_fails() {
        assert!(!validate(SOURCE, "Bonjour, vous avez 3 nouveaux messages"));
        assert!(validate(SOURCE, "Bonjour {name}, vous avez 3 nouveaux messages"));
    }

    #[test]
    fn test_missing_number_fails() {
        assert!(!validate(SOURCE, "Bonjour {name}, vous avez trois nouveaux messages"));
    }

    #[test]
    fn test_number_followed_by_letter_is_not_bare() {
        assert_eq!(structural_tokens("20k users on the 1st day"), Vec::<String>::new());
        assert_eq!(structural_tokens("Version 2.5 ships"), vec!["2", "5"]);
        assert!(validate("Top 20k", "Top vingt mille"));
    }

    #[test]
    fn test_placeholder_kinds() {
        let tokens = structural_tokens("__VAR_12__ sent %s to {user_id} (%d)");
        assert!(tokens.contains(&"__VAR_12__".to_string()));
        assert!(tokens.contains(&"%s".to_string()));
        assert!(tokens.contains(&"%d".to_string()));
        assert!(tokens.contains(&"{user_id}".to_string()));
    }

    #[test]
    fn test_urls_are_preserved() {
        let source = "Read https://example.com/docs. Then continue.";
        assert_eq!(structural_tokens(source), vec!["https://example.com/docs"]);
        assert!(!validate(source, "Lisez la doc. Puis continuez."));
        assert!(validate(source, "Lisez https://example.com/docs. Puis continuez."));
    }

    #[test]
    fn test_empty_translation() {
        assert!(!validate("Hello", "  "));
        assert!(validate("", ""));
    }

    #[test]
    fn test_repair_appends_missing_tokens() {
        assert_eq!(
            repair(SOURCE, "Bonjour, vous avez trois messages "),
            "Bonjour, vous avez trois messages {name} 3"
        );
        assert_eq!(repair(SOURCE, ""), SOURCE);
        assert_eq!(repair("Hi", "Salut"), "Salut");
        assert!(validate(SOURCE, &repair(SOURCE, "Bonjour")));
    }
}
