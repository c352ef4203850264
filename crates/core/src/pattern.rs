use std::collections::BTreeMap;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::models::MatchSpan;

const SPAN_GROUP: &str = "__span";
const REGEX_SIZE_LIMIT: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternSpec {
    Template(String),
    Keywords(Vec<String>),
    Regex(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternMatch {
    pub span: MatchSpan,
    pub captures: BTreeMap<String, String>,
    pub captured_chars: usize,
}

#[derive(Debug, Clone)]
pub struct CompiledPattern {
    regex: Regex,
    captures: Vec<String>,
}

impl CompiledPattern {
    pub fn compile(spec: &PatternSpec) -> Result<Self, String> {
        let (source, captures) = match spec {
            PatternSpec::Template(template) => {
                let tokens = parse_template(template)?;
                if tokens.is_empty() {
                    return Err("template is empty".to_string());
                }
                let mut body = String::new();
                let mut captures = Vec::new();
                render(&tokens, &mut body, &mut captures, true)?;
                (bounded(&body), captures)
            }
            PatternSpec::Keywords(keywords) => {
                let alternatives = keywords
                    .iter()
                    .map(|keyword| keyword.split_whitespace().collect::<Vec<_>>())
                    .filter(|words| !words.is_empty())
                    .map(|words| {
                        words
                            .iter()
                            .map(|word| regex::escape(word))
                            .collect::<Vec<_>>()
                            .join(r"\s+")
                    })
                    .collect::<Vec<_>>();
                if alternatives.is_empty() {
                    return Err("keyword list is empty".to_string());
                }
                (bounded(&format!("(?:{})", alternatives.join("|"))), Vec::new())
            }
            PatternSpec::Regex(source) => {
                let probe = Regex::new(source).map_err(|err| err.to_string())?;
                let captures = probe
                    .capture_names()
                    .flatten()
                    .map(str::to_string)
                    .collect::<Vec<_>>();
                if let Some(name) = captures.iter().find(|name| name.starts_with('_')) {
                    return Err(format!("capture `{name}` uses a reserved leading underscore"));
                }
                (format!("(?i)(?P<{SPAN_GROUP}>{source})"), captures)
            }
        };

        let regex = RegexBuilder::new(&source)
            .size_limit(REGEX_SIZE_LIMIT)
            .build()
            .map_err(|err| err.to_string())?;

        Ok(Self { regex, captures })
    }

    pub fn captures(&self) -> &[String] {
        &self.captures
    }

    pub fn find(&self, text: &str) -> Option<PatternMatch> {
        let caps = self.regex.captures(text)?;
        let whole = caps.name(SPAN_GROUP)?;

        let mut captures = BTreeMap::new();
        let mut captured_chars = 0usize;
        for name in &self.captures {
            let Some(value) = caps.name(name).map(|m| m.as_str().trim()) else {
                continue;
            };
            if value.is_empty() {
                continue;
            }
            captured_chars += value.chars().count();
            captures.insert(name.clone(), value.to_string());
        }

        Some(PatternMatch {
            span: MatchSpan {
                start: whole.start(),
                end: whole.end(),
            },
            captures,
            captured_chars,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Literal(String),
    Alternation(Vec<String>),
    Slot { name: String, multi: bool },
    Optional(Vec<Token>),
}

// Whole-token match: preceded by start/whitespace, followed by whitespace/end.
fn bounded(body: &str) -> String {
    format!(r"(?i)(?:^|\s)(?P<{SPAN_GROUP}>{body})(?:\s|$)")
}

fn parse_template(template: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut rest = template.trim();

    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix('[') {
            let end = after
                .find(']')
                .ok_or_else(|| "unclosed `[` in template".to_string())?;
            let inner = parse_template(&after[..end])?;
            if inner.is_empty() {
                return Err("empty optional group".to_string());
            }
            if inner
                .iter()
                .any(|token| matches!(token, Token::Slot { .. } | Token::Optional(_)))
            {
                return Err("optional groups may only hold literal words".to_string());
            }
            tokens.push(Token::Optional(inner));
            rest = after[end + 1..].trim_start();
            continue;
        }

        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        tokens.push(parse_word(&rest[..end])?);
        rest = rest[end..].trim_start();
    }

    Ok(tokens)
}

fn parse_word(word: &str) -> Result<Token, String> {
    if let Some(inner) = word.strip_prefix('<').and_then(|w| w.strip_suffix('>')) {
        let (name, multi) = match inner.strip_suffix("...") {
            Some(name) => (name, true),
            None => (inner, false),
        };
        validate_slot_name(name)?;
        return Ok(Token::Slot {
            name: name.to_string(),
            multi,
        });
    }

    if let Some(inner) = word.strip_prefix('(').and_then(|w| w.strip_suffix(')')) {
        let alternatives = inner.split('|').map(str::to_string).collect::<Vec<_>>();
        if alternatives.iter().any(|alt| alt.is_empty() || has_syntax(alt)) {
            return Err(format!("malformed alternation `{word}`"));
        }
        return Ok(Token::Alternation(alternatives));
    }

    if has_syntax(word) {
        return Err(format!("unexpected template syntax in `{word}`"));
    }
    Ok(Token::Literal(word.to_string()))
}

fn has_syntax(word: &str) -> bool {
    word.contains(['<', '>', '[', ']', '(', ')', '|'])
}

fn validate_slot_name(name: &str) -> Result<(), String> {
    let mut chars = name.chars();
    let valid = chars.next().is_some_and(|ch| ch.is_ascii_alphabetic())
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_');
    if valid {
        Ok(())
    } else {
        Err(format!("invalid slot name `{name}`"))
    }
}

fn render(
    tokens: &[Token],
    body: &mut String,
    captures: &mut Vec<String>,
    mut first: bool,
) -> Result<(), String> {
    for token in tokens {
        let sep = if first { "" } else { r"\s+" };
        match token {
            Token::Literal(word) => {
                body.push_str(sep);
                body.push_str(&regex::escape(word));
            }
            Token::Alternation(alternatives) => {
                body.push_str(sep);
                body.push_str("(?:");
                body.push_str(
                    &alternatives
                        .iter()
                        .map(|alt| regex::escape(alt))
                        .collect::<Vec<_>>()
                        .join("|"),
                );
                body.push(')');
            }
            Token::Slot { name, multi } => {
                if captures.contains(name) {
                    return Err(format!("slot `{name}` appears twice"));
                }
                captures.push(name.clone());
                body.push_str(sep);
                if *multi {
                    body.push_str(&format!(r"(?P<{name}>\S+(?:\s+\S+)*)"));
                } else {
                    body.push_str(&format!(r"(?P<{name}>\S+)"));
                }
            }
            Token::Optional(inner) => {
                if first {
                    return Err("template cannot start with an optional group".to_string());
                }
                body.push_str("(?:");
                render(inner, body, captures, false)?;
                body.push_str(")?");
            }
        }
        first = false;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(source: &str) -> CompiledPattern {
        CompiledPattern::compile(&PatternSpec::Template(source.to_string())).unwrap()
    }

    #[test]
    fn template_extracts_single_token_slots() {
        let pattern = template("note <name> <topic>");
        let found = pattern.find("note john medication").unwrap();

        assert_eq!(found.span, MatchSpan { start: 0, end: 20 });
        assert_eq!(found.captures["name"], "john");
        assert_eq!(found.captures["topic"], "medication");
        assert_eq!(found.captured_chars, 14);
    }

    #[test]
    fn multi_token_slot_backtracks_to_literal() {
        let pattern = template("schedule [an] appointment for <name...> at <time>");
        let found = pattern
            .find("Schedule appointment for Ada Lovelace at 3pm")
            .unwrap();

        assert_eq!(found.captures["name"], "Ada Lovelace");
        assert_eq!(found.captures["time"], "3pm");
    }

    #[test]
    fn matches_only_whole_tokens() {
        let pattern = template("(open|show) chart");
        assert!(pattern.find("reopen chart").is_none());
        let found = pattern.find("please show chart now").unwrap();
        assert_eq!(found.span, MatchSpan { start: 7, end: 17 });
    }

    #[test]
    fn keywords_match_case_insensitively() {
        let pattern = CompiledPattern::compile(&PatternSpec::Keywords(vec![
            "refill".to_string(),
            "repeat prescription".to_string(),
        ]))
        .unwrap();

        assert!(pattern.find("need a REPEAT   prescription").is_some());
        assert!(pattern.find("refilling").is_none());
        assert!(pattern.captures().is_empty());
    }

    #[test]
    fn regex_patterns_expose_named_captures() {
        let pattern =
            CompiledPattern::compile(&PatternSpec::Regex(r"mrn (?P<mrn>\d{6,})".to_string()))
                .unwrap();
        let found = pattern.find("open MRN 0042137").unwrap();

        assert_eq!(pattern.captures(), ["mrn".to_string()]);
        assert_eq!(found.captures["mrn"], "0042137");
    }

    #[test]
    fn rejects_malformed_templates() {
        for source in [
            "",
            "[optional] first",
            "note <1name>",
            "note <name> <name>",
            "note [<name>]",
            "note (a||b)",
            "note [unclosed",
        ] {
            assert!(
                CompiledPattern::compile(&PatternSpec::Template(source.to_string())).is_err(),
                "{source} should be rejected"
            );
        }
    }
}
