//! Sentence-matching capability used to resolve question answers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A successful match: which answer id matched and the captured slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentenceMatch {
    pub id: String,
    pub slots: BTreeMap<String, String>,
}

pub trait SentenceMatcher: Send + Sync {
    /// Match `text` against `templates` (answer id -> patterns).
    fn match_sentence(
        &self,
        text: &str,
        templates: &BTreeMap<String, Vec<String>>,
    ) -> anyhow::Result<Option<SentenceMatch>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Element {
    Word(String),
    Optional(Vec<String>),
    Slot(String),
}

/// Small template matcher.
///
/// Matching ignores case and punctuation. A template matches when its words
/// appear contiguously somewhere in the sentence; `{name}` captures one or
/// more words and `[words]` may be left out. Answer ids are tried in order.
#[derive(Debug, Default, Clone, Copy)]
pub struct TemplateMatcher;

impl SentenceMatcher for TemplateMatcher {
    fn match_sentence(
        &self,
        text: &str,
        templates: &BTreeMap<String, Vec<String>>,
    ) -> anyhow::Result<Option<SentenceMatch>> {
        let tokens = normalize(text);
        if tokens.is_empty() {
            return Ok(None);
        }

        for (id, patterns) in templates {
            for pattern in patterns {
                let elements = parse_template(pattern)?;
                if elements.is_empty() {
                    continue;
                }
                for start in 0..tokens.len() {
                    let mut slots = BTreeMap::new();
                    if match_elements(&elements, &tokens[start..], &mut slots) {
                        return Ok(Some(SentenceMatch {
                            id: id.clone(),
                            slots,
                        }));
                    }
                }
            }
        }
        Ok(None)
    }
}

fn normalize(text: &str) -> Vec<String> {
    text.chars()
        .map(|c| if c.is_alphanumeric() || c == '\'' { c } else { ' ' })
        .flat_map(char::to_lowercase)
        .collect::<String>()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

fn parse_template(template: &str) -> anyhow::Result<Vec<Element>> {
    let mut elements = Vec::new();
    let mut literal = String::new();
    let mut chars = template.chars();

    while let Some(c) = chars.next() {
        match c {
            '{' | '[' => {
                elements.extend(normalize(&literal).into_iter().map(Element::Word));
                literal.clear();

                let close = if c == '{' { '}' } else { ']' };
                let mut inner = String::new();
                let mut closed = false;
                for next in chars.by_ref() {
                    if next == close {
                        closed = true;
                        break;
                    }
                    inner.push(next);
                }
                if !closed {
                    anyhow::bail!("Unclosed '{c}' in template: {template}");
                }

                if c == '{' {
                    let name = inner.trim();
                    if name.is_empty() {
                        anyhow::bail!("Empty slot name in template: {template}");
                    }
                    elements.push(Element::Slot(name.to_string()));
                } else {
                    let words = normalize(&inner);
                    if !words.is_empty() {
                        elements.push(Element::Optional(words));
                    }
                }
            }
            _ => literal.push(c),
        }
    }
    elements.extend(normalize(&literal).into_iter().map(Element::Word));
    Ok(elements)
}

fn match_elements(elements: &[Element], tokens: &[String], slots: &mut BTreeMap<String, String>) -> bool {
    let Some((first, rest)) = elements.split_first() else {
        return true;
    };

    match first {
        Element::Word(word) => {
            tokens.first() == Some(word) && match_elements(rest, &tokens[1..], slots)
        }
        Element::Optional(words) => {
            (tokens.starts_with(words) && match_elements(rest, &tokens[words.len()..], slots))
                || match_elements(rest, tokens, slots)
        }
        Element::Slot(name) => {
            if tokens.is_empty() {
                return false;
            }
            if rest.is_empty() {
                slots.insert(name.clone(), tokens.join(" "));
                return true;
            }
            for n in 1..=tokens.len() {
                if match_elements(rest, &tokens[n..], slots) {
                    slots.insert(name.clone(), tokens[..n].join(" "));
                    return true;
                }
            }
            false
        }
    }
}
