use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wildcard {
    /// `?`: exactly one character.
    Single,
    /// `|`: one or more characters.
    SingleOrMore,
    /// `*`: any number of characters, including none.
    Any,
}

/// Glob-style exclude rule matched case-insensitively against full paths.
///
/// The pattern is split into literal runs separated by wildcards. Matching is
/// unanchored: the first literal may appear anywhere in the path and anything
/// may follow the last one.
#[derive(Debug, Clone)]
pub struct PathPattern {
    pattern: String,
    parts: Vec<Vec<char>>,
    wildcards: Vec<Wildcard>,
}

impl PathPattern {
    pub fn new(pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Err(Error::InvalidPattern(pattern.to_string()));
        }

        let mut parts: Vec<Vec<char>> = vec![Vec::new()];
        let mut wildcards = Vec::new();

        for c in pattern.chars() {
            let wildcard = match c {
                '?' => Wildcard::Single,
                '|' => Wildcard::SingleOrMore,
                '*' => Wildcard::Any,
                _ => {
                    if let Some(last) = parts.last_mut() {
                        last.extend(c.to_lowercase());
                    }
                    continue;
                }
            };
            wildcards.push(wildcard);
            parts.push(Vec::new());
        }

        Ok(Self {
            pattern: pattern.to_string(),
            parts,
            wildcards,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    pub fn matches(&self, path: &str) -> bool {
        let text: Vec<char> = path.chars().flat_map(char::to_lowercase).collect();

        // Next unconsumed char, chars the wildcards since the last literal
        // must skip, and whether the next literal may float past that point.
        let mut index = 0usize;
        let mut min_gap = 0usize;
        let mut floating = true;

        for (i, part) in self.parts.iter().enumerate() {
            if !part.is_empty() {
                let start = index + min_gap;
                if start > text.len() {
                    return false;
                }
                let found = if floating {
                    find(&text, part, start)
                } else {
                    text[start..].starts_with(part).then_some(start)
                };
                match found {
                    Some(at) => index = at + part.len(),
                    None => return false,
                }
                min_gap = 0;
                floating = false;
            }

            match self.wildcards.get(i) {
                Some(Wildcard::Single) => min_gap += 1,
                Some(Wildcard::SingleOrMore) => {
                    min_gap += 1;
                    floating = true;
                }
                Some(Wildcard::Any) => floating = true,
                None => {}
            }
        }

        text.len() >= index + min_gap
    }
}

fn find(haystack: &[char], needle: &[char], from: usize) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    (from..=haystack.len() - needle.len()).find(|&at| haystack[at..].starts_with(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(pattern: &str) -> PathPattern {
        PathPattern::new(pattern).unwrap()
    }

    #[test]
    fn test_any_count_wildcard() {
        assert!(p("a*b").matches("axyzb"));
        assert!(p("a*b").matches("ab"));
    }

    #[test]
    fn test_single_wildcard_consumes_exactly_one() {
        assert!(!p("a?b").matches("ab"));
        assert!(p("a?b").matches("axb"));
        assert!(!p("a?b").matches("axxb"));
    }

    #[test]
    fn test_single_or_more_wildcard() {
        assert!(!p("a|b").matches("ab"));
        assert!(p("a|b").matches("axb"));
        assert!(p("a|b").matches("axxxb"));
    }

    #[test]
    fn test_case_insensitive() {
        assert!(p("*.TMP").matches("/home/user/cache/file.tmp"));
        assert!(p("Node_Modules").matches("/src/NODE_MODULES/"));
    }

    #[test]
    fn test_unanchored_literal_matches_anywhere() {
        assert!(p("/temp/").matches("/home/user/temp/"));
        assert!(!p("/temp/").matches("/home/user/temporary"));
    }

    #[test]
    fn test_trailing_wildcards_need_remaining_chars() {
        assert!(!p("abc?").matches("xabc"));
        assert!(p("abc?").matches("xabcd"));
        assert!(p("abc*").matches("xabc"));
    }

    #[test]
    fn test_directory_rule_with_trailing_separator() {
        let rule = p("/build/");
        assert!(rule.matches("/repo/build/"));
        assert!(!rule.matches("/repo/build.rs"));
    }

    #[test]
    fn test_empty_pattern_rejected() {
        assert!(matches!(PathPattern::new(""), Err(Error::InvalidPattern(_))));
    }
}
