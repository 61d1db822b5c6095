//! Small glob engine for tag values.
//!
//! `*` matches any run, `?` any single byte, a leading `^` anchors at the
//! start, a trailing `$` at the end, and `\` makes the next byte literal.
//! Unanchored patterns match anywhere in the subject.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Byte(u8),
    One,
    Many,
}

#[derive(Debug, Clone)]
pub struct Glob {
    tokens: Vec<Token>,
    /// Set when the pattern has no wildcards or anchors
    literal: Option<Vec<u8>>,
}

impl Glob {
    pub fn new(pattern: &[u8]) -> Self {
        let mut tokens = Vec::with_capacity(pattern.len() + 2);
        let mut anchored_start = false;
        let mut anchored_end = false;
        let mut special = false;

        let mut i = 0;
        while i < pattern.len() {
            let b = pattern[i];
            match b {
                b'\\' if i + 1 < pattern.len() => {
                    tokens.push(Token::Byte(pattern[i + 1]));
                    i += 1;
                }
                b'*' => {
                    special = true;
                    if tokens.last() != Some(&Token::Many) {
                        tokens.push(Token::Many);
                    }
                }
                b'?' => {
                    special = true;
                    tokens.push(Token::One);
                }
                b'^' if i == 0 => {
                    special = true;
                    anchored_start = true;
                }
                b'$' if i + 1 == pattern.len() => {
                    special = true;
                    anchored_end = true;
                }
                _ => tokens.push(Token::Byte(b)),
            }
            i += 1;
        }

        if !special {
            let literal = tokens
                .iter()
                .filter_map(|t| match t {
                    Token::Byte(b) => Some(*b),
                    _ => None,
                })
                .collect();
            return Self {
                tokens,
                literal: Some(literal),
            };
        }
        if !anchored_start && tokens.first() != Some(&Token::Many) {
            tokens.insert(0, Token::Many);
        }
        if !anchored_end && tokens.last() != Some(&Token::Many) {
            tokens.push(Token::Many);
        }
        Self {
            tokens,
            literal: None,
        }
    }

    pub fn matches(&self, subject: &[u8]) -> bool {
        if let Some(needle) = &self.literal {
            return contains(subject, needle);
        }

        // iterative wildcard match, backtracking to the last `*`
        let (mut p, mut s) = (0, 0);
        let mut star: Option<(usize, usize)> = None;
        while s < subject.len() {
            match self.tokens.get(p) {
                Some(Token::Many) => {
                    star = Some((p, s));
                    p += 1;
                }
                Some(Token::One) => {
                    p += 1;
                    s += 1;
                }
                Some(Token::Byte(b)) if *b == subject[s] => {
                    p += 1;
                    s += 1;
                }
                _ => match star {
                    Some((sp, ss)) => {
                        p = sp + 1;
                        s = ss + 1;
                        star = Some((sp, ss + 1));
                    }
                    None => return false,
                },
            }
        }
        self.tokens[p..].iter().all(|t| *t == Token::Many)
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}
