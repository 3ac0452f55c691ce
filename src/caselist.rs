//! The prefix trie format dEQP uses for case lists.
//!
//! `dEQP-GLES3.info.vendor` and `dEQP-GLES3.info.renderer` become
//! `{dEQP-GLES3{info{vendor,renderer}}}`.

use indexmap::IndexMap;
use thiserror::Error;

use crate::TestId;

#[derive(Debug, Error, Eq, PartialEq)]
pub enum TrieParseError {
    #[error("Expected {expected:?} at offset {offset}")]
    Expected { expected: char, offset: usize },
    #[error("Empty name at offset {0}")]
    EmptyName(usize),
    #[error("Unexpected trailing data at offset {0}")]
    TrailingData(usize),
}

/// Encode test case paths as a trie.
pub fn generate_test_case_trie_from_paths<'a>(paths: impl IntoIterator<Item = &'a str>) -> String {
    let mut result = String::from("{");
    let mut first = true;
    let mut groups: IndexMap<&str, Vec<&str>> = IndexMap::new();

    for path in paths {
        match path.split_once('.') {
            None => {
                if !first {
                    result.push(',');
                }
                first = false;
                result.push_str(path);
            }
            Some((group, rest)) => groups.entry(group).or_default().push(rest),
        }
    }

    for (group, children) in groups {
        if !first {
            result.push(',');
        }
        first = false;
        result.push_str(group);
        result.push_str(&generate_test_case_trie_from_paths(children));
    }

    result.push('}');
    result
}

/// Encode the given tests as a case list trie.
pub fn generate_test_case_trie<'a>(tests: impl IntoIterator<Item = &'a TestId>) -> String {
    let paths: Vec<String> = tests.into_iter().map(TestId::path).collect();
    generate_test_case_trie_from_paths(paths.iter().map(String::as_str))
}

struct TrieParser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> TrieParser<'a> {
    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn expect(&mut self, expected: char) -> Result<(), TrieParseError> {
        if self.peek() == Some(expected) {
            self.pos += expected.len_utf8();
            Ok(())
        } else {
            Err(TrieParseError::Expected {
                expected,
                offset: self.pos,
            })
        }
    }

    fn name(&mut self) -> Result<&'a str, TrieParseError> {
        let input = self.input;
        let start = self.pos;
        let len = input[start..]
            .find(|c| matches!(c, '{' | '}' | ','))
            .unwrap_or(input.len() - start);
        if len == 0 {
            return Err(TrieParseError::EmptyName(start));
        }
        self.pos += len;
        Ok(&input[start..start + len])
    }

    /// Parse a `{...}` group and append every path in it, prefixed with `prefix`.
    fn group(&mut self, prefix: &str, out: &mut Vec<String>) -> Result<(), TrieParseError> {
        self.expect('{')?;
        if self.peek() == Some('}') {
            self.pos += 1;
            return Ok(());
        }
        loop {
            let name = self.name()?;
            let path = if prefix.is_empty() {
                name.to_string()
            } else {
                format!("{}.{}", prefix, name)
            };
            if self.peek() == Some('{') {
                self.group(&path, out)?;
            } else {
                out.push(path);
            }

            match self.peek() {
                Some(',') => self.pos += 1,
                _ => break,
            }
        }
        self.expect('}')
    }
}

/// Decode a case list trie back into dotted test case paths.
pub fn parse_test_case_trie(trie: &str) -> Result<Vec<String>, TrieParseError> {
    let trie = trie.trim_end();
    let mut parser = TrieParser {
        input: trie,
        pos: 0,
    };
    let mut paths = Vec::new();
    parser.group("", &mut paths)?;
    if parser.pos != trie.len() {
        return Err(TrieParseError::TrailingData(parser.pos));
    }
    Ok(paths)
}
