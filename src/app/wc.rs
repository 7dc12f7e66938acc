//! Word count.

use std::path::PathBuf;

/// Emits `(word, "1")` for every word in the document. Words are maximal
/// runs of alphabetic characters.
pub fn map(_filename: &PathBuf, contents: &String) -> Vec<(String, String)> {
    contents
        .split(|c: char| !c.is_alphabetic())
        .filter(|w| !w.is_empty())
        .map(|w| (w.to_owned(), "1".to_owned()))
        .collect()
}

/// Total number of occurrences gathered for one word.
pub fn reduce(_key: &String, values: &Vec<String>) -> String {
    values.len().to_string()
}
