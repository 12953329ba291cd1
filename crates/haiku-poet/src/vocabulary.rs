//! Symbol table with one-hot encoding

use std::collections::HashMap;

use crate::{PoetError, Result};

/// Ordered set of symbols; a symbol's position is its network index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vocabulary {
    symbols: Vec<char>,
    index: HashMap<char, usize>,
}

impl Vocabulary {
    pub fn new(symbols: &str) -> Result<Self> {
        let symbols: Vec<char> = symbols.chars().collect();
        if symbols.is_empty() {
            return Err(PoetError::EmptyVocabulary);
        }

        let mut index = HashMap::with_capacity(symbols.len());
        for (i, &symbol) in symbols.iter().enumerate() {
            if index.insert(symbol, i).is_some() {
                return Err(PoetError::DuplicateSymbol(symbol));
            }
        }

        Ok(Self { symbols, index })
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn symbol(&self, index: usize) -> Option<char> {
        self.symbols.get(index).copied()
    }

    pub fn index_of(&self, symbol: char) -> Option<usize> {
        self.index.get(&symbol).copied()
    }

    /// Indices of the known symbols of `text`, plus the symbols skipped
    pub fn encode(&self, text: &str) -> (Vec<usize>, Vec<char>) {
        let mut indices = Vec::with_capacity(text.len());
        let mut skipped = Vec::new();
        for symbol in text.chars() {
            match self.index_of(symbol) {
                Some(index) => indices.push(index),
                None => skipped.push(symbol),
            }
        }
        (indices, skipped)
    }

    /// Write the one-hot vector for `index` into `out`
    pub fn one_hot_into(&self, index: usize, out: &mut [f32]) {
        out.fill(0.0);
        if let Some(slot) = out.get_mut(index) {
            *slot = 1.0;
        }
    }

    pub fn one_hot(&self, index: usize) -> Vec<f32> {
        let mut out = vec![0.0; self.len()];
        self.one_hot_into(index, &mut out);
        out
    }
}

impl std::fmt::Display for Vocabulary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for symbol in &self.symbols {
            write!(f, "{}", symbol.escape_debug())?;
        }
        Ok(())
    }
}
