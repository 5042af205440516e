//! Causal-chaining tokens.
//!
//! A bookmark is an opaque string minted by the server when a transaction
//! commits. A session threads its newest bookmark into the next
//! transaction's begin metadata so reads observe their own writes across
//! cluster members.

use bolt_proto::Value;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bookmarks {
    values: Vec<String>,
}

impl Bookmarks {
    pub fn none() -> Self {
        Bookmarks::default()
    }

    pub fn from_value(value: impl Into<String>) -> Self {
        Bookmarks {
            values: vec![value.into()],
        }
    }

    pub fn from_values(values: impl IntoIterator<Item = String>) -> Self {
        Bookmarks {
            values: values.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    /// Replace the chain with the token the server just minted.
    pub(crate) fn advance(&mut self, latest: Option<String>) {
        if let Some(value) = latest {
            self.values = vec![value];
        }
    }

    pub(crate) fn to_value(&self) -> Value {
        Value::List(
            self.values
                .iter()
                .map(|b| Value::String(b.clone()))
                .collect(),
        )
    }
}
