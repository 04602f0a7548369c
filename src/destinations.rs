//! Parsing of compact routing expressions into concrete `(exchange, routing key)` pairs.
//!
//! The grammar is `[exchange][:routingKey[,routingKey...]][;...]`:
//!
//! - `"jobs"` publishes straight to the `jobs` queue through the default exchange;
//! - `"events:user.created,user.deleted"` publishes twice to the `events` exchange;
//! - `"events:user.created; audit:"` adds a publish to `audit` with an empty routing key.
use crate::error::ArgumentError;
use std::fmt;

/// Where a single copy of a message is sent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub exchange: String,
    pub routing_key: String,
}

impl Destination {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }

    /// A destination addressing `queue` directly through the default exchange.
    pub fn queue(queue: impl Into<String>) -> Self {
        Self::new("", queue)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.exchange, self.routing_key)
    }
}

/// Anything that can be read as one or more destination expressions.
///
/// `None` stands for an absent destination and is rejected by [`parse_destinations`].
pub trait AsDestinations {
    fn destination_entries(&self) -> Option<Vec<&str>>;
}

impl AsDestinations for str {
    fn destination_entries(&self) -> Option<Vec<&str>> {
        Some(vec![self])
    }
}

impl AsDestinations for String {
    fn destination_entries(&self) -> Option<Vec<&str>> {
        Some(vec![self.as_str()])
    }
}

impl<T: AsDestinations + ?Sized> AsDestinations for &T {
    fn destination_entries(&self) -> Option<Vec<&str>> {
        (**self).destination_entries()
    }
}

impl<T: AsRef<str>> AsDestinations for [T] {
    fn destination_entries(&self) -> Option<Vec<&str>> {
        Some(self.iter().map(AsRef::as_ref).collect())
    }
}

impl<T: AsRef<str>, const N: usize> AsDestinations for [T; N] {
    fn destination_entries(&self) -> Option<Vec<&str>> {
        self.as_slice().destination_entries()
    }
}

impl<T: AsRef<str>> AsDestinations for Vec<T> {
    fn destination_entries(&self) -> Option<Vec<&str>> {
        self.as_slice().destination_entries()
    }
}

impl<T: AsDestinations> AsDestinations for Option<T> {
    fn destination_entries(&self) -> Option<Vec<&str>> {
        self.as_ref()?.destination_entries()
    }
}

/// Expand a destination expression into the list of places a message is sent to, in order.
///
/// Entries are split on `;`. Within an entry everything before the first `:` is the exchange
/// and everything after it a comma-separated list of routing keys; an entry without `:` names
/// a queue. Whitespace is trimmed and empty entries are skipped.
pub fn parse_destinations<D>(input: &D) -> Result<Vec<Destination>, ArgumentError>
where
    D: AsDestinations + ?Sized,
{
    let entries = input
        .destination_entries()
        .ok_or(ArgumentError::MissingDestination)?;
    Ok(entries
        .into_iter()
        .flat_map(|entry| entry.split(';'))
        .flat_map(parse_entry)
        .collect())
}

fn parse_entry(entry: &str) -> Vec<Destination> {
    let Some((exchange, routing_keys)) = entry.split_once(':') else {
        let queue = entry.trim();
        return if queue.is_empty() {
            Vec::new()
        } else {
            vec![Destination::queue(queue)]
        };
    };

    let exchange = exchange.trim();
    let routing_keys: Vec<&str> = routing_keys
        .split(',')
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .collect();

    match (exchange.is_empty(), routing_keys.is_empty()) {
        (true, true) => Vec::new(),
        (false, true) => vec![Destination::new(exchange, "")],
        _ => routing_keys
            .into_iter()
            .map(|key| Destination::new(exchange, key))
            .collect(),
    }
}
