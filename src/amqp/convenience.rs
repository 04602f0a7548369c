//! Header access on [`BasicProperties`], which lapin only exposes by value.
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::BasicProperties;
use std::borrow::{Borrow, Cow};

/// Read-side helpers for message headers.
pub trait BasicPropertiesExt {
    fn get_header<Q>(&self, key: &Q) -> Option<&AMQPValue>
    where
        ShortString: Borrow<Q> + Ord,
        Q: Ord + ?Sized;

    /// The header as text, if it holds either of the AMQP string types.
    fn get_header_str<Q>(&self, key: &Q) -> Option<Cow<'_, str>>
    where
        ShortString: Borrow<Q> + Ord,
        Q: Ord + ?Sized,
    {
        Some(match self.get_header(key)? {
            AMQPValue::ShortString(short) => Cow::Borrowed(short.as_str()),
            AMQPValue::LongString(long) => String::from_utf8_lossy(long.as_bytes()),
            _ => return None,
        })
    }
}

impl BasicPropertiesExt for BasicProperties {
    fn get_header<Q>(&self, key: &Q) -> Option<&AMQPValue>
    where
        ShortString: Borrow<Q> + Ord,
        Q: Ord + ?Sized,
    {
        let headers: &FieldTable = self.headers().as_ref()?;
        headers.inner().get(key)
    }
}

/// Return `properties` with `name` set to `value`, replacing any previous value.
///
/// Takes the properties by value so the stale copy cannot be used by mistake.
///
/// ```rust
/// use hutch::amqp::convenience::{set_header, BasicPropertiesExt};
/// use hutch::amqp::types::AMQPValue;
/// use hutch::amqp::BasicProperties;
///
/// let properties = set_header(
///     BasicProperties::default(),
///     "x-origin",
///     AMQPValue::LongString("billing".into()),
/// );
/// assert_eq!(properties.get_header_str("x-origin").unwrap(), "billing");
/// ```
pub fn set_header(properties: BasicProperties, name: &str, value: AMQPValue) -> BasicProperties {
    let mut headers = properties.headers().clone().unwrap_or_default();
    headers.insert(name.into(), value);
    properties.with_headers(headers)
}
