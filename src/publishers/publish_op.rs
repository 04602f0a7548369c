use crate::content::Content;
use crate::destinations::Destination;
use crate::pipeline::MiddlewareLog;
use lapin::BasicProperties;

/// A message on its way out, as seen by publisher middleware.
///
/// Middleware may rewrite any part of it; what is left after the last middleware is sent
/// once per destination.
#[derive(Debug, Clone)]
pub struct PublishOp {
    pub destinations: Vec<Destination>,
    pub content: Content,
    pub properties: BasicProperties,
    pub log: MiddlewareLog,
}

impl PublishOp {
    pub fn new(
        destinations: Vec<Destination>,
        content: Content,
        properties: BasicProperties,
    ) -> Self {
        Self {
            destinations,
            content,
            properties,
            log: MiddlewareLog::default(),
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        self.properties
            .content_type()
            .as_ref()
            .map(|content_type| content_type.as_str())
    }

    pub fn content_encoding(&self) -> Option<&str> {
        self.properties
            .content_encoding()
            .as_ref()
            .map(|content_encoding| content_encoding.as_str())
    }
}
