use crate::classify::OperationKind;
use std::fmt;

/// The media type used when the client does not ask for a known one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/xml";

/// Serialization formats the endpoint can answer with.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ResultFormat {
    Json,
    Xml,
    Csv,
    Turtle,
}

impl ResultFormat {
    /// The short identifier of the format, e.g. `json` or `ttl`.
    pub const fn id(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Xml => "xml",
            Self::Csv => "csv",
            Self::Turtle => "ttl",
        }
    }

    /// Looks up the format registered for an exact media type.
    ///
    /// ```
    /// use sparext::ResultFormat;
    ///
    /// assert_eq!(
    ///     ResultFormat::from_media_type("text/csv"),
    ///     Some(ResultFormat::Csv)
    /// );
    /// assert_eq!(ResultFormat::from_media_type("text/csv; q=0.9"), None);
    /// ```
    pub fn from_media_type(media_type: &str) -> Option<Self> {
        MEDIA_TYPES
            .iter()
            .find(|(candidate, _)| *candidate == media_type)
            .map(|(_, format)| *format)
    }
}

impl fmt::Display for ResultFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

const MEDIA_TYPES: [(&str, ResultFormat); 10] = [
    ("application/sparql-results+json", ResultFormat::Json),
    ("application/json", ResultFormat::Json),
    ("text/json", ResultFormat::Json),
    ("application/sparql-results+xml", ResultFormat::Xml),
    ("application/xml", ResultFormat::Xml),
    ("application/rdf+xml", ResultFormat::Xml),
    ("text/xml", ResultFormat::Xml),
    ("application/sparql-results+csv", ResultFormat::Csv),
    ("text/csv", ResultFormat::Csv),
    ("text/turtle", ResultFormat::Turtle),
];

/// The outcome of the content negotiation.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct NegotiationResult {
    /// The value to send in the `Content-Type` header.
    pub media_type: &'static str,
    pub format: ResultFormat,
}

/// Picks the response media type and serialization format.
///
/// The `Accept` value is matched exactly against the known media types: no
/// quality values and no lists. Anything unknown falls back to
/// [`DEFAULT_CONTENT_TYPE`]. `CONSTRUCT` queries can not be written as JSON or
/// CSV so they are answered in Turtle instead, and XML becomes RDF/XML.
pub fn negotiate(accept: Option<&str>, kind: &OperationKind) -> NegotiationResult {
    let (mut media_type, mut format) = accept
        .and_then(|accept| {
            MEDIA_TYPES
                .iter()
                .find(|(candidate, _)| *candidate == accept)
                .copied()
        })
        .unwrap_or((DEFAULT_CONTENT_TYPE, ResultFormat::Xml));
    if *kind == OperationKind::Construct {
        match format {
            ResultFormat::Json | ResultFormat::Csv => {
                media_type = "text/turtle";
                format = ResultFormat::Turtle;
            }
            ResultFormat::Xml => media_type = "application/rdf+xml",
            ResultFormat::Turtle => (),
        }
    }
    NegotiationResult { media_type, format }
}
