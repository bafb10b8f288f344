use crate::negotiate::ResultFormat;
use oxigraph::model::{IriParseError, NamedNode, Variable};
use oxigraph::sparql::{QueryEvaluationError, SparqlSyntaxError};
use std::io;
use std::time::Duration;

/// Error raised while turning a query string into an algebra tree.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// A namespace given to the parser is not a valid IRI.
    #[error("Invalid IRI '{iri}' for prefix '{prefix}': {error}")]
    InvalidPrefix {
        prefix: String,
        iri: String,
        #[source]
        error: IriParseError,
    },
    /// The base IRI given to the parser is not a valid IRI.
    #[error("Invalid base IRI '{iri}': {error}")]
    InvalidBaseIri {
        iri: String,
        #[source]
        error: IriParseError,
    },
    /// The query itself is not valid SPARQL.
    #[error(transparent)]
    Syntax(#[from] SparqlSyntaxError),
}

/// Error raised during the evaluation of a query.
#[derive(Debug, thiserror::Error)]
pub enum EvaluationError {
    /// The extension evaluator was given an operator it does not override.
    #[error("The {0} operator is not handled by the extension evaluator")]
    NotImplemented(&'static str),
    /// A BIND expression calls a function IRI that is not in the registry.
    #[error("The function <{}> is not registered on this endpoint", .0.as_str())]
    UnknownFunction(NamedNode),
    /// A built-in BIND expression raised an evaluation error.
    #[error("The expression bound to {variable} could not be evaluated")]
    Expression { variable: Variable },
    /// An argument of a custom function could not be evaluated.
    #[error("The argument {position} of <{}> could not be evaluated", .function.as_str())]
    InvalidArgument { function: NamedNode, position: usize },
    /// A custom function reported a failure.
    #[error("The function <{}> failed: {message}", .function.as_str())]
    Function { function: NamedNode, message: String },
    /// The evaluation took longer than the configured timeout.
    #[error("The query evaluation has been stopped after {}s", .0.as_secs_f32())]
    Timeout(Duration),
    /// The underlying evaluator failed.
    #[error(transparent)]
    Query(#[from] QueryEvaluationError),
}

impl EvaluationError {
    /// Builds the error returned by a custom function implementation.
    pub fn function(function: impl Into<NamedNode>, message: impl Into<String>) -> Self {
        Self::Function {
            function: function.into(),
            message: message.into(),
        }
    }
}

/// Error raised while writing query results in the negotiated format.
#[derive(Debug, thiserror::Error)]
pub enum SerializationError {
    /// The result shape can not be written in the given format.
    #[error("{shape} results can not be serialized as {format}")]
    UnsupportedFormat {
        shape: &'static str,
        format: ResultFormat,
    },
    /// The underlying serializer failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Any error raised while answering a query.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Evaluation(#[from] EvaluationError),
    #[error(transparent)]
    Serialization(#[from] SerializationError),
}

impl EndpointError {
    /// The HTTP status code this error should be reported with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Parse(_) | Self::Evaluation(_) => 400,
            Self::Serialization(_) => 422,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        let error = EndpointError::from(EvaluationError::UnknownFunction(
            NamedNode::new_unchecked("http://example.com/f"),
        ));
        assert_eq!(error.status_code(), 400);
        assert_eq!(
            error.to_string(),
            "The function <http://example.com/f> is not registered on this endpoint"
        );
        let error = EndpointError::from(SerializationError::UnsupportedFormat {
            shape: "Graph",
            format: ResultFormat::Csv,
        });
        assert_eq!(error.status_code(), 422);
        assert_eq!(error.to_string(), "Graph results can not be serialized as csv");
    }
}
