use crate::error::SerializationError;
use crate::negotiate::ResultFormat;
use oxigraph::io::{RdfFormat, RdfSerializer};
use oxigraph::model::{Triple, Variable};
use oxigraph::sparql::QuerySolution;
use oxigraph::sparql::results::{QueryResultsFormat, QueryResultsSerializer};

/// The fully collected results of a query.
#[derive(Debug, Eq, PartialEq)]
pub enum QueryOutcome {
    /// Results of a `SELECT` query.
    Solutions {
        variables: Vec<Variable>,
        solutions: Vec<QuerySolution>,
    },
    /// Result of an `ASK` query.
    Boolean(bool),
    /// Results of a `CONSTRUCT` or `DESCRIBE` query.
    Graph(Vec<Triple>),
}

impl QueryOutcome {
    /// A short name of the result shape, used in error messages.
    pub fn shape(&self) -> &'static str {
        match self {
            Self::Solutions { .. } => "Solutions",
            Self::Boolean(_) => "Boolean",
            Self::Graph(_) => "Graph",
        }
    }
}

/// Writes query results in the given format.
///
/// The output is buffered: on error nothing is returned.
///
/// Tabular and boolean results can be written as JSON, XML and CSV. Graphs can be written as Turtle and RDF/XML.
///
/// ```
/// use sparext::{QueryOutcome, ResultFormat, serialize};
///
/// assert_eq!(
///     serialize(&QueryOutcome::Boolean(true), ResultFormat::Json)?,
///     br#"{"head":{},"boolean":true}"#
/// );
/// assert!(serialize(&QueryOutcome::Boolean(true), ResultFormat::Turtle).is_err());
/// # Result::<_, Box<dyn std::error::Error>>::Ok(())
/// ```
pub fn serialize(
    outcome: &QueryOutcome,
    format: ResultFormat,
) -> Result<Vec<u8>, SerializationError> {
    match outcome {
        QueryOutcome::Solutions {
            variables,
            solutions,
        } => {
            let mut serializer = QueryResultsSerializer::from_format(results_format(
                outcome, format,
            )?)
            .serialize_solutions_to_writer(Vec::new(), variables.clone())?;
            for solution in solutions {
                serializer.serialize(solution)?;
            }
            Ok(serializer.finish()?)
        }
        QueryOutcome::Boolean(value) => Ok(QueryResultsSerializer::from_format(
            results_format(outcome, format)?,
        )
        .serialize_boolean_to_writer(Vec::new(), *value)?),
        QueryOutcome::Graph(triples) => {
            let format = match format {
                ResultFormat::Turtle => RdfFormat::Turtle,
                ResultFormat::Xml => RdfFormat::RdfXml,
                ResultFormat::Json | ResultFormat::Csv => {
                    return Err(SerializationError::UnsupportedFormat {
                        shape: outcome.shape(),
                        format,
                    });
                }
            };
            let mut serializer = RdfSerializer::from_format(format).for_writer(Vec::new());
            for triple in triples {
                serializer.serialize_triple(triple)?;
            }
            Ok(serializer.finish()?)
        }
    }
}

fn results_format(
    outcome: &QueryOutcome,
    format: ResultFormat,
) -> Result<QueryResultsFormat, SerializationError> {
    match format {
        ResultFormat::Json => Ok(QueryResultsFormat::Json),
        ResultFormat::Xml => Ok(QueryResultsFormat::Xml),
        ResultFormat::Csv => Ok(QueryResultsFormat::Csv),
        ResultFormat::Turtle => Err(SerializationError::UnsupportedFormat {
            shape: outcome.shape(),
            format,
        }),
    }
}

#[cfg(test)]
#[expect(clippy::panic_in_result_fn)]
mod tests {
    use super::*;
    use oxigraph::model::{Literal, NamedNode};
    use std::str;

    fn solutions() -> QueryOutcome {
        let variables = vec![Variable::new_unchecked("concat")];
        QueryOutcome::Solutions {
            solutions: vec![QuerySolution::from((
                variables.clone(),
                vec![Some(Literal::from("Firstlast").into())],
            ))],
            variables,
        }
    }

    fn graph() -> QueryOutcome {
        let ex = NamedNode::new_unchecked("http://example.com/s");
        QueryOutcome::Graph(vec![Triple::new(
            ex.clone(),
            ex,
            Literal::from("o"),
        )])
    }

    #[test]
    fn solutions_as_json() -> Result<(), SerializationError> {
        assert_eq!(
            str::from_utf8(&serialize(&solutions(), ResultFormat::Json)?).unwrap(),
            r#"{"head":{"vars":["concat"]},"results":{"bindings":[{"concat":{"type":"literal","value":"Firstlast"}}]}}"#
        );
        Ok(())
    }

    #[test]
    fn solutions_as_csv() -> Result<(), SerializationError> {
        assert_eq!(
            str::from_utf8(&serialize(&solutions(), ResultFormat::Csv)?).unwrap(),
            "concat\r\nFirstlast\r\n"
        );
        Ok(())
    }

    #[test]
    fn graph_as_turtle() -> Result<(), SerializationError> {
        let turtle = serialize(&graph(), ResultFormat::Turtle)?;
        assert!(
            str::from_utf8(&turtle)
                .unwrap()
                .contains("<http://example.com/s> <http://example.com/s> \"o\"")
        );
        let xml = serialize(&graph(), ResultFormat::Xml)?;
        assert!(str::from_utf8(&xml).unwrap().contains("rdf:RDF"));
        Ok(())
    }

    #[test]
    fn unsupported_combinations() {
        for (outcome, format) in [
            (graph(), ResultFormat::Json),
            (graph(), ResultFormat::Csv),
            (solutions(), ResultFormat::Turtle),
            (QueryOutcome::Boolean(false), ResultFormat::Turtle),
        ] {
            assert!(matches!(
                serialize(&outcome, format),
                Err(SerializationError::UnsupportedFormat { .. })
            ));
        }
    }
}
