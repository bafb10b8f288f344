use crate::error::ParseError;
use regex::Regex;
use spargebra::{Query, SparqlParser};
use std::fmt;
use std::sync::LazyLock;

static WORD_BOUNDARY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\w)([A-Z])").unwrap());

/// Prefixes made available to every parsed query.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct NamespaceMap {
    prefixes: Vec<(String, String)>,
    base_iri: Option<String>,
}

impl NamespaceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// The `rdf`, `rdfs`, `xsd` and `owl` namespaces.
    pub fn well_known() -> Self {
        Self::new()
            .with_prefix("rdf", "http://www.w3.org/1999/02/22-rdf-syntax-ns#")
            .with_prefix("rdfs", "http://www.w3.org/2000/01/rdf-schema#")
            .with_prefix("xsd", "http://www.w3.org/2001/XMLSchema#")
            .with_prefix("owl", "http://www.w3.org/2002/07/owl#")
    }

    /// Adds a prefix. A later declaration of the same name replaces the earlier one.
    #[must_use]
    pub fn with_prefix(mut self, name: impl Into<String>, iri: impl Into<String>) -> Self {
        let name = name.into();
        let iri = iri.into();
        if let Some(entry) = self.prefixes.iter_mut().find(|(n, _)| *n == name) {
            entry.1 = iri;
        } else {
            self.prefixes.push((name, iri));
        }
        self
    }

    #[must_use]
    pub fn with_base_iri(mut self, base_iri: impl Into<String>) -> Self {
        self.base_iri = Some(base_iri.into());
        self
    }

    pub fn prefixes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.prefixes
            .iter()
            .map(|(name, iri)| (name.as_str(), iri.as_str()))
    }

    pub fn base_iri(&self) -> Option<&str> {
        self.base_iri.as_deref()
    }

    fn parser(&self) -> Result<SparqlParser, ParseError> {
        let mut parser = SparqlParser::new();
        if let Some(base_iri) = &self.base_iri {
            parser = parser
                .with_base_iri(base_iri)
                .map_err(|error| ParseError::InvalidBaseIri {
                    iri: base_iri.clone(),
                    error,
                })?;
        }
        for (prefix, iri) in &self.prefixes {
            parser = parser
                .with_prefix(prefix, iri)
                .map_err(|error| ParseError::InvalidPrefix {
                    prefix: prefix.clone(),
                    iri: iri.clone(),
                    error,
                })?;
        }
        Ok(parser)
    }
}

/// The normalized category of a query.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum OperationKind {
    Select,
    Construct,
    Ask,
    Describe,
    /// An algebra root this endpoint does not know about, with its normalized label.
    Other(String),
}

impl OperationKind {
    /// Normalizes an algebra root name like `SelectQuery` into an operation kind.
    ///
    /// ```
    /// use sparext::OperationKind;
    ///
    /// assert_eq!(
    ///     OperationKind::from_algebra_name("ConstructQuery"),
    ///     OperationKind::Construct
    /// );
    /// assert_eq!(
    ///     OperationKind::from_algebra_name("InsertDataQuery").to_string(),
    ///     "Insert Data Query"
    /// );
    /// ```
    pub fn from_algebra_name(name: &str) -> Self {
        let label = WORD_BOUNDARY.replace_all(name, "$1 $2");
        match label.as_ref() {
            "Select Query" => Self::Select,
            "Construct Query" => Self::Construct,
            "Ask Query" => Self::Ask,
            "Describe Query" => Self::Describe,
            _ => Self::Other(label.into_owned()),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Self::Select => "Select Query",
            Self::Construct => "Construct Query",
            Self::Ask => "Ask Query",
            Self::Describe => "Describe Query",
            Self::Other(label) => label,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// The name of the algebra root of a query.
pub fn algebra_name(query: &Query) -> &'static str {
    match query {
        Query::Select { .. } => "SelectQuery",
        Query::Construct { .. } => "ConstructQuery",
        Query::Ask { .. } => "AskQuery",
        Query::Describe { .. } => "DescribeQuery",
    }
}

/// Parses a query against the given namespaces and tells what kind of query it is.
pub fn classify(
    query: &str,
    namespaces: &NamespaceMap,
) -> Result<(Query, OperationKind), ParseError> {
    let query = namespaces.parser()?.parse_query(query)?;
    let kind = OperationKind::from_algebra_name(algebra_name(&query));
    Ok((query, kind))
}

#[cfg(test)]
#[expect(clippy::panic_in_result_fn)]
mod tests {
    use super::*;

    #[test]
    fn operation_kinds() -> Result<(), ParseError> {
        let namespaces = NamespaceMap::well_known();
        for (query, kind) in [
            ("SELECT * WHERE { ?s ?p ?o }", OperationKind::Select),
            (
                "CONSTRUCT { ?s ?p ?o } WHERE { ?s ?p ?o }",
                OperationKind::Construct,
            ),
            ("ASK { ?s a owl:Class }", OperationKind::Ask),
            ("DESCRIBE <http://example.com/s>", OperationKind::Describe),
        ] {
            assert_eq!(classify(query, &namespaces)?.1, kind);
        }
        Ok(())
    }

    #[test]
    fn labels() {
        assert_eq!(OperationKind::Select.to_string(), "Select Query");
        assert_eq!(
            OperationKind::from_algebra_name("DescribeQuery"),
            OperationKind::Describe
        );
        assert_eq!(
            OperationKind::from_algebra_name("Query"),
            OperationKind::Other("Query".into())
        );
    }

    #[test]
    fn prefixes_are_applied() -> Result<(), ParseError> {
        let namespaces = NamespaceMap::well_known().with_prefix("ex", "http://example.com/");
        let (query, _) = classify("SELECT * WHERE { ex:s rdf:type ?o }", &namespaces)?;
        assert!(query.to_string().contains("<http://example.com/s>"));
        Ok(())
    }

    #[test]
    fn unknown_prefix_is_a_syntax_error() {
        assert!(matches!(
            classify("SELECT * WHERE { ex:s ?p ?o }", &NamespaceMap::new()),
            Err(ParseError::Syntax(_))
        ));
    }

    #[test]
    fn invalid_prefix_iri() {
        assert!(matches!(
            classify(
                "SELECT * WHERE { ?s ?p ?o }",
                &NamespaceMap::new().with_prefix("ex", "not an iri")
            ),
            Err(ParseError::InvalidPrefix { .. })
        ));
    }

    #[test]
    fn prefix_redefinition() {
        let namespaces = NamespaceMap::new()
            .with_prefix("ex", "http://example.com/a/")
            .with_prefix("ex", "http://example.com/b/");
        assert_eq!(
            namespaces.prefixes().collect::<Vec<_>>(),
            [("ex", "http://example.com/b/")]
        );
    }
}
