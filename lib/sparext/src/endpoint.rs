use crate::classify::{NamespaceMap, classify};
use crate::error::EndpointError;
use crate::eval::{EvaluationContext, ExtensionEvaluator};
use crate::negotiate::negotiate;
use crate::registry::FunctionRegistry;
use crate::results::serialize;
use oxigraph::store::Store;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A serialized answer to a query.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct QueryResponse {
    /// The value of the `Content-Type` header.
    pub media_type: &'static str,
    pub body: Vec<u8>,
}

/// Answers SPARQL queries on a store with extension functions and content negotiation.
///
/// ```
/// use oxigraph::model::NamedNode;
/// use oxigraph::store::Store;
/// use sparext::{FunctionRegistry, QueryEndpoint, ScalarFunction};
/// use std::sync::Arc;
///
/// let iri = NamedNode::new("http://example.com/concat")?;
/// let mut registry = FunctionRegistry::new();
/// registry.register(iri.clone(), ScalarFunction::new(iri, sparext::concat));
///
/// let endpoint = QueryEndpoint::new(Store::new()?, Arc::new(registry));
/// let response = endpoint.query(
///     "SELECT ?c WHERE { BIND(<http://example.com/concat>('First', 'last') AS ?c) }",
///     Some("text/csv"),
/// )?;
/// assert_eq!(response.media_type, "text/csv");
/// assert_eq!(response.body, b"c\r\nFirstlast\r\n");
/// # Result::<_, Box<dyn std::error::Error>>::Ok(())
/// ```
#[derive(Clone)]
pub struct QueryEndpoint {
    store: Store,
    namespaces: NamespaceMap,
    evaluator: ExtensionEvaluator,
    timeout: Option<Duration>,
}

impl QueryEndpoint {
    pub fn new(store: Store, registry: Arc<FunctionRegistry>) -> Self {
        Self {
            store,
            namespaces: NamespaceMap::well_known(),
            evaluator: ExtensionEvaluator::new(registry),
            timeout: None,
        }
    }

    #[must_use]
    pub fn with_namespaces(mut self, namespaces: NamespaceMap) -> Self {
        self.namespaces = namespaces;
        self
    }

    /// Sets the maximal duration of the evaluation of a single query.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn registry(&self) -> &FunctionRegistry {
        self.evaluator.registry()
    }

    pub fn namespaces(&self) -> &NamespaceMap {
        &self.namespaces
    }

    /// Parses, evaluates and serializes a query in the format negotiated from `accept`.
    pub fn query(&self, query: &str, accept: Option<&str>) -> Result<QueryResponse, EndpointError> {
        let (query, kind) = classify(query, &self.namespaces)?;
        debug!("Evaluating a {kind}");
        let mut context = EvaluationContext::new(self.store.clone());
        if let Some(timeout) = self.timeout {
            context = context.with_timeout(timeout);
        }
        let outcome = self.evaluator.execute(&context, query)?;
        let negotiated = negotiate(accept, &kind);
        debug!(
            "Serializing {} results as {}",
            outcome.shape(),
            negotiated.media_type
        );
        Ok(QueryResponse {
            media_type: negotiated.media_type,
            body: serialize(&outcome, negotiated.format)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EvaluationError;
    use crate::functions::{ScalarFunction, concat};
    use oxigraph::io::RdfFormat;
    use oxigraph::model::NamedNode;
    use std::str;

    fn endpoint() -> QueryEndpoint {
        let store = Store::new().unwrap();
        store
            .load_from_reader(
                RdfFormat::TriG,
                br#"
                <http://example.com/s> <http://example.com/p> "o" .
                _:b <http://example.com/p> "blank" ; <http://example.com/rank> 5 .
                GRAPH <http://example.com/g> { <http://example.com/s> <http://example.com/p> "in graph" }
                "#
                .as_slice(),
            )
            .unwrap();
        let iri = NamedNode::new_unchecked("https://w3id.org/um/sparql-functions/custom_concat");
        let mut registry = FunctionRegistry::new();
        registry.register(iri.clone(), ScalarFunction::new(iri, concat));
        QueryEndpoint::new(store, Arc::new(registry)).with_namespaces(
            NamespaceMap::well_known()
                .with_prefix("func", "https://w3id.org/um/sparql-functions/"),
        )
    }

    #[test]
    fn custom_concat_as_json() {
        let response = endpoint()
            .query(
                r#"SELECT ?concat WHERE { BIND("First" AS ?first) BIND(func:custom_concat(?first, "last") AS ?concat) }"#,
                Some("application/json"),
            )
            .unwrap();
        assert_eq!(response.media_type, "application/json");
        assert_eq!(
            str::from_utf8(&response.body).unwrap(),
            r#"{"head":{"vars":["concat"]},"results":{"bindings":[{"concat":{"type":"literal","value":"Firstlast"}}]}}"#
        );
    }

    #[test]
    fn construct_as_turtle() {
        let response = endpoint()
            .query(
                "CONSTRUCT { ?s ?p ?o } WHERE { ?s ?p ?o }",
                Some("application/json"),
            )
            .unwrap();
        assert_eq!(response.media_type, "text/turtle");
        assert!(
            str::from_utf8(&response.body)
                .unwrap()
                .contains("<http://example.com/s>")
        );
    }

    #[test]
    fn error_status_codes() {
        let endpoint = endpoint();
        for (query, accept, status) in [
            ("SELECT * WHERE {", None, 400),
            (
                "SELECT * WHERE { BIND(<http://example.com/unknown>(1) AS ?x) }",
                None,
                400,
            ),
            ("DESCRIBE <http://example.com/s>", Some("text/csv"), 422),
        ] {
            assert_eq!(
                endpoint.query(query, accept).unwrap_err().status_code(),
                status
            );
        }
    }

    #[test]
    fn ask_with_default_format() {
        let response = endpoint().query("ASK { ?s ?p ?o }", None).unwrap();
        assert_eq!(response.media_type, "application/xml");
        assert!(
            str::from_utf8(&response.body)
                .unwrap()
                .contains("<boolean>true</boolean>")
        );
    }

    #[test]
    fn builtin_bind_error_is_a_bad_request() {
        let error = endpoint()
            .query(r#"SELECT ?x WHERE { BIND("a" + 1 AS ?x) }"#, Some("text/csv"))
            .unwrap_err();
        assert!(matches!(
            error,
            EndpointError::Evaluation(EvaluationError::Expression { .. })
        ));
        assert_eq!(error.status_code(), 400);
    }

    #[test]
    fn custom_bind_joined_with_blank_nodes() {
        let response = endpoint()
            .query(
                r#"SELECT ?r WHERE { ?s <http://example.com/p> "blank" . BIND(func:custom_concat("a", "b") AS ?x) ?s <http://example.com/rank> ?r }"#,
                Some("text/csv"),
            )
            .unwrap();
        assert_eq!(str::from_utf8(&response.body).unwrap(), "r\r\n5\r\n");
    }

    #[test]
    fn custom_bind_in_graph() {
        let response = endpoint()
            .query(
                r#"SELECT ?g ?x WHERE { GRAPH ?g { ?s ?p ?o BIND(func:custom_concat(?o, "!") AS ?x) } }"#,
                Some("text/csv"),
            )
            .unwrap();
        assert_eq!(
            str::from_utf8(&response.body).unwrap(),
            "g,x\r\nhttp://example.com/g,in graph!\r\n"
        );
    }
}
