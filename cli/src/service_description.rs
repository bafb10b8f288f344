use oxigraph::io::{RdfFormat, RdfSerializer};
use oxigraph::model::vocab::{rdf, rdfs};
use oxigraph::model::{BlankNode, Literal, NamedNode, NamedNodeRef, TripleRef};
use oxigraph::sparql::results::QueryResultsFormat;
use sparext::FunctionRegistry;

mod sd {
    use oxigraph::model::NamedNodeRef;

    pub const SERVICE: NamedNodeRef<'_> =
        NamedNodeRef::new_unchecked("http://www.w3.org/ns/sparql-service-description#Service");
    pub const DATASET: NamedNodeRef<'_> =
        NamedNodeRef::new_unchecked("http://www.w3.org/ns/sparql-service-description#Dataset");
    pub const GRAPH: NamedNodeRef<'_> =
        NamedNodeRef::new_unchecked("http://www.w3.org/ns/sparql-service-description#Graph");
    pub const FUNCTION: NamedNodeRef<'_> =
        NamedNodeRef::new_unchecked("http://www.w3.org/ns/sparql-service-description#Function");

    pub const DEFAULT_DATASET: NamedNodeRef<'_> = NamedNodeRef::new_unchecked(
        "http://www.w3.org/ns/sparql-service-description#defaultDataset",
    );
    pub const DEFAULT_ENTAILMENT_REGIME: NamedNodeRef<'_> = NamedNodeRef::new_unchecked(
        "http://www.w3.org/ns/sparql-service-description#defaultEntailmentRegime",
    );
    pub const DEFAULT_GRAPH: NamedNodeRef<'_> = NamedNodeRef::new_unchecked(
        "http://www.w3.org/ns/sparql-service-description#defaultGraph",
    );
    pub const ENDPOINT: NamedNodeRef<'_> =
        NamedNodeRef::new_unchecked("http://www.w3.org/ns/sparql-service-description#endpoint");
    pub const EXTENSION_FUNCTION: NamedNodeRef<'_> = NamedNodeRef::new_unchecked(
        "http://www.w3.org/ns/sparql-service-description#extensionFunction",
    );
    pub const FEATURE: NamedNodeRef<'_> =
        NamedNodeRef::new_unchecked("http://www.w3.org/ns/sparql-service-description#feature");
    pub const RESULT_FORMAT: NamedNodeRef<'_> =
        NamedNodeRef::new_unchecked("http://www.w3.org/ns/sparql-service-description#resultFormat");
    pub const SUPPORTED_LANGUAGE: NamedNodeRef<'_> = NamedNodeRef::new_unchecked(
        "http://www.w3.org/ns/sparql-service-description#supportedLanguage",
    );

    pub const DEREFERENCES_URIS: NamedNodeRef<'_> = NamedNodeRef::new_unchecked(
        "http://www.w3.org/ns/sparql-service-description#DereferencesURIs",
    );
    pub const SPARQL_11_QUERY: NamedNodeRef<'_> = NamedNodeRef::new_unchecked(
        "http://www.w3.org/ns/sparql-service-description#SPARQL11Query",
    );
}

const DC_DESCRIPTION: NamedNodeRef<'_> =
    NamedNodeRef::new_unchecked("http://purl.org/dc/elements/1.1/description");
const ENT_RDFS: NamedNodeRef<'_> =
    NamedNodeRef::new_unchecked("http://www.w3.org/ns/entailment/RDFS");

/// What the service description says about the endpoint itself.
#[derive(Debug, Clone)]
pub struct EndpointDescription {
    pub public_url: NamedNode,
    pub title: String,
    pub description: String,
}

/// Serializes the SPARQL service description of the endpoint.
///
/// Every registered extension function is typed as `sd:Function` and linked from the service.
pub fn generate_service_description(
    format: RdfFormat,
    endpoint: &EndpointDescription,
    registry: &FunctionRegistry,
) -> anyhow::Result<Vec<u8>> {
    let root = endpoint.public_url.as_ref();
    let title = Literal::from(endpoint.title.as_str());
    let description = Literal::from(endpoint.description.replace('\n', ""));
    let dataset = BlankNode::default();
    let default_graph = BlankNode::default();
    let functions = registry.function_names().collect::<Vec<_>>();

    let mut graph = vec![
        TripleRef::new(root, rdf::TYPE, sd::SERVICE),
        TripleRef::new(root, rdfs::LABEL, &title),
        TripleRef::new(root, DC_DESCRIPTION, &description),
        TripleRef::new(root, sd::ENDPOINT, root),
        TripleRef::new(root, sd::SUPPORTED_LANGUAGE, sd::SPARQL_11_QUERY),
    ];
    for format in [QueryResultsFormat::Json, QueryResultsFormat::Csv] {
        graph.push(TripleRef::new(
            root,
            sd::RESULT_FORMAT,
            NamedNodeRef::new_unchecked(format.iri()),
        ));
    }
    graph.extend([
        TripleRef::new(root, sd::FEATURE, sd::DEREFERENCES_URIS),
        TripleRef::new(root, sd::DEFAULT_ENTAILMENT_REGIME, ENT_RDFS),
        TripleRef::new(root, sd::DEFAULT_DATASET, &dataset),
        TripleRef::new(&dataset, rdf::TYPE, sd::DATASET),
        TripleRef::new(&dataset, sd::DEFAULT_GRAPH, &default_graph),
        TripleRef::new(&default_graph, rdf::TYPE, sd::GRAPH),
    ]);
    for function in &functions {
        graph.push(TripleRef::new(function, rdf::TYPE, sd::FUNCTION));
        graph.push(TripleRef::new(root, sd::EXTENSION_FUNCTION, function));
    }

    let mut serializer = RdfSerializer::from_format(format)
        .with_prefix("sd", "http://www.w3.org/ns/sparql-service-description#")?
        .with_prefix("ent", "http://www.w3.org/ns/entailment/")?
        .with_prefix("dc", "http://purl.org/dc/elements/1.1/")?
        .with_prefix("rdfs", "http://www.w3.org/2000/01/rdf-schema#")?
        .for_writer(Vec::new());
    for t in graph {
        serializer.serialize_triple(t)?;
    }
    Ok(serializer.finish()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxigraph::io::RdfParser;
    use oxigraph::model::{Term, Triple};
    use sparext::ScalarFunction;

    fn description() -> EndpointDescription {
        EndpointDescription {
            public_url: NamedNode::new_unchecked("https://example.com/sparql"),
            title: "Test".into(),
            description: "A test\nendpoint".into(),
        }
    }

    fn parse(format: RdfFormat, data: &[u8]) -> Vec<Triple> {
        RdfParser::from_format(format)
            .for_slice(data)
            .map(|q| q.unwrap().into())
            .collect()
    }

    #[test]
    fn lists_extension_functions() -> anyhow::Result<()> {
        let function = NamedNode::new_unchecked("https://example.com/f");
        let mut registry = FunctionRegistry::new();
        registry.register(
            function.clone(),
            ScalarFunction::new(function.clone(), sparext::concat),
        );
        let triples = parse(
            RdfFormat::Turtle,
            &generate_service_description(RdfFormat::Turtle, &description(), &registry)?,
        );
        let root = description().public_url;
        assert!(triples.contains(&Triple::new(
            function.clone(),
            rdf::TYPE,
            sd::FUNCTION.into_owned()
        )));
        assert!(triples.contains(&Triple::new(
            root.clone(),
            sd::EXTENSION_FUNCTION.into_owned(),
            function
        )));
        assert!(triples.contains(&Triple::new(
            root,
            DC_DESCRIPTION.into_owned(),
            Literal::from("A testendpoint")
        )));
        Ok(())
    }

    #[test]
    fn rdf_xml() -> anyhow::Result<()> {
        let triples = parse(
            RdfFormat::RdfXml,
            &generate_service_description(
                RdfFormat::RdfXml,
                &description(),
                &FunctionRegistry::new(),
            )?,
        );
        assert!(triples.iter().any(|t| t.predicate == rdf::TYPE
            && t.object == Term::from(sd::SERVICE.into_owned())));
        assert!(
            triples
                .iter()
                .all(|t| t.predicate != sd::EXTENSION_FUNCTION)
        );
        Ok(())
    }
}
