use crate::cli::{Args, Command, LogFormat};
use crate::health::HealthStatus;
use crate::service_description::{EndpointDescription, generate_service_description};
use anyhow::{Context, bail};
use clap::Parser;
use flate2::read::MultiGzDecoder;
use oxhttp::Server;
use oxhttp::model::{Body, HeaderName, HeaderValue, Method, Request, Response, Status};
use oxigraph::io::{RdfFormat, RdfParser};
use oxigraph::model::NamedNode;
use oxigraph::store::Store;
use serde_json::Value;
use sparext::{EndpointError, FunctionRegistry, NamespaceMap, QueryEndpoint, ScalarFunction};
use std::borrow::Cow;
use std::ffi::OsStr;
use std::fs::File;
use std::io::{self, Read, Write, stdin, stdout};
use std::net::ToSocketAddrs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::thread::available_parallelism;
use std::time::{Duration, Instant};
use std::{fmt, fs};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;
use url::form_urlencoded;

mod cli;
mod health;
mod service_description;

const MAX_SPARQL_BODY_SIZE: u64 = 0x0010_0000;
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);
const HTML_ROOT_PAGE: &str = include_str!("../templates/query.html");
const CUSTOM_CONCAT: &str = "https://w3id.org/um/sparql-functions/custom_concat";
const EXAMPLE_QUERY: &str = r#"PREFIX myfunctions: <https://w3id.org/um/sparql-functions/>

SELECT ?concat WHERE {
    BIND("First" AS ?first)
    BIND(myfunctions:custom_concat(?first, "last") AS ?concat)
}"#;

pub fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);
    match args.command {
        Command::Serve {
            bind,
            path,
            file,
            format,
            base,
            title,
            description,
            public_url,
            favicon,
            example_query,
            example_queries,
            prefix,
            query_timeout,
            cors,
        } => {
            health::init_start_time();
            let (store, mut prefixes) = load_store(&file, format.as_deref(), base.as_deref())?;
            prefixes.extend(prefix);
            let endpoint = build_endpoint(store, &prefixes, query_timeout)?;
            let example_queries = if let Some(example_queries) = example_queries {
                serde_json::from_reader(File::open(&example_queries).with_context(|| {
                    format!("Error while opening file {}", example_queries.display())
                })?)
                .with_context(|| {
                    format!(
                        "The example queries file {} is not valid JSON",
                        example_queries.display()
                    )
                })?
            } else {
                Value::Object(serde_json::Map::new())
            };
            let config = ConsoleConfig {
                path,
                favicon,
                example_query: example_query.unwrap_or_else(|| EXAMPLE_QUERY.into()),
                example_queries,
                description: EndpointDescription {
                    public_url: NamedNode::new(&public_url)
                        .with_context(|| format!("The public URL {public_url} is not a valid IRI"))?,
                    title,
                    description,
                },
            };
            serve(ServerState { endpoint, config }, &bind, cors)
        }
        Command::Query {
            query,
            query_file,
            file,
            format,
            base,
            accept,
            prefix,
            query_timeout,
        } => {
            let query = if let Some(query) = query {
                query
            } else if let Some(query_file) = query_file {
                fs::read_to_string(&query_file).with_context(|| {
                    format!("Not able to read query file {}", query_file.display())
                })?
            } else {
                io::read_to_string(stdin().lock())?
            };
            let (store, mut prefixes) = load_store(&file, format.as_deref(), base.as_deref())?;
            prefixes.extend(prefix);
            let endpoint = build_endpoint(store, &prefixes, query_timeout)?;
            let response = endpoint.query(&query, accept.as_deref())?;
            debug!("Results written as {}", response.media_type);
            let mut stdout = stdout().lock();
            stdout.write_all(&response.body)?;
            stdout.flush()?;
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr);
    match format {
        LogFormat::Human => subscriber.init(),
        LogFormat::Json => subscriber.json().init(),
    }
}

/// Registers the extension functions shipped with the binary.
fn register_default_functions(registry: &mut FunctionRegistry) {
    let custom_concat = NamedNode::new_unchecked(CUSTOM_CONCAT);
    registry.register(
        custom_concat.clone(),
        ScalarFunction::new(custom_concat, sparext::concat),
    );
}

fn build_endpoint(
    store: Store,
    prefixes: &[(String, String)],
    timeout: Option<Duration>,
) -> anyhow::Result<QueryEndpoint> {
    let mut registry = FunctionRegistry::new();
    register_default_functions(&mut registry);
    let mut namespaces = NamespaceMap::well_known();
    for (name, iri) in prefixes {
        NamedNode::new(iri).with_context(|| format!("The IRI of prefix {name} is invalid"))?;
        namespaces = namespaces.with_prefix(name, iri);
    }
    let mut endpoint = QueryEndpoint::new(store, Arc::new(registry)).with_namespaces(namespaces);
    if let Some(timeout) = timeout {
        endpoint = endpoint.with_timeout(timeout);
    }
    info!(
        "{} extension function(s) registered: {}",
        endpoint.registry().len(),
        endpoint
            .registry()
            .function_names()
            .map(NamedNode::into_string)
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(endpoint)
}

/// Loads the files into a new store and returns it with the prefixes declared in the files.
fn load_store(
    files: &[PathBuf],
    format: Option<&str>,
    base: Option<&str>,
) -> anyhow::Result<(Store, Vec<(String, String)>)> {
    let store = Store::new()?;
    let mut prefixes = Vec::new();
    let format = format.map(rdf_format_from_name).transpose()?;
    for file in files {
        let start = Instant::now();
        let fp = File::open(file)
            .with_context(|| format!("Error while opening file {}", file.display()))?;
        let result = if file.extension().is_some_and(|e| e == OsStr::new("gz")) {
            let format = match format {
                Some(format) => format,
                None => rdf_format_from_path(&file.with_extension(""))?,
            };
            load_file(&store, MultiGzDecoder::new(fp), format, base)
        } else {
            let format = match format {
                Some(format) => format,
                None => rdf_format_from_path(file)?,
            };
            load_file(&store, fp, format, base)
        };
        prefixes.extend(
            result.with_context(|| format!("Error while loading file {}", file.display()))?,
        );
        info!(
            "{} loaded in {}ms",
            file.display(),
            start.elapsed().as_millis()
        );
    }
    info!("The store contains {} triples", store.len()?);
    Ok((store, prefixes))
}

fn load_file(
    store: &Store,
    read: impl Read,
    format: RdfFormat,
    base_iri: Option<&str>,
) -> anyhow::Result<Vec<(String, String)>> {
    let mut parser = RdfParser::from_format(format).rename_blank_nodes();
    if let Some(base_iri) = base_iri {
        parser = parser
            .with_base_iri(base_iri)
            .with_context(|| format!("Invalid base IRI {base_iri}"))?;
    }
    let mut reader = parser.for_reader(read);
    let mut quads = Vec::new();
    for quad in reader.by_ref() {
        quads.push(quad?);
    }
    store.extend(quads)?;
    // Prefixes are complete once the whole file is parsed
    Ok(reader
        .prefixes()
        .map(|(name, iri)| (name.to_owned(), iri.to_owned()))
        .collect())
}

fn format_from_path<T>(
    path: &Path,
    from_extension: impl FnOnce(&str) -> anyhow::Result<T>,
) -> anyhow::Result<T> {
    if let Some(ext) = path.extension().and_then(OsStr::to_str) {
        from_extension(ext).map_err(|e| {
            e.context(format!(
                "Not able to guess the file format from file name extension '{ext}'"
            ))
        })
    } else {
        bail!(
            "The path {} has no extension to guess a file format from",
            path.display()
        )
    }
}

fn rdf_format_from_path(path: &Path) -> anyhow::Result<RdfFormat> {
    format_from_path(path, |ext| {
        RdfFormat::from_extension(ext)
            .with_context(|| format!("The file extension '{ext}' is unknown"))
    })
}

fn rdf_format_from_name(name: &str) -> anyhow::Result<RdfFormat> {
    if let Some(t) = RdfFormat::from_extension(name) {
        return Ok(t);
    }
    if let Some(t) = RdfFormat::from_media_type(name) {
        return Ok(t);
    }
    bail!("The file format '{name}' is unknown")
}

/// Settings of the pages served when a request carries no query.
struct ConsoleConfig {
    path: String,
    favicon: String,
    example_query: String,
    example_queries: Value,
    description: EndpointDescription,
}

struct ServerState {
    endpoint: QueryEndpoint,
    config: ConsoleConfig,
}

fn serve(state: ServerState, bind: &str, cors: bool) -> anyhow::Result<()> {
    let state = Arc::new(state);
    let mut server = if cors {
        Server::new(cors_middleware(move |request| {
            handle_request(request, &state).unwrap_or_else(|(status, message)| error(status, message))
        }))
    } else {
        Server::new(move |request| {
            handle_request(request, &state).unwrap_or_else(|(status, message)| error(status, message))
        })
    }
    .with_global_timeout(HTTP_TIMEOUT)
    .with_server_name(concat!("sparext/", env!("CARGO_PKG_VERSION")))?
    .with_max_concurrent_connections(available_parallelism()?.get() * 128);
    for socket in bind.to_socket_addrs()? {
        server = server.bind(socket);
    }
    let server = server.spawn()?;
    info!("Listening for requests at http://{bind}");
    server.join()?;
    Ok(())
}

fn cors_middleware(
    on_request: impl Fn(&mut Request) -> Response + Send + Sync + 'static,
) -> impl Fn(&mut Request) -> Response + Send + Sync + 'static {
    let origin = HeaderName::from_str("Origin").ok();
    let access_control_allow_origin = HeaderName::from_str("Access-Control-Allow-Origin").ok();
    let access_control_request_method = HeaderName::from_str("Access-Control-Request-Method").ok();
    let access_control_allow_method = HeaderName::from_str("Access-Control-Allow-Methods").ok();
    let access_control_request_headers =
        HeaderName::from_str("Access-Control-Request-Headers").ok();
    let access_control_allow_headers = HeaderName::from_str("Access-Control-Allow-Headers").ok();
    let star = HeaderValue::from_str("*").ok();
    move |request| {
        let has_origin = origin
            .as_ref()
            .is_some_and(|origin| request.header(origin).is_some());
        let mut response = if *request.method() == Method::OPTIONS {
            let mut response = Response::builder(Status::NO_CONTENT).build();
            for (request_header, allow_header) in [
                (&access_control_request_method, &access_control_allow_method),
                (&access_control_request_headers, &access_control_allow_headers),
            ] {
                if let (Some(request_header), Some(allow_header)) = (request_header, allow_header) {
                    if let Some(value) = request.header(request_header) {
                        response
                            .headers_mut()
                            .append(allow_header.clone(), value.clone());
                    }
                }
            }
            response
        } else {
            on_request(request)
        };
        if has_origin {
            if let (Some(name), Some(star)) = (&access_control_allow_origin, &star) {
                response.headers_mut().append(name.clone(), star.clone());
            }
        }
        response
    }
}

type HttpError = (Status, String);

fn handle_request(request: &mut Request, state: &ServerState) -> Result<Response, HttpError> {
    let path = request.url().path().to_owned();
    match (path.as_str(), request.method().as_ref()) {
        (path, "GET") if path == state.config.path => {
            let query = url_query_parameter(request, "query").map(Cow::into_owned);
            answer(request, state, query)
        }
        (path, "POST") if path == state.config.path => {
            let query = url_query_parameter(request, "query")
                .filter(|query| !query.is_empty())
                .map(Cow::into_owned);
            let query = if query.is_some() {
                query
            } else if content_type(request).as_deref() == Some("application/sparql-query") {
                Some(
                    io::read_to_string(request.body_mut().take(MAX_SPARQL_BODY_SIZE))
                        .map_err(bad_request)?,
                )
            } else {
                let mut buffer = Vec::new();
                request
                    .body_mut()
                    .take(MAX_SPARQL_BODY_SIZE)
                    .read_to_end(&mut buffer)
                    .map_err(bad_request)?;
                form_urlencoded::parse(&buffer)
                    .find(|(k, _)| k == "query")
                    .map(|(_, v)| v.into_owned())
            };
            answer(request, state, query)
        }
        ("/health", "GET") => {
            let body = HealthStatus::from_endpoint(&state.endpoint)
                .to_json()
                .map_err(internal_server_error)?;
            response(Status::OK, "application/json", body)
        }
        (path, method) => Err((
            Status::NOT_FOUND,
            format!("{method} {path} is not supported by this server"),
        )),
    }
}

fn answer(
    request: &Request,
    state: &ServerState,
    query: Option<String>,
) -> Result<Response, HttpError> {
    let accept = accept(request)?;
    let Some(query) = query.filter(|q| !q.is_empty()) else {
        return describe(state, accept.as_deref());
    };
    let answer = state
        .endpoint
        .query(&query, accept.as_deref())
        .map_err(|e| {
            error!("Error while answering a SPARQL query: {e}");
            endpoint_error(e)
        })?;
    response(Status::OK, answer.media_type, answer.body)
}

/// Serves the query console or the service description.
fn describe(state: &ServerState, accept: Option<&str>) -> Result<Response, HttpError> {
    let registry = state.endpoint.registry();
    match accept {
        Some(accept) if accept.starts_with("text/html") => {
            response(Status::OK, "text/html; charset=utf-8", console_page(&state.config))
        }
        Some("text/turtle") => response(
            Status::OK,
            "text/turtle",
            generate_service_description(RdfFormat::Turtle, &state.config.description, registry)
                .map_err(internal_server_error)?,
        ),
        _ => response(
            Status::OK,
            "application/xml",
            generate_service_description(RdfFormat::RdfXml, &state.config.description, registry)
                .map_err(internal_server_error)?,
        ),
    }
}

fn console_page(config: &ConsoleConfig) -> String {
    HTML_ROOT_PAGE
        .replace("$TITLE", &escape_html(&config.description.title))
        .replace("$DESCRIPTION", &escape_html(&config.description.description))
        .replace("$FAVICON", &escape_html(&config.favicon))
        .replace("$EXAMPLE_QUERIES", &script_value(&config.example_queries))
        .replace(
            "$EXAMPLE_QUERY",
            &script_value(&Value::from(config.example_query.as_str())),
        )
        .replace("$ENDPOINT", &script_value(&Value::from(config.path.as_str())))
}

fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// JSON value that is safe to inline in a `<script>` element.
fn script_value(value: &Value) -> String {
    value.to_string().replace("</", "<\\/")
}

fn endpoint_error(e: EndpointError) -> HttpError {
    let status = match e.status_code() {
        422 => Status::UNPROCESSABLE_CONTENT,
        _ => Status::BAD_REQUEST,
    };
    (status, e.to_string())
}

fn url_query_parameter<'a>(request: &'a Request, param: &str) -> Option<Cow<'a, str>> {
    request
        .url()
        .query_pairs()
        .find(|(k, _)| k == param)
        .map(|(_, v)| v)
}

fn accept(request: &Request) -> Result<Option<String>, HttpError> {
    request
        .header(&HeaderName::ACCEPT)
        .map(|value| {
            value
                .to_str()
                .map(|value| value.trim().to_owned())
                .map_err(|_| bad_request("The Accept header should be a valid ASCII string"))
        })
        .transpose()
}

fn content_type(request: &Request) -> Option<String> {
    let value = request.header(&HeaderName::CONTENT_TYPE)?.to_str().ok()?;
    Some(
        value
            .split_once(';')
            .map_or(value, |(b, _)| b)
            .trim()
            .to_ascii_lowercase(),
    )
}

fn response(
    status: Status,
    content_type: &'static str,
    body: impl Into<Body>,
) -> Result<Response, HttpError> {
    Ok(Response::builder(status)
        .with_header(HeaderName::CONTENT_TYPE, content_type)
        .map_err(internal_server_error)?
        .with_body(body))
}

fn error(status: Status, message: impl fmt::Display) -> Response {
    let body = serde_json::json!({ "message": message.to_string() }).to_string();
    match Response::builder(status).with_header(HeaderName::CONTENT_TYPE, "application/json") {
        Ok(response) => response.with_body(body),
        Err(_) => Response::builder(status).with_body(body),
    }
}

fn bad_request(message: impl fmt::Display) -> HttpError {
    (Status::BAD_REQUEST, message.to_string())
}

fn internal_server_error(message: impl fmt::Display) -> HttpError {
    error!("Internal server error: {message}");
    (Status::INTERNAL_SERVER_ERROR, message.to_string())
}
