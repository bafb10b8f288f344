use clap::{Parser, Subcommand, ValueEnum, ValueHint};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(about, version, name = "sparext")]
/// SPARQL endpoint with extension functions and negotiated result formats
pub struct Args {
    /// Format of the log lines written to stderr
    ///
    /// Log levels are selected with the RUST_LOG environment variable (default: info).
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Human)]
    pub log_format: LogFormat,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the SPARQL HTTP endpoint
    ///
    /// The given files are loaded into an in-memory store that is then served read-only.
    Serve {
        /// Host and port to listen to
        #[arg(short, long, default_value = "localhost:7878", value_hint = ValueHint::Hostname)]
        bind: String,
        /// Path of the SPARQL endpoint
        #[arg(long, default_value = "/")]
        path: String,
        /// File(s) to load at startup
        ///
        /// The format is guessed from the file extension unless --format is set.
        /// Files ending with .gz are decompressed on the fly.
        #[arg(short, long, num_args = 0.., value_hint = ValueHint::FilePath)]
        file: Vec<PathBuf>,
        /// The format of the file(s) to load
        ///
        /// It can be an extension like "nt" or a MIME type like "application/n-triples".
        #[arg(long)]
        format: Option<String>,
        /// Base IRI of the file(s) to load
        #[arg(long, value_hint = ValueHint::Url)]
        base: Option<String>,
        /// Title of the endpoint, shown in the query console and the service description
        #[arg(long, default_value = "SPARQL endpoint with extension functions")]
        title: String,
        /// Description of the endpoint, shown in the query console and the service description
        #[arg(
            long,
            default_value = "A SPARQL endpoint to serve custom functions implemented in Rust."
        )]
        description: String,
        /// Public URL of the endpoint, used as the subject of the service description
        #[arg(long, default_value = "https://your-endpoint/sparql", value_hint = ValueHint::Url)]
        public_url: String,
        /// Favicon of the query console
        #[arg(long, default_value = "https://rdflib.readthedocs.io/en/stable/_static/RDFlib.png", value_hint = ValueHint::Url)]
        favicon: String,
        /// Query shown when opening the query console
        #[arg(long)]
        example_query: Option<String>,
        /// JSON file with additional example queries for the query console
        ///
        /// The file contains an object mapping example names to objects with a "query" key.
        #[arg(long, value_hint = ValueHint::FilePath)]
        example_queries: Option<PathBuf>,
        /// Prefix declared for every query, as name=iri
        ///
        /// The rdf, rdfs, xsd and owl prefixes and the ones declared in the loaded files are always declared.
        #[arg(long, value_parser = parse_prefix)]
        prefix: Vec<(String, String)>,
        /// Maximal evaluation time of a query, in seconds
        #[arg(long, value_parser = parse_seconds)]
        query_timeout: Option<Duration>,
        /// Allows cross-origin requests
        #[arg(long)]
        cors: bool,
    },
    /// Evaluate a SPARQL query against the given file(s) and write the results to stdout
    ///
    /// The results format is negotiated from --accept in the same way the HTTP endpoint does it.
    Query {
        /// The SPARQL query to execute
        ///
        /// If no query or query file are given, stdin is used.
        #[arg(short, long, conflicts_with = "query_file")]
        query: Option<String>,
        /// File in which the query is stored
        #[arg(long, conflicts_with = "query", value_hint = ValueHint::FilePath)]
        query_file: Option<PathBuf>,
        /// File(s) to load before evaluating the query
        #[arg(short, long, num_args = 0.., value_hint = ValueHint::FilePath)]
        file: Vec<PathBuf>,
        /// The format of the file(s) to load
        #[arg(long)]
        format: Option<String>,
        /// Base IRI of the file(s) to load
        #[arg(long, value_hint = ValueHint::Url)]
        base: Option<String>,
        /// Media type the results should be written in
        ///
        /// Unknown media types fall back to application/xml.
        #[arg(long)]
        accept: Option<String>,
        /// Prefix declared for the query, as name=iri
        #[arg(long, value_parser = parse_prefix)]
        prefix: Vec<(String, String)>,
        /// Maximal evaluation time of the query, in seconds
        #[arg(long, value_parser = parse_seconds)]
        query_timeout: Option<Duration>,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum LogFormat {
    /// Human readable lines
    Human,
    /// One JSON object per line
    Json,
}

fn parse_prefix(value: &str) -> Result<(String, String), String> {
    let (name, iri) = value
        .split_once('=')
        .ok_or_else(|| format!("'{value}' should be of the form name=iri"))?;
    Ok((name.trim().to_owned(), iri.trim().to_owned()))
}

fn parse_seconds(value: &str) -> Result<Duration, String> {
    Duration::try_from_secs_f64(
        value
            .parse::<f64>()
            .map_err(|e| format!("Invalid number of seconds '{value}': {e}"))?,
    )
    .map_err(|e| format!("Invalid number of seconds '{value}': {e}"))
}
