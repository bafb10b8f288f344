#![doc = include_str!("../README.md")]
#![doc(test(attr(deny(warnings))))]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

mod algebra;
mod classify;
mod endpoint;
mod error;
mod eval;
mod functions;
mod negotiate;
mod registry;
mod results;

pub use crate::algebra::{AlgebraNode, BindExpression, Binding, BindingSet, ExtendNode};
pub use crate::classify::{NamespaceMap, OperationKind, algebra_name, classify};
pub use crate::endpoint::{QueryEndpoint, QueryResponse};
pub use crate::error::{EndpointError, EvaluationError, ParseError, SerializationError};
pub use crate::eval::{EvaluationContext, ExtendState, ExtensionEvaluator};
pub use crate::functions::{ScalarFunction, concat};
pub use crate::negotiate::{DEFAULT_CONTENT_TYPE, NegotiationResult, ResultFormat, negotiate};
pub use crate::registry::{CustomFunction, FunctionRegistry};
pub use crate::results::{QueryOutcome, serialize};
