use crate::algebra::Binding;
use crate::error::EvaluationError;
use crate::eval::ExtendState;
use oxigraph::model::NamedNode;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// An extension function called when a `BIND` expression calls its IRI.
///
/// The function gets the state of the `BIND` evaluation so far and the current
/// input binding. It returns the state the evaluation should continue with,
/// usually with one more binding appended to [`ExtendState::results`].
/// The shape of the returned bindings is not checked.
///
/// Closures with the same signature implement this trait.
pub trait CustomFunction: Send + Sync {
    fn evaluate(
        &self,
        state: ExtendState,
        binding: &Binding,
    ) -> Result<ExtendState, EvaluationError>;
}

impl<F> CustomFunction for F
where
    F: Fn(ExtendState, &Binding) -> Result<ExtendState, EvaluationError> + Send + Sync,
{
    fn evaluate(
        &self,
        state: ExtendState,
        binding: &Binding,
    ) -> Result<ExtendState, EvaluationError> {
        self(state, binding)
    }
}

/// Extension functions indexed by IRI.
///
/// The registry is filled during startup then shared behind an [`Arc`].
/// Only `&self` methods remain reachable once it is shared so readers never need a lock.
///
/// ```
/// use oxigraph::model::NamedNode;
/// use sparext::{FunctionRegistry, ScalarFunction};
///
/// let mut registry = FunctionRegistry::new();
/// let iri = NamedNode::new("http://example.com/concat")?;
/// registry.register(iri.clone(), ScalarFunction::new(iri.clone(), sparext::concat));
/// assert!(registry.lookup(&iri).is_some());
/// # Result::<_, Box<dyn std::error::Error>>::Ok(())
/// ```
#[derive(Default, Clone)]
pub struct FunctionRegistry {
    functions: BTreeMap<String, Arc<dyn CustomFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a function. A function already registered with the same IRI is replaced and returned.
    pub fn register(
        &mut self,
        iri: impl Into<NamedNode>,
        function: impl CustomFunction + 'static,
    ) -> Option<Arc<dyn CustomFunction>> {
        self.functions
            .insert(iri.into().into_string(), Arc::new(function))
    }

    pub fn lookup(&self, iri: &NamedNode) -> Option<&Arc<dyn CustomFunction>> {
        self.functions.get(iri.as_str())
    }

    pub fn contains(&self, iri: &NamedNode) -> bool {
        self.functions.contains_key(iri.as_str())
    }

    /// The IRIs of the registered functions, in lexicographic order.
    pub fn function_names(&self) -> impl Iterator<Item = NamedNode> + '_ {
        self.functions
            .keys()
            .map(|iri| NamedNode::new_unchecked(iri.clone()))
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.functions.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::ExtendNode;
    use crate::eval::EvaluationContext;
    use oxigraph::model::{Literal, Variable};
    use oxigraph::store::Store;
    use spargebra::algebra::{Expression, GraphPattern};

    fn constant(value: &'static str) -> impl CustomFunction {
        move |state: ExtendState, binding: &Binding| -> Result<ExtendState, EvaluationError> {
            let variable = state.node.variable.clone();
            Ok(state.push(binding.merge(variable, Literal::from(value))))
        }
    }

    #[test]
    fn last_registration_wins() {
        let iri = NamedNode::new_unchecked("http://example.com/f");
        let mut registry = FunctionRegistry::new();
        assert!(registry.register(iri.clone(), constant("a")).is_none());
        assert!(registry.register(iri.clone(), constant("b")).is_some());
        assert_eq!(registry.len(), 1);

        let state = ExtendState::new(
            EvaluationContext::new(Store::new().unwrap()),
            ExtendNode::new(
                GraphPattern::Bgp {
                    patterns: Vec::new(),
                },
                Variable::new_unchecked("x"),
                Expression::NamedNode(iri.clone()),
            ),
        );
        let state = registry
            .lookup(&iri)
            .unwrap()
            .evaluate(state, &Binding::new())
            .unwrap();
        assert_eq!(
            state.results[0].get(&Variable::new_unchecked("x")),
            Some(&Literal::from("b").into())
        );
    }

    #[test]
    fn names_are_sorted() {
        let mut registry = FunctionRegistry::new();
        registry.register(NamedNode::new_unchecked("http://example.com/b"), constant("b"));
        registry.register(NamedNode::new_unchecked("http://example.com/a"), constant("a"));
        assert_eq!(
            registry
                .function_names()
                .map(NamedNode::into_string)
                .collect::<Vec<_>>(),
            ["http://example.com/a", "http://example.com/b"]
        );
        assert!(!registry.contains(&NamedNode::new_unchecked("http://example.com/c")));
    }
}
