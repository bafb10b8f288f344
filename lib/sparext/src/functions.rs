use crate::algebra::{BindExpression, Binding};
use crate::error::EvaluationError;
use crate::eval::ExtendState;
use crate::registry::CustomFunction;
use oxigraph::model::{Literal, NamedNode, Term};
use spargebra::algebra::Expression;

/// Adapts a function from argument values to a single value into a [`CustomFunction`].
///
/// Arguments are evaluated against the input binding: variables are looked up,
/// constants are used as is and other expressions go through the built-in evaluator.
/// The returned value is bound to the target variable of the `BIND`.
pub struct ScalarFunction<F> {
    iri: NamedNode,
    function: F,
}

impl<F: Fn(&[Term]) -> Result<Term, String> + Send + Sync> ScalarFunction<F> {
    pub fn new(iri: impl Into<NamedNode>, function: F) -> Self {
        Self {
            iri: iri.into(),
            function,
        }
    }

    fn argument(
        &self,
        state: &ExtendState,
        binding: &Binding,
        position: usize,
        argument: &Expression,
    ) -> Result<Term, EvaluationError> {
        let value = match argument {
            Expression::Variable(variable) => binding.get(variable).cloned(),
            Expression::NamedNode(node) => Some(node.clone().into()),
            Expression::Literal(literal) => Some(literal.clone().into()),
            expression => state.context.evaluate_expression(expression, binding)?,
        };
        value.ok_or_else(|| EvaluationError::InvalidArgument {
            function: self.iri.clone(),
            position,
        })
    }
}

impl<F: Fn(&[Term]) -> Result<Term, String> + Send + Sync> CustomFunction for ScalarFunction<F> {
    fn evaluate(
        &self,
        state: ExtendState,
        binding: &Binding,
    ) -> Result<ExtendState, EvaluationError> {
        let arguments = match &state.node.expression {
            BindExpression::FunctionCall { arguments, .. } => arguments
                .iter()
                .enumerate()
                .map(|(position, argument)| self.argument(&state, binding, position, argument))
                .collect::<Result<Vec<_>, _>>()?,
            BindExpression::Builtin(_) => Vec::new(),
        };
        let value = (self.function)(&arguments)
            .map_err(|message| EvaluationError::function(self.iri.clone(), message))?;
        let variable = state.node.variable.clone();
        Ok(state.push(binding.merge(variable, value)))
    }
}

/// Concatenates the lexical forms of its arguments into a simple literal.
///
/// ```
/// use oxigraph::model::{Literal, NamedNode};
///
/// assert_eq!(
///     sparext::concat(&[
///         Literal::from("First").into(),
///         Literal::new_language_tagged_literal("last", "en")?.into(),
///     ]),
///     Ok(Literal::from("Firstlast").into())
/// );
/// assert!(sparext::concat(&[NamedNode::new("http://example.com")?.into()]).is_err());
/// # Result::<_, Box<dyn std::error::Error>>::Ok(())
/// ```
pub fn concat(arguments: &[Term]) -> Result<Term, String> {
    let mut value = String::new();
    for argument in arguments {
        let Term::Literal(literal) = argument else {
            return Err(format!("{argument} is not a literal"));
        };
        value.push_str(literal.value());
    }
    Ok(Literal::from(value).into())
}
