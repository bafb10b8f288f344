use crate::algebra::{AlgebraNode, BindExpression, Binding, BindingSet, ExtendNode};
use crate::error::EvaluationError;
use crate::registry::{CustomFunction, FunctionRegistry};
use crate::results::QueryOutcome;
use oxigraph::model::{BlankNode, Literal, NamedNode, Term, Triple, Variable};
use oxigraph::sparql::{QueryResults, QuerySolution, SparqlEvaluator};
use oxigraph::store::Store;
use oxiri::Iri;
use spargebra::Query;
use spargebra::algebra::{Expression, GraphPattern, QueryDataset};
use spargebra::term::{GroundTerm, NamedNodePattern};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Blank nodes can not be written in a `VALUES` table so they are carried as IRIs with this prefix.
const SKOLEM_PREFIX: &str = "https://sparext.invalid/.well-known/genid/";

/// Handle on everything an evaluation step needs: the store, the query dataset and base IRI, and the deadline.
///
/// Cloning is cheap, the store is reference counted.
#[derive(Clone)]
pub struct EvaluationContext {
    store: Store,
    dataset: Option<QueryDataset>,
    base_iri: Option<Iri<String>>,
    deadline: Option<(Instant, Duration)>,
}

impl EvaluationContext {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            dataset: None,
            base_iri: None,
            deadline: None,
        }
    }

    /// Stops the evaluation with [`EvaluationError::Timeout`] once `timeout` has elapsed from now.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some((Instant::now() + timeout, timeout));
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn check_deadline(&self) -> Result<(), EvaluationError> {
        match self.deadline {
            Some((deadline, timeout)) if Instant::now() >= deadline => {
                Err(EvaluationError::Timeout(timeout))
            }
            _ => Ok(()),
        }
    }

    /// The same context with the dataset and base IRI of `query`.
    #[must_use]
    fn for_query(&self, query: &Query) -> Self {
        let base_iri = match query {
            Query::Select { base_iri, .. }
            | Query::Construct { base_iri, .. }
            | Query::Describe { base_iri, .. }
            | Query::Ask { base_iri, .. } => base_iri.clone(),
        };
        Self {
            store: self.store.clone(),
            dataset: query.dataset().cloned(),
            base_iri,
            deadline: self.deadline,
        }
    }

    /// Evaluates a graph pattern with the external evaluator.
    ///
    /// The solutions are produced lazily.
    pub fn evaluate_pattern(
        &self,
        pattern: GraphPattern,
    ) -> Result<impl Iterator<Item = Result<Binding, EvaluationError>> + use<>, EvaluationError>
    {
        let results = self.evaluate_query(Query::Select {
            dataset: self.dataset.clone(),
            pattern,
            base_iri: self.base_iri.clone(),
        })?;
        let QueryResults::Solutions(solutions) = results else {
            return Err(EvaluationError::NotImplemented("non tabular subquery"));
        };
        Ok(solutions.map(|solution| -> Result<Binding, EvaluationError> {
            Ok(Binding::from(solution?)
                .into_iter()
                .map(|(v, t)| (v, deskolemize(t)))
                .collect())
        }))
    }

    /// Tells if a graph pattern has at least one solution.
    pub fn ask(&self, pattern: GraphPattern) -> Result<bool, EvaluationError> {
        let results = self.evaluate_query(Query::Ask {
            dataset: self.dataset.clone(),
            pattern,
            base_iri: self.base_iri.clone(),
        })?;
        let QueryResults::Boolean(value) = results else {
            return Err(EvaluationError::NotImplemented("non boolean subquery"));
        };
        Ok(value)
    }

    /// Evaluates a built-in expression against a binding.
    ///
    /// Returns `None` if the expression raises an error.
    pub fn evaluate_expression(
        &self,
        expression: &Expression,
        binding: &Binding,
    ) -> Result<Option<Term>, EvaluationError> {
        let result = Variable::new_unchecked("__sparext_value");
        let inner = values_table(binding.variables().cloned().collect(), [binding])?;
        let pattern = GraphPattern::Project {
            inner: Box::new(GraphPattern::Extend {
                inner: Box::new(inner),
                variable: result.clone(),
                expression: expression.clone(),
            }),
            variables: vec![result.clone()],
        };
        let Some(binding) = self.evaluate_pattern(pattern)?.next().transpose()? else {
            return Ok(None);
        };
        Ok(binding.get(&result).cloned())
    }

    /// Evaluates a complete query with the external evaluator.
    pub fn evaluate_query(&self, query: Query) -> Result<QueryResults<'static>, EvaluationError> {
        self.check_deadline()?;
        Ok(SparqlEvaluator::new()
            .for_query(query)
            .on_store(&self.store)
            .execute()?)
    }
}

/// The state threaded through the evaluation of a `BIND` operator.
///
/// Each input binding turns the current state into a new one.
pub struct ExtendState {
    /// The bindings produced so far, in the order of the input bindings.
    pub results: BindingSet,
    pub context: EvaluationContext,
    pub node: ExtendNode,
}

impl ExtendState {
    pub fn new(context: EvaluationContext, node: ExtendNode) -> Self {
        Self {
            results: Vec::new(),
            context,
            node,
        }
    }

    /// Appends a binding to the results.
    #[must_use]
    pub fn push(mut self, binding: Binding) -> Self {
        self.results.push(binding);
        self
    }
}

enum ExtendStep {
    Function(Arc<dyn CustomFunction>),
    Builtin(Expression),
}

/// Evaluates `BIND` operators with the registered extension functions.
///
/// The operators combining their results with the rest of the query are joined in memory,
/// everything else is left to the external evaluator.
#[derive(Debug, Clone)]
pub struct ExtensionEvaluator {
    registry: Arc<FunctionRegistry>,
}

impl ExtensionEvaluator {
    pub fn new(registry: Arc<FunctionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    /// Evaluates an `Extend` node.
    ///
    /// The child pattern is evaluated by the external evaluator then each of its
    /// solutions goes through the registered function or the built-in expression.
    /// The output keeps the order of the child solutions.
    pub fn evaluate_extend(
        &self,
        context: &EvaluationContext,
        node: AlgebraNode,
    ) -> Result<BindingSet, EvaluationError> {
        let node = match node {
            AlgebraNode::Extend(node) => node,
            other => return Err(EvaluationError::NotImplemented(other.name())),
        };
        let solutions = context.evaluate_pattern(node.inner.clone())?;
        self.extend_solutions(context, node, solutions)
    }

    fn extend_solutions(
        &self,
        context: &EvaluationContext,
        node: ExtendNode,
        solutions: impl IntoIterator<Item = Result<Binding, EvaluationError>>,
    ) -> Result<BindingSet, EvaluationError> {
        let step = match &node.expression {
            BindExpression::FunctionCall { function, .. } => ExtendStep::Function(Arc::clone(
                self.registry
                    .lookup(function)
                    .ok_or_else(|| EvaluationError::UnknownFunction(function.clone()))?,
            )),
            BindExpression::Builtin(expression) => ExtendStep::Builtin(expression.clone()),
        };
        let state = solutions.into_iter().try_fold(
            ExtendState::new(context.clone(), node),
            |state: ExtendState,
             binding: Result<Binding, EvaluationError>|
             -> Result<ExtendState, EvaluationError> {
                state.context.check_deadline()?;
                let binding = binding?;
                match &step {
                    ExtendStep::Function(function) => function.evaluate(state, &binding),
                    ExtendStep::Builtin(expression) => {
                        let variable = state.node.variable.clone();
                        let value = state
                            .context
                            .evaluate_expression(expression, &binding.forget(&variable))?
                            .ok_or_else(|| EvaluationError::Expression {
                                variable: variable.clone(),
                            })?;
                        Ok(state.push(binding.merge(variable, value)))
                    }
                }
            },
        )?;
        Ok(state.results)
    }

    /// Replaces each `BIND` calling an extension function by a `VALUES` table holding its evaluation.
    ///
    /// Operators combining an evaluated table with other patterns are evaluated too,
    /// so that blank nodes of the store are only compared with each other.
    /// Built-in `BIND`s are checked for evaluation errors.
    /// Patterns under `SERVICE` and the ones inside expressions are left untouched.
    pub fn rewrite_query(
        &self,
        context: &EvaluationContext,
        query: Query,
    ) -> Result<Query, EvaluationError> {
        let context = context.for_query(&query);
        self.rewrite(&context, query)
    }

    /// Evaluates a query and collects all its results.
    pub fn execute(
        &self,
        context: &EvaluationContext,
        query: Query,
    ) -> Result<QueryOutcome, EvaluationError> {
        let context = context.for_query(&query);
        let query = self.rewrite(&context, query)?;
        Ok(match context.evaluate_query(query)? {
            QueryResults::Solutions(solutions) => {
                let variables = solutions.variables().to_vec();
                let solutions = solutions
                    .map(|solution| -> Result<QuerySolution, EvaluationError> {
                        context.check_deadline()?;
                        Ok(deskolemize_solution(solution?))
                    })
                    .collect::<Result<Vec<_>, EvaluationError>>()?;
                QueryOutcome::Solutions {
                    variables,
                    solutions,
                }
            }
            QueryResults::Boolean(value) => QueryOutcome::Boolean(value),
            QueryResults::Graph(triples) => QueryOutcome::Graph(
                triples
                    .map(|triple| -> Result<Triple, EvaluationError> {
                        context.check_deadline()?;
                        Ok(deskolemize_triple(triple?))
                    })
                    .collect::<Result<Vec<_>, EvaluationError>>()?,
            ),
        })
    }

    fn rewrite(&self, context: &EvaluationContext, query: Query) -> Result<Query, EvaluationError> {
        Ok(match query {
            Query::Select {
                dataset,
                pattern,
                base_iri,
            } => Query::Select {
                dataset,
                pattern: self.rewrite_pattern(context, None, pattern)?.into_pattern()?,
                base_iri,
            },
            Query::Construct {
                template,
                dataset,
                pattern,
                base_iri,
            } => Query::Construct {
                template,
                dataset,
                pattern: self.rewrite_pattern(context, None, pattern)?.into_pattern()?,
                base_iri,
            },
            Query::Describe {
                dataset,
                pattern,
                base_iri,
            } => Query::Describe {
                dataset,
                pattern: self.rewrite_pattern(context, None, pattern)?.into_pattern()?,
                base_iri,
            },
            Query::Ask {
                dataset,
                pattern,
                base_iri,
            } => Query::Ask {
                dataset,
                pattern: self.rewrite_pattern(context, None, pattern)?.into_pattern()?,
                base_iri,
            },
        })
    }

    /// Rewrites `pattern`, evaluated in the graph `graph` if set.
    fn rewrite_pattern(
        &self,
        context: &EvaluationContext,
        graph: Option<&NamedNodePattern>,
        pattern: GraphPattern,
    ) -> Result<Rewritten, EvaluationError> {
        Ok(match pattern {
            GraphPattern::Extend {
                inner,
                variable,
                expression,
            } => {
                let node = ExtendNode::new(*inner, variable, expression);
                let inner = self.rewrite_pattern(context, graph, node.inner.clone())?;
                if node.expression.function().is_some() {
                    self.rewrite_function_call(context, graph, node, inner)?
                } else {
                    rewrite_builtin(context, graph, node, inner)?
                }
            }
            GraphPattern::Join { left, right } => match (
                self.rewrite_pattern(context, graph, *left)?,
                self.rewrite_pattern(context, graph, *right)?,
            ) {
                (Rewritten::Pattern(left), Rewritten::Pattern(right)) => {
                    Rewritten::Pattern(GraphPattern::Join {
                        left: Box::new(left),
                        right: Box::new(right),
                    })
                }
                (left, right) => {
                    let (left_variables, left) = left.evaluate(context, graph)?;
                    let (right_variables, right) = right.evaluate(context, graph)?;
                    Rewritten::Solutions {
                        variables: union_variables(left_variables, right_variables),
                        solutions: join(&left, &right),
                    }
                }
            },
            GraphPattern::LeftJoin {
                left,
                right,
                expression,
            } => match (
                self.rewrite_pattern(context, graph, *left)?,
                self.rewrite_pattern(context, graph, *right)?,
            ) {
                (Rewritten::Pattern(left), Rewritten::Pattern(right)) => {
                    Rewritten::Pattern(GraphPattern::LeftJoin {
                        left: Box::new(left),
                        right: Box::new(right),
                        expression,
                    })
                }
                (left, right) => {
                    let (left_variables, left) = left.evaluate(context, graph)?;
                    let (right_variables, right) = right.evaluate(context, graph)?;
                    Rewritten::Solutions {
                        variables: union_variables(left_variables, right_variables),
                        solutions: left_join(context, &left, &right, expression.as_ref())?,
                    }
                }
            },
            GraphPattern::Minus { left, right } => match (
                self.rewrite_pattern(context, graph, *left)?,
                self.rewrite_pattern(context, graph, *right)?,
            ) {
                (Rewritten::Pattern(left), Rewritten::Pattern(right)) => {
                    Rewritten::Pattern(GraphPattern::Minus {
                        left: Box::new(left),
                        right: Box::new(right),
                    })
                }
                (left, right) => {
                    let (variables, left) = left.evaluate(context, graph)?;
                    let (_, right) = right.evaluate(context, graph)?;
                    Rewritten::Solutions {
                        variables,
                        solutions: minus(left, &right),
                    }
                }
            },
            GraphPattern::Union { left, right } => match (
                self.rewrite_pattern(context, graph, *left)?,
                self.rewrite_pattern(context, graph, *right)?,
            ) {
                (Rewritten::Pattern(left), Rewritten::Pattern(right)) => {
                    Rewritten::Pattern(GraphPattern::Union {
                        left: Box::new(left),
                        right: Box::new(right),
                    })
                }
                (left, right) => {
                    let (left_variables, mut solutions) = left.evaluate(context, graph)?;
                    let (right_variables, right) = right.evaluate(context, graph)?;
                    solutions.extend(right);
                    Rewritten::Solutions {
                        variables: union_variables(left_variables, right_variables),
                        solutions,
                    }
                }
            },
            GraphPattern::Graph { name, inner } => {
                match self.rewrite_pattern(context, Some(&name), *inner)? {
                    Rewritten::Pattern(inner) => Rewritten::Pattern(GraphPattern::Graph {
                        name,
                        inner: Box::new(inner),
                    }),
                    Rewritten::Solutions {
                        variables,
                        solutions,
                    } => match &name {
                        NamedNodePattern::Variable(graph_variable)
                            if !solutions.iter().all(|s| s.contains(graph_variable)) =>
                        {
                            // Solutions evaluated in another graph are repeated for each named graph
                            let (graph_variables, graphs) = Rewritten::Pattern(GraphPattern::Bgp {
                                patterns: Vec::new(),
                            })
                            .evaluate(context, Some(&name))?;
                            Rewritten::Solutions {
                                variables: union_variables(variables, graph_variables),
                                solutions: join(&solutions, &graphs),
                            }
                        }
                        _ => Rewritten::Solutions {
                            variables,
                            solutions,
                        },
                    },
                }
            }
            GraphPattern::Filter { expr, inner } => self
                .rewrite_pattern(context, graph, *inner)?
                .apply(context, |inner| GraphPattern::Filter {
                    expr,
                    inner: Box::new(inner),
                })?,
            GraphPattern::OrderBy { inner, expression } => self
                .rewrite_pattern(context, graph, *inner)?
                .apply(context, |inner| GraphPattern::OrderBy {
                    inner: Box::new(inner),
                    expression,
                })?,
            GraphPattern::Project {
                inner,
                mut variables,
            } => {
                let inner = self.rewrite_pattern(context, graph, *inner)?;
                if let (Some(NamedNodePattern::Variable(graph_variable)), Rewritten::Solutions { .. }) =
                    (graph, &inner)
                {
                    // Keeps track of the graph each evaluated solution comes from
                    if !variables.contains(graph_variable) {
                        variables.push(graph_variable.clone());
                    }
                }
                inner.apply(context, |inner| GraphPattern::Project {
                    inner: Box::new(inner),
                    variables,
                })?
            }
            GraphPattern::Distinct { inner } => self
                .rewrite_pattern(context, graph, *inner)?
                .apply(context, |inner| GraphPattern::Distinct {
                    inner: Box::new(inner),
                })?,
            GraphPattern::Reduced { inner } => self
                .rewrite_pattern(context, graph, *inner)?
                .apply(context, |inner| GraphPattern::Reduced {
                    inner: Box::new(inner),
                })?,
            GraphPattern::Slice {
                inner,
                start,
                length,
            } => self
                .rewrite_pattern(context, graph, *inner)?
                .apply(context, |inner| GraphPattern::Slice {
                    inner: Box::new(inner),
                    start,
                    length,
                })?,
            GraphPattern::Group {
                inner,
                mut variables,
                aggregates,
            } => {
                let inner = self.rewrite_pattern(context, graph, *inner)?;
                if let (Some(NamedNodePattern::Variable(graph_variable)), Rewritten::Solutions { .. }) =
                    (graph, &inner)
                {
                    if !variables.contains(graph_variable) {
                        variables.push(graph_variable.clone());
                    }
                }
                inner.apply(context, |inner| GraphPattern::Group {
                    inner: Box::new(inner),
                    variables,
                    aggregates,
                })?
            }
            // Triple patterns, paths, VALUES and SERVICE
            pattern => Rewritten::Pattern(pattern),
        })
    }

    /// Evaluates a `BIND` calling an extension function on the solutions of its rewritten child.
    fn rewrite_function_call(
        &self,
        context: &EvaluationContext,
        graph: Option<&NamedNodePattern>,
        node: ExtendNode,
        inner: Rewritten,
    ) -> Result<Rewritten, EvaluationError> {
        debug!(
            "Evaluating BIND of {} with {}",
            node.variable,
            node.expression.function().map_or("", NamedNode::as_str)
        );
        let (mut variables, solutions) = inner.evaluate(context, graph)?;
        let target = node.variable.clone();
        let solutions = self.extend_solutions(context, node, solutions.into_iter().map(Ok))?;
        if !variables.contains(&target) {
            variables.push(target);
        }
        for variable in solutions.iter().flat_map(Binding::variables) {
            if !variables.contains(variable) {
                variables.push(variable.clone());
            }
        }
        Ok(Rewritten::Solutions {
            variables,
            solutions,
        })
    }
}

/// A pattern during the rewriting of a query.
enum Rewritten {
    /// Left to the external evaluator. It does not contain any evaluated table.
    Pattern(GraphPattern),
    /// Already evaluated solutions, holding the blank nodes of the store.
    Solutions {
        variables: Vec<Variable>,
        solutions: BindingSet,
    },
}

impl Rewritten {
    /// The pattern handed to the external evaluator, with the evaluated solutions inlined.
    fn into_pattern(self) -> Result<GraphPattern, EvaluationError> {
        match self {
            Self::Pattern(pattern) => Ok(pattern),
            Self::Solutions {
                variables,
                solutions,
            } => values_table(variables, &solutions),
        }
    }

    /// Evaluates the pattern in the graph `graph` if it is not evaluated yet.
    fn evaluate(
        self,
        context: &EvaluationContext,
        graph: Option<&NamedNodePattern>,
    ) -> Result<(Vec<Variable>, BindingSet), EvaluationError> {
        match self {
            Self::Solutions {
                variables,
                solutions,
            } => Ok((variables, solutions)),
            Self::Pattern(pattern) => {
                let pattern = match graph {
                    Some(name) => GraphPattern::Graph {
                        name: name.clone(),
                        inner: Box::new(pattern),
                    },
                    None => pattern,
                };
                let variables = in_scope_variables(&pattern);
                let solutions = context
                    .evaluate_pattern(pattern)?
                    .collect::<Result<BindingSet, _>>()?;
                Ok((variables, solutions))
            }
        }
    }

    /// Wraps the pattern into `operator`, evaluating it at once if the pattern holds evaluated solutions.
    fn apply(
        self,
        context: &EvaluationContext,
        operator: impl FnOnce(GraphPattern) -> GraphPattern,
    ) -> Result<Self, EvaluationError> {
        match self {
            Self::Pattern(pattern) => Ok(Self::Pattern(operator(pattern))),
            Self::Solutions {
                variables,
                solutions,
            } => {
                let pattern = operator(values_table(variables, &solutions)?);
                let variables = in_scope_variables(&pattern);
                let solutions = context
                    .evaluate_pattern(pattern)?
                    .collect::<Result<BindingSet, _>>()?;
                Ok(Self::Solutions {
                    variables,
                    solutions,
                })
            }
        }
    }
}

/// Checks that a built-in `BIND` does not raise an error on any solution of its child.
fn rewrite_builtin(
    context: &EvaluationContext,
    graph: Option<&NamedNodePattern>,
    node: ExtendNode,
    inner: Rewritten,
) -> Result<Rewritten, EvaluationError> {
    let variable = node.variable;
    let expression = Expression::from(node.expression);
    // Copying an unbound variable is not an error, aggregates without value are projected this way
    let checked = !matches!(expression, Expression::Variable(_));
    let extend = |inner: GraphPattern| GraphPattern::Extend {
        inner: Box::new(inner),
        variable: variable.clone(),
        expression: expression.clone(),
    };
    match inner {
        Rewritten::Pattern(inner) => {
            let extended = extend(inner);
            if !checked {
                return Ok(Rewritten::Pattern(extended));
            }
            let scoped = match graph {
                Some(name) => GraphPattern::Graph {
                    name: name.clone(),
                    inner: Box::new(extended.clone()),
                },
                None => extended.clone(),
            };
            // An expression error leaves the target unbound
            if context.ask(GraphPattern::Filter {
                expr: Expression::Not(Box::new(Expression::Bound(variable.clone()))),
                inner: Box::new(scoped),
            })? {
                return Err(EvaluationError::Expression { variable });
            }
            Ok(Rewritten::Pattern(extended))
        }
        inner @ Rewritten::Solutions { .. } => {
            let extended = inner.apply(context, extend)?;
            if let Rewritten::Solutions { solutions, .. } = &extended {
                if checked && !solutions.iter().all(|s| s.contains(&variable)) {
                    return Err(EvaluationError::Expression { variable });
                }
            }
            Ok(extended)
        }
    }
}

fn in_scope_variables(pattern: &GraphPattern) -> Vec<Variable> {
    let mut variables = Vec::new();
    pattern.on_in_scope_variable(|variable| {
        if !variables.contains(variable) {
            variables.push(variable.clone());
        }
    });
    variables
}

fn union_variables(mut left: Vec<Variable>, right: Vec<Variable>) -> Vec<Variable> {
    for variable in right {
        if !left.contains(&variable) {
            left.push(variable);
        }
    }
    left
}

fn compatible(left: &Binding, right: &Binding) -> bool {
    left.iter()
        .all(|(variable, term)| right.get(variable).is_none_or(|other| other == term))
}

fn merge_bindings(left: &Binding, right: &Binding) -> Binding {
    right
        .iter()
        .fold(left.clone(), |binding, (variable, term)| {
            binding.merge(variable.clone(), term.clone())
        })
}

fn join(left: &[Binding], right: &[Binding]) -> BindingSet {
    left.iter()
        .flat_map(|l| {
            right
                .iter()
                .filter(|r| compatible(l, r))
                .map(|r| merge_bindings(l, r))
        })
        .collect()
}

fn left_join(
    context: &EvaluationContext,
    left: &[Binding],
    right: &[Binding],
    expression: Option<&Expression>,
) -> Result<BindingSet, EvaluationError> {
    let candidates = left
        .iter()
        .enumerate()
        .flat_map(|(position, l)| {
            right
                .iter()
                .filter(|r| compatible(l, r))
                .map(move |r| (position, merge_bindings(l, r)))
        })
        .collect::<Vec<_>>();
    let kept = match expression {
        Some(expression) => filter_rows(
            context,
            expression,
            candidates.iter().map(|(_, binding)| binding),
        )?,
        None => vec![true; candidates.len()],
    };
    let mut results = Vec::new();
    let mut candidates = candidates.into_iter().zip(kept).peekable();
    for (position, l) in left.iter().enumerate() {
        let mut matched = false;
        while let Some(((_, binding), keep)) =
            candidates.next_if(|((candidate, _), _)| *candidate == position)
        {
            if keep {
                results.push(binding);
                matched = true;
            }
        }
        if !matched {
            results.push(l.clone());
        }
    }
    Ok(results)
}

/// Tells for each row if `expression` evaluates to true on it.
fn filter_rows<'a>(
    context: &EvaluationContext,
    expression: &Expression,
    rows: impl Iterator<Item = &'a Binding>,
) -> Result<Vec<bool>, EvaluationError> {
    let position = Variable::new_unchecked("__sparext_row");
    let mut variables = vec![position.clone()];
    let mut indexed = Vec::new();
    for (i, row) in rows.enumerate() {
        for variable in row.variables() {
            if !variables.contains(variable) {
                variables.push(variable.clone());
            }
        }
        indexed.push(row.merge(position.clone(), Literal::from(i.to_string())));
    }
    let mut kept = vec![false; indexed.len()];
    let pattern = GraphPattern::Project {
        inner: Box::new(GraphPattern::Filter {
            expr: expression.clone(),
            inner: Box::new(values_table(variables, &indexed)?),
        }),
        variables: vec![position.clone()],
    };
    for solution in context.evaluate_pattern(pattern)? {
        if let Some(Term::Literal(value)) = solution?.get(&position) {
            if let Some(keep) = value
                .value()
                .parse::<usize>()
                .ok()
                .and_then(|i| kept.get_mut(i))
            {
                *keep = true;
            }
        }
    }
    Ok(kept)
}

fn minus(left: BindingSet, right: &[Binding]) -> BindingSet {
    left.into_iter()
        .filter(|l| {
            !right.iter().any(|r| {
                compatible(l, r) && l.variables().any(|variable| r.contains(variable))
            })
        })
        .collect()
}

fn values_table<'a>(
    variables: Vec<Variable>,
    solutions: impl IntoIterator<Item = &'a Binding>,
) -> Result<GraphPattern, EvaluationError> {
    let bindings = solutions
        .into_iter()
        .map(|binding| {
            variables
                .iter()
                .map(|variable| binding.get(variable).cloned().map(skolemize).transpose())
                .collect::<Result<Vec<_>, _>>()
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(GraphPattern::Values {
        variables,
        bindings,
    })
}

fn skolemize(term: Term) -> Result<GroundTerm, EvaluationError> {
    let term = match term {
        Term::BlankNode(node) => {
            Term::from(NamedNode::new_unchecked(format!("{SKOLEM_PREFIX}{}", node.as_str())))
        }
        term => term,
    };
    match term {
        Term::NamedNode(node) => Ok(node.into()),
        Term::Literal(literal) => Ok(literal.into()),
        _ => Err(EvaluationError::NotImplemented("triple term in BIND input")),
    }
}

fn deskolemize(term: Term) -> Term {
    if let Term::NamedNode(node) = &term {
        if let Some(id) = node.as_str().strip_prefix(SKOLEM_PREFIX) {
            return BlankNode::new_unchecked(id).into();
        }
    }
    term
}

fn deskolemize_solution(solution: QuerySolution) -> QuerySolution {
    let variables = solution.variables().to_vec();
    let values = solution
        .values()
        .iter()
        .map(|value| value.clone().map(deskolemize))
        .collect::<Vec<_>>();
    (variables, values).into()
}

fn deskolemize_triple(triple: Triple) -> Triple {
    let object = deskolemize(triple.object);
    match deskolemize(triple.subject.clone().into()) {
        Term::BlankNode(subject) => Triple::new(subject, triple.predicate, object),
        _ => Triple::new(triple.subject, triple.predicate, object),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::{ScalarFunction, concat};
    use oxigraph::io::RdfFormat;
    use spargebra::SparqlParser;

    const CONCAT: &str = "http://example.com/concat";

    fn var(name: &str) -> Variable {
        Variable::new_unchecked(name)
    }

    fn store() -> Store {
        let store = Store::new().unwrap();
        store
            .load_from_reader(
                RdfFormat::Turtle,
                r#"
                @prefix ex: <http://example.com/> .
                ex:a ex:name "a" ; ex:rank 1 .
                ex:b ex:name "b" ; ex:rank 2 .
                ex:c ex:name "c" ; ex:rank 3 .
                _:n ex:name "blank" ; ex:weight 5 .
                "#
                .as_bytes(),
            )
            .unwrap();
        store
    }

    fn evaluator() -> ExtensionEvaluator {
        let mut registry = FunctionRegistry::new();
        let iri = NamedNode::new_unchecked(CONCAT);
        registry.register(iri.clone(), ScalarFunction::new(iri, concat));
        ExtensionEvaluator::new(Arc::new(registry))
    }

    fn extend_node(query: &str) -> ExtendNode {
        let query = SparqlParser::new().parse_query(query).unwrap();
        let Query::Select { pattern, .. } = query else {
            unreachable!()
        };
        let GraphPattern::Project { inner, .. } = pattern else {
            unreachable!()
        };
        let AlgebraNode::Extend(node) = AlgebraNode::from(*inner) else {
            unreachable!()
        };
        node
    }

    #[test]
    fn other_nodes_are_not_implemented() {
        let error = evaluator()
            .evaluate_extend(
                &EvaluationContext::new(store()),
                GraphPattern::Bgp {
                    patterns: Vec::new(),
                }
                .into(),
            )
            .unwrap_err();
        assert!(matches!(error, EvaluationError::NotImplemented("BGP")));
    }

    #[test]
    fn builtin_keeps_child_order() {
        let node = extend_node(
            "SELECT * WHERE { { SELECT ?r WHERE { ?s <http://example.com/rank> ?r } ORDER BY DESC(?r) } BIND(?r * 10 AS ?x) }",
        );
        let results = evaluator()
            .evaluate_extend(&EvaluationContext::new(store()), node.into())
            .unwrap();
        assert_eq!(
            results
                .iter()
                .map(|binding| binding.get(&var("x")).cloned())
                .collect::<Vec<_>>(),
            [30, 20, 10].map(|v| Some(Literal::from(v).into()))
        );
    }

    #[test]
    fn builtin_does_not_see_its_target() {
        let node = ExtendNode::new(
            GraphPattern::Values {
                variables: vec![var("x")],
                bindings: vec![vec![Some(Literal::from("old").into())]],
            },
            var("x"),
            Expression::Bound(var("x")),
        );
        let results = evaluator()
            .evaluate_extend(&EvaluationContext::new(store()), node.into())
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(
            results[0].get(&var("x")),
            Some(&Literal::from(false).into())
        );
    }

    #[test]
    fn builtin_errors_fail_the_evaluation() {
        let node = extend_node(
            "SELECT * WHERE { ?s <http://example.com/name> ?n BIND(?n + 1 AS ?x) }",
        );
        assert!(matches!(
            evaluator().evaluate_extend(&EvaluationContext::new(store()), node.into()),
            Err(EvaluationError::Expression { variable }) if variable == var("x")
        ));
    }

    #[test]
    fn custom_function_keeps_child_order() {
        let node = extend_node(
            "SELECT * WHERE { { SELECT ?n WHERE { ?s <http://example.com/rank> ?r ; <http://example.com/name> ?n } ORDER BY ?r } BIND(<http://example.com/concat>(?n, \"!\") AS ?x) }",
        );
        let results = evaluator()
            .evaluate_extend(&EvaluationContext::new(store()), node.into())
            .unwrap();
        assert_eq!(
            results
                .iter()
                .map(|binding| binding.get(&var("x")).cloned())
                .collect::<Vec<_>>(),
            ["a!", "b!", "c!"].map(|v| Some(Literal::from(v).into()))
        );
    }

    #[test]
    fn unknown_function() {
        let node = extend_node(
            "SELECT * WHERE { BIND(<http://example.com/unknown>(1) AS ?x) }",
        );
        assert!(matches!(
            evaluator().evaluate_extend(&EvaluationContext::new(store()), node.into()),
            Err(EvaluationError::UnknownFunction(f)) if f.as_str() == "http://example.com/unknown"
        ));
    }

    #[test]
    fn timeout() {
        let node = extend_node(
            "SELECT * WHERE { ?s ?p ?o BIND(<http://example.com/concat>(?o, ?o) AS ?x) }",
        );
        let context = EvaluationContext::new(store()).with_timeout(Duration::ZERO);
        assert!(matches!(
            evaluator().evaluate_extend(&context, node.into()),
            Err(EvaluationError::Timeout(_))
        ));
    }

    #[test]
    fn rewritten_query_keeps_blank_nodes() {
        let query = SparqlParser::new()
            .parse_query(
                "SELECT ?s ?x WHERE { ?s <http://example.com/name> \"blank\" BIND(<http://example.com/concat>(\"x\", \"y\") AS ?x) }",
            )
            .unwrap();
        let outcome = evaluator()
            .execute(&EvaluationContext::new(store()), query)
            .unwrap();
        let QueryOutcome::Solutions { solutions, .. } = outcome else {
            unreachable!()
        };
        assert_eq!(solutions.len(), 1);
        assert!(matches!(solutions[0].get("s"), Some(Term::BlankNode(_))));
        assert_eq!(solutions[0].get("x"), Some(&Literal::from("xy").into()));
    }

    #[test]
    fn rewrite_replaces_custom_calls_only() {
        let query = SparqlParser::new()
            .parse_query(
                "SELECT ?a WHERE { BIND(\"a\" AS ?a) } ORDER BY ?a",
            )
            .unwrap();
        assert_eq!(
            evaluator()
                .rewrite_query(&EvaluationContext::new(store()), query.clone())
                .unwrap(),
            query
        );

        let query = SparqlParser::new()
            .parse_query(
                "SELECT * WHERE { BIND(\"a\" AS ?a) BIND(<http://example.com/concat>(?a, \"b\") AS ?b) BIND(STR(?b) AS ?c) }",
            )
            .unwrap();
        let Query::Select { pattern, .. } = evaluator()
            .rewrite_query(&EvaluationContext::new(store()), query)
            .unwrap()
        else {
            unreachable!()
        };
        let GraphPattern::Values {
            variables,
            bindings,
        } = pattern
        else {
            unreachable!()
        };
        assert_eq!(variables, [var("a"), var("b"), var("c")]);
        assert_eq!(
            bindings,
            [vec![
                Some(GroundTerm::from(Literal::from("a"))),
                Some(GroundTerm::from(Literal::from("ab"))),
                Some(GroundTerm::from(Literal::from("ab"))),
            ]]
        );
    }

    fn select(query: &str) -> Vec<QuerySolution> {
        select_on(store(), query)
    }

    fn select_on(store: Store, query: &str) -> Vec<QuerySolution> {
        let query = SparqlParser::new().parse_query(query).unwrap();
        let QueryOutcome::Solutions { solutions, .. } = evaluator()
            .execute(&EvaluationContext::new(store), query)
            .unwrap()
        else {
            unreachable!()
        };
        solutions
    }

    #[test]
    fn builtin_error_fails_the_query() {
        for query in [
            "SELECT ?x WHERE { BIND(\"a\" + 1 AS ?x) }",
            "SELECT ?d WHERE { BIND(<http://example.com/concat>(\"a\", \"b\") AS ?c) BIND(?c + 1 AS ?d) }",
            "SELECT ?x WHERE { OPTIONAL { ?s <http://example.com/name> ?n BIND(?n * 2 AS ?x) } }",
        ] {
            let query = SparqlParser::new().parse_query(query).unwrap();
            assert!(
                matches!(
                    evaluator().execute(&EvaluationContext::new(store()), query.clone()),
                    Err(EvaluationError::Expression { .. })
                ),
                "{query}"
            );
        }
    }

    #[test]
    fn empty_aggregate_is_not_an_error() {
        let solutions = select(
            "SELECT (MAX(?o) AS ?m) WHERE { ?s <http://example.com/unknown> ?o }",
        );
        assert_eq!(solutions.len(), 1);
        assert_eq!(solutions[0].get("m"), None);
    }

    #[test]
    fn builtin_without_error_is_left_to_the_store() {
        let solutions = select(
            "SELECT ?x WHERE { ?s <http://example.com/rank> ?r BIND(?r * 10 AS ?x) } ORDER BY ?x",
        );
        assert_eq!(
            solutions.iter().map(|s| s.get("x").cloned()).collect::<Vec<_>>(),
            [10, 20, 30].map(|v| Some(Term::from(Literal::from(v))))
        );
    }

    #[test]
    fn rewritten_table_joins_store_blank_nodes() {
        let solutions = select(
            "SELECT ?w ?x WHERE { ?s <http://example.com/name> \"blank\" . BIND(<http://example.com/concat>(\"a\", \"b\") AS ?x) ?s <http://example.com/weight> ?w }",
        );
        assert_eq!(solutions.len(), 1);
        assert_eq!(solutions[0].get("w"), Some(&Literal::from(5).into()));
        assert_eq!(solutions[0].get("x"), Some(&Literal::from("ab").into()));
    }

    #[test]
    fn rewritten_table_in_optional_with_filter() {
        let solutions = select(
            "SELECT ?r ?x WHERE { ?s <http://example.com/rank> ?r OPTIONAL { ?s <http://example.com/name> ?n BIND(<http://example.com/concat>(?n, \"!\") AS ?x) FILTER(?r > 1) } } ORDER BY ?r",
        );
        assert_eq!(
            solutions
                .iter()
                .map(|s| (s.get("r").cloned(), s.get("x").cloned()))
                .collect::<Vec<_>>(),
            [
                (Some(Term::from(Literal::from(1))), None),
                (
                    Some(Term::from(Literal::from(2))),
                    Some(Term::from(Literal::from("b!")))
                ),
                (
                    Some(Term::from(Literal::from(3))),
                    Some(Term::from(Literal::from("c!")))
                ),
            ]
        );
    }

    #[test]
    fn rewritten_table_in_minus_and_union() {
        let solutions = select(
            "SELECT ?m WHERE { { ?s <http://example.com/name> ?n BIND(<http://example.com/concat>(?n, \"?\") AS ?m) } MINUS { ?s <http://example.com/rank> 1 } }",
        );
        let mut values = solutions
            .iter()
            .filter_map(|s| s.get("m").map(ToString::to_string))
            .collect::<Vec<_>>();
        values.sort();
        assert_eq!(values, ["\"b?\"", "\"blank?\"", "\"c?\""]);

        let solutions = select(
            "SELECT ?n WHERE { { BIND(<http://example.com/concat>(\"x\") AS ?n) } UNION { <http://example.com/a> <http://example.com/name> ?n } }",
        );
        assert_eq!(solutions.len(), 2);
    }

    #[test]
    fn custom_function_in_graph() {
        let store = Store::new().unwrap();
        store
            .load_from_reader(
                RdfFormat::NQuads,
                b"<http://example.com/a> <http://example.com/name> \"g\" <http://example.com/g> .\n<http://example.com/a> <http://example.com/name> \"default\" .".as_slice(),
            )
            .unwrap();
        let solutions = select_on(
            store.clone(),
            "SELECT ?g ?x WHERE { GRAPH ?g { ?s <http://example.com/name> ?o BIND(<http://example.com/concat>(?o, \"!\") AS ?x) } }",
        );
        assert_eq!(solutions.len(), 1);
        assert_eq!(
            solutions[0].get("g"),
            Some(&NamedNode::new_unchecked("http://example.com/g").into())
        );
        assert_eq!(solutions[0].get("x"), Some(&Literal::from("g!").into()));

        let solutions = select_on(
            store,
            "SELECT ?x WHERE { GRAPH <http://example.com/g> { BIND(<http://example.com/concat>(\"y\") AS ?x) } }",
        );
        assert_eq!(solutions.len(), 1);
        assert_eq!(solutions[0].get("x"), Some(&Literal::from("y").into()));
    }

    #[test]
    fn ask_with_custom_function() {
        let query = SparqlParser::new()
            .parse_query("ASK { BIND(<http://example.com/concat>(\"a\") AS ?x) FILTER(?x = \"a\") }")
            .unwrap();
        assert_eq!(
            evaluator()
                .execute(&EvaluationContext::new(store()), query)
                .unwrap(),
            QueryOutcome::Boolean(true)
        );
    }
}
